//! Raw device command surface.
//!
//! [`Device`] is the GL-shaped boundary every GPU interaction crosses: state
//! setters, object lifetime, uniform upload, draw and blit. It is deliberately
//! dumb: no caching, no diffing. The [`StateTracker`](crate::state::StateTracker)
//! and the resource caches sit on top of it and decide which calls are needed.
//!
//! Vocabulary types (blend factors, compare functions, formats, filters) are the
//! `wgpu` types so the same descriptors can drive a wgpu backend.

pub mod headless;

use prism_config::Precision;

pub use headless::{DeviceCall, HeadlessDevice};

/// Device texture object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub u32);

/// Device buffer object (vertex or index data).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u32);

/// Device framebuffer object. `None` where a framebuffer is expected means the
/// presentable surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferHandle(pub u32);

/// Device renderbuffer (multisampled or depth storage that is never sampled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderbufferHandle(pub u32);

/// Linked device program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub u32);

/// Errors reported by device calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The allocation would exceed the device memory budget.
    #[error("device out of memory: requested {requested} bytes with {available} available")]
    OutOfMemory { requested: u64, available: u64 },

    /// The device context was lost; every handle is invalid until restore.
    #[error("device context lost")]
    ContextLost,

    /// A handle that the device does not know was passed to a call.
    #[error("invalid device handle {0}")]
    InvalidHandle(u32),
}

/// Limits and features reported by a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    /// Number of texture units usable by one draw.
    pub max_texture_units: u32,
    /// Maximum simultaneous color attachments.
    pub max_draw_buffers: u32,
    /// Maximum MSAA sample count for renderbuffers.
    pub max_samples: u32,
    /// Maximum texture width/height.
    pub max_texture_size: u32,
    /// Highest supported shader precision.
    pub precision: Precision,
    /// Float color formats are renderable.
    pub float_render_targets: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_texture_units: 16,
            max_draw_buffers: 8,
            max_samples: 4,
            max_texture_size: 8192,
            precision: Precision::High,
            float_render_targets: true,
        }
    }
}

impl Capabilities {
    /// Clamp a requested precision to the supported maximum.
    pub fn clamp_precision(&self, requested: Precision) -> Precision {
        requested.min(self.precision)
    }
}

/// Rectangle in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Resolved blend equation plus the constant color it may reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlendConfig {
    pub state: wgpu::BlendState,
    pub constant: [f32; 4],
}

/// Depth test configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: wgpu::CompareFunction,
}

impl Default for DepthState {
    fn default() -> Self {
        Self {
            test: true,
            write: true,
            compare: wgpu::CompareFunction::LessEqual,
        }
    }
}

/// Stencil test configuration (front and back share one state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilState {
    pub compare: wgpu::CompareFunction,
    pub reference: u32,
    pub read_mask: u32,
    pub write_mask: u32,
    pub fail_op: wgpu::StencilOperation,
    pub depth_fail_op: wgpu::StencilOperation,
    pub pass_op: wgpu::StencilOperation,
}

impl Default for StencilState {
    fn default() -> Self {
        Self {
            compare: wgpu::CompareFunction::Always,
            reference: 0,
            read_mask: 0xff,
            write_mask: 0xff,
            fail_op: wgpu::StencilOperation::Keep,
            depth_fail_op: wgpu::StencilOperation::Keep,
            pass_op: wgpu::StencilOperation::Keep,
        }
    }
}

/// Face culling and winding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CullState {
    /// Face to cull, `None` disables culling.
    pub face: Option<wgpu::Face>,
    pub front_face: wgpu::FrontFace,
}

impl Default for CullState {
    fn default() -> Self {
        Self {
            face: Some(wgpu::Face::Back),
            front_face: wgpu::FrontFace::Ccw,
        }
    }
}

/// Depth bias applied to rasterized fragments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolygonOffset {
    pub factor: f32,
    pub units: f32,
}

/// Which buffers a clear or blit touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClearMask {
    pub color: bool,
    pub depth: bool,
    pub stencil: bool,
}

impl ClearMask {
    pub const ALL: Self = Self {
        color: true,
        depth: true,
        stencil: true,
    };
    pub const COLOR: Self = Self {
        color: true,
        depth: false,
        stencil: false,
    };
    pub const DEPTH: Self = Self {
        color: false,
        depth: true,
        stencil: false,
    };

    pub fn is_empty(&self) -> bool {
        !(self.color || self.depth || self.stencil)
    }
}

/// Texture dimensionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureDimension {
    #[default]
    D2,
    Cube,
}

impl TextureDimension {
    /// Number of 2D layers the dimension stores.
    pub fn layers(self) -> u32 {
        match self {
            TextureDimension::D2 => 1,
            TextureDimension::Cube => 6,
        }
    }
}

/// Storage allocation request for a device texture.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TextureStorage {
    pub dimension: TextureDimension,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: wgpu::TextureFormat,
}

impl TextureStorage {
    /// Bytes occupied by every level and layer of this storage.
    pub fn byte_size(&self) -> u64 {
        let texel = self.format.block_copy_size(None).unwrap_or(4) as u64;
        let mut total = 0u64;
        for level in 0..self.mip_levels {
            let w = (self.width >> level).max(1) as u64;
            let h = (self.height >> level).max(1) as u64;
            total += w * h * texel;
        }
        total * self.dimension.layers() as u64
    }
}

/// Sampling parameters applied to a device texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerParams {
    pub wrap_s: wgpu::AddressMode,
    pub wrap_t: wgpu::AddressMode,
    pub mag_filter: wgpu::FilterMode,
    pub min_filter: wgpu::FilterMode,
    pub mipmap_filter: wgpu::MipmapFilterMode,
    pub anisotropy: u16,
    /// Depth comparison for shadow sampling.
    pub compare: Option<wgpu::CompareFunction>,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            wrap_s: wgpu::AddressMode::ClampToEdge,
            wrap_t: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::MipmapFilterMode::Linear,
            anisotropy: 1,
            compare: None,
        }
    }
}

/// Kind of data a device buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
}

/// One vertex attribute stream bound at a shader location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexStream {
    pub location: u32,
    pub buffer: BufferHandle,
    /// Components per vertex (or per instance when `per_instance`).
    pub components: u32,
    /// Byte offset of the first element.
    pub offset: u32,
    /// Byte stride between elements.
    pub stride: u32,
    pub per_instance: bool,
}

/// The complete vertex/index buffer set used by a draw.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VertexBinding {
    pub streams: Vec<VertexStream>,
    pub index: Option<(BufferHandle, wgpu::IndexFormat)>,
}

/// Framebuffer attachment point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attachment {
    Color(u32),
    Depth,
    DepthStencil,
}

/// What is attached to a framebuffer attachment point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentSource {
    /// A level (and cube face for cube textures) of a texture.
    Texture {
        texture: TextureHandle,
        level: u32,
        layer: u32,
    },
    Renderbuffer(RenderbufferHandle),
}

/// Shape of one uniform upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformKind {
    Float,
    Vec2,
    Vec3,
    Vec4,
    Int,
    IVec2,
    IVec3,
    IVec4,
    UInt,
    Bool,
    Mat2,
    Mat3,
    Mat4,
    /// Texture unit index for a sampled 2D texture.
    Texture2d,
    /// Texture unit index for a cube texture.
    TextureCube,
    /// Texture unit index for a depth texture sampled with comparison.
    TextureDepth2d,
    /// Texture unit index for a depth cube sampled with comparison.
    TextureDepthCube,
    /// Whole uniform block of the given byte size.
    Block(u32),
}

impl UniformKind {
    /// Number of 32-bit words a value of this kind carries when uploaded.
    pub fn word_count(self) -> usize {
        match self {
            UniformKind::Float | UniformKind::Int | UniformKind::UInt | UniformKind::Bool => 1,
            UniformKind::Vec2 | UniformKind::IVec2 => 2,
            UniformKind::Vec3 | UniformKind::IVec3 => 3,
            UniformKind::Vec4 | UniformKind::IVec4 | UniformKind::Mat2 => 4,
            UniformKind::Mat3 => 12,
            UniformKind::Mat4 => 16,
            UniformKind::Texture2d
            | UniformKind::TextureCube
            | UniformKind::TextureDepth2d
            | UniformKind::TextureDepthCube => 1,
            UniformKind::Block(bytes) => bytes as usize / 4,
        }
    }

    /// Whether this uniform names a texture unit.
    pub fn is_texture(self) -> bool {
        matches!(
            self,
            UniformKind::Texture2d
                | UniformKind::TextureCube
                | UniformKind::TextureDepth2d
                | UniformKind::TextureDepthCube
        )
    }
}

/// Upload location of a uniform inside the program's bind layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UniformLocation {
    pub group: u32,
    pub binding: u32,
    /// Byte offset inside the binding's buffer.
    pub offset: u32,
}

/// One draw primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawCommand {
    pub topology: wgpu::PrimitiveTopology,
    /// First vertex (or first index when indexed).
    pub first: u32,
    /// Vertex (or index) count.
    pub count: u32,
    /// Set when drawing from the bound index buffer.
    pub indexed: bool,
    /// Instance count; 1 for non-instanced draws.
    pub instances: u32,
}

/// Raw device commands.
///
/// Every method maps to one graphics-API call. Setters apply immediately and are
/// never deduplicated at this level.
pub trait Device {
    fn capabilities(&self) -> &Capabilities;
    fn is_context_lost(&self) -> bool;

    // --- Fixed-function state ---

    fn set_blend(&mut self, blend: Option<&BlendConfig>);
    fn set_depth(&mut self, depth: &DepthState);
    fn set_stencil(&mut self, stencil: Option<&StencilState>);
    fn set_cull(&mut self, cull: &CullState);
    fn set_polygon_offset(&mut self, offset: Option<&PolygonOffset>);
    fn set_color_mask(&mut self, mask: wgpu::ColorWrites);
    fn set_viewport(&mut self, rect: &Rect);
    fn set_scissor(&mut self, rect: &Rect);
    fn set_scissor_test(&mut self, enabled: bool);
    fn set_clear_color(&mut self, color: [f32; 4]);
    fn clear(&mut self, mask: ClearMask);

    // --- Bindings ---

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>);
    fn use_program(&mut self, program: Option<ProgramHandle>);
    fn active_texture(&mut self, unit: u32);
    fn bind_texture(&mut self, texture: Option<TextureHandle>);
    fn bind_vertex_buffers(&mut self, binding: &VertexBinding);

    // --- Textures ---

    fn create_texture(&mut self, storage: &TextureStorage) -> Result<TextureHandle, DeviceError>;
    /// Upload one level of pixel data; cube textures take all six faces concatenated.
    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        level: u32,
        data: &[u8],
    ) -> Result<(), DeviceError>;
    fn set_sampler(&mut self, texture: TextureHandle, sampler: &SamplerParams);
    fn generate_mipmaps(&mut self, texture: TextureHandle);
    fn delete_texture(&mut self, texture: TextureHandle);

    // --- Buffers ---

    fn create_buffer(&mut self, kind: BufferKind, data: &[u8]) -> Result<BufferHandle, DeviceError>;
    fn update_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> Result<(), DeviceError>;
    fn delete_buffer(&mut self, buffer: BufferHandle);

    // --- Framebuffers ---

    fn create_renderbuffer(
        &mut self,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        samples: u32,
    ) -> Result<RenderbufferHandle, DeviceError>;
    fn delete_renderbuffer(&mut self, renderbuffer: RenderbufferHandle);
    fn create_framebuffer(&mut self) -> Result<FramebufferHandle, DeviceError>;
    fn attach(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: Attachment,
        source: AttachmentSource,
    );
    /// Select how many color attachments receive fragment outputs.
    fn set_draw_buffers(&mut self, framebuffer: FramebufferHandle, count: u32);
    fn blit_framebuffer(
        &mut self,
        source: FramebufferHandle,
        destination: Option<FramebufferHandle>,
        width: u32,
        height: u32,
        mask: ClearMask,
    );
    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle);

    // --- Programs ---

    fn create_program(&mut self, vertex: &str, fragment: &str) -> Result<ProgramHandle, DeviceError>;
    fn delete_program(&mut self, program: ProgramHandle);
    /// Upload a uniform value to the program currently in use.
    fn upload_uniform(&mut self, location: &UniformLocation, kind: UniformKind, data: &[u32]);

    // --- Draw ---

    fn draw(&mut self, command: &DrawCommand);
}
