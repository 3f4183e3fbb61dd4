//! In-memory device backend.
//!
//! [`HeadlessDevice`] implements [`Device`] without a GPU. It keeps the object
//! tables a driver would keep, accounts allocated bytes against an optional
//! budget, and records every call so tests can count what the pipeline issued.
//! Handles come from one monotonically increasing counter and are never reused,
//! which makes use-after-dispose bugs visible.

use std::collections::{HashMap, HashSet};

use super::{
    Attachment, AttachmentSource, BlendConfig, BufferHandle, BufferKind, Capabilities, ClearMask,
    CullState, DepthState, Device, DeviceError, DrawCommand, FramebufferHandle, PolygonOffset,
    ProgramHandle, Rect, RenderbufferHandle, SamplerParams, StencilState, TextureHandle,
    TextureStorage, UniformKind, UniformLocation, VertexBinding,
};

/// One recorded device call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    SetBlend(Option<BlendConfig>),
    SetDepth(DepthState),
    SetStencil(Option<StencilState>),
    SetCull(CullState),
    SetPolygonOffset(Option<PolygonOffset>),
    SetColorMask(wgpu::ColorWrites),
    SetViewport(Rect),
    SetScissor(Rect),
    SetScissorTest(bool),
    SetClearColor([f32; 4]),
    Clear(ClearMask),
    BindFramebuffer(Option<FramebufferHandle>),
    UseProgram(Option<ProgramHandle>),
    ActiveTexture(u32),
    BindTexture(Option<TextureHandle>),
    BindVertexBuffers(VertexBinding),
    CreateTexture(TextureHandle),
    UploadTexture { texture: TextureHandle, level: u32 },
    SetSampler(TextureHandle),
    GenerateMipmaps(TextureHandle),
    DeleteTexture(TextureHandle),
    CreateBuffer(BufferHandle),
    UpdateBuffer(BufferHandle),
    DeleteBuffer(BufferHandle),
    CreateRenderbuffer(RenderbufferHandle),
    DeleteRenderbuffer(RenderbufferHandle),
    CreateFramebuffer(FramebufferHandle),
    Attach {
        framebuffer: FramebufferHandle,
        attachment: Attachment,
        source: AttachmentSource,
    },
    SetDrawBuffers { framebuffer: FramebufferHandle, count: u32 },
    Blit {
        source: FramebufferHandle,
        destination: Option<FramebufferHandle>,
        mask: ClearMask,
    },
    DeleteFramebuffer(FramebufferHandle),
    CreateProgram(ProgramHandle),
    DeleteProgram(ProgramHandle),
    UploadUniform {
        location: UniformLocation,
        kind: UniformKind,
        data: Vec<u32>,
    },
    Draw(DrawCommand),
}

impl DeviceCall {
    /// Whether the call changes fixed-function or binding state.
    pub fn is_state_change(&self) -> bool {
        matches!(
            self,
            DeviceCall::SetBlend(_)
                | DeviceCall::SetDepth(_)
                | DeviceCall::SetStencil(_)
                | DeviceCall::SetCull(_)
                | DeviceCall::SetPolygonOffset(_)
                | DeviceCall::SetColorMask(_)
                | DeviceCall::SetViewport(_)
                | DeviceCall::SetScissor(_)
                | DeviceCall::SetScissorTest(_)
                | DeviceCall::SetClearColor(_)
                | DeviceCall::BindFramebuffer(_)
                | DeviceCall::UseProgram(_)
                | DeviceCall::ActiveTexture(_)
                | DeviceCall::BindTexture(_)
                | DeviceCall::BindVertexBuffers(_)
        )
    }
}

/// State the headless device believes is current; mirrors what a driver holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeadlessState {
    pub blend: Option<BlendConfig>,
    pub depth: Option<DepthState>,
    pub stencil: Option<StencilState>,
    pub cull: Option<CullState>,
    pub polygon_offset: Option<PolygonOffset>,
    pub color_mask: Option<wgpu::ColorWrites>,
    pub viewport: Option<Rect>,
    pub scissor: Option<Rect>,
    pub scissor_test: bool,
    pub clear_color: [f32; 4],
    pub framebuffer: Option<FramebufferHandle>,
    pub program: Option<ProgramHandle>,
    pub active_unit: u32,
    pub textures: HashMap<u32, TextureHandle>,
    pub vertex_binding: Option<VertexBinding>,
}

/// Device backend that runs entirely in memory.
pub struct HeadlessDevice {
    capabilities: Capabilities,
    next_handle: u32,
    context_lost: bool,
    memory_budget: Option<u64>,
    allocated: u64,
    allocations: HashMap<u32, u64>,
    textures: HashMap<TextureHandle, TextureStorage>,
    buffers: HashSet<BufferHandle>,
    renderbuffers: HashSet<RenderbufferHandle>,
    framebuffers: HashSet<FramebufferHandle>,
    programs: HashSet<ProgramHandle>,
    state: HeadlessState,
    calls: Vec<DeviceCall>,
    recording: bool,
}

impl HeadlessDevice {
    /// Create a device with default capabilities and no memory budget.
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::default())
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            next_handle: 1,
            context_lost: false,
            memory_budget: None,
            allocated: 0,
            allocations: HashMap::new(),
            textures: HashMap::new(),
            buffers: HashSet::new(),
            renderbuffers: HashSet::new(),
            framebuffers: HashSet::new(),
            programs: HashSet::new(),
            state: HeadlessState::default(),
            calls: Vec::new(),
            recording: true,
        }
    }

    /// Limit total allocated bytes; `None` removes the limit.
    pub fn set_memory_budget(&mut self, budget: Option<u64>) {
        self.memory_budget = budget;
    }

    /// Bytes currently allocated across textures, buffers and renderbuffers.
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    /// Drop every object, as a real context loss would. Calls fail until restore.
    pub fn lose_context(&mut self) {
        log::warn!("Headless device: simulating context loss");
        self.context_lost = true;
        self.textures.clear();
        self.buffers.clear();
        self.renderbuffers.clear();
        self.framebuffers.clear();
        self.programs.clear();
        self.allocations.clear();
        self.allocated = 0;
        self.state = HeadlessState::default();
    }

    pub fn restore_context(&mut self) {
        log::info!("Headless device: context restored");
        self.context_lost = false;
    }

    /// Enable or disable the call log (counters derived from it stop too).
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    pub fn calls(&self) -> &[DeviceCall] {
        &self.calls
    }

    /// Return and clear the call log.
    pub fn take_calls(&mut self) -> Vec<DeviceCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Count recorded calls matching a predicate.
    pub fn count_calls(&self, predicate: impl Fn(&DeviceCall) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    /// Number of uniform uploads recorded.
    pub fn uniform_uploads(&self) -> usize {
        self.count_calls(|call| matches!(call, DeviceCall::UploadUniform { .. }))
    }

    /// Number of draw calls recorded.
    pub fn draw_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, DeviceCall::Draw(_)))
    }

    /// State the device currently holds.
    pub fn current_state(&self) -> &HeadlessState {
        &self.state
    }

    pub fn is_texture_alive(&self, texture: TextureHandle) -> bool {
        self.textures.contains_key(&texture)
    }

    pub fn is_program_alive(&self, program: ProgramHandle) -> bool {
        self.programs.contains(&program)
    }

    pub fn texture_storage(&self, texture: TextureHandle) -> Option<&TextureStorage> {
        self.textures.get(&texture)
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_renderbuffers(&self) -> usize {
        self.renderbuffers.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    fn record(&mut self, call: DeviceCall) {
        if self.recording {
            self.calls.push(call);
        }
    }

    fn allocate_handle(&mut self, bytes: u64) -> Result<u32, DeviceError> {
        if self.context_lost {
            return Err(DeviceError::ContextLost);
        }
        if let Some(budget) = self.memory_budget {
            let available = budget.saturating_sub(self.allocated);
            if bytes > available {
                return Err(DeviceError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
        }
        let id = self.next_handle;
        self.next_handle += 1;
        if bytes > 0 {
            self.allocated += bytes;
            self.allocations.insert(id, bytes);
        }
        Ok(id)
    }

    fn free(&mut self, id: u32) {
        if let Some(bytes) = self.allocations.remove(&id) {
            self.allocated -= bytes;
        }
    }

    fn resize_allocation(&mut self, id: u32, bytes: u64) -> Result<(), DeviceError> {
        let current = self.allocations.get(&id).copied().unwrap_or(0);
        if bytes > current
            && let Some(budget) = self.memory_budget
        {
            let available = budget.saturating_sub(self.allocated);
            if bytes - current > available {
                return Err(DeviceError::OutOfMemory {
                    requested: bytes - current,
                    available,
                });
            }
        }
        self.allocated = self.allocated - current + bytes;
        self.allocations.insert(id, bytes);
        Ok(())
    }
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HeadlessDevice {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn is_context_lost(&self) -> bool {
        self.context_lost
    }

    fn set_blend(&mut self, blend: Option<&BlendConfig>) {
        self.state.blend = blend.copied();
        self.record(DeviceCall::SetBlend(blend.copied()));
    }

    fn set_depth(&mut self, depth: &DepthState) {
        self.state.depth = Some(*depth);
        self.record(DeviceCall::SetDepth(*depth));
    }

    fn set_stencil(&mut self, stencil: Option<&StencilState>) {
        self.state.stencil = stencil.copied();
        self.record(DeviceCall::SetStencil(stencil.copied()));
    }

    fn set_cull(&mut self, cull: &CullState) {
        self.state.cull = Some(*cull);
        self.record(DeviceCall::SetCull(*cull));
    }

    fn set_polygon_offset(&mut self, offset: Option<&PolygonOffset>) {
        self.state.polygon_offset = offset.copied();
        self.record(DeviceCall::SetPolygonOffset(offset.copied()));
    }

    fn set_color_mask(&mut self, mask: wgpu::ColorWrites) {
        self.state.color_mask = Some(mask);
        self.record(DeviceCall::SetColorMask(mask));
    }

    fn set_viewport(&mut self, rect: &Rect) {
        self.state.viewport = Some(*rect);
        self.record(DeviceCall::SetViewport(*rect));
    }

    fn set_scissor(&mut self, rect: &Rect) {
        self.state.scissor = Some(*rect);
        self.record(DeviceCall::SetScissor(*rect));
    }

    fn set_scissor_test(&mut self, enabled: bool) {
        self.state.scissor_test = enabled;
        self.record(DeviceCall::SetScissorTest(enabled));
    }

    fn set_clear_color(&mut self, color: [f32; 4]) {
        self.state.clear_color = color;
        self.record(DeviceCall::SetClearColor(color));
    }

    fn clear(&mut self, mask: ClearMask) {
        self.record(DeviceCall::Clear(mask));
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>) {
        self.state.framebuffer = framebuffer;
        self.record(DeviceCall::BindFramebuffer(framebuffer));
    }

    fn use_program(&mut self, program: Option<ProgramHandle>) {
        self.state.program = program;
        self.record(DeviceCall::UseProgram(program));
    }

    fn active_texture(&mut self, unit: u32) {
        self.state.active_unit = unit;
        self.record(DeviceCall::ActiveTexture(unit));
    }

    fn bind_texture(&mut self, texture: Option<TextureHandle>) {
        let unit = self.state.active_unit;
        match texture {
            Some(handle) => {
                self.state.textures.insert(unit, handle);
            }
            None => {
                self.state.textures.remove(&unit);
            }
        }
        self.record(DeviceCall::BindTexture(texture));
    }

    fn bind_vertex_buffers(&mut self, binding: &VertexBinding) {
        self.state.vertex_binding = Some(binding.clone());
        self.record(DeviceCall::BindVertexBuffers(binding.clone()));
    }

    fn create_texture(&mut self, storage: &TextureStorage) -> Result<TextureHandle, DeviceError> {
        let handle = TextureHandle(self.allocate_handle(storage.byte_size())?);
        self.textures.insert(handle, storage.clone());
        self.record(DeviceCall::CreateTexture(handle));
        Ok(handle)
    }

    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        level: u32,
        _data: &[u8],
    ) -> Result<(), DeviceError> {
        if self.context_lost {
            return Err(DeviceError::ContextLost);
        }
        if !self.textures.contains_key(&texture) {
            return Err(DeviceError::InvalidHandle(texture.0));
        }
        self.record(DeviceCall::UploadTexture { texture, level });
        Ok(())
    }

    fn set_sampler(&mut self, texture: TextureHandle, _sampler: &SamplerParams) {
        self.record(DeviceCall::SetSampler(texture));
    }

    fn generate_mipmaps(&mut self, texture: TextureHandle) {
        self.record(DeviceCall::GenerateMipmaps(texture));
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture).is_some() {
            self.free(texture.0);
            self.state.textures.retain(|_, bound| *bound != texture);
        }
        self.record(DeviceCall::DeleteTexture(texture));
    }

    fn create_buffer(&mut self, _kind: BufferKind, data: &[u8]) -> Result<BufferHandle, DeviceError> {
        let handle = BufferHandle(self.allocate_handle(data.len() as u64)?);
        self.buffers.insert(handle);
        self.record(DeviceCall::CreateBuffer(handle));
        Ok(handle)
    }

    fn update_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> Result<(), DeviceError> {
        if self.context_lost {
            return Err(DeviceError::ContextLost);
        }
        if !self.buffers.contains(&buffer) {
            return Err(DeviceError::InvalidHandle(buffer.0));
        }
        self.resize_allocation(buffer.0, data.len() as u64)?;
        self.record(DeviceCall::UpdateBuffer(buffer));
        Ok(())
    }

    fn delete_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer) {
            self.free(buffer.0);
        }
        self.record(DeviceCall::DeleteBuffer(buffer));
    }

    fn create_renderbuffer(
        &mut self,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
        samples: u32,
    ) -> Result<RenderbufferHandle, DeviceError> {
        let texel = format.block_copy_size(None).unwrap_or(4) as u64;
        let bytes = width as u64 * height as u64 * texel * samples.max(1) as u64;
        let handle = RenderbufferHandle(self.allocate_handle(bytes)?);
        self.renderbuffers.insert(handle);
        self.record(DeviceCall::CreateRenderbuffer(handle));
        Ok(handle)
    }

    fn delete_renderbuffer(&mut self, renderbuffer: RenderbufferHandle) {
        if self.renderbuffers.remove(&renderbuffer) {
            self.free(renderbuffer.0);
        }
        self.record(DeviceCall::DeleteRenderbuffer(renderbuffer));
    }

    fn create_framebuffer(&mut self) -> Result<FramebufferHandle, DeviceError> {
        let handle = FramebufferHandle(self.allocate_handle(0)?);
        self.framebuffers.insert(handle);
        self.record(DeviceCall::CreateFramebuffer(handle));
        Ok(handle)
    }

    fn attach(
        &mut self,
        framebuffer: FramebufferHandle,
        attachment: Attachment,
        source: AttachmentSource,
    ) {
        self.record(DeviceCall::Attach {
            framebuffer,
            attachment,
            source,
        });
    }

    fn set_draw_buffers(&mut self, framebuffer: FramebufferHandle, count: u32) {
        self.record(DeviceCall::SetDrawBuffers { framebuffer, count });
    }

    fn blit_framebuffer(
        &mut self,
        source: FramebufferHandle,
        destination: Option<FramebufferHandle>,
        _width: u32,
        _height: u32,
        mask: ClearMask,
    ) {
        self.record(DeviceCall::Blit {
            source,
            destination,
            mask,
        });
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self.framebuffers.remove(&framebuffer) && self.state.framebuffer == Some(framebuffer) {
            self.state.framebuffer = None;
        }
        self.record(DeviceCall::DeleteFramebuffer(framebuffer));
    }

    fn create_program(&mut self, _vertex: &str, _fragment: &str) -> Result<ProgramHandle, DeviceError> {
        let handle = ProgramHandle(self.allocate_handle(0)?);
        self.programs.insert(handle);
        self.record(DeviceCall::CreateProgram(handle));
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        if self.programs.remove(&program) && self.state.program == Some(program) {
            self.state.program = None;
        }
        self.record(DeviceCall::DeleteProgram(program));
    }

    fn upload_uniform(&mut self, location: &UniformLocation, kind: UniformKind, data: &[u32]) {
        self.record(DeviceCall::UploadUniform {
            location: *location,
            kind,
            data: data.to_vec(),
        });
    }

    fn draw(&mut self, command: &DrawCommand) {
        self.record(DeviceCall::Draw(*command));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::TextureDimension;

    fn storage(width: u32, height: u32) -> TextureStorage {
        TextureStorage {
            dimension: TextureDimension::D2,
            width,
            height,
            mip_levels: 1,
            format: wgpu::TextureFormat::Rgba8Unorm,
        }
    }

    #[test]
    fn test_handles_never_reused() {
        let mut device = HeadlessDevice::new();
        let a = device.create_texture(&storage(4, 4)).unwrap();
        device.delete_texture(a);
        let b = device.create_texture(&storage(4, 4)).unwrap();
        assert_ne!(a, b);
        assert!(!device.is_texture_alive(a));
        assert!(device.is_texture_alive(b));
    }

    #[test]
    fn test_memory_accounting() {
        let mut device = HeadlessDevice::new();
        let tex = device.create_texture(&storage(4, 4)).unwrap();
        assert_eq!(device.allocated_bytes(), 64);
        let buf = device.create_buffer(BufferKind::Vertex, &[0u8; 36]).unwrap();
        assert_eq!(device.allocated_bytes(), 100);
        device.delete_texture(tex);
        device.delete_buffer(buf);
        assert_eq!(device.allocated_bytes(), 0);
    }

    #[test]
    fn test_memory_budget_rejects_allocation() {
        let mut device = HeadlessDevice::new();
        device.set_memory_budget(Some(100));
        let result = device.create_texture(&storage(8, 8));
        assert_eq!(
            result,
            Err(DeviceError::OutOfMemory {
                requested: 256,
                available: 100
            })
        );
        assert_eq!(device.live_textures(), 0);
    }

    #[test]
    fn test_context_loss_drops_objects() {
        let mut device = HeadlessDevice::new();
        device.create_texture(&storage(4, 4)).unwrap();
        device.create_framebuffer().unwrap();
        device.lose_context();
        assert!(device.is_context_lost());
        assert_eq!(device.live_textures(), 0);
        assert_eq!(device.live_framebuffers(), 0);
        assert_eq!(device.create_framebuffer(), Err(DeviceError::ContextLost));

        device.restore_context();
        assert!(device.create_framebuffer().is_ok());
    }

    #[test]
    fn test_delete_bound_texture_unbinds() {
        let mut device = HeadlessDevice::new();
        let tex = device.create_texture(&storage(2, 2)).unwrap();
        device.active_texture(3);
        device.bind_texture(Some(tex));
        assert_eq!(device.current_state().textures.get(&3), Some(&tex));
        device.delete_texture(tex);
        assert!(device.current_state().textures.get(&3).is_none());
    }

    #[test]
    fn test_call_log_counts() {
        let mut device = HeadlessDevice::new();
        device.set_viewport(&Rect::new(0, 0, 10, 10));
        device.draw(&DrawCommand {
            topology: wgpu::PrimitiveTopology::TriangleList,
            first: 0,
            count: 3,
            indexed: false,
            instances: 1,
        });
        assert_eq!(device.draw_calls(), 1);
        assert_eq!(device.count_calls(DeviceCall::is_state_change), 1);
        assert_eq!(device.take_calls().len(), 2);
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_recording_toggle() {
        let mut device = HeadlessDevice::new();
        device.set_recording(false);
        device.clear(ClearMask::ALL);
        assert!(device.calls().is_empty());
    }
}
