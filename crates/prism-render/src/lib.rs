//! Forward renderer: shader variant caching, redundant-state elision, lazy GPU resources and sorted render lists over a pluggable device.

pub mod animation;
pub mod camera;
pub mod device;
pub mod error;
pub mod frustum;
pub mod geometry;
pub mod info;
pub mod light;
pub mod material;
pub mod program;
pub mod render_list;
pub mod render_target;
pub mod renderer;
pub mod resource;
pub mod scene;
pub mod shader;
pub mod shadow;
pub mod state;
pub mod texture;
pub mod uniforms;

mod sync;

pub use animation::{AnimationLoop, FrameCallback};
pub use camera::{Camera, Projection};
pub use device::{
    Capabilities, ClearMask, Device, DeviceCall, DeviceError, HeadlessDevice, Rect,
    SamplerParams, TextureDimension,
};
pub use error::RenderError;
pub use geometry::{Attribute, DrawRange, Geometry, GeometryData, GeometryGroup, Semantic};
pub use info::{FrameStats, MemoryStats, RenderInfo};
pub use light::{Light, LightKind, LightShadow};
pub use material::{Material, MaterialKind, MaterialParams, ShaderSource, Side};
pub use program::{Program, ProgramDiagnostics, ShaderError};
pub use render_list::{RenderItem, RenderList, build_render_list};
pub use render_target::{RenderTarget, RenderTargetDescriptor};
pub use renderer::{FramePhase, Renderer, ShaderErrorCallback};
pub use scene::{Mesh, Node, NodeKind, ObjectId, Scene, Transform};
pub use state::{Blending, CustomBlending, StateTracker};
pub use texture::{ImageSource, Texture, TextureDescriptor};
pub use uniforms::UniformValue;
