//! Device-side storage for logical resources.
//!
//! [`ResourceManager`] owns the three caches that turn logical handles
//! ([`Texture`], [`RenderTarget`], [`Geometry`]) into device objects. Every
//! allocation is lazy and keyed by the handle's identity; a version change on
//! the handle triggers an update on next use.

pub mod geometry;
pub mod render_target;
pub mod texture;

pub use geometry::GeometryCache;
pub use render_target::RenderTargetCache;
pub use texture::{TextureCache, TextureStatus};

use crate::device::{Device, DeviceError, FramebufferHandle, TextureHandle};
use crate::geometry::{Geometry, GeometryId};
use crate::render_target::RenderTarget;
use crate::state::StateTracker;
use crate::texture::{Texture, TextureId};

/// Device memory currently held, by resource kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub geometries: usize,
    pub textures: usize,
    pub render_targets: usize,
    pub bytes: u64,
}

/// Owner of every device texture, framebuffer and buffer.
#[derive(Default)]
pub struct ResourceManager {
    textures: TextureCache,
    targets: RenderTargetCache,
    geometries: GeometryCache,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn textures(&self) -> &TextureCache {
        &self.textures
    }

    pub fn render_targets(&self) -> &RenderTargetCache {
        &self.targets
    }

    pub fn geometries(&self) -> &GeometryCache {
        &self.geometries
    }

    /// Device texture for sampling `texture`. A render target attachment that
    /// was drawn into since its last resolve is resolved first.
    pub fn texture(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        texture: &Texture,
        target: Option<&RenderTarget>,
    ) -> Result<TextureHandle, DeviceError> {
        if let Some(target) = target
            && self.targets.needs_resolve(target.id())
        {
            self.targets.finish(device, state, &mut self.textures, target);
        }
        self.textures.acquire(device, state, texture)
    }

    /// Bind the framebuffer of `target`, or the presentable surface for `None`.
    pub fn bind_render_target(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        target: Option<&RenderTarget>,
        face: u32,
    ) -> Result<Option<FramebufferHandle>, DeviceError> {
        match target {
            Some(target) => self
                .targets
                .bind(device, state, &mut self.textures, target, face)
                .map(Some),
            None => {
                state.bind_framebuffer(device, None);
                Ok(None)
            }
        }
    }

    /// Resolve and regenerate mipmaps after rendering into `target`.
    pub fn finish_render_target(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        target: &RenderTarget,
    ) {
        self.targets.finish(device, state, &mut self.textures, target);
    }

    pub fn bind_geometry(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        geometry: &Geometry,
    ) -> Result<(), DeviceError> {
        self.geometries.bind(device, state, geometry)
    }

    pub fn dispose_texture(&mut self, device: &mut dyn Device, state: &mut StateTracker, id: TextureId) {
        self.textures.dispose(device, state, id);
    }

    pub fn dispose_geometry(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        id: GeometryId,
    ) {
        self.geometries.dispose(device, state, id);
    }

    pub fn dispose_render_target(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        target: &RenderTarget,
    ) {
        self.targets.dispose(device, state, &mut self.textures, target);
    }

    pub fn memory(&self) -> MemoryInfo {
        MemoryInfo {
            geometries: self.geometries.count(),
            textures: self.textures.count(),
            render_targets: self.targets.count(),
            bytes: self.textures.memory() + self.geometries.memory(),
        }
    }

    /// Delete every device object.
    pub fn clear(&mut self, device: &mut dyn Device, state: &mut StateTracker) {
        self.targets.clear(device, state);
        self.textures.clear(device, state);
        self.geometries.clear(device, state);
    }

    /// Drop all bookkeeping after a context loss; the device objects are gone.
    pub fn forget_all(&mut self) {
        self.targets.forget_all();
        self.textures.forget_all();
        self.geometries.forget_all();
    }
}
