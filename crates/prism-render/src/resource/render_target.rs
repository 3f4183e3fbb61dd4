//! Framebuffers behind logical render targets.
//!
//! A target is allocated the first time it is bound. Multisampled targets
//! render into renderbuffers and keep a second framebuffer whose attachments
//! are the sampleable textures; [`RenderTargetCache::finish`] resolves one into
//! the other. A version change (resize) reallocates everything.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::device::{
    Attachment, AttachmentSource, ClearMask, Device, DeviceError, FramebufferHandle,
    RenderbufferHandle, TextureDimension,
};
use crate::render_target::{RenderTarget, RenderTargetDescriptor, RenderTargetId};
use crate::resource::texture::TextureCache;
use crate::state::StateTracker;

#[derive(Debug)]
struct TargetRecord {
    version: u64,
    framebuffer: FramebufferHandle,
    /// Framebuffer holding the sampleable textures of a multisampled target.
    resolve: Option<FramebufferHandle>,
    renderbuffers: Vec<RenderbufferHandle>,
    /// Cube face currently attached.
    face: u32,
    /// Rendered into since the last resolve.
    dirty: bool,
}

impl TargetRecord {
    fn new(version: u64, framebuffer: FramebufferHandle) -> Self {
        Self {
            version,
            framebuffer,
            resolve: None,
            renderbuffers: Vec::new(),
            face: 0,
            dirty: false,
        }
    }
}

/// Maps logical render targets to device framebuffers.
#[derive(Debug, Default)]
pub struct RenderTargetCache {
    records: HashMap<RenderTargetId, TargetRecord>,
}

impl RenderTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate (if needed) and bind the framebuffer for `target`, selecting
    /// `face` on cube targets.
    pub fn bind(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        textures: &mut TextureCache,
        target: &RenderTarget,
        face: u32,
    ) -> Result<FramebufferHandle, DeviceError> {
        let id = target.id();
        let version = target.version();
        let stale = self
            .records
            .get(&id)
            .is_some_and(|record| record.version != version);
        if stale && let Some(record) = self.records.remove(&id) {
            log::debug!("Reallocating render target {:?} after resize", id);
            release(device, state, record);
        }

        let record = match self.records.entry(id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(allocate(device, state, textures, target, face)?),
        };
        let descriptor = target.descriptor();
        if descriptor.dimension == TextureDimension::Cube && record.face != face {
            attach_textures(device, state, textures, target, record.framebuffer, face)?;
            record.face = face;
        }
        state.bind_framebuffer(device, Some(record.framebuffer));
        record.dirty = true;
        Ok(record.framebuffer)
    }

    /// Whether `target` was rendered into since its last resolve.
    pub fn needs_resolve(&self, id: RenderTargetId) -> bool {
        self.records.get(&id).is_some_and(|record| record.dirty)
    }

    /// Make the target's textures sampleable: resolve multisampled storage and
    /// regenerate mipmaps.
    pub fn finish(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        textures: &mut TextureCache,
        target: &RenderTarget,
    ) {
        let Some(record) = self.records.get_mut(&target.id()) else {
            return;
        };
        if !record.dirty {
            return;
        }
        record.dirty = false;

        let (width, height) = target.size();
        if let Some(resolve) = record.resolve {
            let mask = ClearMask {
                depth: target.depth_texture().is_some(),
                ..ClearMask::COLOR
            };
            device.blit_framebuffer(record.framebuffer, Some(resolve), width, height, mask);
        }
        if target.descriptor().generate_mipmaps {
            for texture in target.textures() {
                match textures.acquire(device, state, texture) {
                    Ok(handle) => device.generate_mipmaps(handle),
                    Err(err) => log::warn!("Skipping mipmap generation: {err}"),
                }
            }
        }
    }

    /// Number of live framebuffer records.
    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn framebuffer(&self, id: RenderTargetId) -> Option<FramebufferHandle> {
        self.records.get(&id).map(|record| record.framebuffer)
    }

    /// Delete the target's framebuffers and its attachment textures.
    pub fn dispose(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        textures: &mut TextureCache,
        target: &RenderTarget,
    ) {
        if let Some(record) = self.records.remove(&target.id()) {
            release(device, state, record);
        }
        for texture in target.textures().iter().chain(target.depth_texture()) {
            textures.dispose(device, state, texture.id());
        }
    }

    pub fn clear(&mut self, device: &mut dyn Device, state: &mut StateTracker) {
        for (_, record) in self.records.drain() {
            release(device, state, record);
        }
    }

    pub fn forget_all(&mut self) {
        self.records.clear();
    }
}

fn depth_attachment(descriptor: &RenderTargetDescriptor) -> Attachment {
    if descriptor.stencil_buffer {
        Attachment::DepthStencil
    } else {
        Attachment::Depth
    }
}

fn allocate(
    device: &mut dyn Device,
    state: &mut StateTracker,
    textures: &mut TextureCache,
    target: &RenderTarget,
    face: u32,
) -> Result<TargetRecord, DeviceError> {
    let framebuffer = device.create_framebuffer()?;
    let mut record = TargetRecord::new(target.version(), framebuffer);
    record.face = face;
    match populate(device, state, textures, target, &mut record) {
        Ok(()) => {
            let descriptor = target.descriptor();
            log::debug!(
                "Allocated render target '{}' {}x{} ({} color, {} samples)",
                descriptor.label,
                descriptor.width,
                descriptor.height,
                descriptor.color_attachments,
                descriptor.samples
            );
            Ok(record)
        }
        Err(err) => {
            release(device, state, record);
            Err(err)
        }
    }
}

fn populate(
    device: &mut dyn Device,
    state: &mut StateTracker,
    textures: &mut TextureCache,
    target: &RenderTarget,
    record: &mut TargetRecord,
) -> Result<(), DeviceError> {
    let descriptor = target.descriptor();
    let (width, height) = (descriptor.width, descriptor.height);

    if descriptor.samples > 1 {
        for index in 0..descriptor.color_attachments {
            let renderbuffer =
                device.create_renderbuffer(descriptor.color_format, width, height, descriptor.samples)?;
            record.renderbuffers.push(renderbuffer);
            device.attach(
                record.framebuffer,
                Attachment::Color(index),
                AttachmentSource::Renderbuffer(renderbuffer),
            );
        }
        // A depth texture is resolved from multisampled depth storage.
        if descriptor.depth_buffer || descriptor.depth_texture {
            let renderbuffer =
                device.create_renderbuffer(descriptor.depth_format(), width, height, descriptor.samples)?;
            record.renderbuffers.push(renderbuffer);
            device.attach(
                record.framebuffer,
                depth_attachment(&descriptor),
                AttachmentSource::Renderbuffer(renderbuffer),
            );
        }
        device.set_draw_buffers(record.framebuffer, descriptor.color_attachments);

        let resolve = device.create_framebuffer()?;
        record.resolve = Some(resolve);
        attach_textures(device, state, textures, target, resolve, 0)?;
        return Ok(());
    }

    attach_textures(device, state, textures, target, record.framebuffer, record.face)?;
    if descriptor.depth_buffer && !descriptor.depth_texture {
        let renderbuffer = device.create_renderbuffer(descriptor.depth_format(), width, height, 1)?;
        record.renderbuffers.push(renderbuffer);
        device.attach(
            record.framebuffer,
            depth_attachment(&descriptor),
            AttachmentSource::Renderbuffer(renderbuffer),
        );
    }
    Ok(())
}

/// Attach every sampleable texture of `target` to `framebuffer` at `face`.
fn attach_textures(
    device: &mut dyn Device,
    state: &mut StateTracker,
    textures: &mut TextureCache,
    target: &RenderTarget,
    framebuffer: FramebufferHandle,
    face: u32,
) -> Result<(), DeviceError> {
    let descriptor = target.descriptor();
    for (index, texture) in target.textures().iter().enumerate() {
        let handle = textures.acquire(device, state, texture)?;
        device.attach(
            framebuffer,
            Attachment::Color(index as u32),
            AttachmentSource::Texture {
                texture: handle,
                level: 0,
                layer: face,
            },
        );
    }
    if let Some(depth) = target.depth_texture() {
        let handle = textures.acquire(device, state, depth)?;
        device.attach(
            framebuffer,
            depth_attachment(&descriptor),
            AttachmentSource::Texture {
                texture: handle,
                level: 0,
                layer: face,
            },
        );
    }
    device.set_draw_buffers(framebuffer, descriptor.color_attachments);
    Ok(())
}

fn release(device: &mut dyn Device, state: &mut StateTracker, record: TargetRecord) {
    for framebuffer in std::iter::once(record.framebuffer).chain(record.resolve) {
        state.forget_framebuffer(framebuffer);
        device.delete_framebuffer(framebuffer);
    }
    for renderbuffer in record.renderbuffers {
        device.delete_renderbuffer(renderbuffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Capabilities, DeviceCall, HeadlessDevice};

    struct Fixture {
        device: HeadlessDevice,
        state: StateTracker,
        textures: TextureCache,
        targets: RenderTargetCache,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                device: HeadlessDevice::new(),
                state: StateTracker::new(16),
                textures: TextureCache::new(),
                targets: RenderTargetCache::new(),
            }
        }

        fn bind(&mut self, target: &RenderTarget, face: u32) -> Result<FramebufferHandle, DeviceError> {
            self.targets
                .bind(&mut self.device, &mut self.state, &mut self.textures, target, face)
        }
    }

    fn target(descriptor: RenderTargetDescriptor) -> RenderTarget {
        RenderTarget::new(descriptor, &Capabilities::default()).unwrap()
    }

    #[test]
    fn test_lazy_allocation_and_reuse() {
        let mut fx = Fixture::new();
        let rt = target(RenderTargetDescriptor::new("rt", 32, 32));
        assert_eq!(fx.device.live_framebuffers(), 0);

        let a = fx.bind(&rt, 0).unwrap();
        let b = fx.bind(&rt, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(fx.device.live_framebuffers(), 1);
        assert_eq!(fx.device.live_renderbuffers(), 1);
        assert_eq!(fx.device.current_state().framebuffer, Some(a));
    }

    #[test]
    fn test_mrt_sets_draw_buffers() {
        let mut fx = Fixture::new();
        let rt = target(RenderTargetDescriptor {
            color_attachments: 3,
            ..RenderTargetDescriptor::new("gbuffer", 16, 16)
        });
        let framebuffer = fx.bind(&rt, 0).unwrap();
        assert!(fx.device.calls().iter().any(|call| matches!(
            call,
            DeviceCall::SetDrawBuffers { framebuffer: fb, count: 3 } if *fb == framebuffer
        )));
        assert_eq!(
            fx.device.count_calls(|c| matches!(c, DeviceCall::Attach { attachment: Attachment::Color(_), .. })),
            3
        );
    }

    #[test]
    fn test_msaa_resolves_into_textures() {
        let mut fx = Fixture::new();
        let rt = target(RenderTargetDescriptor {
            samples: 4,
            generate_mipmaps: true,
            ..RenderTargetDescriptor::new("msaa", 64, 64)
        });
        let framebuffer = fx.bind(&rt, 0).unwrap();
        assert_eq!(fx.device.live_framebuffers(), 2);
        assert_eq!(fx.device.live_renderbuffers(), 2);
        assert!(fx.targets.needs_resolve(rt.id()));

        fx.targets
            .finish(&mut fx.device, &mut fx.state, &mut fx.textures, &rt);
        assert!(!fx.targets.needs_resolve(rt.id()));
        assert!(fx.device.calls().iter().any(|call| matches!(
            call,
            DeviceCall::Blit { source, destination: Some(_), mask }
                if *source == framebuffer && *mask == ClearMask::COLOR
        )));
        assert_eq!(fx.device.count_calls(|c| matches!(c, DeviceCall::GenerateMipmaps(_))), 1);
    }

    #[test]
    fn test_msaa_resolve_includes_depth_texture() {
        let mut fx = Fixture::new();
        let rt = target(RenderTargetDescriptor {
            samples: 4,
            depth_texture: true,
            ..RenderTargetDescriptor::new("msaa-depth", 32, 32)
        });
        assert!(rt.depth_texture().is_some());
        fx.bind(&rt, 0).unwrap();
        fx.targets
            .finish(&mut fx.device, &mut fx.state, &mut fx.textures, &rt);

        let masks: Vec<ClearMask> = fx
            .device
            .calls()
            .iter()
            .filter_map(|call| match call {
                DeviceCall::Blit { mask, .. } => Some(*mask),
                _ => None,
            })
            .collect();
        assert_eq!(
            masks,
            vec![ClearMask {
                color: true,
                depth: true,
                stencil: false,
            }]
        );
    }

    #[test]
    fn test_resize_reallocates() {
        let mut fx = Fixture::new();
        let rt = target(RenderTargetDescriptor::new("rt", 32, 32));
        let old = fx.bind(&rt, 0).unwrap();
        let old_texture = fx.textures.handle(rt.texture().unwrap().id()).unwrap();

        rt.set_size(64, 64).unwrap();
        let new = fx.bind(&rt, 0).unwrap();
        assert_ne!(old, new);
        assert_eq!(fx.device.live_framebuffers(), 1);
        assert!(!fx.device.is_texture_alive(old_texture));
        let new_texture = fx.textures.handle(rt.texture().unwrap().id()).unwrap();
        assert_eq!(fx.device.texture_storage(new_texture).map(|s| s.width), Some(64));
    }

    #[test]
    fn test_cube_face_reattaches() {
        let mut fx = Fixture::new();
        let rt = target(RenderTargetDescriptor {
            dimension: TextureDimension::Cube,
            ..RenderTargetDescriptor::new("cube", 16, 16)
        });
        fx.bind(&rt, 0).unwrap();
        fx.device.clear_calls();
        fx.bind(&rt, 3).unwrap();
        assert!(fx.device.calls().iter().any(|call| matches!(
            call,
            DeviceCall::Attach { source: AttachmentSource::Texture { layer: 3, .. }, .. }
        )));
        fx.device.clear_calls();
        fx.bind(&rt, 3).unwrap();
        assert_eq!(fx.device.count_calls(|c| matches!(c, DeviceCall::Attach { .. })), 0);
    }

    #[test]
    fn test_failed_allocation_cleans_up() {
        let mut fx = Fixture::new();
        let rt = target(RenderTargetDescriptor::new("big", 1024, 1024));
        fx.device.set_memory_budget(Some(1024 * 1024));
        let result = fx.bind(&rt, 0);
        assert!(matches!(result, Err(DeviceError::OutOfMemory { .. })));
        assert_eq!(fx.device.live_framebuffers(), 0);
        assert_eq!(fx.device.live_renderbuffers(), 0);
        assert_eq!(fx.targets.count(), 0);
    }

    #[test]
    fn test_dispose_releases_everything() {
        let mut fx = Fixture::new();
        let rt = target(RenderTargetDescriptor {
            depth_texture: true,
            ..RenderTargetDescriptor::new("rt", 8, 8)
        });
        fx.bind(&rt, 0).unwrap();
        assert_eq!(fx.device.live_textures(), 2);

        fx.targets
            .dispose(&mut fx.device, &mut fx.state, &mut fx.textures, &rt);
        assert_eq!(fx.device.live_framebuffers(), 0);
        assert_eq!(fx.device.live_textures(), 0);
        assert_eq!(fx.state.framebuffer(), None);
    }
}
