//! Logical render targets.
//!
//! A [`RenderTarget`] describes offscreen color/depth storage. Its color
//! attachments are ordinary [`Texture`]s so a later pass can sample them. The
//! framebuffer, renderbuffers and MSAA resolve objects are allocated lazily by
//! the resource manager the first time the target is bound.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::device::{Capabilities, SamplerParams, TextureDimension};
use crate::error::RenderError;
use crate::sync;
use crate::texture::{ImageSource, Texture, TextureDescriptor};

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a render target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderTargetId(pub u64);

/// Creation parameters for a render target.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTargetDescriptor {
    pub label: String,
    pub width: u32,
    pub height: u32,
    /// 2D or cube storage; cube targets render one face at a time.
    pub dimension: TextureDimension,
    /// Number of color attachments (MRT when greater than one). Zero renders depth only.
    pub color_attachments: u32,
    pub color_format: wgpu::TextureFormat,
    /// MSAA sample count; 1 disables multisampling.
    pub samples: u32,
    /// Depth storage that is never sampled.
    pub depth_buffer: bool,
    pub stencil_buffer: bool,
    /// Depth storage exposed as a sampleable texture.
    pub depth_texture: bool,
    pub generate_mipmaps: bool,
    pub sampler: SamplerParams,
}

impl RenderTargetDescriptor {
    /// Single RGBA8 color attachment with a depth buffer.
    pub fn new(label: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            dimension: TextureDimension::D2,
            color_attachments: 1,
            color_format: wgpu::TextureFormat::Rgba8Unorm,
            samples: 1,
            depth_buffer: true,
            stencil_buffer: false,
            depth_texture: false,
            generate_mipmaps: false,
            sampler: SamplerParams::default(),
        }
    }

    /// Depth-only target whose depth is sampled with comparison (shadow maps).
    pub fn depth_only(label: impl Into<String>, size: u32, dimension: TextureDimension) -> Self {
        Self {
            dimension,
            color_attachments: 0,
            depth_texture: true,
            sampler: SamplerParams {
                mag_filter: wgpu::FilterMode::Linear,
                min_filter: wgpu::FilterMode::Linear,
                mipmap_filter: wgpu::MipmapFilterMode::Nearest,
                compare: Some(wgpu::CompareFunction::LessEqual),
                ..Default::default()
            },
            ..Self::new(label, size, size)
        }
    }

    /// Format of the depth attachment.
    pub fn depth_format(&self) -> wgpu::TextureFormat {
        if self.stencil_buffer {
            wgpu::TextureFormat::Depth24PlusStencil8
        } else {
            wgpu::TextureFormat::Depth32Float
        }
    }

    /// Check the attachment combination against device limits.
    pub fn validate(&self, capabilities: &Capabilities) -> Result<(), RenderError> {
        let invalid = |message: String| Err(RenderError::InvalidParameter(message));
        if self.width == 0 || self.height == 0 {
            return invalid(format!(
                "render target '{}' has zero size {}x{}",
                self.label, self.width, self.height
            ));
        }
        if self.width > capabilities.max_texture_size || self.height > capabilities.max_texture_size {
            return invalid(format!(
                "render target '{}' size {}x{} exceeds device maximum {}",
                self.label, self.width, self.height, capabilities.max_texture_size
            ));
        }
        if self.color_attachments > capabilities.max_draw_buffers {
            return invalid(format!(
                "render target '{}' requests {} color attachments, device supports {}",
                self.label, self.color_attachments, capabilities.max_draw_buffers
            ));
        }
        if self.color_attachments == 0 && !self.depth_buffer && !self.depth_texture {
            return invalid(format!("render target '{}' has no attachments", self.label));
        }
        if self.samples == 0 || self.samples > capabilities.max_samples {
            return invalid(format!(
                "render target '{}' requests {} samples, device supports 1..={}",
                self.label, self.samples, capabilities.max_samples
            ));
        }
        if self.stencil_buffer && !(self.depth_buffer || self.depth_texture) {
            return invalid(format!(
                "render target '{}' requests stencil without depth",
                self.label
            ));
        }
        if self.dimension == TextureDimension::Cube && self.width != self.height {
            return invalid(format!(
                "cube render target '{}' must be square, got {}x{}",
                self.label, self.width, self.height
            ));
        }
        if self.dimension == TextureDimension::Cube && self.samples > 1 {
            return invalid(format!(
                "cube render target '{}' cannot be multisampled",
                self.label
            ));
        }
        if self.color_format.is_depth_stencil_format() {
            return invalid(format!(
                "render target '{}' color format {:?} is a depth format",
                self.label, self.color_format
            ));
        }
        Ok(())
    }
}

struct RenderTargetInner {
    id: RenderTargetId,
    version: AtomicU64,
    descriptor: RwLock<RenderTargetDescriptor>,
    textures: Vec<Texture>,
    depth_texture: Option<Texture>,
}

/// Shared handle to an offscreen render target.
#[derive(Clone)]
pub struct RenderTarget {
    inner: Arc<RenderTargetInner>,
}

impl std::fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderTarget")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .finish()
    }
}

impl RenderTarget {
    /// Create a target after validating it against the device capabilities.
    pub fn new(
        descriptor: RenderTargetDescriptor,
        capabilities: &Capabilities,
    ) -> Result<Self, RenderError> {
        descriptor.validate(capabilities)?;
        let id = RenderTargetId(NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed));

        let textures = (0..descriptor.color_attachments)
            .map(|index| {
                let image =
                    ImageSource::empty(descriptor.width, descriptor.height, descriptor.dimension);
                Texture::for_render_target(
                    id,
                    TextureDescriptor::new(format!("{}-color{index}", descriptor.label), image)
                        .with_format(descriptor.color_format)
                        .with_sampler(descriptor.sampler)
                        .with_mipmaps(descriptor.generate_mipmaps),
                )
            })
            .collect();

        let depth_texture = descriptor.depth_texture.then(|| {
            let image = ImageSource::empty(descriptor.width, descriptor.height, descriptor.dimension);
            Texture::for_render_target(
                id,
                TextureDescriptor::new(format!("{}-depth", descriptor.label), image)
                    .with_format(descriptor.depth_format())
                    .with_sampler(descriptor.sampler)
                    .with_mipmaps(false),
            )
        });

        Ok(Self {
            inner: Arc::new(RenderTargetInner {
                id,
                version: AtomicU64::new(1),
                descriptor: RwLock::new(descriptor),
                textures,
                depth_texture,
            }),
        })
    }

    pub fn id(&self) -> RenderTargetId {
        self.inner.id
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn descriptor(&self) -> RenderTargetDescriptor {
        sync::read(&self.inner.descriptor).clone()
    }

    pub fn size(&self) -> (u32, u32) {
        let descriptor = sync::read(&self.inner.descriptor);
        (descriptor.width, descriptor.height)
    }

    pub fn samples(&self) -> u32 {
        sync::read(&self.inner.descriptor).samples
    }

    /// First color attachment, the usual sampling source.
    pub fn texture(&self) -> Option<&Texture> {
        self.inner.textures.first()
    }

    /// All color attachments in attachment order.
    pub fn textures(&self) -> &[Texture] {
        &self.inner.textures
    }

    pub fn depth_texture(&self) -> Option<&Texture> {
        self.inner.depth_texture.as_ref()
    }

    /// Whether `texture` is one of this target's attachments.
    pub fn owns(&self, texture: &Texture) -> bool {
        texture.render_target() == Some(self.inner.id)
    }

    /// Resize every attachment. Storage is reallocated on next bind.
    pub fn set_size(&self, width: u32, height: u32) -> Result<(), RenderError> {
        let mut descriptor = sync::write(&self.inner.descriptor);
        if descriptor.width == width && descriptor.height == height {
            return Ok(());
        }
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidParameter(format!(
                "render target '{}' cannot be resized to {width}x{height}",
                descriptor.label
            )));
        }
        descriptor.width = width;
        descriptor.height = height;
        for texture in self.inner.textures.iter().chain(self.inner.depth_texture.iter()) {
            texture.resize(width, height);
        }
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn ptr_eq(&self, other: &RenderTarget) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_rejected() {
        let caps = Capabilities::default();
        let result = RenderTarget::new(RenderTargetDescriptor::new("rt", 0, 16), &caps);
        assert!(matches!(result, Err(RenderError::InvalidParameter(_))));
    }

    #[test]
    fn test_too_many_draw_buffers_rejected() {
        let caps = Capabilities {
            max_draw_buffers: 4,
            ..Default::default()
        };
        let descriptor = RenderTargetDescriptor {
            color_attachments: 5,
            ..RenderTargetDescriptor::new("gbuffer", 64, 64)
        };
        assert!(RenderTarget::new(descriptor, &caps).is_err());
    }

    #[test]
    fn test_depth_texture_with_msaa_accepted() {
        let descriptor = RenderTargetDescriptor {
            samples: 4,
            depth_texture: true,
            ..RenderTargetDescriptor::new("rt", 64, 64)
        };
        let target = RenderTarget::new(descriptor, &Capabilities::default()).unwrap();
        assert!(target.depth_texture().is_some());
    }

    #[test]
    fn test_stencil_without_depth_rejected() {
        let descriptor = RenderTargetDescriptor {
            depth_buffer: false,
            stencil_buffer: true,
            ..RenderTargetDescriptor::new("rt", 64, 64)
        };
        assert!(RenderTarget::new(descriptor, &Capabilities::default()).is_err());
    }

    #[test]
    fn test_mrt_textures_belong_to_target() {
        let descriptor = RenderTargetDescriptor {
            color_attachments: 3,
            ..RenderTargetDescriptor::new("gbuffer", 32, 32)
        };
        let target = RenderTarget::new(descriptor, &Capabilities::default()).unwrap();
        assert_eq!(target.textures().len(), 3);
        assert!(target.textures().iter().all(|texture| target.owns(texture)));
        assert!(target.depth_texture().is_none());
    }

    #[test]
    fn test_set_size_bumps_versions() {
        let target =
            RenderTarget::new(RenderTargetDescriptor::new("rt", 32, 32), &Capabilities::default())
                .unwrap();
        let texture_version = target.texture().unwrap().version();
        let version = target.version();

        target.set_size(32, 32).unwrap();
        assert_eq!(target.version(), version);

        target.set_size(64, 16).unwrap();
        assert!(target.version() > version);
        assert!(target.texture().unwrap().version() > texture_version);
        assert_eq!(target.texture().unwrap().size(), (64, 16));
        assert!(target.set_size(0, 16).is_err());
    }

    #[test]
    fn test_depth_only_target() {
        let descriptor = RenderTargetDescriptor::depth_only("shadow", 512, TextureDimension::D2);
        let target = RenderTarget::new(descriptor, &Capabilities::default()).unwrap();
        assert!(target.texture().is_none());
        let depth = target.depth_texture().unwrap();
        assert_eq!(depth.descriptor().format, wgpu::TextureFormat::Depth32Float);
        assert!(depth.descriptor().sampler.compare.is_some());
    }
}
