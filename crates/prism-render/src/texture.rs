//! Logical textures.
//!
//! A [`Texture`] is a cheap, clonable handle describing pixel data and how it is
//! sampled. It owns no GPU memory; the resource manager uploads it on first
//! bind and re-uploads it whenever its version advances. Pixel data lives in a
//! shared [`ImageSource`] so several textures may reference the same image with
//! different sampling parameters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::device::{SamplerParams, TextureDimension};
use crate::error::RenderError;
use crate::render_target::RenderTargetId;
use crate::sync;

static NEXT_TEXTURE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a logical texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u64);

/// Identity of an image source; textures sharing a source may share an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

/// Calculates the number of mip levels for the given dimensions.
pub fn mip_level_count(width: u32, height: u32) -> u32 {
    (width.max(height).max(1) as f32).log2().floor() as u32 + 1
}

/// Immutable pixel data shared between textures.
#[derive(Debug)]
pub struct ImageSource {
    id: SourceId,
    width: u32,
    height: u32,
    dimension: TextureDimension,
    data: Option<Vec<u8>>,
}

impl ImageSource {
    /// A 2D image with tightly packed pixel rows.
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Arc<Self> {
        Self::build(width, height, TextureDimension::D2, Some(data))
    }

    /// A cube image: six square faces (+X, -X, +Y, -Y, +Z, -Z) concatenated.
    pub fn cube(size: u32, data: Vec<u8>) -> Arc<Self> {
        Self::build(size, size, TextureDimension::Cube, Some(data))
    }

    /// Storage without pixel data, filled by rendering.
    pub fn empty(width: u32, height: u32, dimension: TextureDimension) -> Arc<Self> {
        Self::build(width, height, dimension, None)
    }

    fn build(
        width: u32,
        height: u32,
        dimension: TextureDimension,
        data: Option<Vec<u8>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: SourceId(NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed)),
            width,
            height,
            dimension,
            data,
        })
    }

    pub fn id(&self) -> SourceId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimension(&self) -> TextureDimension {
        self.dimension
    }

    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }
}

/// Everything the resource manager needs to upload a texture.
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: String,
    pub image: Arc<ImageSource>,
    pub format: wgpu::TextureFormat,
    pub sampler: SamplerParams,
    pub generate_mipmaps: bool,
}

impl TextureDescriptor {
    /// RGBA8 texture with linear filtering and generated mipmaps.
    pub fn new(label: impl Into<String>, image: Arc<ImageSource>) -> Self {
        Self {
            label: label.into(),
            image,
            format: wgpu::TextureFormat::Rgba8Unorm,
            sampler: SamplerParams {
                min_filter: wgpu::FilterMode::Linear,
                mipmap_filter: wgpu::MipmapFilterMode::Linear,
                ..Default::default()
            },
            generate_mipmaps: true,
        }
    }

    pub fn with_format(mut self, format: wgpu::TextureFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerParams) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_mipmaps(mut self, generate: bool) -> Self {
        self.generate_mipmaps = generate;
        self
    }

    /// Number of mip levels the uploaded storage holds.
    pub fn mip_levels(&self) -> u32 {
        if self.generate_mipmaps {
            mip_level_count(self.image.width, self.image.height)
        } else {
            1
        }
    }

    /// Expected byte length of level 0 for all layers.
    pub fn expected_byte_size(&self) -> usize {
        let texel = self.format.block_copy_size(None).unwrap_or(4) as usize;
        self.image.width as usize
            * self.image.height as usize
            * texel
            * self.image.dimension.layers() as usize
    }

    fn validate(&self) -> Result<(), RenderError> {
        let (width, height) = (self.image.width, self.image.height);
        if width == 0 || height == 0 {
            return Err(RenderError::InvalidParameter(format!(
                "texture '{}' dimensions must be non-zero, got {width}x{height}",
                self.label
            )));
        }
        if self.image.dimension == TextureDimension::Cube && width != height {
            return Err(RenderError::InvalidParameter(format!(
                "cube texture '{}' faces must be square, got {width}x{height}",
                self.label
            )));
        }
        if let Some(data) = &self.image.data {
            let expected = self.expected_byte_size();
            if data.len() != expected {
                return Err(RenderError::InvalidParameter(format!(
                    "texture '{}' data size ({}) does not match expected ({expected}) for {width}x{height} {:?}",
                    self.label,
                    data.len(),
                    self.format
                )));
            }
        }
        Ok(())
    }
}

struct TextureInner {
    id: TextureId,
    version: AtomicU64,
    render_target: Option<RenderTargetId>,
    descriptor: RwLock<TextureDescriptor>,
}

/// Shared handle to a logical texture.
#[derive(Clone)]
pub struct Texture {
    inner: Arc<TextureInner>,
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .finish()
    }
}

impl Texture {
    /// Create a texture, validating its data against its dimensions and format.
    pub fn new(descriptor: TextureDescriptor) -> Result<Self, RenderError> {
        descriptor.validate()?;
        Ok(Self::build(descriptor, None))
    }

    /// Texture backing a render target attachment.
    pub(crate) fn for_render_target(target: RenderTargetId, descriptor: TextureDescriptor) -> Self {
        Self::build(descriptor, Some(target))
    }

    fn build(descriptor: TextureDescriptor, render_target: Option<RenderTargetId>) -> Self {
        Self {
            inner: Arc::new(TextureInner {
                id: TextureId(NEXT_TEXTURE_ID.fetch_add(1, Ordering::Relaxed)),
                version: AtomicU64::new(1),
                render_target,
                descriptor: RwLock::new(descriptor),
            }),
        }
    }

    pub fn id(&self) -> TextureId {
        self.inner.id
    }

    /// Monotonic version; increases on every mutation.
    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// Render target this texture is attached to, if any.
    pub fn render_target(&self) -> Option<RenderTargetId> {
        self.inner.render_target
    }

    /// Snapshot of the current descriptor.
    pub fn descriptor(&self) -> TextureDescriptor {
        sync::read(&self.inner.descriptor).clone()
    }

    pub fn dimension(&self) -> TextureDimension {
        sync::read(&self.inner.descriptor).image.dimension
    }

    pub fn size(&self) -> (u32, u32) {
        let descriptor = sync::read(&self.inner.descriptor);
        (descriptor.image.width, descriptor.image.height)
    }

    /// Replace the pixel data.
    pub fn set_image(&self, image: Arc<ImageSource>) -> Result<(), RenderError> {
        let mut descriptor = sync::write(&self.inner.descriptor);
        let mut updated = descriptor.clone();
        updated.image = image;
        updated.validate()?;
        *descriptor = updated;
        self.bump();
        Ok(())
    }

    /// Change how the texture is sampled.
    pub fn set_sampler(&self, sampler: SamplerParams) {
        sync::write(&self.inner.descriptor).sampler = sampler;
        self.bump();
    }

    /// Force a re-upload on next use.
    pub fn needs_update(&self) {
        self.bump();
    }

    /// Resize render target storage.
    pub(crate) fn resize(&self, width: u32, height: u32) {
        let mut descriptor = sync::write(&self.inner.descriptor);
        let dimension = descriptor.image.dimension;
        descriptor.image = ImageSource::empty(width, height, dimension);
        self.bump();
    }

    pub fn ptr_eq(&self, other: &Texture) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn bump(&self) {
        self.inner.version.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba(width: u32, height: u32) -> Arc<ImageSource> {
        ImageSource::new(width, height, vec![255; (width * height * 4) as usize])
    }

    #[test]
    fn test_mip_level_count() {
        assert_eq!(mip_level_count(1, 1), 1);
        assert_eq!(mip_level_count(256, 256), 9);
        assert_eq!(mip_level_count(1024, 512), 11);
        assert_eq!(mip_level_count(3, 7), 3);
    }

    #[test]
    fn test_data_size_mismatch_rejected() {
        let image = ImageSource::new(4, 4, vec![0; 10]);
        let result = Texture::new(TextureDescriptor::new("bad", image));
        assert!(matches!(result, Err(RenderError::InvalidParameter(_))));
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let image = ImageSource::new(0, 4, Vec::new());
        let result = Texture::new(TextureDescriptor::new("empty", image));
        assert!(matches!(result, Err(RenderError::InvalidParameter(_))));
    }

    #[test]
    fn test_cube_expected_size_counts_faces() {
        let image = ImageSource::cube(2, vec![0; 2 * 2 * 4 * 6]);
        let descriptor = TextureDescriptor::new("sky", image);
        assert_eq!(descriptor.expected_byte_size(), 96);
        assert!(Texture::new(descriptor).is_ok());
    }

    #[test]
    fn test_mutation_bumps_version() {
        let texture = Texture::new(TextureDescriptor::new("albedo", rgba(2, 2))).unwrap();
        let v0 = texture.version();
        texture.set_sampler(SamplerParams {
            wrap_s: wgpu::AddressMode::Repeat,
            ..Default::default()
        });
        assert!(texture.version() > v0);
        let v1 = texture.version();
        texture.set_image(rgba(4, 4)).unwrap();
        assert!(texture.version() > v1);
        assert_eq!(texture.size(), (4, 4));
    }

    #[test]
    fn test_failed_set_image_keeps_descriptor() {
        let texture = Texture::new(TextureDescriptor::new("albedo", rgba(2, 2))).unwrap();
        let version = texture.version();
        let result = texture.set_image(ImageSource::new(2, 2, vec![0; 3]));
        assert!(result.is_err());
        assert_eq!(texture.version(), version);
        assert_eq!(texture.size(), (2, 2));
    }

    #[test]
    fn test_unique_ids() {
        let image = rgba(1, 1);
        let a = Texture::new(TextureDescriptor::new("a", image.clone())).unwrap();
        let b = Texture::new(TextureDescriptor::new("b", image)).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&a.clone()));
    }
}
