//! Device storage for logical textures.
//!
//! Textures are uploaded lazily, the first time a draw samples them or a render
//! target attaches them. Uploads are shared: every texture with the same image
//! source and the same storage/sampling parameters points at one device texture
//! that is reference counted and deleted when its last user is disposed.

use std::collections::HashMap;

use crate::device::{
    Device, DeviceError, SamplerParams, TextureDimension, TextureHandle, TextureStorage,
};
use crate::state::StateTracker;
use crate::texture::{SourceId, Texture, TextureDescriptor, TextureId};

/// Everything that must match for two textures to share one upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShareKey {
    source: SourceId,
    format: wgpu::TextureFormat,
    dimension: TextureDimension,
    mip_levels: u32,
    sampler: SamplerParams,
}

impl ShareKey {
    fn new(descriptor: &TextureDescriptor) -> Self {
        Self {
            source: descriptor.image.id(),
            format: descriptor.format,
            dimension: descriptor.image.dimension(),
            mip_levels: descriptor.mip_levels(),
            sampler: descriptor.sampler,
        }
    }
}

struct SharedUpload {
    handle: TextureHandle,
    storage: TextureStorage,
    used_times: u32,
}

struct TextureRecord {
    version: u64,
    key: ShareKey,
}

/// Lifecycle of a logical texture as seen by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureStatus {
    /// Never uploaded, or disposed.
    Unallocated,
    /// Device storage matches the texture's current version.
    Uploaded,
    /// Device storage exists but the texture changed since.
    Stale,
}

/// Maps logical textures to shared device textures.
#[derive(Default)]
pub struct TextureCache {
    records: HashMap<TextureId, TextureRecord>,
    shares: HashMap<ShareKey, SharedUpload>,
}

impl TextureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device texture for `texture`, uploading or re-uploading as needed.
    pub fn acquire(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        texture: &Texture,
    ) -> Result<TextureHandle, DeviceError> {
        let id = texture.id();
        let version = texture.version();
        if let Some(record) = self.records.get(&id)
            && record.version == version
            && let Some(share) = self.shares.get(&record.key)
        {
            return Ok(share.handle);
        }

        let descriptor = texture.descriptor();
        let key = ShareKey::new(&descriptor);
        let previous = self.records.get(&id).map(|record| record.key.clone());

        let handle = if previous.as_ref() == Some(&key)
            && let Some(share) = self.shares.get(&key)
        {
            // Same source and parameters: refresh the contents in place.
            write_contents(device, share.handle, &descriptor)?;
            share.handle
        } else if let Some(share) = self.shares.get_mut(&key) {
            share.used_times += 1;
            share.handle
        } else {
            let share = create_upload(device, &descriptor)?;
            log::debug!(
                "Uploaded texture '{}' ({}x{}, {:?}, {} levels)",
                descriptor.label,
                share.storage.width,
                share.storage.height,
                share.storage.format,
                share.storage.mip_levels
            );
            let handle = share.handle;
            self.shares.insert(key.clone(), share);
            handle
        };

        if let Some(previous) = previous
            && previous != key
        {
            self.release_share(device, state, &previous);
        }
        self.records.insert(id, TextureRecord { version, key });
        Ok(handle)
    }

    /// Device texture currently backing `id`, without uploading.
    pub fn handle(&self, id: TextureId) -> Option<TextureHandle> {
        let record = self.records.get(&id)?;
        self.shares.get(&record.key).map(|share| share.handle)
    }

    pub fn status(&self, texture: &Texture) -> TextureStatus {
        match self.records.get(&texture.id()) {
            None => TextureStatus::Unallocated,
            Some(record) if record.version == texture.version() => TextureStatus::Uploaded,
            Some(_) => TextureStatus::Stale,
        }
    }

    /// Number of logical textures sharing the upload that backs `id`.
    pub fn used_times(&self, id: TextureId) -> u32 {
        self.records
            .get(&id)
            .and_then(|record| self.shares.get(&record.key))
            .map_or(0, |share| share.used_times)
    }

    /// Number of live device textures.
    pub fn count(&self) -> usize {
        self.shares.len()
    }

    /// Bytes held by live device textures.
    pub fn memory(&self) -> u64 {
        self.shares.values().map(|share| share.storage.byte_size()).sum()
    }

    /// Release `id`'s claim on its upload. Idempotent.
    pub fn dispose(&mut self, device: &mut dyn Device, state: &mut StateTracker, id: TextureId) {
        if let Some(record) = self.records.remove(&id) {
            self.release_share(device, state, &record.key);
        }
    }

    /// Delete every device texture.
    pub fn clear(&mut self, device: &mut dyn Device, state: &mut StateTracker) {
        self.records.clear();
        for (_, share) in self.shares.drain() {
            state.forget_texture(share.handle);
            device.delete_texture(share.handle);
        }
    }

    /// Drop all bookkeeping without device calls (the handles died with the context).
    pub fn forget_all(&mut self) {
        self.records.clear();
        self.shares.clear();
    }

    fn release_share(&mut self, device: &mut dyn Device, state: &mut StateTracker, key: &ShareKey) {
        let Some(share) = self.shares.get_mut(key) else {
            return;
        };
        share.used_times = share.used_times.saturating_sub(1);
        if share.used_times > 0 {
            return;
        }
        if let Some(share) = self.shares.remove(key) {
            state.forget_texture(share.handle);
            device.delete_texture(share.handle);
        }
    }
}

fn create_upload(
    device: &mut dyn Device,
    descriptor: &TextureDescriptor,
) -> Result<SharedUpload, DeviceError> {
    let storage = TextureStorage {
        dimension: descriptor.image.dimension(),
        width: descriptor.image.width(),
        height: descriptor.image.height(),
        mip_levels: descriptor.mip_levels(),
        format: descriptor.format,
    };
    let handle = device.create_texture(&storage)?;
    if let Err(err) = write_contents(device, handle, descriptor) {
        device.delete_texture(handle);
        return Err(err);
    }
    Ok(SharedUpload {
        handle,
        storage,
        used_times: 1,
    })
}

fn write_contents(
    device: &mut dyn Device,
    handle: TextureHandle,
    descriptor: &TextureDescriptor,
) -> Result<(), DeviceError> {
    device.set_sampler(handle, &descriptor.sampler);
    if let Some(data) = descriptor.image.data() {
        device.upload_texture(handle, 0, data)?;
        if descriptor.mip_levels() > 1 {
            device.generate_mipmaps(handle);
        }
    }
    Ok(())
}
