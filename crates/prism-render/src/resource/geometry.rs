//! Vertex and index buffers behind logical geometry.

use std::collections::HashMap;

use crate::device::{BufferHandle, BufferKind, Device, DeviceError, VertexBinding, VertexStream};
use crate::geometry::{Geometry, GeometryData, GeometryId, INSTANCE_MATRIX_LOCATION};
use crate::state::StateTracker;

/// Largest index that still fits a 16-bit index buffer.
const MAX_U16_INDEX: u32 = u16::MAX as u32;

struct GeometryRecord {
    version: u64,
    buffers: Vec<BufferHandle>,
    binding: VertexBinding,
    bytes: u64,
}

/// Maps logical geometry to device buffers.
#[derive(Default)]
pub struct GeometryCache {
    records: HashMap<GeometryId, GeometryRecord>,
}

impl GeometryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upload `geometry` if it is new or changed, then bind its buffers.
    pub fn bind(
        &mut self,
        device: &mut dyn Device,
        state: &mut StateTracker,
        geometry: &Geometry,
    ) -> Result<(), DeviceError> {
        let id = geometry.id();
        let version = geometry.version();
        let current = self
            .records
            .get(&id)
            .is_some_and(|record| record.version == version);
        if !current {
            if let Some(old) = self.records.remove(&id) {
                release(device, state, old);
            }
            let record = upload(device, &geometry.data(), version)?;
            self.records.insert(id, record);
        }
        if let Some(record) = self.records.get(&id) {
            state.bind_vertex_buffers(device, &record.binding);
        }
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    /// Bytes held by live vertex and index buffers.
    pub fn memory(&self) -> u64 {
        self.records.values().map(|record| record.bytes).sum()
    }

    pub fn dispose(&mut self, device: &mut dyn Device, state: &mut StateTracker, id: GeometryId) {
        if let Some(record) = self.records.remove(&id) {
            release(device, state, record);
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

fn upload(
    device: &mut dyn Device,
    data: &GeometryData,
    version: u64,
) -> Result<GeometryRecord, DeviceError> {
    let mut record = GeometryRecord {
        version,
        buffers: Vec::new(),
        binding: VertexBinding::default(),
        bytes: 0,
    };
    match fill(device, data, &mut record) {
        Ok(()) => Ok(record),
        Err(err) => {
            for buffer in record.buffers {
                device.delete_buffer(buffer);
            }
            Err(err)
        }
    }
}

fn fill(
    device: &mut dyn Device,
    data: &GeometryData,
    record: &mut GeometryRecord,
) -> Result<(), DeviceError> {
    let mut create = |record: &mut GeometryRecord, kind, bytes: &[u8]| {
        let buffer = device.create_buffer(kind, bytes)?;
        record.buffers.push(buffer);
        record.bytes += bytes.len() as u64;
        Ok::<_, DeviceError>(buffer)
    };

    for attribute in &data.attributes {
        let components = attribute.semantic.components();
        let buffer = create(record, BufferKind::Vertex, bytemuck::cast_slice(&attribute.data))?;
        record.binding.streams.push(VertexStream {
            location: attribute.semantic.location(),
            buffer,
            components,
            offset: 0,
            stride: components * 4,
            per_instance: false,
        });
    }

    if let Some(instances) = &data.instances {
        let matrices: Vec<f32> = instances
            .iter()
            .flat_map(|matrix| matrix.to_cols_array())
            .collect();
        let buffer = create(record, BufferKind::Vertex, bytemuck::cast_slice(&matrices))?;
        for column in 0..4 {
            record.binding.streams.push(VertexStream {
                location: INSTANCE_MATRIX_LOCATION + column,
                buffer,
                components: 4,
                offset: column * 16,
                stride: 64,
                per_instance: true,
            });
        }
    }

    if let Some(indices) = &data.indices {
        let max = indices.iter().copied().max().unwrap_or(0);
        let (buffer, format) = if max <= MAX_U16_INDEX {
            let narrow: Vec<u16> = indices.iter().map(|&index| index as u16).collect();
            (
                create(record, BufferKind::Index, bytemuck::cast_slice(&narrow))?,
                wgpu::IndexFormat::Uint16,
            )
        } else {
            (
                create(record, BufferKind::Index, bytemuck::cast_slice(indices))?,
                wgpu::IndexFormat::Uint32,
            )
        };
        record.binding.index = Some((buffer, format));
    }
    Ok(())
}

fn release(device: &mut dyn Device, state: &mut StateTracker, record: GeometryRecord) {
    for buffer in record.buffers {
        state.forget_buffer(buffer);
        device.delete_buffer(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCall, HeadlessDevice};
    use glam::{Mat4, Vec3};

    #[test]
    fn test_upload_once_and_rebind_is_noop() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(16);
        let mut cache = GeometryCache::new();
        let cube = Geometry::cuboid(1.0, 1.0, 1.0);

        cache.bind(&mut device, &mut state, &cube).unwrap();
        // position, normal, uv, index
        assert_eq!(device.live_buffers(), 4);
        device.clear_calls();
        cache.bind(&mut device, &mut state, &cube).unwrap();
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_small_indices_use_u16() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(16);
        let mut cache = GeometryCache::new();
        cache
            .bind(&mut device, &mut state, &Geometry::plane(1.0, 1.0))
            .unwrap();
        let binding = device.current_state().vertex_binding.clone().unwrap();
        assert_eq!(binding.index.map(|(_, format)| format), Some(wgpu::IndexFormat::Uint16));
    }

    #[test]
    fn test_large_indices_use_u32() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(16);
        let mut cache = GeometryCache::new();
        let positions = vec![0.0; 70_000 * 3];
        let geometry =
            Geometry::new(GeometryData::new(positions).with_indices(vec![0, 1, 69_999])).unwrap();
        cache.bind(&mut device, &mut state, &geometry).unwrap();
        let binding = device.current_state().vertex_binding.clone().unwrap();
        assert_eq!(binding.index.map(|(_, format)| format), Some(wgpu::IndexFormat::Uint32));
    }

    #[test]
    fn test_instances_bind_four_columns() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(16);
        let mut cache = GeometryCache::new();
        let geometry = Geometry::cuboid(1.0, 1.0, 1.0);
        geometry
            .update(|data| {
                data.instances = Some(vec![
                    Mat4::IDENTITY,
                    Mat4::from_translation(Vec3::X * 3.0),
                ])
            })
            .unwrap();
        cache.bind(&mut device, &mut state, &geometry).unwrap();
        let binding = device.current_state().vertex_binding.clone().unwrap();
        let instanced: Vec<u32> = binding
            .streams
            .iter()
            .filter(|stream| stream.per_instance)
            .map(|stream| stream.location)
            .collect();
        assert_eq!(instanced, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_version_change_reuploads() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(16);
        let mut cache = GeometryCache::new();
        let geometry = Geometry::plane(1.0, 1.0);
        cache.bind(&mut device, &mut state, &geometry).unwrap();
        let before = device.count_calls(|c| matches!(c, DeviceCall::CreateBuffer(_)));

        geometry
            .update(|data| data.draw_range.count = Some(3))
            .unwrap();
        cache.bind(&mut device, &mut state, &geometry).unwrap();
        let after = device.count_calls(|c| matches!(c, DeviceCall::CreateBuffer(_)));
        assert_eq!(after, before * 2);
        assert_eq!(cache.count(), 1);
        assert_eq!(device.live_buffers(), before);
    }

    #[test]
    fn test_failed_upload_frees_partial_buffers() {
        let mut device = HeadlessDevice::new();
        let mut state = StateTracker::new(16);
        let mut cache = GeometryCache::new();
        device.set_memory_budget(Some(300));
        let result = cache.bind(&mut device, &mut state, &Geometry::cuboid(1.0, 1.0, 1.0));
        assert!(result.is_err());
        assert_eq!(device.live_buffers(), 0);
        assert_eq!(device.allocated_bytes(), 0);
    }
}
