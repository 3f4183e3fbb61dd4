//! Render statistics.

use crate::geometry::primitive_count;

/// Draw counters of the current frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Draw calls issued.
    pub calls: u32,
    pub triangles: u32,
    pub lines: u32,
    pub points: u32,
    /// Uniform uploads issued by the binder.
    pub uniform_uploads: u32,
}

/// Live device-side objects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub programs: usize,
    pub textures: usize,
    pub geometries: usize,
    pub render_targets: usize,
    /// Bytes held by textures and buffers.
    pub bytes: u64,
}

/// Counters exposed through `Renderer::info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderInfo {
    pub render: FrameStats,
    pub memory: MemoryStats,
    /// Completed `render()` calls.
    pub frame: u64,
    /// Reset the frame counters at the start of every `render()`. Turn off to
    /// accumulate over several renders and call [`RenderInfo::reset`] manually.
    pub auto_reset: bool,
}

impl Default for RenderInfo {
    fn default() -> Self {
        Self {
            render: FrameStats::default(),
            memory: MemoryStats::default(),
            frame: 0,
            auto_reset: true,
        }
    }
}

impl RenderInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one draw of `count` elements, `instances` times.
    pub fn update(&mut self, topology: wgpu::PrimitiveTopology, count: u32, instances: u32) {
        let primitives = primitive_count(topology, count).saturating_mul(instances.max(1));
        self.render.calls += 1;
        match topology {
            wgpu::PrimitiveTopology::TriangleList | wgpu::PrimitiveTopology::TriangleStrip => {
                self.render.triangles += primitives
            }
            wgpu::PrimitiveTopology::LineList | wgpu::PrimitiveTopology::LineStrip => {
                self.render.lines += primitives
            }
            wgpu::PrimitiveTopology::PointList => self.render.points += primitives,
        }
    }

    /// Clear the frame counters.
    pub fn reset(&mut self) {
        self.render = FrameStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_counts_by_topology() {
        let mut info = RenderInfo::new();
        info.update(wgpu::PrimitiveTopology::TriangleList, 36, 1);
        info.update(wgpu::PrimitiveTopology::LineList, 4, 1);
        info.update(wgpu::PrimitiveTopology::PointList, 5, 2);
        assert_eq!(info.render.calls, 3);
        assert_eq!(info.render.triangles, 12);
        assert_eq!(info.render.lines, 2);
        assert_eq!(info.render.points, 10);
    }

    #[test]
    fn test_reset_keeps_frame_counter() {
        let mut info = RenderInfo::new();
        info.frame = 4;
        info.update(wgpu::PrimitiveTopology::TriangleStrip, 5, 1);
        info.reset();
        assert_eq!(info.render, FrameStats::default());
        assert_eq!(info.frame, 4);
    }
}
