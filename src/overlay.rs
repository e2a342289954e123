// Overlay collaborator boundary
//
// The renderer does not know how the overlay builds its content; it only
// consumes one ready-to-record draw-data value per frame and exposes the
// off-screen scene texture the overlay may display.

use ash::vk;
use std::time::Duration;

/// Handle to the renderer's off-screen scene target, for overlay layers
/// that want to display it.
#[derive(Clone, Copy)]
pub struct SceneView {
    /// Combined-image-sampler descriptor set bound to the scene texture.
    pub texture: vk::DescriptorSet,
    pub extent: vk::Extent2D,
}

/// One frame of overlay output. Consumed exactly once by `Renderer::draw`,
/// which replays it inside the overlay render pass.
pub struct OverlayDrawData<'a> {
    record: Option<Box<dyn FnOnce(&ash::Device, vk::CommandBuffer) + 'a>>,
}

impl<'a> OverlayDrawData<'a> {
    /// A frame with nothing to draw.
    pub fn empty() -> Self {
        Self { record: None }
    }

    pub fn new(record: impl FnOnce(&ash::Device, vk::CommandBuffer) + 'a) -> Self {
        Self {
            record: Some(Box::new(record)),
        }
    }

    pub(crate) fn replay(self, device: &ash::Device, cmd: vk::CommandBuffer) {
        if let Some(record) = self.record {
            record(device, cmd);
        }
    }
}

/// Produces the overlay's draw data once per frame.
pub trait OverlayLayer {
    fn prepare(&mut self, scene: SceneView, frame_time: Duration) -> OverlayDrawData<'_>;
}

/// Minimal overlay layer: tracks frame timing and reports it through the
/// log instead of drawing. A windowed average is published once a second.
pub struct StatsOverlay {
    enabled: bool,
    frame_count: u32,
    accumulated: Duration,
}

impl StatsOverlay {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            frame_count: 0,
            accumulated: Duration::ZERO,
        }
    }
}

impl OverlayLayer for StatsOverlay {
    fn prepare(&mut self, _scene: SceneView, frame_time: Duration) -> OverlayDrawData<'_> {
        if self.enabled {
            self.frame_count += 1;
            self.accumulated += frame_time;

            if self.accumulated >= Duration::from_secs(1) {
                let avg_ms = self.accumulated.as_secs_f32() * 1000.0 / self.frame_count as f32;
                log::info!(
                    "cpu frame time: {:.2} ms ({:.0} fps)",
                    avg_ms,
                    1000.0 / avg_ms
                );
                self.frame_count = 0;
                self.accumulated = Duration::ZERO;
            }
        }

        OverlayDrawData::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn empty_draw_data_replays_nothing() {
        // Replaying an empty frame must not touch the command buffer;
        // there is no device in unit tests, so reaching the closure at all
        // would be a failure.
        let data = OverlayDrawData::empty();
        assert!(data.record.is_none());
    }

    #[test]
    fn draw_data_is_consumed_once() {
        let calls = Cell::new(0);
        let data = OverlayDrawData::new(|_, _| {
            calls.set(calls.get() + 1);
        });
        assert!(data.record.is_some());
        // `replay` takes the value; a second replay cannot be expressed.
        drop(data);
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn stats_overlay_produces_empty_frames() {
        let mut overlay = StatsOverlay::new(true);
        let scene = SceneView {
            texture: vk::DescriptorSet::null(),
            extent: vk::Extent2D {
                width: 600,
                height: 600,
            },
        };
        let data = overlay.prepare(scene, Duration::from_millis(16));
        assert!(data.record.is_none());
    }
}
