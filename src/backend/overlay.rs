// UI overlay hooks
//
// The frame loop hands an overlay its render pass, the buffering depth and
// each frame's command buffer. What the overlay draws is its own business.

use anyhow::Result;
use ash::vk;
use std::time::{Duration, Instant};

pub trait Overlay {
    fn init(&mut self, render_pass: vk::RenderPass, buffering_depth: usize) -> Result<()>;
    fn shutdown(&mut self);
    fn new_frame(&mut self);
    /// Record overlay draws inside the active render pass
    fn render(&mut self, device: &ash::Device, cmd: vk::CommandBuffer);
}

/// Frame-rate counter that reports through a title sink once per second.
/// Records no GPU commands.
pub struct FpsOverlay {
    base_title: String,
    sink: Box<dyn FnMut(String)>,
    frames: u32,
    last_report: Instant,
    last_frame: Instant,
    active: bool,
}

impl FpsOverlay {
    pub fn new(base_title: impl Into<String>, sink: Box<dyn FnMut(String)>) -> Self {
        let now = Instant::now();
        Self {
            base_title: base_title.into(),
            sink,
            frames: 0,
            last_report: now,
            last_frame: now,
            active: false,
        }
    }

    /// Count a frame at `now`, reporting when a second has passed
    pub fn new_frame_at(&mut self, now: Instant) {
        if !self.active {
            return;
        }

        let frame_time = now.saturating_duration_since(self.last_frame);
        self.last_frame = now;
        self.frames += 1;

        let elapsed = now.saturating_duration_since(self.last_report);
        if elapsed >= Duration::from_secs(1) {
            let fps = self.frames as f32 / elapsed.as_secs_f32();
            (self.sink)(format!(
                "{} - {:.0} FPS ({:.2}ms)",
                self.base_title,
                fps,
                frame_time.as_secs_f32() * 1000.0
            ));
            self.frames = 0;
            self.last_report = now;
        }
    }
}

impl Overlay for FpsOverlay {
    fn init(&mut self, _render_pass: vk::RenderPass, buffering_depth: usize) -> Result<()> {
        log::debug!("FPS overlay active ({} frames in flight)", buffering_depth);
        let now = Instant::now();
        self.last_report = now;
        self.last_frame = now;
        self.active = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.active = false;
    }

    fn new_frame(&mut self) {
        self.new_frame_at(Instant::now());
    }

    fn render(&mut self, _device: &ash::Device, _cmd: vk::CommandBuffer) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn overlay() -> (FpsOverlay, Rc<RefCell<Vec<String>>>) {
        let titles = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&titles);
        let overlay = FpsOverlay::new("demo", Box::new(move |t| sink.borrow_mut().push(t)));
        (overlay, titles)
    }

    #[test]
    fn reports_once_per_second() {
        let (mut fps, titles) = overlay();
        fps.init(vk::RenderPass::null(), 2).unwrap();
        let start = fps.last_report;

        for i in 1..=59 {
            fps.new_frame_at(start + Duration::from_millis(i * 16));
        }
        assert!(titles.borrow().is_empty());

        fps.new_frame_at(start + Duration::from_millis(1000));
        let titles = titles.borrow();
        assert_eq!(titles.len(), 1);
        assert!(titles[0].starts_with("demo - 60 FPS"));
    }

    #[test]
    fn inactive_overlay_stays_silent() {
        let (mut fps, titles) = overlay();
        let start = fps.last_report;
        fps.new_frame_at(start + Duration::from_secs(5));
        assert!(titles.borrow().is_empty());

        fps.init(vk::RenderPass::null(), 2).unwrap();
        fps.shutdown();
        fps.new_frame_at(start + Duration::from_secs(10));
        assert!(titles.borrow().is_empty());
    }
}
