//! Rendering abstraction.
//!
//! The cluster layer does not depend on a graphics backend. A slave hands its
//! replicated scene to a [`FrameRenderer`] once per frame; what "drawing"
//! means is up to the implementation.

use crate::{
    objects::{Camera, Transform},
    session::Session,
};

/// Renders one frame from the slave's replicated scene.
pub trait FrameRenderer: Send {
    /// Draws frame `frame`. Called between `DRAWING` and `DRAW_DONE`.
    fn draw(&mut self, frame: u32, scene: &Session) -> anyhow::Result<()>;

    /// Presents the frame. Called after `DRAW_DONE` is sent.
    fn present(&mut self, _frame: u32) {}
}

/// A no-op renderer useful for headless tests.
#[derive(Debug, Default)]
pub struct NullRenderer;

impl FrameRenderer for NullRenderer {
    fn draw(&mut self, _frame: u32, _scene: &Session) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a [`FrameLog`] saw for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawnFrame {
    pub frame: u32,
    pub objects: usize,
    pub transforms: usize,
    /// Name of the first camera found, if any.
    pub camera: Option<String>,
}

/// Headless renderer that records a summary of every frame it draws.
#[derive(Debug, Default)]
pub struct FrameLog {
    frames: Vec<DrawnFrame>,
    presented: Vec<u32>,
}

impl FrameLog {
    pub fn frames(&self) -> &[DrawnFrame] {
        &self.frames
    }

    pub fn presented(&self) -> &[u32] {
        &self.presented
    }
}

impl FrameRenderer for FrameLog {
    fn draw(&mut self, frame: u32, scene: &Session) -> anyhow::Result<()> {
        let mut transforms = 0;
        let mut camera = None;
        for id in scene.ids() {
            if scene.get::<Transform>(id).is_some() {
                transforms += 1;
            } else if let Some(cam) = scene.get::<Camera>(id) {
                camera.get_or_insert_with(|| cam.name().to_string());
            }
        }
        self.frames.push(DrawnFrame {
            frame,
            objects: scene.len(),
            transforms,
            camera,
        });
        Ok(())
    }

    fn present(&mut self, frame: u32) {
        self.presented.push(frame);
    }
}
