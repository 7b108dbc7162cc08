// Delivered-frame rate, reported periodically in the log
use std::time::{Duration, Instant};

/// Rolling count of frames delivered through `layer_sync`
pub struct FrameStats {
    /// When the current window started
    window_start: Instant,
    /// Frames in the current window
    frames: u32,
    /// Rate measured over the last full window
    rate: f64,
    window: Duration,
}

impl FrameStats {
    pub fn new(window: Duration) -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
            rate: 0.0,
            window,
        }
    }

    /// Count one delivered frame.
    /// Returns Some(rate) when a window has just closed.
    pub fn tick(&mut self) -> Option<f64> {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> Option<f64> {
        self.frames += 1;

        let elapsed = now.duration_since(self.window_start);
        if elapsed >= self.window {
            self.rate = self.frames as f64 / elapsed.as_secs_f64();
            self.frames = 0;
            self.window_start = now;
            Some(self.rate)
        } else {
            None
        }
    }

    /// Rate measured over the last full window
    pub fn rate(&self) -> f64 {
        self.rate
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
