// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::time::{Duration, Instant};

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

/// Counts presented frames and reports a rate once per window.
pub struct FrameCounter {
    frames: u32,
    window: Duration,
    started: Instant,
}

impl FrameCounter {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    pub fn starting_at(window: Duration, now: Instant) -> Self {
        Self {
            frames: 0,
            window,
            started: now,
        }
    }

    pub fn frame(&mut self) {
        self.frames = self.frames.saturating_add(1);
    }

    pub fn reset(&mut self, now: Instant) {
        self.frames = 0;
        self.started = now;
    }

    /// Frames per second over the elapsed window, once the window has passed.
    pub fn poll(&mut self, now: Instant) -> Option<f32> {
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed < self.window {
            return None;
        }
        let fps = self.frames as f32 / elapsed.as_secs_f32();
        tracing::debug!(frames = self.frames, "fps window closed");
        self.reset(now);
        Some(fps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_only_after_window() {
        let t0 = Instant::now();
        let mut fc = FrameCounter::starting_at(Duration::from_secs(1), t0);
        for _ in 0..30 {
            fc.frame();
        }
        assert_eq!(fc.poll(t0 + Duration::from_millis(500)), None);
        let fps = fc.poll(t0 + Duration::from_secs(2)).unwrap();
        assert!((fps - 15.0).abs() < 1e-3);
        // window restarted
        assert_eq!(fc.poll(t0 + Duration::from_millis(2500)), None);
    }

    #[test]
    fn init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }
}
