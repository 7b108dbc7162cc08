//! Frame timing for a display with a fixed refresh period.

use std::collections::VecDeque;

use tracing::trace;

use super::{FrameEvent, FramePrediction, FramePredictor};

/// How early a frame may be presented before its desired time
const PRESENT_SLOP_NS: u64 = 500_000;

/// Frames kept for inspection
const HISTORY_LEN: usize = 4;

/// What happened to one predicted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRecord {
    pub frame_id: i64,
    pub predicted_display_time_ns: u64,
    pub last_event: Option<FrameEvent>,
    pub last_event_ns: u64,
}

/// Predicts display times on vsync boundaries of a fixed-rate display.
///
/// Boundaries are counted from the first prediction. Every frame gets
/// `min_app_time_ns` to render plus one full period for composition.
pub struct FixedRatePredictor {
    period_ns: u64,
    min_app_time_ns: u64,
    epoch_ns: Option<u64>,
    last_frame_id: i64,
    last_display_ns: u64,
    history: VecDeque<FrameRecord>,
}

impl FixedRatePredictor {
    pub fn new(period_ns: u64, min_app_time_ns: u64) -> Self {
        Self {
            period_ns: period_ns.max(1),
            min_app_time_ns,
            epoch_ns: None,
            last_frame_id: -1,
            last_display_ns: 0,
            history: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    /// Build from a refresh rate in Hz
    pub fn from_refresh_rate(refresh_rate_hz: f64, min_app_time_ns: u64) -> Self {
        let period_ns = if refresh_rate_hz > 0.0 {
            (1_000_000_000.0 / refresh_rate_hz) as u64
        } else {
            0
        };
        Self::new(period_ns, min_app_time_ns)
    }

    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    /// Record of a recent frame, if still in the history
    #[cfg(test)]
    pub fn frame(&self, frame_id: i64) -> Option<&FrameRecord> {
        self.history.iter().find(|r| r.frame_id == frame_id)
    }
}

impl FramePredictor for FixedRatePredictor {
    fn predict(&mut self, now_ns: u64) -> FramePrediction {
        let epoch = *self.epoch_ns.get_or_insert(now_ns);
        let period = self.period_ns;

        // Round the earliest possible display time up to a vsync boundary
        let earliest = now_ns + self.min_app_time_ns + period;
        let since_epoch = earliest.saturating_sub(epoch);
        let mut display_ns = epoch + since_epoch.div_ceil(period) * period;
        if display_ns <= self.last_display_ns {
            display_ns = self.last_display_ns + period;
        }
        self.last_display_ns = display_ns;

        let desired_present = display_ns - period;
        let wake_up = desired_present.saturating_sub(self.min_app_time_ns).max(now_ns);

        self.last_frame_id += 1;
        let frame_id = self.last_frame_id;

        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(FrameRecord {
            frame_id,
            predicted_display_time_ns: display_ns,
            last_event: None,
            last_event_ns: now_ns,
        });

        trace!("Predicted frame {} for display at {}", frame_id, display_ns);

        FramePrediction {
            frame_id,
            wake_up_time_ns: wake_up,
            desired_present_time_ns: desired_present,
            present_slop_ns: PRESENT_SLOP_NS,
            predicted_display_time_ns: display_ns,
            predicted_display_period_ns: period,
            min_display_period_ns: period,
        }
    }

    fn mark(&mut self, frame_id: i64, event: FrameEvent, now_ns: u64) {
        if let Some(record) = self.history.iter_mut().find(|r| r.frame_id == frame_id) {
            trace!(
                "Frame {} (display at {}): {:?} -> {:?} after {} ns",
                frame_id,
                record.predicted_display_time_ns,
                record.last_event,
                event,
                now_ns.saturating_sub(record.last_event_ns)
            );
            record.last_event = Some(event);
            record.last_event_ns = now_ns;
        }
    }

    fn clear(&mut self) {
        self.history.clear();
        self.epoch_ns = None;
        self.last_display_ns = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: u64 = 10_000_000;
    const APP_TIME: u64 = 2_000_000;

    #[test]
    fn test_frame_ids_increase() {
        let mut p = FixedRatePredictor::new(PERIOD, APP_TIME);
        assert_eq!(p.predict(1_000).frame_id, 0);
        assert_eq!(p.predict(2_000).frame_id, 1);
        p.clear();
        assert_eq!(p.predict(3_000).frame_id, 2);
    }

    #[test]
    fn test_display_on_vsync_boundary() {
        let mut p = FixedRatePredictor::new(PERIOD, APP_TIME);
        let epoch = 100_000_000;
        let first = p.predict(epoch);
        assert_eq!((first.predicted_display_time_ns - epoch) % PERIOD, 0);
        assert!(first.predicted_display_time_ns >= epoch + APP_TIME + PERIOD);
        assert_eq!(first.desired_present_time_ns + PERIOD, first.predicted_display_time_ns);
        assert!(first.wake_up_time_ns >= epoch);
        assert_eq!(first.predicted_display_period_ns, PERIOD);
        assert_eq!(first.present_slop_ns, PRESENT_SLOP_NS);

        let second = p.predict(epoch + 3_000_000);
        assert_eq!((second.predicted_display_time_ns - epoch) % PERIOD, 0);
        assert!(second.predicted_display_time_ns > first.predicted_display_time_ns);
    }

    #[test]
    fn test_display_times_strictly_increase() {
        let mut p = FixedRatePredictor::new(PERIOD, APP_TIME);
        let mut last = 0;
        for _ in 0..8 {
            // Same instant every time
            let f = p.predict(50_000_000);
            assert!(f.predicted_display_time_ns > last);
            last = f.predicted_display_time_ns;
        }
    }

    #[test]
    fn test_mark_records_last_event() {
        let mut p = FixedRatePredictor::new(PERIOD, APP_TIME);
        let f = p.predict(0);
        p.mark(f.frame_id, FrameEvent::WaitWoke, 10);
        p.mark(f.frame_id, FrameEvent::Begin, 20);
        let record = p.frame(f.frame_id).unwrap();
        assert_eq!(record.last_event, Some(FrameEvent::Begin));
        assert_eq!(record.last_event_ns, 20);

        // Unknown frames are ignored
        p.mark(99, FrameEvent::Delivered, 30);
        assert!(p.frame(99).is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut p = FixedRatePredictor::new(PERIOD, APP_TIME);
        for i in 0..10 {
            p.predict(i * PERIOD);
        }
        assert!(p.frame(0).is_none());
        assert!(p.frame(9).is_some());
        assert!(p.frame(6).is_some());
    }

    #[test]
    fn test_refresh_rate() {
        let p = FixedRatePredictor::from_refresh_rate(100.0, 0);
        assert_eq!(p.period_ns(), PERIOD);
    }
}
