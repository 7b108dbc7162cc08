//! Frame-Pacing Arbiter
//!
//! Wraps the timing predictor and tracks, per session, the single frame the
//! client currently has in flight. Lifecycle calls must name that frame.

use std::collections::HashMap;

use halo_ipc::N_SLOTS;
use thiserror::Error;
use tracing::{debug, trace};

use super::ClientId;
use crate::backend::{FrameEvent, FramePrediction, FramePredictor};

/// Frame id reported when nothing is in flight
pub const NO_FRAME: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("frame id {got} does not match frame {expected} in flight")]
pub struct FrameMismatch {
    pub expected: i64,
    pub got: i64,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    frame_id: i64,
    last_event: Option<FrameEvent>,
}

pub struct FramePacer {
    predictor: Box<dyn FramePredictor>,
    in_flight: HashMap<ClientId, InFlight>,
}

/// Ring slot a client should write next after publishing `slot_id`
pub fn next_slot(slot_id: u32) -> u32 {
    (slot_id + 1) % N_SLOTS as u32
}

impl FramePacer {
    pub fn new(predictor: Box<dyn FramePredictor>) -> Self {
        Self {
            predictor,
            in_flight: HashMap::new(),
        }
    }

    /// Predict the next frame and make it the client's frame in flight.
    ///
    /// A frame the client never finished is abandoned.
    pub fn wait_frame(&mut self, client: ClientId, now_ns: u64) -> FramePrediction {
        let prediction = self.predictor.predict(now_ns);
        let previous = self.in_flight.insert(
            client,
            InFlight {
                frame_id: prediction.frame_id,
                last_event: None,
            },
        );
        if let Some(previous) = previous {
            debug!(
                "Client {} abandoned frame {} (last event {:?})",
                client, previous.frame_id, previous.last_event
            );
        }
        trace!("Client {} waits for frame {}", client, prediction.frame_id);
        prediction
    }

    /// Frame currently in flight for a client, or [`NO_FRAME`]
    pub fn in_flight(&self, client: ClientId) -> i64 {
        self.in_flight
            .get(&client)
            .map_or(NO_FRAME, |f| f.frame_id)
    }

    /// Record a lifecycle event for the client's frame in flight.
    ///
    /// Discarding ends the frame.
    pub fn mark(&mut self, client: ClientId, frame_id: i64, event: FrameEvent, now_ns: u64) -> Result<(), FrameMismatch> {
        let expected = self.in_flight(client);
        if expected != frame_id {
            return Err(FrameMismatch {
                expected,
                got: frame_id,
            });
        }

        self.predictor.mark(frame_id, event, now_ns);
        if event == FrameEvent::Discarded {
            self.in_flight.remove(&client);
        } else if let Some(frame) = self.in_flight.get_mut(&client) {
            frame.last_event = Some(event);
        }
        Ok(())
    }

    /// Record that a frame's layers were handed over.
    ///
    /// Ends the frame if it is the one in flight.
    pub fn deliver(&mut self, client: ClientId, frame_id: i64, now_ns: u64) {
        self.predictor.mark(frame_id, FrameEvent::Delivered, now_ns);
        if self.in_flight(client) == frame_id {
            self.in_flight.remove(&client);
        } else {
            debug!(
                "Client {} delivered frame {} while {} is in flight",
                client,
                frame_id,
                self.in_flight(client)
            );
        }
    }

    /// Forget a client. The predictor resets once no frame is in flight.
    pub fn clear_client(&mut self, client: ClientId) {
        self.in_flight.remove(&client);
        if self.in_flight.is_empty() {
            self.predictor.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        marks: Vec<(i64, FrameEvent)>,
        clears: usize,
    }

    /// Hands out consecutive frame ids starting at a chosen value
    struct ScriptedPredictor {
        next: i64,
        log: Arc<Mutex<Log>>,
    }

    impl FramePredictor for ScriptedPredictor {
        fn predict(&mut self, now_ns: u64) -> FramePrediction {
            let frame_id = self.next;
            self.next += 1;
            FramePrediction {
                frame_id,
                wake_up_time_ns: now_ns,
                predicted_display_time_ns: now_ns + 10,
                ..Default::default()
            }
        }

        fn mark(&mut self, frame_id: i64, event: FrameEvent, _now_ns: u64) {
            self.log.lock().unwrap().marks.push((frame_id, event));
        }

        fn clear(&mut self) {
            self.log.lock().unwrap().clears += 1;
        }
    }

    fn pacer(first_id: i64) -> (FramePacer, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let predictor = ScriptedPredictor {
            next: first_id,
            log: log.clone(),
        };
        (FramePacer::new(Box::new(predictor)), log)
    }

    #[test]
    fn test_wait_woke_must_name_frame_in_flight() {
        let (mut pacer, log) = pacer(5);
        assert_eq!(pacer.wait_frame(1, 0).frame_id, 5);

        assert_eq!(
            pacer.mark(1, 6, FrameEvent::WaitWoke, 0),
            Err(FrameMismatch { expected: 5, got: 6 })
        );
        pacer.mark(1, 5, FrameEvent::WaitWoke, 0).unwrap();
        pacer.mark(1, 5, FrameEvent::Begin, 0).unwrap();
        assert_eq!(
            log.lock().unwrap().marks,
            vec![(5, FrameEvent::WaitWoke), (5, FrameEvent::Begin)]
        );
    }

    #[test]
    fn test_no_frame_in_flight() {
        let (mut pacer, _) = pacer(0);
        assert_eq!(pacer.in_flight(1), NO_FRAME);
        assert_eq!(
            pacer.mark(1, 0, FrameEvent::Begin, 0),
            Err(FrameMismatch { expected: -1, got: 0 })
        );
    }

    #[test]
    fn test_discard_ends_frame() {
        let (mut pacer, _) = pacer(0);
        pacer.wait_frame(1, 0);
        pacer.mark(1, 0, FrameEvent::Discarded, 0).unwrap();
        assert_eq!(pacer.in_flight(1), NO_FRAME);
        assert!(pacer.mark(1, 0, FrameEvent::Begin, 0).is_err());
    }

    #[test]
    fn test_deliver_ends_frame() {
        let (mut pacer, log) = pacer(0);
        pacer.wait_frame(1, 0);
        pacer.mark(1, 0, FrameEvent::Begin, 0).unwrap();
        pacer.deliver(1, 0, 0);
        assert_eq!(pacer.in_flight(1), NO_FRAME);
        assert_eq!(log.lock().unwrap().marks.last(), Some(&(0, FrameEvent::Delivered)));
    }

    #[test]
    fn test_wait_frame_replaces_unfinished_frame() {
        let (mut pacer, _) = pacer(0);
        pacer.wait_frame(1, 0);
        pacer.wait_frame(1, 0);
        assert_eq!(pacer.in_flight(1), 1);
        assert!(pacer.mark(1, 0, FrameEvent::Begin, 0).is_err());
    }

    #[test]
    fn test_sessions_are_independent() {
        let (mut pacer, _) = pacer(0);
        pacer.wait_frame(1, 0);
        pacer.wait_frame(2, 0);
        assert_eq!(pacer.in_flight(1), 0);
        assert_eq!(pacer.in_flight(2), 1);
        assert!(pacer.mark(2, 0, FrameEvent::Begin, 0).is_err());
    }

    #[test]
    fn test_predictor_cleared_when_idle() {
        let (mut pacer, log) = pacer(0);
        pacer.wait_frame(1, 0);
        pacer.wait_frame(2, 0);

        pacer.clear_client(1);
        assert_eq!(log.lock().unwrap().clears, 0);
        assert_eq!(pacer.in_flight(1), NO_FRAME);

        pacer.clear_client(2);
        assert_eq!(log.lock().unwrap().clears, 1);
    }

    #[test]
    fn test_next_slot_wraps() {
        let next: Vec<u32> = (0..N_SLOTS as u32).map(next_slot).collect();
        assert_eq!(next, [1, 2, 0]);
    }
}
