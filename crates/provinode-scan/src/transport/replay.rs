//! Bounded replay buffer for reconnect resume.
//!
//! The buffer keeps the raw plaintext sample frames most recently
//! handed to the transport, keyed by sequence number and scoped to one
//! session. A peer acknowledgement trims everything at or below the
//! acknowledged sequence; a peer-initiated resume replays what remains.
//! Insertion order is preserved independently of numeric order because
//! retransmission must resend the exact frames that were buffered.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::debug;

/// Maximum buffered frames per session.
pub const REPLAY_BUFFER_CAP: usize = 512;

/// Session-scoped, insertion-ordered frame buffer.
#[derive(Debug, Default)]
pub struct ReplayBuffer {
    session_id: Option<String>,
    frames: VecDeque<(i64, Bytes)>,
}

impl ReplayBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Buffers `frame` under `seq` for `session_id`.
    ///
    /// Switching sessions empties the buffer first. At capacity the
    /// oldest insertion is evicted.
    pub fn record(&mut self, session_id: &str, seq: i64, frame: Bytes) {
        if self.session_id.as_deref() != Some(session_id) {
            if self.session_id.is_some() {
                debug!(
                    previous = self.session_id.as_deref().unwrap_or_default(),
                    next = session_id,
                    "replay buffer reset on session change"
                );
            }
            self.frames.clear();
            self.session_id = Some(session_id.to_string());
        }

        if self.frames.len() == REPLAY_BUFFER_CAP {
            self.frames.pop_front();
        }
        self.frames.push_back((seq, frame));
    }

    /// Removes every frame with `seq <= ack`.
    pub fn trim_through(&mut self, ack: i64) {
        self.frames.retain(|(seq, _)| *seq > ack);
    }

    /// Frames with `seq > ack`, ascending by sequence number.
    #[must_use]
    pub fn frames_after(&self, ack: i64) -> Vec<(i64, Bytes)> {
        let mut frames: Vec<(i64, Bytes)> = self
            .frames
            .iter()
            .filter(|(seq, _)| *seq > ack)
            .cloned()
            .collect();
        frames.sort_by_key(|(seq, _)| *seq);
        frames
    }

    /// Empties the buffer and forgets the session binding.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.session_id = None;
    }
}
