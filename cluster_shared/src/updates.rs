//! Update sequencing on the slave.
//!
//! Every `SG_UPDATE` names the frame it was built on (`prev_frame`) and the
//! frame it produces. The sequencer only releases an update whose
//! `prev_frame` equals the last frame applied, so updates apply exactly once
//! and in order even when datagrams are reordered.
//!
//! Objects created during a frame travel in a separate `SG_CREATE` tagged
//! with the same frame number. The update counts those records, so a frame
//! is held back until its creates have arrived too; a lost create stalls the
//! chain like a lost update and ends in a resync.
//!
//! Payload layout:
//!
//! ```text
//! prev_frame:u32, frame:u32, creates:u32, batch (see session)
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use tracing::debug;

use crate::{
    error::ProtocolResult,
    session::ObjectBatch,
    stream::ByteStream,
};

/// One decoded `SG_UPDATE` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameUpdate {
    pub prev_frame: u32,
    pub frame: u32,
    /// Records in this frame's `SG_CREATE`; zero when none was sent.
    pub creates: u32,
    pub batch: ObjectBatch,
}

impl FrameUpdate {
    pub fn encode(&self) -> Bytes {
        let mut s = ByteStream::new();
        s.write_u32(self.prev_frame);
        s.write_u32(self.frame);
        s.write_u32(self.creates);
        self.batch.write_to(&mut s);
        s.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let mut s = ByteStream::from_bytes(bytes);
        Ok(Self {
            prev_frame: s.read_u32()?,
            frame: s.read_u32()?,
            creates: s.read_u32()?,
            batch: ObjectBatch::read_from(&mut s)?,
        })
    }
}

/// A frame whose update and creates are both present, in apply order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyFrame {
    pub prev_frame: u32,
    pub frame: u32,
    pub creates: ObjectBatch,
    pub update: ObjectBatch,
}

/// What [`UpdateSequencer::push`] did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queued {
    Accepted,
    /// Already applied or superseded.
    Stale,
    /// Same `prev_frame` already waiting.
    Duplicate,
}

/// Orders incoming frame updates into a contiguous chain.
#[derive(Debug, Clone)]
pub struct UpdateSequencer {
    /// Updates keyed by `prev_frame`.
    pending: BTreeMap<u32, FrameUpdate>,
    /// Creates keyed by their own frame.
    creates: BTreeMap<u32, ObjectBatch>,
    last_applied: u32,
    max_gap: usize,
    /// Set when applying failed; nothing is released until [`Self::reset`].
    broken: bool,
}

impl UpdateSequencer {
    pub fn new(max_gap: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            creates: BTreeMap::new(),
            last_applied: 0,
            max_gap,
            broken: false,
        }
    }

    pub fn last_applied(&self) -> u32 {
        self.last_applied
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn push(&mut self, update: FrameUpdate) -> Queued {
        if update.frame <= self.last_applied || update.prev_frame < self.last_applied {
            debug!(frame = update.frame, last_applied = self.last_applied, "Stale update");
            return Queued::Stale;
        }
        if self.pending.contains_key(&update.prev_frame) {
            return Queued::Duplicate;
        }
        self.pending.insert(update.prev_frame, update);
        Queued::Accepted
    }

    /// Queues the `SG_CREATE` shipped for `frame`.
    pub fn push_creates(&mut self, frame: u32, batch: ObjectBatch) -> Queued {
        if frame <= self.last_applied {
            debug!(frame, last_applied = self.last_applied, "Stale create");
            return Queued::Stale;
        }
        if self.creates.contains_key(&frame) {
            return Queued::Duplicate;
        }
        self.creates.insert(frame, batch);
        Queued::Accepted
    }

    /// Releases the next frame of the chain if its update and creates are
    /// both here.
    pub fn pop_ready(&mut self) -> Option<ReadyFrame> {
        if self.broken {
            return None;
        }
        let (frame, wanted) = self
            .pending
            .get(&self.last_applied)
            .map(|u| (u.frame, u.creates))?;
        if wanted > 0 && !self.creates.contains_key(&frame) {
            return None;
        }
        let update = self.pending.remove(&self.last_applied)?;
        let creates = self.creates.remove(&frame).unwrap_or_default();
        self.last_applied = frame;
        Some(ReadyFrame {
            prev_frame: update.prev_frame,
            frame,
            creates,
            update: update.batch,
        })
    }

    /// Removes and returns every frame that continues the applied chain.
    pub fn drain_ready(&mut self) -> Vec<ReadyFrame> {
        std::iter::from_fn(|| self.pop_ready()).collect()
    }

    /// Marks the frame after `at` as failed: the chain rewinds to `at` and
    /// stays blocked until a snapshot resets it.
    pub fn fail(&mut self, at: u32) {
        debug!(at, "Update chain broken");
        self.last_applied = at;
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Restarts the chain at a snapshot frame, dropping what it covers.
    pub fn reset(&mut self, frame: u32) {
        self.last_applied = frame;
        self.pending = self.pending.split_off(&frame);
        self.creates = self.creates.split_off(&frame.saturating_add(1));
        self.broken = false;
    }

    /// True when the chain is stuck behind a missing update or create, or
    /// was broken by a failed apply.
    pub fn needs_resync(&self) -> bool {
        self.broken || self.pending.len() > self.max_gap
    }
}
