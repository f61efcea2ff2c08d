use std::collections::VecDeque;

use log::{debug, warn};

use call_relay_protocol::IceCandidate;

use crate::engine::{NegotiationEngine, RemoteCommitted};

/// What happened to a candidate handed to [CandidateBuffer::push].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushed {
    /// Remote description not committed yet, kept for the next flush
    Buffered,
    Applied,
    /// The engine refused it
    Discarded,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub discarded: usize,
}

/// Remote ICE candidates that arrived before the remote description was committed.
///
/// Owned by one side of one call; nothing else touches it.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: VecDeque<IceCandidate>,
    remote_committed: bool,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_remote_committed(&self) -> bool {
        self.remote_committed
    }

    /// Forget everything, the next call starts without a remote description.
    pub fn reset(&mut self) {
        if !self.pending.is_empty() {
            debug!("dropping {} unused ICE candidates", self.pending.len());
        }
        self.pending.clear();
        self.remote_committed = false;
    }

    pub async fn push<E: NegotiationEngine + ?Sized>(
        &mut self,
        candidate: IceCandidate,
        engine: &mut E,
    ) -> Pushed {
        if !self.remote_committed {
            debug!("ICE candidate received before remote description, queueing it");
            self.pending.push_back(candidate);
            return Pushed::Buffered;
        }
        if apply(candidate, engine).await {
            Pushed::Applied
        } else {
            Pushed::Discarded
        }
    }

    /// Apply every queued candidate, oldest first, then empty the queue.
    ///
    /// From now on [push](Self::push) applies candidates directly.
    pub async fn flush<E: NegotiationEngine + ?Sized>(
        &mut self,
        committed: RemoteCommitted,
        engine: &mut E,
    ) -> FlushReport {
        self.remote_committed = true;
        let mut report = FlushReport::default();
        if self.pending.is_empty() {
            return report;
        }
        debug!(
            "remote {} committed, applying {} queued ICE candidates",
            committed.kind(),
            self.pending.len()
        );
        while let Some(candidate) = self.pending.pop_front() {
            if apply(candidate, engine).await {
                report.applied += 1;
            } else {
                report.discarded += 1;
            }
        }
        report
    }
}

async fn apply<E: NegotiationEngine + ?Sized>(candidate: IceCandidate, engine: &mut E) -> bool {
    match engine.add_ice_candidate(candidate).await {
        Ok(()) => true,
        Err(e) => {
            warn!("discarding ICE candidate: {e}");
            false
        }
    }
}
