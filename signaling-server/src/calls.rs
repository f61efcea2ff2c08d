//! Call state tracker: at most one call record per pair of users, and the
//! rules deciding which signal is acceptable in which phase.
//!
//! The tracker is a plain synchronous structure. Callers are expected to keep
//! it behind a single lock so that every transition for a pair is serialized.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use log::debug;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use call_relay_protocol::{Phase, Signal, UserId};

/// Unordered pair of users, normalized so that `{a, b}` and `{b, a}` are the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pair(UserId, UserId);

impl Pair {
    pub fn new(a: &UserId, b: &UserId) -> Self {
        if a <= b {
            Pair(a.clone(), b.clone())
        } else {
            Pair(b.clone(), a.clone())
        }
    }

    pub fn contains(&self, user_id: &UserId) -> bool {
        self.0 == *user_id || self.1 == *user_id
    }
}

impl Display for Pair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}, {}}}", self.0, self.1)
    }
}

/// Distinguishes successive calls between the same pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallId(u64);

impl Display for CallId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

#[derive(Debug)]
pub struct CallRecord {
    pub call_id: CallId,
    pub caller: UserId,
    pub callee: UserId,
    pub phase: Phase,
    /// Last offer that has not been answered yet
    pub pending_offer: Option<String>,
    /// Who sent `pending_offer`; the other side must answer
    pub offerer: Option<UserId>,
    pub missed_call_deadline: Option<Instant>,
    ring_timer: Option<AbortHandle>,
}

impl CallRecord {
    pub fn peer_of(&self, user_id: &UserId) -> &UserId {
        if *user_id == self.caller {
            &self.callee
        } else {
            &self.caller
        }
    }

    /// Clear the ringing deadline and abort the timer task, if one was armed.
    /// Returns whether there was a deadline to cancel.
    fn cancel_ring_timer(&mut self) -> bool {
        if let Some(timer) = self.ring_timer.take() {
            timer.abort();
        }
        self.missed_call_deadline.take().is_some()
    }
}

/// Side effects the owner of the tracker has to carry out after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Start the missed-call timer for the new call
    ArmRingTimer { deadline: Instant },
    /// The pending missed-call timer was cancelled
    RingTimerCancelled,
    /// Tell `caller` that `callee` never picked up
    MissedCall { caller: UserId, callee: UserId },
    /// The record is in `Ending` and must be released once the peer was notified
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub pair: Pair,
    pub call_id: CallId,
    pub from: Phase,
    pub to: Phase,
    pub effects: Vec<Effect>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("{event} is not valid while the call is {phase}")]
    InvalidPhase { phase: Phase, event: &'static str },
    #[error("{0} is already in another call")]
    Busy(UserId),
}

/// What is left of a call torn down because one of its users went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub pair: Pair,
    pub call_id: CallId,
    pub peer: UserId,
    pub phase: Phase,
}

#[derive(Debug)]
pub struct CallTracker {
    records: HashMap<Pair, CallRecord>,
    /// Pair each engaged user currently belongs to
    engaged: HashMap<UserId, Pair>,
    ring_timeout: std::time::Duration,
    next_call_id: u64,
}

impl CallTracker {
    pub fn new(ring_timeout: std::time::Duration) -> Self {
        CallTracker {
            records: HashMap::new(),
            engaged: HashMap::new(),
            ring_timeout,
            next_call_id: 1,
        }
    }

    pub fn phase(&self, a: &UserId, b: &UserId) -> Phase {
        self.records
            .get(&Pair::new(a, b))
            .map_or(Phase::Idle, |record| record.phase)
    }

    pub fn record(&self, a: &UserId, b: &UserId) -> Option<&CallRecord> {
        self.records.get(&Pair::new(a, b))
    }

    /// Number of calls that are not idle.
    pub fn active_calls(&self) -> usize {
        self.records.len()
    }

    /// Validate `signal` sent by `from` to `to` against the pair's record and apply it.
    pub fn apply(
        &mut self,
        from: &UserId,
        to: &UserId,
        signal: &Signal,
        now: Instant,
    ) -> Result<Transition, TransitionError> {
        let invalid = |phase| TransitionError::InvalidPhase {
            phase,
            event: signal.name(),
        };
        if from == to {
            return Err(invalid(Phase::Idle));
        }

        let pair = Pair::new(from, to);
        let Some(record) = self.records.get_mut(&pair) else {
            return match signal {
                Signal::CallRequest => self.open(pair, from, to, now),
                _ => Err(invalid(Phase::Idle)),
            };
        };

        let phase = record.phase;
        let by_caller = *from == record.caller;
        let mut effects = Vec::new();
        let next = match (phase, signal) {
            (p, Signal::CallCanceled) if p.is_ringing() && by_caller => {
                if record.cancel_ring_timer() {
                    effects.push(Effect::RingTimerCancelled);
                }
                record.pending_offer = None;
                Phase::Idle
            }
            (p, Signal::CallRejected) if p.is_ringing() && !by_caller => {
                if record.cancel_ring_timer() {
                    effects.push(Effect::RingTimerCancelled);
                }
                effects.push(Effect::MissedCall {
                    caller: record.caller.clone(),
                    callee: record.callee.clone(),
                });
                Phase::Idle
            }
            (p, Signal::CallAccepted) if p.is_ringing() && !by_caller => {
                if record.cancel_ring_timer() {
                    effects.push(Effect::RingTimerCancelled);
                }
                Phase::Accepted
            }
            (Phase::Accepted, Signal::Offer(sdp)) if by_caller => {
                record.pending_offer = Some(sdp.clone());
                record.offerer = Some(from.clone());
                Phase::Negotiating
            }
            // renegotiation round, either side may offer
            (Phase::Active, Signal::Offer(sdp)) => {
                record.pending_offer = Some(sdp.clone());
                record.offerer = Some(from.clone());
                Phase::Negotiating
            }
            // the answering side failed to apply the offer, the offerer tries again
            (Phase::Negotiating, Signal::Offer(sdp)) if record.offerer.as_ref() == Some(from) => {
                record.pending_offer = Some(sdp.clone());
                Phase::Negotiating
            }
            (Phase::Negotiating, Signal::Answer(_))
                if record.offerer.as_ref().is_some_and(|offerer| offerer != from) =>
            {
                record.pending_offer = None;
                record.offerer = None;
                Phase::Active
            }
            (p, Signal::IceCandidate(_) | Signal::MediaToggle { .. }) if p.is_connected() => p,
            (p @ (Phase::Active | Phase::Negotiating), Signal::ReconnectRequest) => p,
            (p, Signal::CallEnded) if p.is_ringing() || p.is_connected() => {
                if record.cancel_ring_timer() {
                    effects.push(Effect::RingTimerCancelled);
                }
                record.pending_offer = None;
                effects.push(Effect::Release);
                Phase::Ending
            }
            (p, Signal::CallCanceled) if p.is_connected() => {
                record.pending_offer = None;
                effects.push(Effect::Release);
                Phase::Ending
            }
            _ => return Err(invalid(phase)),
        };

        let call_id = record.call_id;
        if next == Phase::Idle {
            self.remove(&pair);
        } else {
            record.phase = next;
        }
        debug!("{call_id} {pair}: {phase} -> {next} on {}", signal.name());
        Ok(Transition {
            pair,
            call_id,
            from: phase,
            to: next,
            effects,
        })
    }

    fn open(
        &mut self,
        pair: Pair,
        caller: &UserId,
        callee: &UserId,
        now: Instant,
    ) -> Result<Transition, TransitionError> {
        for user_id in [caller, callee] {
            if self.engaged.contains_key(user_id) {
                return Err(TransitionError::Busy(user_id.clone()));
            }
        }
        let call_id = CallId(self.next_call_id);
        self.next_call_id += 1;
        let deadline = now + self.ring_timeout;
        self.records.insert(
            pair.clone(),
            CallRecord {
                call_id,
                caller: caller.clone(),
                callee: callee.clone(),
                phase: Phase::Requested,
                pending_offer: None,
                offerer: None,
                missed_call_deadline: Some(deadline),
                ring_timer: None,
            },
        );
        self.engaged.insert(caller.clone(), pair.clone());
        self.engaged.insert(callee.clone(), pair.clone());
        debug!("{call_id} {pair}: idle -> requested, rings until {deadline:?}");
        Ok(Transition {
            pair,
            call_id,
            from: Phase::Idle,
            to: Phase::Requested,
            effects: vec![Effect::ArmRingTimer { deadline }],
        })
    }

    /// The `call-request` of `call_id` reached the callee.
    pub fn mark_ringing(&mut self, pair: &Pair, call_id: CallId) {
        if let Some(record) = self.records.get_mut(pair) {
            if record.call_id == call_id && record.phase == Phase::Requested {
                record.phase = Phase::Ringing;
            }
        }
    }

    /// Attach the task that fires the missed-call timeout of `call_id`.
    /// If the call already left the ringing phase the task is aborted right away.
    pub fn arm_ring_timer(&mut self, pair: &Pair, call_id: CallId, timer: AbortHandle) {
        match self.records.get_mut(pair) {
            Some(record)
                if record.call_id == call_id
                    && record.phase.is_ringing()
                    && record.missed_call_deadline.is_some() =>
            {
                if let Some(previous) = record.ring_timer.replace(timer) {
                    previous.abort();
                }
            }
            _ => timer.abort(),
        }
    }

    /// The missed-call timeout of `call_id` fired.
    ///
    /// Only honored while that very call is still ringing; the record is
    /// released and returned so the caller can be told about the missed call.
    pub fn expire(&mut self, pair: &Pair, call_id: CallId) -> Option<CallRecord> {
        let record = self.records.get(pair)?;
        if record.call_id != call_id || !record.phase.is_ringing() {
            return None;
        }
        let mut record = self.remove(pair)?;
        record.ring_timer = None;
        record.missed_call_deadline = None;
        debug!("{call_id} {pair}: {} -> idle on ring timeout", record.phase);
        Some(record)
    }

    /// Finish the teardown of a call that reached `Ending`.
    pub fn release(&mut self, pair: &Pair, call_id: CallId) {
        if self
            .records
            .get(pair)
            .is_some_and(|record| record.call_id == call_id && record.phase == Phase::Ending)
        {
            self.remove(pair);
            debug!("{call_id} {pair}: ending -> idle");
        }
    }

    /// Tear down whatever call `user_id` is part of, used when the user disconnects.
    pub fn release_user(&mut self, user_id: &UserId) -> Option<Released> {
        let pair = self.engaged.get(user_id)?.clone();
        let mut record = self.remove(&pair)?;
        record.cancel_ring_timer();
        debug!(
            "{} {pair}: {} -> idle, {user_id} went away",
            record.call_id, record.phase
        );
        Some(Released {
            peer: record.peer_of(user_id).clone(),
            pair,
            call_id: record.call_id,
            phase: record.phase,
        })
    }

    fn remove(&mut self, pair: &Pair) -> Option<CallRecord> {
        let record = self.records.remove(pair)?;
        self.engaged.remove(&record.caller);
        self.engaged.remove(&record.callee);
        Some(record)
    }
}
