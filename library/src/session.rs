/*!
Client-side view of a call: one [CallSession] per participant.

The session turns user actions and messages coming from the signaling server into
messages to send back, drives the [NegotiationEngine] and keeps track of what the
user interface should show.
*/

use log::{debug, info, warn};

use call_relay_protocol::{
    ClientMessage, IceCandidate, Media, Phase, ServerMessage, Signal, UserId,
};

use crate::candidates::CandidateBuffer;
use crate::engine::{commit_remote_description, NegotiationEngine, NegotiationError, SdpKind};

/// What the user interface should currently announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    None,
    /// `from` is ringing us
    Incoming(UserId),
    /// We are ringing `to`
    Outgoing(UserId),
    /// `from` did not pick up or declined our call
    Missed(UserId),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no identity assigned by the signaling server yet")]
    NotAssigned,
    #[error("already in a call with {0}")]
    Busy(UserId),
    #[error("cannot {action} while the call is {phase}")]
    InvalidPhase { action: &'static str, phase: Phase },
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMedia {
    pub camera: bool,
    pub microphone: bool,
}

impl Default for RemoteMedia {
    fn default() -> Self {
        RemoteMedia {
            camera: true,
            microphone: true,
        }
    }
}

#[derive(Debug)]
struct Call {
    peer: UserId,
    caller: bool,
    phase: Phase,
}

pub struct CallSession<E> {
    engine: E,
    me: Option<UserId>,
    roster: Vec<UserId>,
    call: Option<Call>,
    notification: Notification,
    remote_media: RemoteMedia,
    candidates: CandidateBuffer,
}

impl<E: NegotiationEngine> CallSession<E> {
    pub fn new(engine: E) -> Self {
        CallSession {
            engine,
            me: None,
            roster: Vec::new(),
            call: None,
            notification: Notification::None,
            remote_media: RemoteMedia::default(),
            candidates: CandidateBuffer::new(),
        }
    }

    pub fn me(&self) -> Option<&UserId> {
        self.me.as_ref()
    }

    /// Other users currently reachable through the signaling server.
    pub fn contacts(&self) -> impl Iterator<Item = &UserId> {
        self.roster
            .iter()
            .filter(move |user_id| Some(*user_id) != self.me.as_ref())
    }

    pub fn notification(&self) -> &Notification {
        &self.notification
    }

    pub fn phase(&self) -> Phase {
        self.call.as_ref().map_or(Phase::Idle, |call| call.phase)
    }

    pub fn peer(&self) -> Option<&UserId> {
        self.call.as_ref().map(|call| &call.peer)
    }

    pub fn remote_media(&self) -> RemoteMedia {
        self.remote_media
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Ring `peer`.
    pub fn call(&mut self, peer: UserId) -> Result<ClientMessage, SessionError> {
        if self.me.is_none() {
            return Err(SessionError::NotAssigned);
        }
        if let Some(call) = &self.call {
            return Err(SessionError::Busy(call.peer.clone()));
        }
        info!("calling {peer}");
        self.start(peer.clone(), true, Phase::Requested);
        self.notification = Notification::Outgoing(peer.clone());
        Ok(ClientMessage::new(peer, Signal::CallRequest))
    }

    /// Pick up the incoming call.
    pub fn accept(&mut self) -> Result<ClientMessage, SessionError> {
        let call = self.ringing("accept", false)?;
        call.phase = Phase::Accepted;
        let peer = call.peer.clone();
        self.notification = Notification::None;
        Ok(ClientMessage::new(peer, Signal::CallAccepted))
    }

    /// Decline the incoming call.
    pub fn reject(&mut self) -> Result<ClientMessage, SessionError> {
        let peer = self.ringing("reject", false)?.peer.clone();
        self.finish();
        Ok(ClientMessage::new(peer, Signal::CallRejected))
    }

    /// Stop ringing the callee before they answered.
    pub fn cancel(&mut self) -> Result<ClientMessage, SessionError> {
        let peer = self.ringing("cancel", true)?.peer.clone();
        self.finish();
        Ok(ClientMessage::new(peer, Signal::CallCanceled))
    }

    /// End the call, whatever phase it is in.
    pub fn hang_up(&mut self) -> Result<ClientMessage, SessionError> {
        let Some(call) = self.call.take() else {
            return Err(SessionError::InvalidPhase {
                action: "hang up",
                phase: Phase::Idle,
            });
        };
        self.finish();
        Ok(ClientMessage::new(call.peer, Signal::CallEnded))
    }

    pub fn toggle_media(
        &mut self,
        media: Media,
        enabled: bool,
    ) -> Result<ClientMessage, SessionError> {
        let peer = self.connected("toggle media")?.peer.clone();
        Ok(ClientMessage::new(peer, Signal::MediaToggle { media, enabled }))
    }

    /// A candidate gathered by the local engine, to be trickled to the peer.
    pub fn local_candidate(&self, candidate: IceCandidate) -> Option<ClientMessage> {
        let call = self.call.as_ref().filter(|call| call.phase.is_connected())?;
        Some(ClientMessage::new(
            call.peer.clone(),
            Signal::IceCandidate(candidate),
        ))
    }

    /// Start a new offer/answer round.
    ///
    /// Used when media connectivity was lost during the call, and to send our offer
    /// again when the peer could not answer it, or when creating it failed after the
    /// call was accepted.
    pub async fn request_reconnect(&mut self) -> Result<Vec<ClientMessage>, SessionError> {
        let (peer, phase) = match self.call.as_ref() {
            Some(call)
                if matches!(call.phase, Phase::Active | Phase::Negotiating)
                    || (call.phase == Phase::Accepted && call.caller) =>
            {
                (call.peer.clone(), call.phase)
            }
            call => {
                return Err(SessionError::InvalidPhase {
                    action: "reconnect",
                    phase: call.map_or(Phase::Idle, |call| call.phase),
                })
            }
        };
        let offer = self.offer().await?;
        let mut messages = Vec::with_capacity(2);
        // nothing to restart before the first offer went out
        if phase != Phase::Accepted {
            messages.push(ClientMessage::new(peer.clone(), Signal::ReconnectRequest));
        }
        messages.push(ClientMessage::new(peer, Signal::Offer(offer)));
        Ok(messages)
    }

    /// React to a message from the signaling server.
    /// Returns what has to be sent back, in order.
    pub async fn handle(
        &mut self,
        message: ServerMessage,
    ) -> Result<Vec<ClientMessage>, SessionError> {
        match message {
            ServerMessage::Assigned(user_id) => {
                info!("signaling server assigned identity {user_id}");
                self.me = Some(user_id);
            }
            ServerMessage::Roster(users) => self.roster = users,
            ServerMessage::MissedCall { from } => {
                if self.peer() == Some(&from) {
                    self.finish();
                }
                self.notification = Notification::Missed(from);
            }
            ServerMessage::Signal { from, signal } => return self.on_signal(from, signal).await,
        }
        Ok(Vec::new())
    }

    async fn on_signal(
        &mut self,
        from: UserId,
        signal: Signal,
    ) -> Result<Vec<ClientMessage>, SessionError> {
        if let Signal::CallRequest = signal {
            if let Some(call) = &self.call {
                warn!("ignoring call from {from}, already in a call with {}", call.peer);
            } else {
                info!("incoming call from {from}");
                self.start(from.clone(), false, Phase::Ringing);
                self.notification = Notification::Incoming(from);
            }
            return Ok(Vec::new());
        }

        let Some(call) = self.call.as_mut().filter(|call| call.peer == from) else {
            warn!("ignoring {} from {from}, no call with them", signal.name());
            return Ok(Vec::new());
        };
        debug!("{} from {from} while {}", signal.name(), call.phase);

        match signal {
            Signal::CallAccepted if call.caller && call.phase.is_ringing() => {
                call.phase = Phase::Accepted;
                self.notification = Notification::None;
                let offer = self.offer().await?;
                return Ok(vec![ClientMessage::new(from, Signal::Offer(offer))]);
            }
            Signal::CallRejected | Signal::CallCanceled | Signal::CallEnded => {
                self.finish();
            }
            // phase only moves once the answer is out
            Signal::Offer(sdp) if call.phase.is_connected() => {
                let committed =
                    commit_remote_description(&mut self.engine, SdpKind::Offer, sdp).await?;
                self.candidates.flush(committed, &mut self.engine).await;
                let answer = self.engine.create_answer().await?;
                self.engine
                    .set_local_description(SdpKind::Answer, answer.clone())
                    .await?;
                self.set_phase(Phase::Active);
                return Ok(vec![ClientMessage::new(from, Signal::Answer(answer))]);
            }
            Signal::Answer(sdp) if call.phase == Phase::Negotiating => {
                let committed =
                    commit_remote_description(&mut self.engine, SdpKind::Answer, sdp).await?;
                self.candidates.flush(committed, &mut self.engine).await;
                self.set_phase(Phase::Active);
            }
            Signal::IceCandidate(candidate) => {
                self.candidates.push(candidate, &mut self.engine).await;
            }
            Signal::MediaToggle { media, enabled } => match media {
                Media::Camera => self.remote_media.camera = enabled,
                Media::Microphone => self.remote_media.microphone = enabled,
            },
            Signal::ReconnectRequest => debug!("{from} is about to renegotiate"),
            signal => warn!("ignoring unexpected {} from {from}", signal.name()),
        }
        Ok(Vec::new())
    }

    /// Create and apply a local offer; the call is negotiating afterwards.
    async fn offer(&mut self) -> Result<String, SessionError> {
        let offer = self.engine.create_offer().await?;
        self.engine
            .set_local_description(SdpKind::Offer, offer.clone())
            .await?;
        self.set_phase(Phase::Negotiating);
        Ok(offer)
    }

    fn start(&mut self, peer: UserId, caller: bool, phase: Phase) {
        self.candidates.reset();
        self.remote_media = RemoteMedia::default();
        self.call = Some(Call {
            peer,
            caller,
            phase,
        });
    }

    fn finish(&mut self) {
        self.call = None;
        self.candidates.reset();
        self.notification = Notification::None;
    }

    fn set_phase(&mut self, phase: Phase) {
        if let Some(call) = self.call.as_mut() {
            call.phase = phase;
        }
    }

    fn ringing(
        &mut self,
        action: &'static str,
        as_caller: bool,
    ) -> Result<&mut Call, SessionError> {
        match self.call.as_mut() {
            Some(call) if call.phase.is_ringing() && call.caller == as_caller => Ok(call),
            call => Err(SessionError::InvalidPhase {
                action,
                phase: call.map_or(Phase::Idle, |call| call.phase),
            }),
        }
    }

    fn connected(&self, action: &'static str) -> Result<&Call, SessionError> {
        match self.call.as_ref() {
            Some(call) if call.phase.is_connected() => Ok(call),
            call => Err(SessionError::InvalidPhase {
                action,
                phase: call.map_or(Phase::Idle, |call| call.phase),
            }),
        }
    }
}
