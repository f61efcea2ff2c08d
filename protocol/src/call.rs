/*!
Signaling messages exchanged between two call participants and the signaling server.

Clients address a [Signal] to a peer through [ClientMessage]; the server stamps the
sender's identity and hands it to the peer as [ServerMessage::Signal].
 */

use crate::UserId;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Media {
    Camera,
    Microphone,
}

/// Everything one participant can say to the other.
/// Offer, answer and candidate bodies are passed along without modifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Signal {
    /// Caller wants to ring the callee
    CallRequest,
    /// Callee agreed, caller should now send an offer
    CallAccepted,
    /// Callee declined
    CallRejected,
    /// Initiator aborts before the call is resolved
    CallCanceled,

    /// SDP Offer
    Offer(String),
    /// SDP Answer
    Answer(String),
    /// Proposed ICE Candidate of one user
    IceCandidate(IceCandidate),

    /// Either side terminates the call
    CallEnded,

    /// Camera or microphone of the sender was switched on or off
    MediaToggle { media: Media, enabled: bool },
    /// Sender lost media connectivity and is about to renegotiate
    ReconnectRequest,
}

impl Signal {
    /// Name of the signal on the wire, used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::CallRequest => "call-request",
            Signal::CallAccepted => "call-accepted",
            Signal::CallRejected => "call-rejected",
            Signal::CallCanceled => "call-canceled",
            Signal::Offer(_) => "offer",
            Signal::Answer(_) => "answer",
            Signal::IceCandidate(_) => "icecandidate",
            Signal::CallEnded => "call-ended",
            Signal::MediaToggle { .. } => "media-toggle",
            Signal::ReconnectRequest => "reconnect-request",
        }
    }
}

/// Message sent by a client to the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub to: UserId,
    pub signal: Signal,
}

impl ClientMessage {
    pub fn new(to: impl Into<UserId>, signal: Signal) -> Self {
        ClientMessage {
            to: to.into(),
            signal,
        }
    }
}

/// Message sent by the signaling server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Identity assigned to the receiving connection
    Assigned(UserId),
    /// Users currently reachable, sorted
    Roster(Vec<UserId>),
    /// Signal forwarded from another user
    Signal { from: UserId, signal: Signal },
    /// The call to `from` was not picked up
    MissedCall { from: UserId },
}
