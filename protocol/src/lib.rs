/*!
Helper crate that declares common types and structures shared between
[call-relay-server](../call_relay_server/index.html) and
[call-relay-client](../call_relay_client/index.html).
*/

use serde::{Deserialize, Serialize};
use std::{
    convert::Infallible,
    fmt::{Display, Formatter},
    str::FromStr,
};

pub mod call;

pub use call::{ClientMessage, IceCandidate, Media, ServerMessage, Signal};

/// Identity handed out by the signaling server to each connected user.
///
/// The value is opaque: clients must not assume anything about its shape,
/// only that it stays stable for the lifetime of their connection.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap a String into a UserId struct
    pub fn new(inner: impl Into<String>) -> Self {
        UserId(inner.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Acquire the underlying type
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl From<&str> for UserId {
    fn from(val: &str) -> Self {
        UserId(val.to_owned())
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(UserId(s.to_owned()))
    }
}

/// Position of a call between two users in the signaling state machine.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    /// `call-request` accepted by the relay, not yet delivered to the callee
    Requested,
    /// `call-request` delivered, callee's device is ringing
    Ringing,
    Accepted,
    /// An offer is outstanding
    Negotiating,
    Active,
    /// Call is being torn down, the record is released right after
    Ending,
}

impl Phase {
    /// Both `Requested` and `Ringing` wait for the callee's decision.
    pub fn is_ringing(self) -> bool {
        matches!(self, Phase::Requested | Phase::Ringing)
    }

    /// Phases in which media negotiation traffic may flow.
    pub fn is_connected(self) -> bool {
        matches!(self, Phase::Accepted | Phase::Negotiating | Phase::Active)
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Requested => "requested",
            Phase::Ringing => "ringing",
            Phase::Accepted => "accepted",
            Phase::Negotiating => "negotiating",
            Phase::Active => "active",
            Phase::Ending => "ending",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Serialize a message into the binary frame format used on the websocket.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(rmp_serde::to_vec(message)?)
}

/// Inverse of [encode].
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, ProtocolError> {
    Ok(rmp_serde::from_slice(bytes)?)
}
