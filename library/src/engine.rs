//! Seam between the call session and whatever actually speaks WebRTC.

use async_trait::async_trait;
use std::fmt::{Display, Formatter};

use call_relay_protocol::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl Display for SdpKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpKind::Offer => f.write_str("offer"),
            SdpKind::Answer => f.write_str("answer"),
        }
    }
}

/// The negotiation engine refused a description or a candidate.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {reason}")]
pub struct NegotiationError {
    pub operation: &'static str,
    pub reason: String,
}

impl NegotiationError {
    pub fn new(operation: &'static str, reason: impl Into<String>) -> Self {
        NegotiationError {
            operation,
            reason: reason.into(),
        }
    }
}

/// Offer/answer machinery of one participant, e.g. a browser `RTCPeerConnection`.
///
/// Descriptions and candidates are opaque to the caller. Every call may fail
/// and may take a while; none of them is expected to block forever.
#[async_trait(?Send)]
pub trait NegotiationEngine {
    async fn create_offer(&mut self) -> Result<String, NegotiationError>;

    async fn create_answer(&mut self) -> Result<String, NegotiationError>;

    async fn set_local_description(
        &mut self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), NegotiationError>;

    /// Resolves once the engine has committed the remote description.
    async fn set_remote_description(
        &mut self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError>;
}

/// Proof that a remote description has been committed by the engine.
///
/// Only [commit_remote_description] hands these out, and
/// [CandidateBuffer::flush](crate::CandidateBuffer::flush) consumes one, so queued
/// candidates can only be applied after the engine confirmed the description.
#[derive(Debug)]
pub struct RemoteCommitted {
    kind: SdpKind,
}

impl RemoteCommitted {
    pub fn kind(&self) -> SdpKind {
        self.kind
    }
}

/// Apply the peer's description and wait for the engine to confirm it.
pub async fn commit_remote_description<E: NegotiationEngine + ?Sized>(
    engine: &mut E,
    kind: SdpKind,
    sdp: String,
) -> Result<RemoteCommitted, NegotiationError> {
    engine.set_remote_description(kind, sdp).await?;
    Ok(RemoteCommitted { kind })
}
