/*!
Client side of a one-to-one call relayed by `call-relay-server`.

[CallSession] keeps one participant's view of the call and produces the signals to
send; the actual offer/answer work is delegated to a [NegotiationEngine]. Remote ICE
candidates that show up before the remote description are held in a
[CandidateBuffer] until the engine has committed that description.
*/

pub mod candidates;
pub mod engine;
pub mod session;
#[cfg(target_arch = "wasm32")]
pub mod web;

pub use call_relay_protocol::{ClientMessage, IceCandidate, ServerMessage, Signal, UserId};
pub use candidates::{CandidateBuffer, FlushReport, Pushed};
pub use engine::{
    commit_remote_description, NegotiationEngine, NegotiationError, RemoteCommitted, SdpKind,
};
pub use session::{CallSession, Notification, RemoteMedia, SessionError};
#[cfg(target_arch = "wasm32")]
pub use web::{init_logging, ConnectionType, WebRtcEngine};
