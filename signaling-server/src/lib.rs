/*!
Signaling relay for one-to-one audio/video calls.

The relay never looks at media. It hands out identities, tracks the phase of the
call between each pair of users and forwards call signals, SDP offers/answers and
ICE candidates between the two participants, dropping whatever does not fit the
current phase.
*/

pub mod calls;
pub mod config;
pub mod one_to_one;
pub mod registry;
pub mod router;

pub use config::Config;
pub use router::{DropReason, Relay, RouteOutcome};
