//! Signaling router: resolves the destination, validates the signal against the
//! call state, applies the transition and forwards the signal untouched.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::Mutex;
use tokio::time::Instant;

use call_relay_protocol::{ClientMessage, Phase, ServerMessage, Signal, UserId};

use crate::calls::{CallId, CallTracker, Effect, Pair, TransitionError};
use crate::registry::{deliver, Handle, IdentitySource, Registry, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Destination has no live connection
    UserNotFound,
    /// Signal does not fit the current phase of the pair
    InvalidPhase,
    /// One of the users is already in another call
    Busy,
}

impl Display for DropReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            DropReason::UserNotFound => "user not found",
            DropReason::InvalidPhase => "invalid phase",
            DropReason::Busy => "busy",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Dropped(DropReason),
}

/// Shared state of the relay. Cheap to clone, every connection task holds one.
///
/// Lock order: the call tracker is always taken before the registry.
#[derive(Clone)]
pub struct Relay {
    registry: Registry,
    calls: Arc<Mutex<CallTracker>>,
}

impl Relay {
    pub fn new(identities: IdentitySource, ring_timeout: Duration) -> Self {
        Relay {
            registry: Registry::new(identities),
            calls: Arc::new(Mutex::new(CallTracker::new(ring_timeout))),
        }
    }

    pub async fn phase(&self, a: &UserId, b: &UserId) -> Phase {
        self.calls.lock().await.phase(a, b)
    }

    /// Bind a new connection to an identity.
    pub async fn connect(&self, handle: Handle) -> Result<UserId, RegistryError> {
        self.registry.register(handle).await
    }

    /// Release the call of `user_id`, if any, then forget the user.
    ///
    /// The tracker stays locked until the binding is gone, so the identity can
    /// neither be handed out again nor be rung while its call is torn down.
    pub async fn disconnect(&self, user_id: &UserId) {
        let mut calls = self.calls.lock().await;
        if let Some(released) = calls.release_user(user_id) {
            info!(
                "{} {}: {user_id} disconnected while {}, notifying {}",
                released.call_id, released.pair, released.phase, released.peer
            );
            self.send(&released.peer, user_id, Signal::CallEnded).await;
        }
        self.registry.unregister(user_id).await;
    }

    /// Route one signal sent by `from`.
    pub async fn route(&self, from: &UserId, message: ClientMessage) -> RouteOutcome {
        let ClientMessage { to, signal } = message;
        let mut calls = self.calls.lock().await;

        let Some(handle) = self.registry.resolve(&to).await else {
            warn!("dropping {} from {from}: {to} not found", signal.name());
            return RouteOutcome::Dropped(DropReason::UserNotFound);
        };

        let transition = match calls.apply(from, &to, &signal, Instant::now()) {
            Ok(transition) => transition,
            Err(error @ TransitionError::InvalidPhase { .. }) => {
                warn!("dropping {} from {from} to {to}: {error}", signal.name());
                return RouteOutcome::Dropped(DropReason::InvalidPhase);
            }
            Err(error @ TransitionError::Busy(_)) => {
                warn!("dropping {} from {from} to {to}: {error}", signal.name());
                // let the caller stop ringing, there is nothing to miss
                self.send(from, &to, Signal::CallRejected).await;
                return RouteOutcome::Dropped(DropReason::Busy);
            }
        };

        deliver(
            &to,
            &handle,
            ServerMessage::Signal {
                from: from.clone(),
                signal,
            },
        );

        for effect in transition.effects {
            match effect {
                Effect::ArmRingTimer { deadline } => {
                    calls.mark_ringing(&transition.pair, transition.call_id);
                    let timer = self.spawn_ring_timer(
                        transition.pair.clone(),
                        transition.call_id,
                        deadline,
                    );
                    calls.arm_ring_timer(&transition.pair, transition.call_id, timer);
                }
                Effect::MissedCall { caller, callee } => {
                    self.notify_missed_call(&caller, &callee).await;
                }
                Effect::Release => calls.release(&transition.pair, transition.call_id),
                Effect::RingTimerCancelled => {}
            }
        }
        RouteOutcome::Delivered
    }

    fn spawn_ring_timer(
        &self,
        pair: Pair,
        call_id: CallId,
        deadline: Instant,
    ) -> tokio::task::AbortHandle {
        let relay = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            relay.ring_expired(&pair, call_id).await;
        })
        .abort_handle()
    }

    async fn ring_expired(&self, pair: &Pair, call_id: CallId) {
        let mut calls = self.calls.lock().await;
        let Some(record) = calls.expire(pair, call_id) else {
            return;
        };
        info!("{call_id} {pair}: {} did not pick up", record.callee);
        self.send(&record.callee, &record.caller, Signal::CallCanceled)
            .await;
        self.notify_missed_call(&record.caller, &record.callee).await;
    }

    async fn notify_missed_call(&self, caller: &UserId, callee: &UserId) {
        match self.registry.resolve(caller).await {
            Some(handle) => {
                deliver(
                    caller,
                    &handle,
                    ServerMessage::MissedCall {
                        from: callee.clone(),
                    },
                );
            }
            None => warn!("cannot deliver missed-call notice: {caller} not found"),
        }
    }

    /// Relay-generated signal, delivered as if `from` had sent it.
    async fn send(&self, to: &UserId, from: &UserId, signal: Signal) {
        match self.registry.resolve(to).await {
            Some(handle) => {
                deliver(
                    to,
                    &handle,
                    ServerMessage::Signal {
                        from: from.clone(),
                        signal,
                    },
                );
            }
            None => warn!("cannot deliver {} to {to}: not found", signal.name()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use call_relay_protocol::{IceCandidate, Media};
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const RING: Duration = Duration::from_secs(10);

    struct Peer {
        id: UserId,
        rx: UnboundedReceiver<ServerMessage>,
    }

    impl Peer {
        /// Everything received so far, roster updates left out.
        fn signals(&mut self) -> Vec<ServerMessage> {
            let mut received = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                if !matches!(
                    message,
                    ServerMessage::Roster(_) | ServerMessage::Assigned(_)
                ) {
                    received.push(message);
                }
            }
            received
        }
    }

    async fn relay_with(names: &[&str]) -> (Relay, Vec<Peer>) {
        let relay = Relay::new(
            IdentitySource::Pool(names.iter().map(|name| name.to_string()).collect()),
            RING,
        );
        let mut peers = Vec::new();
        for _ in names {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = relay.connect(tx).await.unwrap();
            peers.push(Peer { id, rx });
        }
        (relay, peers)
    }

    async fn two_users() -> (Relay, Peer, Peer) {
        let (relay, mut peers) = relay_with(&["alice", "bob"]).await;
        let b = peers.pop().unwrap();
        let a = peers.pop().unwrap();
        (relay, a, b)
    }

    fn signal(from: &UserId, signal: Signal) -> ServerMessage {
        ServerMessage::Signal {
            from: from.clone(),
            signal,
        }
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2113937151 10.0.0.{n} 5000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    async fn send(relay: &Relay, from: &Peer, to: &Peer, s: Signal) -> RouteOutcome {
        relay.route(&from.id, ClientMessage::new(to.id.clone(), s)).await
    }

    #[tokio::test(start_paused = true)]
    async fn call_round_trip_reaches_active() {
        let (relay, mut a, mut b) = two_users().await;

        assert_eq!(send(&relay, &a, &b, Signal::CallRequest).await, RouteOutcome::Delivered);
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Ringing);
        assert_eq!(b.signals(), vec![signal(&a.id, Signal::CallRequest)]);

        assert_eq!(send(&relay, &b, &a, Signal::CallAccepted).await, RouteOutcome::Delivered);
        let offer = Signal::Offer("v=0\r\no=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n".into());
        assert_eq!(send(&relay, &a, &b, offer.clone()).await, RouteOutcome::Delivered);
        let answer = Signal::Answer("v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n".into());
        assert_eq!(send(&relay, &b, &a, answer.clone()).await, RouteOutcome::Delivered);
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Active);

        assert_eq!(
            send(&relay, &a, &b, Signal::IceCandidate(candidate(1))).await,
            RouteOutcome::Delivered
        );
        assert_eq!(
            send(&relay, &b, &a, Signal::IceCandidate(candidate(2))).await,
            RouteOutcome::Delivered
        );
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Active);

        // payloads arrive verbatim
        assert_eq!(
            b.signals(),
            vec![signal(&a.id, offer), signal(&a.id, Signal::IceCandidate(candidate(1)))]
        );
        assert_eq!(
            a.signals(),
            vec![
                signal(&b.id, Signal::CallAccepted),
                signal(&b.id, answer),
                signal(&b.id, Signal::IceCandidate(candidate(2))),
            ]
        );

        // no missed call once the call was accepted
        tokio::time::sleep(RING * 2).await;
        assert!(a.signals().is_empty());
        assert!(b.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_destination_does_not_touch_call_state() {
        let (relay, a, _b) = two_users().await;
        let ghost = UserId::from("ghost");
        let outcome = relay
            .route(&a.id, ClientMessage::new(ghost.clone(), Signal::CallRequest))
            .await;
        assert_eq!(outcome, RouteOutcome::Dropped(DropReason::UserNotFound));
        assert_eq!(relay.phase(&a.id, &ghost).await, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_phase_is_dropped_not_forwarded() {
        let (relay, a, mut b) = two_users().await;
        assert_eq!(
            send(&relay, &a, &b, Signal::Answer("v=0".into())).await,
            RouteOutcome::Dropped(DropReason::InvalidPhase)
        );
        assert!(b.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_before_answer_leaves_no_missed_call() {
        let (relay, mut a, mut b) = two_users().await;
        send(&relay, &a, &b, Signal::CallRequest).await;
        tokio::time::sleep(RING / 2).await;
        assert_eq!(send(&relay, &a, &b, Signal::CallCanceled).await, RouteOutcome::Delivered);
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Idle);

        tokio::time::sleep(RING * 3).await;
        assert_eq!(
            b.signals(),
            vec![
                signal(&a.id, Signal::CallRequest),
                signal(&a.id, Signal::CallCanceled)
            ]
        );
        assert!(a.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_is_missed_exactly_once() {
        let (relay, mut a, mut b) = two_users().await;
        send(&relay, &a, &b, Signal::CallRequest).await;

        tokio::time::sleep(RING + Duration::from_millis(1)).await;
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Idle);
        assert_eq!(a.signals(), vec![ServerMessage::MissedCall { from: b.id.clone() }]);
        assert_eq!(
            b.signals(),
            vec![
                signal(&a.id, Signal::CallRequest),
                signal(&a.id, Signal::CallCanceled)
            ]
        );

        tokio::time::sleep(RING * 3).await;
        assert!(a.signals().is_empty());

        // late accept after the timeout is stale
        assert_eq!(
            send(&relay, &b, &a, Signal::CallAccepted).await,
            RouteOutcome::Dropped(DropReason::InvalidPhase)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn old_timer_does_not_hit_a_newer_call() {
        let (relay, mut a, b) = two_users().await;
        send(&relay, &a, &b, Signal::CallRequest).await;
        tokio::time::sleep(RING / 2).await;
        send(&relay, &a, &b, Signal::CallCanceled).await;
        send(&relay, &a, &b, Signal::CallRequest).await;

        // first call's deadline passes while the second still rings
        tokio::time::sleep(RING * 3 / 4).await;
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Ringing);
        assert!(a.signals().is_empty());

        tokio::time::sleep(RING / 2).await;
        assert_eq!(a.signals(), vec![ServerMessage::MissedCall { from: b.id.clone() }]);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_sends_missed_call_and_allows_redial() {
        let (relay, mut a, mut b) = two_users().await;
        send(&relay, &a, &b, Signal::CallRequest).await;
        assert_eq!(send(&relay, &b, &a, Signal::CallRejected).await, RouteOutcome::Delivered);
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Idle);
        assert_eq!(
            a.signals(),
            vec![
                signal(&b.id, Signal::CallRejected),
                ServerMessage::MissedCall { from: b.id.clone() }
            ]
        );

        assert_eq!(send(&relay, &a, &b, Signal::CallRequest).await, RouteOutcome::Delivered);
        b.signals();
        tokio::time::sleep(RING * 2).await;
        // only the timeout of the second request fires
        assert_eq!(a.signals(), vec![ServerMessage::MissedCall { from: b.id.clone() }]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_accept_tears_the_call_down() {
        let (relay, mut a, mut b) = two_users().await;
        send(&relay, &a, &b, Signal::CallRequest).await;
        b.signals();

        assert_eq!(send(&relay, &b, &a, Signal::CallAccepted).await, RouteOutcome::Delivered);
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Accepted);
        assert_eq!(send(&relay, &a, &b, Signal::CallCanceled).await, RouteOutcome::Delivered);
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Idle);
        assert_eq!(b.signals(), vec![signal(&a.id, Signal::CallCanceled)]);

        tokio::time::sleep(RING * 2).await;
        assert_eq!(a.signals(), vec![signal(&b.id, Signal::CallAccepted)]);
    }

    #[tokio::test(start_paused = true)]
    async fn accept_after_cancel_is_stale() {
        let (relay, mut a, mut b) = two_users().await;
        send(&relay, &a, &b, Signal::CallRequest).await;
        assert_eq!(send(&relay, &a, &b, Signal::CallCanceled).await, RouteOutcome::Delivered);

        assert_eq!(
            send(&relay, &b, &a, Signal::CallAccepted).await,
            RouteOutcome::Dropped(DropReason::InvalidPhase)
        );
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Idle);

        tokio::time::sleep(RING * 2).await;
        assert!(a.signals().is_empty());
        assert_eq!(
            b.signals(),
            vec![
                signal(&a.id, Signal::CallRequest),
                signal(&a.id, Signal::CallCanceled)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn offer_can_be_sent_again_after_a_failed_answer() {
        let (relay, mut a, mut b) = two_users().await;
        send(&relay, &a, &b, Signal::CallRequest).await;
        send(&relay, &b, &a, Signal::CallAccepted).await;
        send(&relay, &a, &b, Signal::Offer("v=0 first".into())).await;
        b.signals();

        // callee could not answer the first offer
        assert_eq!(
            send(&relay, &a, &b, Signal::ReconnectRequest).await,
            RouteOutcome::Delivered
        );
        let retry = Signal::Offer("v=0 second".into());
        assert_eq!(send(&relay, &a, &b, retry.clone()).await, RouteOutcome::Delivered);
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Negotiating);
        assert_eq!(
            b.signals(),
            vec![signal(&a.id, Signal::ReconnectRequest), signal(&a.id, retry)]
        );

        assert_eq!(
            send(&relay, &b, &a, Signal::Answer("v=0 answer".into())).await,
            RouteOutcome::Delivered
        );
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_callee_is_not_rung() {
        let (relay, mut peers) = relay_with(&["alice", "bob", "carol"]).await;
        let mut c = peers.pop().unwrap();
        let mut b = peers.pop().unwrap();
        let mut a = peers.pop().unwrap();

        send(&relay, &b, &c, Signal::CallRequest).await;
        send(&relay, &c, &b, Signal::CallAccepted).await;
        send(&relay, &b, &c, Signal::Offer("v=0".into())).await;
        send(&relay, &c, &b, Signal::Answer("v=0".into())).await;
        b.signals();
        c.signals();

        assert_eq!(
            send(&relay, &a, &b, Signal::CallRequest).await,
            RouteOutcome::Dropped(DropReason::Busy)
        );
        assert!(b.signals().is_empty());
        assert_eq!(a.signals(), vec![signal(&b.id, Signal::CallRejected)]);
        assert_eq!(relay.phase(&b.id, &c.id).await, Phase::Active);

        tokio::time::sleep(RING * 2).await;
        assert!(a.signals().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hang_up_notifies_peer_and_frees_pair() {
        let (relay, mut a, mut b) = two_users().await;
        send(&relay, &a, &b, Signal::CallRequest).await;
        send(&relay, &b, &a, Signal::CallAccepted).await;
        send(&relay, &a, &b, Signal::Offer("v=0".into())).await;
        send(&relay, &b, &a, Signal::Answer("v=0".into())).await;
        let toggle = Signal::MediaToggle {
            media: Media::Camera,
            enabled: false,
        };
        assert_eq!(send(&relay, &a, &b, toggle.clone()).await, RouteOutcome::Delivered);
        a.signals();

        assert_eq!(send(&relay, &b, &a, Signal::CallEnded).await, RouteOutcome::Delivered);
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Idle);
        assert_eq!(a.signals(), vec![signal(&b.id, Signal::CallEnded)]);
        assert_eq!(b.signals().last(), Some(&signal(&a.id, toggle)));
        assert_eq!(
            send(&relay, &a, &b, Signal::CallEnded).await,
            RouteOutcome::Dropped(DropReason::InvalidPhase)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_mid_call_ends_it_for_the_peer() {
        let (relay, mut a, b) = two_users().await;
        send(&relay, &a, &b, Signal::CallRequest).await;
        send(&relay, &b, &a, Signal::CallAccepted).await;
        a.signals();

        relay.disconnect(&b.id).await;
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Idle);
        let mut received = Vec::new();
        while let Ok(message) = a.rx.try_recv() {
            received.push(message);
        }
        assert_eq!(
            received,
            vec![
                signal(&b.id, Signal::CallEnded),
                ServerMessage::Roster(vec![a.id.clone()])
            ]
        );

        // the freed identity can be handed out again
        let (tx, _rx) = mpsc::unbounded_channel();
        assert_eq!(relay.connect(tx).await, Ok(b.id.clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_while_ringing_cancels_timer() {
        let (relay, mut a, b) = two_users().await;
        send(&relay, &b, &a, Signal::CallRequest).await;
        relay.disconnect(&b.id).await;
        a.signals();

        tokio::time::sleep(RING * 2).await;
        assert!(a.signals().is_empty());
        assert_eq!(relay.phase(&a.id, &b.id).await, Phase::Idle);
    }
}
