//! Session registry: which identity is bound to which websocket connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, RwLock};

use call_relay_protocol::{ServerMessage, UserId};

/// Sending half of a connection; whatever is pushed here ends up on the user's websocket.
pub type Handle = mpsc::UnboundedSender<ServerMessage>;

/// Where identities for new connections come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// A fixed set of names, the first free one is handed out
    Pool(Vec<String>),
    /// Unbounded `user-N` identities
    Sequential,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("every identity of the pool is already bound to a connection")]
    PoolExhausted,
}

struct Inner {
    source: IdentitySource,
    next_id: AtomicU64,
    bindings: HashMap<UserId, Handle>,
}

/// Owned map of connected users. Cheap to clone, all clones share the same bindings.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RwLock<Inner>>,
}

impl Registry {
    pub fn new(source: IdentitySource) -> Self {
        Registry {
            inner: Arc::new(RwLock::new(Inner {
                source,
                next_id: AtomicU64::new(1),
                bindings: HashMap::new(),
            })),
        }
    }

    /// Bind `handle` to the next free identity.
    ///
    /// The new user is told its identity first, then every bound handle
    /// (the new one included) receives the updated roster.
    pub async fn register(&self, handle: Handle) -> Result<UserId, RegistryError> {
        let mut inner = self.inner.write().await;
        let user_id = match &inner.source {
            IdentitySource::Pool(names) => names
                .iter()
                .map(|name| UserId::new(name.as_str()))
                .find(|candidate| !inner.bindings.contains_key(candidate))
                .ok_or(RegistryError::PoolExhausted)?,
            IdentitySource::Sequential => {
                let n = inner.next_id.fetch_add(1, Ordering::Relaxed);
                UserId::new(format!("user-{n}"))
            }
        };
        deliver(&user_id, &handle, ServerMessage::Assigned(user_id.clone()));
        inner.bindings.insert(user_id.clone(), handle);
        info!("user registered: {user_id}");
        broadcast_roster(&inner.bindings);
        Ok(user_id)
    }

    /// Drop the binding of `user_id`. Unknown identities are ignored.
    pub async fn unregister(&self, user_id: &UserId) {
        let mut inner = self.inner.write().await;
        if inner.bindings.remove(user_id).is_some() {
            info!("user unregistered: {user_id}");
            broadcast_roster(&inner.bindings);
        }
    }

    /// Handle to deliver messages to `user_id`, if that user is still reachable.
    pub async fn resolve(&self, user_id: &UserId) -> Option<Handle> {
        let inner = self.inner.read().await;
        inner
            .bindings
            .get(user_id)
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Currently reachable users, sorted.
    pub async fn snapshot(&self) -> Vec<UserId> {
        roster(&self.inner.read().await.bindings)
    }
}

fn roster(bindings: &HashMap<UserId, Handle>) -> Vec<UserId> {
    let mut users: Vec<UserId> = bindings.keys().cloned().collect();
    users.sort();
    users
}

fn broadcast_roster(bindings: &HashMap<UserId, Handle>) {
    let users = roster(bindings);
    debug!("publishing roster {users:?}");
    for (user_id, handle) in bindings {
        deliver(user_id, handle, ServerMessage::Roster(users.clone()));
    }
}

/// Push `message` to the connection of `user_id`; a closed connection is only logged.
pub(crate) fn deliver(user_id: &UserId, handle: &Handle, message: ServerMessage) -> bool {
    match handle.send(message) {
        Ok(()) => true,
        Err(mpsc::error::SendError(message)) => {
            warn!("connection of {user_id} is gone, dropping {message:?}");
            false
        }
    }
}
