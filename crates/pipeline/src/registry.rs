//! Live session registry.
//!
//! Running sessions are looked up by correlation id; the cancel and
//! notify-toggle handlers operate only through the handles held here,
//! never through ambient shared state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use cloudrelay_transfer::ConcurrencyGate;

use crate::command::SessionCommand;

/// The externally visible surface of a running transfer session.
///
/// The cancellation token is the only state shared with the session task;
/// everything else is read at well-defined points (the notify flag at
/// completion time).
pub struct SessionHandle {
    id: Uuid,
    user_id: i64,
    cancel: CancellationToken,
    notify_on_complete: AtomicBool,
}

impl SessionHandle {
    fn new(user_id: i64, notify_on_complete: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            cancel: CancellationToken::new(),
            notify_on_complete: AtomicBool::new(notify_on_complete),
        }
    }

    /// Correlation id of the session.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Owning user.
    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Clone of the cooperative cancellation token.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests cooperative cancellation; takes effect at the next chunk
    /// boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Flips the notify-on-completion flag, returning the new value.
    pub fn toggle_notify(&self) -> bool {
        // fetch_xor on a bool flips it atomically.
        !self.notify_on_complete.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn notify_on_complete(&self) -> bool {
        self.notify_on_complete.load(Ordering::SeqCst)
    }
}

/// Process-wide map of running sessions, keyed by correlation id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers a handle for a new session.
    pub fn register(&self, user_id: i64, notify_on_complete: bool) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(user_id, notify_on_complete));
        self.sessions
            .lock()
            .unwrap()
            .insert(handle.id(), Arc::clone(&handle));
        handle
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    /// Removes a terminated session. Safe to call twice.
    pub fn remove(&self, id: Uuid) {
        self.sessions.lock().unwrap().remove(&id);
    }

    /// Number of registered (live) sessions.
    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Routes a decoded command to the addressed session.
    ///
    /// Returns `false` when the session is no longer registered.
    pub fn dispatch(&self, id: Uuid, command: SessionCommand, gate: &ConcurrencyGate) -> bool {
        let Some(handle) = self.get(id) else {
            debug!(session = %id, ?command, "command for unknown session");
            return false;
        };
        match command {
            SessionCommand::CancelUpload => handle.cancel(),
            SessionCommand::ToggleNotify => {
                handle.toggle_notify();
            }
            SessionCommand::SetParallelism(width) => {
                gate.set_parallelism(handle.user_id(), width);
            }
        }
        true
    }
}
