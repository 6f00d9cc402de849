//! Child session pool — at most one live session per child identity.
//!
//! Sessions are created lazily on first use and cached under their
//! identity hash. Spawn-plus-handshake is single-flight per identity:
//! concurrent first calls coalesce onto one spawn, with later callers
//! waiting on the per-identity gate. A session found dead on access is
//! evicted and respawned in place.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::client::ChildSession;
use crate::resolve::ResolvedCommand;

/// Errors from acquiring a pooled session.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Spawn, handshake, or initialize failed; nothing was pooled.
    #[error("failed to start server for '{tool}': {detail}")]
    Startup {
        /// The tool whose child failed to come up.
        tool: String,
        /// Underlying failure detail.
        detail: String,
    },
}

/// Per-identity slot. The gate serializes spawn attempts for one identity
/// without blocking unrelated identities.
#[derive(Default)]
struct Slot {
    gate: Mutex<Option<Arc<ChildSession>>>,
}

/// Identity-keyed cache of live downstream sessions.
#[derive(Default)]
pub struct SessionPool {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl SessionPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live session for `identity`, spawning and initializing
    /// one if none exists.
    ///
    /// On failure the slot is left empty, so the next call with the same
    /// identity retries from scratch.
    pub async fn acquire(
        &self,
        tool: &str,
        identity: &str,
        resolved: &ResolvedCommand,
    ) -> Result<Arc<ChildSession>, PoolError> {
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(identity.to_owned()).or_default())
        };

        let mut guard = slot.gate.lock().await;
        if let Some(session) = guard.as_ref() {
            if session.is_alive() {
                return Ok(Arc::clone(session));
            }
            debug!(tool, identity, "evicting dead session");
            session.release().await;
            *guard = None;
        }

        let session = ChildSession::spawn(tool, identity, resolved).map_err(|e| {
            PoolError::Startup {
                tool: tool.to_owned(),
                detail: e.to_string(),
            }
        })?;
        session.initialize().await.map_err(|e| PoolError::Startup {
            tool: tool.to_owned(),
            detail: e.to_string(),
        })?;

        info!(tool, identity, "downstream server started");
        let session = Arc::new(session);
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Whether a live session exists for `identity`.
    pub async fn contains(&self, identity: &str) -> bool {
        let slot = {
            let slots = self.slots.lock().await;
            slots.get(identity).map(Arc::clone)
        };
        match slot {
            Some(slot) => slot.gate.lock().await.as_ref().is_some_and(|s| s.is_alive()),
            None => false,
        }
    }

    /// Release every pooled session. Per-session failures are ignored so
    /// one stubborn child cannot keep the others alive.
    pub async fn shutdown_all(&self) {
        let slots: Vec<Arc<Slot>> = {
            let mut map = self.slots.lock().await;
            map.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            let session = slot.gate.lock().await.take();
            if let Some(session) = session {
                session.release().await;
                debug!(identity = session.identity(), "downstream server shut down");
            }
        }
    }
}
