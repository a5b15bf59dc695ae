use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Active request tokens of one chat session.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    active: Arc<Mutex<HashMap<u64, CancellationToken>>>,
    next_id: Arc<AtomicU64>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, CancellationToken>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a fresh token; it stays registered until the guard drops.
    pub fn register(&self) -> RequestGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.lock().insert(id, token.clone());
        tracing::trace!("Registered request token {}", id);
        RequestGuard {
            id,
            token,
            registry: self.clone(),
        }
    }

    pub fn cancel_all(&self) -> usize {
        let active = self.lock();
        for token in active.values() {
            token.cancel();
        }
        if !active.is_empty() {
            tracing::info!("Cancelled {} in-flight request(s)", active.len());
        }
        active.len()
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }

    fn deregister(&self, id: u64) {
        self.lock().remove(&id);
        tracing::trace!("Deregistered request token {}", id);
    }
}

pub struct RequestGuard {
    id: u64,
    token: CancellationToken,
    registry: CancellationRegistry,
}

impl RequestGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}
