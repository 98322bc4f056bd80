//! `DistributedLock`: named mutual-exclusion lease with TTL and renewal
//! (spec §4.6), used to serialise processing per upload id even across
//! replicas, or across duplicate queue deliveries of the same message.

use crate::error::LockError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Lease {
    pub name: String,
    pub token: String,
    pub expires_at: Instant,
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Non-blocking: returns `None` immediately if the name is already held.
    async fn acquire(&self, name: &str, ttl: Duration) -> Option<Lease>;

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LockError>;

    async fn release(&self, lease: &Lease) -> Result<(), LockError>;
}

struct Holder {
    token: String,
    expires_at: Instant,
}

/// Process-local fake: a mutex-guarded table of held names. Sufficient for
/// tests and for a single-replica deployment; a real deployment points this
/// trait at a Redis- or etcd-backed implementation instead.
#[derive(Default)]
pub struct InMemoryLock {
    held: Mutex<HashMap<String, Holder>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_expired(holder: &Holder) -> bool {
        Instant::now() >= holder.expires_at
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, name: &str, ttl: Duration) -> Option<Lease> {
        let mut held = self.held.lock().unwrap();
        if let Some(existing) = held.get(name) {
            if !Self::is_expired(existing) {
                return None;
            }
        }
        let token = uuid::Uuid::new_v4().to_string();
        let expires_at = Instant::now() + ttl;
        held.insert(name.to_string(), Holder { token: token.clone(), expires_at });
        Some(Lease { name: name.to_string(), token, expires_at })
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LockError> {
        let mut held = self.held.lock().unwrap();
        match held.get_mut(&lease.name) {
            Some(holder) if holder.token == lease.token => {
                holder.expires_at = Instant::now() + ttl;
                Ok(Lease { name: lease.name.clone(), token: lease.token.clone(), expires_at: holder.expires_at })
            }
            _ => Err(LockError::InvalidLease(lease.name.clone())),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let mut held = self.held.lock().unwrap();
        match held.get(&lease.name) {
            Some(holder) if holder.token == lease.token => {
                held.remove(&lease.name);
                Ok(())
            }
            _ => Err(LockError::InvalidLease(lease.name.clone())),
        }
    }
}

/// `lock:upload:{upload_id}` naming convention from spec §4.6.
pub fn upload_lock_name(upload_id: &str) -> String {
    format!("lock:upload:{upload_id}")
}
