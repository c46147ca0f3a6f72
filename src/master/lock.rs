//! Named-resource lock manager
//!
//! Provides:
//! - At most one holder per resource name
//! - Bounded wait on acquisition
//! - Lease expiry, force-releasing a guard its holder never gave back
//! - Idempotent release, also performed when the guard is dropped

use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;

/// Mutual exclusion keyed by logical resource name
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Wait for exclusive ownership of `resource`
    async fn lock_resource(&self, resource: &str) -> Result<LockGuard>;

    /// Give the resource back
    fn unlock(&self, guard: LockGuard) {
        guard.release();
    }
}

/// Proof of ownership of a resource
pub struct LockGuard {
    resource: String,
    fence_token: u64,
    permit: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
    lease: Option<AbortHandle>,
}

impl LockGuard {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Monotonic token identifying this acquisition
    pub fn fence_token(&self) -> u64 {
        self.fence_token
    }

    /// False once released, explicitly or by lease expiry
    pub fn is_held(&self) -> bool {
        self.permit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Release the resource; later calls are no-ops
    pub fn release(&self) {
        if let Some(lease) = &self.lease {
            lease.abort();
        }
        let permit = self
            .permit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if permit.is_some() {
            tracing::debug!(resource = %self.resource, fence = self.fence_token, "Lock released");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("fence_token", &self.fence_token)
            .field("held", &self.is_held())
            .finish()
    }
}

/// In-process lock manager
pub struct MemoryLockManager {
    resources: Mutex<HashMap<String, Arc<Semaphore>>>,
    next_fence: AtomicU64,
    acquire_timeout: Duration,
    lease: Duration,
}

impl MemoryLockManager {
    pub fn new(acquire_timeout: Duration, lease: Duration) -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            next_fence: AtomicU64::new(1),
            acquire_timeout,
            lease,
        }
    }

    fn semaphore(&self, resource: &str) -> Arc<Semaphore> {
        let mut resources = self.resources.lock().unwrap_or_else(|e| e.into_inner());
        resources
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn lock_resource(&self, resource: &str) -> Result<LockGuard> {
        let semaphore = self.semaphore(resource);

        let permit = match tokio::time::timeout(self.acquire_timeout, semaphore.acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Internal(format!("lock {} closed", resource))),
            Err(_) => {
                tracing::warn!(resource, timeout = ?self.acquire_timeout, "Lock acquisition timed out");
                return Err(Error::LockTimeout(resource.to_string()));
            }
        };

        let fence_token = self.next_fence.fetch_add(1, Ordering::SeqCst);
        let permit = Arc::new(Mutex::new(Some(permit)));

        let lease_permit = permit.clone();
        let lease_resource = resource.to_string();
        let lease = self.lease;
        let lease_task = tokio::spawn(async move {
            tokio::time::sleep(lease).await;
            let expired = lease_permit
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if expired.is_some() {
                tracing::warn!(
                    resource = %lease_resource,
                    fence = fence_token,
                    "Lock lease expired, force releasing"
                );
            }
        });

        tracing::debug!(resource, fence = fence_token, "Lock acquired");
        Ok(LockGuard {
            resource: resource.to_string(),
            fence_token,
            permit,
            lease: Some(lease_task.abort_handle()),
        })
    }
}
