//! Distributed single-writer stream lock
//!
//! Acquisition creates an ephemeral-sequential member node and waits on the
//! deletion of the immediately lower sequence. Reentrant within a process by
//! reason tag; each acquire must be matched by a release with the same
//! reason. Session expiration fans out to every dependent through the lost
//! signal, which flips writers and readers into their errored state.

use super::{CoordError, Coordinator, SessionEvent, WatchEvent};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lock errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock acquisition timed out after {0:?}")]
    Timeout(Duration),
    #[error("coordinator session expired while locking")]
    SessionExpired,
    #[error("release without matching acquire for reason {0:?}")]
    NotAcquired(String),
    #[error(transparent)]
    Coord(#[from] CoordError),
}

struct LockState {
    member: Option<String>,
    reasons: HashMap<String, usize>,
    expiry_task: Option<JoinHandle<()>>,
}

/// Owner lock for one stream, held through the coordinator
pub struct StreamLock {
    coord: Arc<dyn Coordinator>,
    lock_dir: String,
    state: Mutex<LockState>,
    lost_tx: watch::Sender<bool>,
    lost_rx: watch::Receiver<bool>,
}

impl StreamLock {
    pub fn new(coord: Arc<dyn Coordinator>, lock_dir: impl Into<String>) -> Arc<Self> {
        let (lost_tx, lost_rx) = watch::channel(false);
        Arc::new(Self {
            coord,
            lock_dir: lock_dir.into(),
            state: Mutex::new(LockState {
                member: None,
                reasons: HashMap::new(),
                expiry_task: None,
            }),
            lost_tx,
            lost_rx,
        })
    }

    /// Signal that flips to `true` once the underlying session expires
    pub fn lost_signal(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    pub fn is_held(&self) -> bool {
        let state = self.state.lock();
        state.member.is_some() && !state.reasons.is_empty()
    }

    /// Acquire the lock for `reason`. Reentrant acquires for a lock already
    /// held by this process return without a coordinator round trip.
    pub async fn acquire(
        self: &Arc<Self>,
        reason: &str,
        timeout: Duration,
    ) -> Result<(), LockError> {
        {
            let mut state = self.state.lock();
            if state.member.is_some() {
                *state.reasons.entry(reason.to_string()).or_insert(0) += 1;
                debug!(lock = %self.lock_dir, reason, "reentrant lock acquire");
                return Ok(());
            }
        }

        let member = tokio::time::timeout(timeout, self.acquire_member())
            .await
            .map_err(|_| LockError::Timeout(timeout))?;
        let member = member?;

        info!(lock = %self.lock_dir, member = %member, reason, "stream lock acquired");
        let expiry_task = self.spawn_expiry_watcher();
        let mut state = self.state.lock();
        state.member = Some(member);
        state.reasons.insert(reason.to_string(), 1);
        state.expiry_task = Some(expiry_task);
        Ok(())
    }

    /// Release the acquire tagged `reason`; the member node is deleted when
    /// the last reason is released.
    pub async fn release(&self, reason: &str) -> Result<(), LockError> {
        let member = {
            let mut state = self.state.lock();
            match state.reasons.get_mut(reason) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    return Ok(());
                }
                Some(_) => {
                    state.reasons.remove(reason);
                }
                None => return Err(LockError::NotAcquired(reason.to_string())),
            }
            if !state.reasons.is_empty() {
                return Ok(());
            }
            if let Some(task) = state.expiry_task.take() {
                task.abort();
            }
            state.member.take()
        };

        if let Some(member) = member {
            match self.coord.delete(&member).await {
                Ok(()) => debug!(lock = %self.lock_dir, member = %member, "stream lock released"),
                // ephemeral node may already be gone with the session
                Err(CoordError::NodeNotFound(_)) | Err(CoordError::SessionExpired) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn acquire_member(self: &Arc<Self>) -> Result<String, LockError> {
        let prefix = format!("{}/member-", self.lock_dir);
        let session = self.coord.session_id();
        let member = self
            .coord
            .create_sequential(&prefix, Bytes::from(session.to_string()), true)
            .await?;
        let my_name = member
            .rsplit_once('/')
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| member.clone());

        let mut session_events = self.coord.session_events();
        loop {
            let children = self.coord.children(&self.lock_dir).await?;
            let my_index = match children.iter().position(|name| *name == my_name) {
                Some(index) => index,
                None => {
                    // our member vanished with the session
                    return Err(LockError::SessionExpired);
                }
            };
            if my_index == 0 {
                return Ok(member);
            }

            let predecessor = format!("{}/{}", self.lock_dir, children[my_index - 1]);
            debug!(lock = %self.lock_dir, waiting_on = %predecessor, "lock contended");
            let watch = self.coord.watch(&predecessor).await?;
            if !self.coord.exists(&predecessor).await? {
                continue;
            }
            tokio::select! {
                event = watch => {
                    if let Ok(WatchEvent::Deleted(_)) = event {
                        continue;
                    }
                    // spurious event, re-list and rearm
                }
                event = session_events.recv() => {
                    if matches!(event, Ok(SessionEvent::Expired)) {
                        return Err(LockError::SessionExpired);
                    }
                }
            }
        }
    }

    fn spawn_expiry_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.coord.session_events();
        let lock = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Expired) => {
                        warn!(lock = %lock.lock_dir, "coordinator session expired, lock lost");
                        {
                            let mut state = lock.state.lock();
                            state.member = None;
                            state.reasons.clear();
                        }
                        let _ = lock.lost_tx.send(true);
                        return;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryCoordinator;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_acquire_release() {
        let coord = MemoryCoordinator::new();
        let lock = StreamLock::new(coord.clone(), "/locks/s1");
        lock.acquire("writer", TIMEOUT).await.unwrap();
        assert!(lock.is_held());
        lock.release("writer").await.unwrap();
        assert!(!lock.is_held());
        assert!(coord.children("/locks/s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reentrant_by_reason() {
        let coord = MemoryCoordinator::new();
        let lock = StreamLock::new(coord.clone(), "/locks/s1");
        lock.acquire("writer", TIMEOUT).await.unwrap();
        lock.acquire("roll", TIMEOUT).await.unwrap();
        lock.release("writer").await.unwrap();
        // still held by the other reason
        assert!(lock.is_held());
        assert_eq!(coord.children("/locks/s1").await.unwrap().len(), 1);
        lock.release("roll").await.unwrap();
        assert!(!lock.is_held());
        assert!(matches!(
            lock.release("roll").await,
            Err(LockError::NotAcquired(_))
        ));
    }

    #[tokio::test]
    async fn test_contender_waits_for_owner() {
        let coord = MemoryCoordinator::new();
        let owner = StreamLock::new(coord.clone(), "/locks/s1");
        owner.acquire("writer", TIMEOUT).await.unwrap();

        let contender = StreamLock::new(coord.attach(), "/locks/s1");
        let pending = {
            let contender = Arc::clone(&contender);
            tokio::spawn(async move { contender.acquire("writer", TIMEOUT).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        owner.release("writer").await.unwrap();
        pending.await.unwrap().unwrap();
        assert!(contender.is_held());
    }

    #[tokio::test]
    async fn test_session_expiry_flips_lost_signal() {
        let coord = MemoryCoordinator::new();
        let lock = StreamLock::new(coord.clone(), "/locks/s1");
        lock.acquire("writer", TIMEOUT).await.unwrap();

        let mut lost = lock.lost_signal();
        assert!(!*lost.borrow());
        coord.expire_session();
        lost.changed().await.unwrap();
        assert!(*lost.borrow());
        assert!(!lock.is_held());
    }
}
