//! Token → client record store.
//!
//! The registry is the only place that answers "does this token already have
//! a management channel / an extension runtime". Insertions refuse to
//! overwrite a live entry. Removals carry the generation of the entry they
//! mean to remove, so a late cleanup from an old session cannot clear a
//! newer one.
//!
//! Handshake dispatch for every token runs under [`SessionRegistry::lock_dispatch`],
//! so check-then-insert sequences never interleave.

use crate::error::session::SessionError;
use crate::runtime::supervisor::RuntimeHandle;
use crate::session::grace::GraceStatus;
use crate::session::management::ManagementHandle;
use crate::session::token::ClientToken;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Held for the duration of one handshake dispatch.
pub type DispatchGuard = OwnedMutexGuard<()>;

#[derive(Default)]
struct ClientRecord {
    management: Option<ManagementHandle>,
    extension_runtime: Option<RuntimeHandle>,
}

impl ClientRecord {
    fn is_empty(&self) -> bool {
        self.management.is_none() && self.extension_runtime.is_none()
    }
}

/// Outcome of a "reduce grace time" broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReduceGraceReport {
    /// Disconnected management sessions whose short timer was armed.
    pub management_shortened: usize,
    /// Extension runtimes that were sent the notice.
    pub runtimes_notified: usize,
}

/// Point-in-time view of one client record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSnapshot {
    pub token: ClientToken,
    pub management: Option<GraceStatus>,
    pub extension_runtime_pid: Option<u32>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    clients: Arc<RwLock<HashMap<ClientToken, ClientRecord>>>,
    dispatch: Arc<Mutex<()>>,
    generations: Arc<AtomicU64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_dispatch(&self) -> DispatchGuard {
        self.dispatch.clone().lock_owned().await
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    // ============================================
    // MANAGEMENT
    // ============================================

    pub async fn management(&self, token: &ClientToken) -> Option<ManagementHandle> {
        self.clients
            .read()
            .await
            .get(token)
            .and_then(|record| record.management.clone())
            .filter(ManagementHandle::is_alive)
    }

    pub async fn has_management(&self, token: &ClientToken) -> bool {
        self.management(token).await.is_some()
    }

    pub(crate) async fn insert_management(
        &self,
        token: ClientToken,
        handle: ManagementHandle,
    ) -> Result<(), SessionError> {
        let mut clients = self.clients.write().await;
        let record = clients.entry(token).or_default();
        if record
            .management
            .as_ref()
            .is_some_and(ManagementHandle::is_alive)
        {
            return Err(SessionError::management_already_running());
        }
        record.management = Some(handle);
        Ok(())
    }

    /// Clear the management entry if it still belongs to `generation`.
    pub(crate) async fn remove_management(&self, token: &ClientToken, generation: u64) -> bool {
        let mut clients = self.clients.write().await;
        let Some(record) = clients.get_mut(token) else {
            return false;
        };
        if record
            .management
            .as_ref()
            .is_none_or(|handle| handle.generation() != generation)
        {
            debug!("[{token}] Management entry already replaced or removed");
            return false;
        }
        record.management = None;
        if record.is_empty() {
            clients.remove(token);
        }
        true
    }

    // ============================================
    // EXTENSION RUNTIME
    // ============================================

    pub async fn extension_runtime(&self, token: &ClientToken) -> Option<RuntimeHandle> {
        self.clients
            .read()
            .await
            .get(token)
            .and_then(|record| record.extension_runtime.clone())
            .filter(RuntimeHandle::is_alive)
    }

    pub async fn has_extension_runtime(&self, token: &ClientToken) -> bool {
        self.extension_runtime(token).await.is_some()
    }

    pub(crate) async fn insert_extension_runtime(
        &self,
        token: ClientToken,
        handle: RuntimeHandle,
    ) -> Result<(), SessionError> {
        let mut clients = self.clients.write().await;
        let record = clients.entry(token).or_default();
        if record
            .extension_runtime
            .as_ref()
            .is_some_and(RuntimeHandle::is_alive)
        {
            return Err(SessionError::runtime_already_running());
        }
        record.extension_runtime = Some(handle);
        Ok(())
    }

    pub(crate) async fn remove_extension_runtime(
        &self,
        token: &ClientToken,
        generation: u64,
    ) -> bool {
        let mut clients = self.clients.write().await;
        let Some(record) = clients.get_mut(token) else {
            return false;
        };
        if record
            .extension_runtime
            .as_ref()
            .is_none_or(|handle| handle.generation() != generation)
        {
            debug!("[{token}] Extension runtime entry already replaced or removed");
            return false;
        }
        record.extension_runtime = None;
        if record.is_empty() {
            clients.remove(token);
        }
        true
    }

    // ============================================
    // BROADCAST & INSPECTION
    // ============================================

    /// Tell every client that someone has connected.
    ///
    /// Management sessions other than `origin`'s that are waiting on their
    /// long timer get their short timer armed. Every extension runtime,
    /// `origin`'s included, gets a fire-and-forget notice.
    pub async fn publish_reduce_grace_time(&self, origin: &ClientToken) -> ReduceGraceReport {
        let clients = self.clients.read().await;
        let mut report = ReduceGraceReport::default();

        for (token, record) in clients.iter() {
            if let Some(management) = record.management.as_ref().filter(|_| token != origin) {
                if management.grace_status().accepts_reduction() && management.reduce_grace_time() {
                    info!(
                        "[{token}] Another client has connected, reducing the reconnection grace time"
                    );
                    report.management_shortened += 1;
                }
            }
            if let Some(runtime) = &record.extension_runtime {
                if runtime.reduce_grace_time() {
                    report.runtimes_notified += 1;
                }
            }
        }

        report
    }

    pub async fn snapshot(&self) -> Vec<ClientSnapshot> {
        let clients = self.clients.read().await;
        let mut snapshot: Vec<ClientSnapshot> = clients
            .iter()
            .map(|(token, record)| ClientSnapshot {
                token: token.clone(),
                management: record.management.as_ref().map(ManagementHandle::grace_status),
                extension_runtime_pid: record.extension_runtime.as_ref().map(RuntimeHandle::pid),
            })
            .collect();
        snapshot.sort_by(|left, right| left.token.cmp(&right.token));
        snapshot
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Ask every session to dispose and every runtime to terminate.
    pub async fn dispose_all(&self) {
        let clients = self.clients.read().await;
        for (token, record) in clients.iter() {
            if let Some(management) = &record.management {
                debug!("[{token}] Disposing management connection on shutdown");
                management.dispose();
            }
            if let Some(runtime) = &record.extension_runtime {
                debug!("[{token}] Terminating extension runtime on shutdown");
                runtime.terminate();
            }
        }
    }
}
