//! In-memory service table.
//!
//! Holds the lifecycle state and runtime handle of every service an engine
//! manages. State changes are published on a per-service `watch` channel
//! so dependents can wait for readiness without polling.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use berth_common::error::{BerthError, Result, ServiceError};
use berth_common::types::{RuntimeHandle, ServiceState};
use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Snapshot of one service's entry in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Current lifecycle state.
    pub state: ServiceState,
    /// Container handle, once one exists.
    pub handle: Option<RuntimeHandle>,
    /// Bring-up attempts made in the current operation.
    pub attempts: u32,
    /// Why the service last failed, if it did.
    pub error: Option<ServiceError>,
    /// Whether the container was created by the current operation.
    pub created_by_operation: bool,
    /// When the state last changed.
    pub updated_at: DateTime<Utc>,
}

impl ServiceRecord {
    fn new(state: ServiceState, handle: Option<RuntimeHandle>) -> Self {
        Self {
            state,
            handle,
            attempts: 0,
            error: None,
            created_by_operation: false,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    record: ServiceRecord,
    tx: watch::Sender<ServiceState>,
}

/// Shared, cloneable table of service records.
///
/// The lock is never held across an `.await`.
#[derive(Debug, Clone, Default)]
pub struct ServiceTable {
    inner: Arc<RwLock<BTreeMap<String, Entry>>>,
}

impl ServiceTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets a service's state and handle from observation, bypassing the
    /// transition rules, and resets per-operation bookkeeping.
    ///
    /// Used when an operation starts from a runtime snapshot.
    pub fn observe(&self, service: &str, state: ServiceState, handle: Option<RuntimeHandle>) {
        let mut entries = self.write();
        match entries.get_mut(service) {
            Some(entry) => {
                entry.record = ServiceRecord::new(state, handle);
                let _ = entry.tx.send_replace(state);
            }
            None => {
                let (tx, _) = watch::channel(state);
                let _ = entries.insert(
                    service.to_string(),
                    Entry {
                        record: ServiceRecord::new(state, handle),
                        tx,
                    },
                );
            }
        }
    }

    /// Moves a service to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidTransition`] if the state machine
    /// forbids the move, or [`BerthError::NotFound`] for an unknown service.
    pub fn transition(&self, service: &str, next: ServiceState) -> Result<()> {
        let mut entries = self.write();
        let entry = entries.get_mut(service).ok_or_else(|| BerthError::NotFound {
            kind: "service",
            id: service.to_string(),
        })?;
        let from = entry.record.state;
        if !from.can_transition_to(next) {
            return Err(BerthError::InvalidTransition {
                service: service.to_string(),
                from,
                to: next,
            });
        }
        entry.record.state = next;
        entry.record.updated_at = Utc::now();
        let _ = entry.tx.send_replace(next);
        drop(entries);
        tracing::info!(service, from = %from, state = %next, "service state changed");
        Ok(())
    }

    /// Marks a service failed and records why.
    ///
    /// A service already in a terminal state keeps its state; only the
    /// error is recorded. One that was already `Failed` is republished so
    /// dependents waiting on a replacement see it settle.
    pub fn fail(&self, service: &str, error: ServiceError) {
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(service) else {
            return;
        };
        tracing::warn!(service, error = %error, "service failed");
        entry.record.error = Some(error);
        let state = entry.record.state;
        if state.can_transition_to(ServiceState::Failed) || state == ServiceState::Failed {
            entry.record.state = ServiceState::Failed;
            entry.record.updated_at = Utc::now();
            let _ = entry.tx.send_replace(ServiceState::Failed);
        }
    }

    /// Records an error without changing state.
    pub fn set_error(&self, service: &str, error: ServiceError) {
        if let Some(entry) = self.write().get_mut(service) {
            entry.record.error = Some(error);
        }
    }

    /// Stores the container handle of a freshly created container.
    pub fn set_created(&self, service: &str, handle: RuntimeHandle) {
        if let Some(entry) = self.write().get_mut(service) {
            entry.record.handle = Some(handle);
            entry.record.created_by_operation = true;
        }
    }

    /// Drops the container handle after removal.
    pub fn clear_handle(&self, service: &str) {
        if let Some(entry) = self.write().get_mut(service) {
            entry.record.handle = None;
        }
    }

    /// Counts one more bring-up attempt, returning the new total.
    pub fn record_attempt(&self, service: &str) -> u32 {
        self.write().get_mut(service).map_or(0, |entry| {
            entry.record.attempts += 1;
            entry.record.attempts
        })
    }

    /// Current record of a service.
    #[must_use]
    pub fn get(&self, service: &str) -> Option<ServiceRecord> {
        self.read().get(service).map(|e| e.record.clone())
    }

    /// Current state of a service.
    #[must_use]
    pub fn state(&self, service: &str) -> Option<ServiceState> {
        self.read().get(service).map(|e| e.record.state)
    }

    /// Container handle of a service.
    #[must_use]
    pub fn handle(&self, service: &str) -> Option<RuntimeHandle> {
        self.read().get(service).and_then(|e| e.record.handle.clone())
    }

    /// Whether the table manages `service`.
    #[must_use]
    pub fn contains(&self, service: &str) -> bool {
        self.read().contains_key(service)
    }

    /// Subscribes a dependent to a service's state.
    ///
    /// The flag is set when the current `Failed` was observed from a dead
    /// container and carries no error: that service is about to be
    /// replaced, so its present state says nothing about readiness.
    #[must_use]
    pub fn subscribe_dependency(
        &self,
        service: &str,
    ) -> Option<(watch::Receiver<ServiceState>, bool)> {
        self.read().get(service).map(|e| {
            let replacing = e.record.state == ServiceState::Failed && e.record.error.is_none();
            (e.tx.subscribe(), replacing)
        })
    }

    /// Discards a service's record, as after `down`.
    pub fn forget(&self, service: &str) {
        let _ = self.write().remove(service);
    }

    /// Every record, sorted by service name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, ServiceRecord)> {
        self.read()
            .iter()
            .map(|(name, e)| (name.clone(), e.record.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn legal_transitions_update_state() {
        let table = ServiceTable::new();
        table.observe("db", ServiceState::Planned, None);
        table.transition("db", ServiceState::Created).expect("created");
        table.transition("db", ServiceState::Starting).expect("starting");
        assert_eq!(table.state("db"), Some(ServiceState::Starting));
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let table = ServiceTable::new();
        table.observe("db", ServiceState::Planned, None);
        let err = table
            .transition("db", ServiceState::Healthy)
            .expect_err("illegal");
        assert!(matches!(err, BerthError::InvalidTransition { .. }));
        assert_eq!(table.state("db"), Some(ServiceState::Planned));
    }

    #[test]
    fn unknown_service_is_not_found() {
        let table = ServiceTable::new();
        assert!(matches!(
            table.transition("ghost", ServiceState::Created),
            Err(BerthError::NotFound { .. })
        ));
    }

    #[test]
    fn fail_records_error_and_state() {
        let table = ServiceTable::new();
        table.observe("api", ServiceState::Running, Some(RuntimeHandle::new("c1")));
        table.fail(
            "api",
            ServiceError::HealthTimeout {
                timeout: Duration::from_secs(30),
            },
        );
        let record = table.get("api").expect("record");
        assert_eq!(record.state, ServiceState::Failed);
        assert!(record.error.is_some());
        assert_eq!(record.handle, Some(RuntimeHandle::new("c1")));
    }

    #[test]
    fn observe_resets_operation_bookkeeping() {
        let table = ServiceTable::new();
        table.observe("api", ServiceState::Planned, None);
        let _ = table.record_attempt("api");
        table.set_created("api", RuntimeHandle::new("c1"));
        table.observe("api", ServiceState::Running, Some(RuntimeHandle::new("c1")));
        let record = table.get("api").expect("record");
        assert_eq!(record.attempts, 0);
        assert!(!record.created_by_operation);
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let table = ServiceTable::new();
        table.observe("db", ServiceState::Running, None);
        let (mut rx, replacing) = table.subscribe_dependency("db").expect("subscribe");
        assert!(!replacing);
        let waiter = tokio::spawn(async move {
            rx.wait_for(|s| *s == ServiceState::Healthy).await.map(|s| *s)
        });
        table.transition("db", ServiceState::Healthy).expect("healthy");
        let seen = waiter.await.expect("join").expect("wait");
        assert_eq!(seen, ServiceState::Healthy);
    }

    #[test]
    fn observed_dead_service_is_flagged_for_replacement() {
        let table = ServiceTable::new();
        table.observe("db", ServiceState::Failed, Some(RuntimeHandle::new("c1")));
        let (_, replacing) = table.subscribe_dependency("db").expect("subscribe");
        assert!(replacing);

        table.fail("db", ServiceError::Cancelled);
        let (_, replacing) = table.subscribe_dependency("db").expect("subscribe");
        assert!(!replacing);
    }

    #[tokio::test]
    async fn failing_a_failed_service_wakes_waiters() {
        let table = ServiceTable::new();
        table.observe("db", ServiceState::Failed, None);
        let (mut rx, _) = table.subscribe_dependency("db").expect("subscribe");
        table.fail("db", ServiceError::Cancelled);
        assert!(rx.has_changed().expect("open"));
        assert_eq!(*rx.borrow_and_update(), ServiceState::Failed);
    }
}
