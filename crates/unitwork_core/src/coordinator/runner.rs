//! Unit-of-work execution and post-commit dispatch.
//!
//! # Responsibility
//! - Open (outer call) or join (nested call) the calling thread's transaction.
//! - Commit or roll back, then convert the pending log into notifications.
//!
//! # Invariants
//! - Dispatch happens only after a successful commit, exactly once per outer
//!   call, and never for a rolled-back attempt.
//! - The thread's transaction marker is cleared and the session closed before
//!   dispatch and before `run` returns, including when the unit of work panics.

use super::error::{CoordinatorError, CoordinatorResult};
use crate::event::pending::GroupedNotification;
use crate::event::registry::{KindFilter, Observer, ObserverRegistry, RegistryResult};
use crate::identity::IdentityTracker;
use crate::model::change::ChangeMask;
use crate::reconcile::ReconciliationHook;
use crate::store::{StorageEngine, StorageResult, StorageSession};
use log::{debug, error, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

/// Transaction state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    Idle,
    Open,
    Committing,
    RollingBack,
}

impl TransactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Open => "open",
            Self::Committing => "committing",
            Self::RollingBack => "rolling_back",
        }
    }
}

/// Unit of work that wants to observe its own failure.
///
/// `handle_error` runs once, at the outermost boundary, after rollback and
/// before the error is returned. It cannot suppress the error.
pub trait SafeWork<S: ?Sized> {
    type Output;
    type Error;

    fn run(&mut self, session: &S) -> Result<Self::Output, Self::Error>;

    /// Receives the failure wrapped with its kind. The raw cause is
    /// `error.operation_error()` when the work itself failed and
    /// `error.storage_error()` when opening, beginning or committing failed.
    fn handle_error(&mut self, _error: &CoordinatorError<Self::Error>) {}
}

impl<S: ?Sized, T: SafeWork<S> + ?Sized> SafeWork<S> for &mut T {
    type Output = T::Output;
    type Error = T::Error;

    fn run(&mut self, session: &S) -> Result<Self::Output, Self::Error> {
        (**self).run(session)
    }

    fn handle_error(&mut self, error: &CoordinatorError<Self::Error>) {
        (**self).handle_error(error)
    }
}

struct ActiveTransaction<S> {
    session: Arc<S>,
    state: TransactionState,
}

/// Owns the observer registry and identity tracker for one storage engine and
/// runs units of work against it.
pub struct Coordinator<E: StorageEngine> {
    engine: E,
    tracker: Arc<IdentityTracker>,
    registry: ObserverRegistry,
    active: Mutex<HashMap<ThreadId, ActiveTransaction<E::Session>>>,
}

impl<E: StorageEngine> Coordinator<E> {
    /// Wraps `engine` and installs the reconciliation hook as its row listener.
    ///
    /// # Errors
    /// - `ListenerAlreadyInstalled` when the engine already has a listener.
    pub fn new(engine: E) -> StorageResult<Self> {
        let tracker = Arc::new(IdentityTracker::new());
        engine.install_row_listener(Arc::new(ReconciliationHook::new(Arc::clone(&tracker))))?;
        Ok(Self {
            engine,
            tracker,
            registry: ObserverRegistry::new(),
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn tracker(&self) -> &IdentityTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &ObserverRegistry {
        &self.registry
    }

    pub fn subscribe(
        &self,
        mask: ChangeMask,
        filter: KindFilter,
        observer: Arc<dyn Observer>,
    ) -> RegistryResult<()> {
        self.registry.subscribe(mask, filter, observer)
    }

    pub fn unsubscribe(
        &self,
        mask: ChangeMask,
        filter: KindFilter,
        observer: &Arc<dyn Observer>,
    ) -> bool {
        self.registry.unsubscribe(mask, filter, observer)
    }

    /// State of the calling thread's transaction.
    pub fn transaction_state(&self) -> TransactionState {
        self.active
            .lock()
            .get(&thread::current().id())
            .map_or(TransactionState::Idle, |active| active.state)
    }

    pub fn in_transaction(&self) -> bool {
        self.active.lock().contains_key(&thread::current().id())
    }

    /// Session of the calling thread's open transaction.
    pub fn current_session(&self) -> Option<Arc<E::Session>> {
        self.active
            .lock()
            .get(&thread::current().id())
            .map(|active| Arc::clone(&active.session))
    }

    /// Runs `work` exactly once inside a transaction.
    ///
    /// An outer call opens, commits and dispatches; a call made while the
    /// calling thread already has an open transaction joins it inline.
    ///
    /// # Errors
    /// - `SessionUnavailable` / `TransactionBeginFailed` when the transaction
    ///   could not start; `work` is not run.
    /// - `OperationFailed` when `work` failed.
    /// - `CommitFailed` when `work` succeeded but commit failed.
    pub fn run<R, W, F>(&self, work: F) -> CoordinatorResult<R, W>
    where
        F: FnOnce(&E::Session) -> Result<R, W>,
    {
        match self.current_session() {
            Some(session) => work(&*session).map_err(CoordinatorError::OperationFailed),
            None => self.run_outer(work),
        }
    }

    /// Like [`Coordinator::run`], also giving `work` its own failure.
    pub fn run_safe<S>(&self, mut work: S) -> CoordinatorResult<S::Output, S::Error>
    where
        S: SafeWork<E::Session>,
    {
        let outer = !self.in_transaction();
        let result = self.run(|session| work.run(session));
        if outer {
            if let Err(err) = &result {
                work.handle_error(err);
            }
        }
        result
    }

    fn run_outer<R, W, F>(&self, work: F) -> CoordinatorResult<R, W>
    where
        F: FnOnce(&E::Session) -> Result<R, W>,
    {
        let started_at = Instant::now();
        let session = match self.engine.open_session() {
            Ok(session) => Arc::new(session),
            Err(err) => {
                error!(
                    "event=tx_begin module=coordinator status=error error_code=session_unavailable error={}",
                    err
                );
                return Err(CoordinatorError::SessionUnavailable(err));
            }
        };

        if let Err(err) = session.begin() {
            error!(
                "event=tx_begin module=coordinator status=error error_code=transaction_begin_failed error={}",
                err
            );
            close_session(session.as_ref());
            return Err(CoordinatorError::TransactionBeginFailed(err));
        }
        session.pending_events().clear();

        let thread = thread::current().id();
        self.active.lock().insert(
            thread,
            ActiveTransaction {
                session: Arc::clone(&session),
                state: TransactionState::Open,
            },
        );
        let guard = TransactionGuard {
            coordinator: self,
            session: Arc::clone(&session),
            thread,
            released: false,
        };
        debug!("event=tx_begin module=coordinator status=ok");

        let outcome = match work(&*session) {
            Ok(value) => {
                self.set_state(thread, TransactionState::Committing);
                match session.commit() {
                    Ok(()) => Ok((value, session.pending_events().drain_grouped())),
                    Err(err) => {
                        self.set_state(thread, TransactionState::RollingBack);
                        roll_back(session.as_ref());
                        Err(CoordinatorError::CommitFailed(err))
                    }
                }
            }
            Err(cause) => {
                self.set_state(thread, TransactionState::RollingBack);
                roll_back(session.as_ref());
                Err(CoordinatorError::OperationFailed(cause))
            }
        };
        guard.release();

        match outcome {
            Ok((value, groups)) => {
                debug!(
                    "event=tx_commit module=coordinator status=ok groups={} duration_ms={}",
                    groups.len(),
                    started_at.elapsed().as_millis()
                );
                self.dispatch(&groups);
                Ok(value)
            }
            Err(err) => {
                match err.storage_error() {
                    Some(cause) => warn!(
                        "event=tx_rollback module=coordinator status=error error_code={} duration_ms={} error={}",
                        err.kind().as_str(),
                        started_at.elapsed().as_millis(),
                        cause
                    ),
                    None => warn!(
                        "event=tx_rollback module=coordinator status=error error_code={} duration_ms={}",
                        err.kind().as_str(),
                        started_at.elapsed().as_millis()
                    ),
                }
                Err(err)
            }
        }
    }

    fn set_state(&self, thread: ThreadId, state: TransactionState) {
        if let Some(active) = self.active.lock().get_mut(&thread) {
            active.state = state;
        }
    }

    fn dispatch(&self, groups: &[GroupedNotification]) {
        for group in groups {
            let observers = self.registry.dispatch(group);
            debug!(
                "event=tx_dispatch module=coordinator status=ok kind={} change={} entities={} observers={}",
                group.kind().name,
                group.change(),
                group.len(),
                observers
            );
        }
    }
}

/// Clears the thread marker and closes the session, rolling back first when
/// dropped without `release` (the unit of work panicked).
struct TransactionGuard<'a, E: StorageEngine> {
    coordinator: &'a Coordinator<E>,
    session: Arc<E::Session>,
    thread: ThreadId,
    released: bool,
}

impl<E: StorageEngine> TransactionGuard<'_, E> {
    fn release(mut self) {
        self.finish();
        self.released = true;
    }

    fn finish(&self) {
        self.coordinator.active.lock().remove(&self.thread);
        close_session(self.session.as_ref());
    }
}

impl<E: StorageEngine> Drop for TransactionGuard<'_, E> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!("event=tx_rollback module=coordinator status=error error_code=unit_of_work_panicked");
        if self.session.is_active() {
            roll_back(self.session.as_ref());
        } else {
            self.session.pending_events().clear();
        }
        self.finish();
    }
}

fn roll_back<S: StorageSession + ?Sized>(session: &S) {
    if let Err(err) = session.rollback() {
        warn!(
            "event=tx_rollback module=coordinator status=error error_code=rollback_failed error={}",
            err
        );
    }
    let discarded = session.pending_events().clear();
    if discarded > 0 {
        debug!(
            "event=tx_rollback module=coordinator status=ok discarded_events={}",
            discarded
        );
    }
}

fn close_session<S: StorageSession + ?Sized>(session: &S) {
    if let Err(err) = session.close() {
        warn!(
            "event=session_close module=coordinator status=error error={}",
            err
        );
    }
}
