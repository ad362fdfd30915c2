//! Per-session serialization of commands.
//!
//! The reconciler works on a `&mut UserState` with no locking of its own. The
//! hub owns one async mutex per session key and holds it for the whole
//! load → apply → save → publish sequence, so two requests for the same
//! session never interleave. Different sessions run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{
    AssetStore, GraphRepository, KeyError, NotificationChannel, SessionGroup, SessionKey,
};
use crate::command::{Command, CommandOutcome};
use crate::model::{Identity, UserState};
use crate::reconciler::{ReconcileError, StateReconciler};
use crate::state_store::{load_or_new, StateStore, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("invalid session key: {0}")]
    Key(#[from] KeyError),
}

type SessionLock = Arc<tokio::sync::Mutex<()>>;

pub struct SessionHub<G: ?Sized, A: ?Sized, S: ?Sized, N: ?Sized> {
    reconciler: StateReconciler<G, A>,
    store: Arc<S>,
    notifier: Arc<N>,
    locks: Mutex<HashMap<SessionKey, SessionLock>>,
}

impl<G, A, S, N> SessionHub<G, A, S, N>
where
    G: GraphRepository + ?Sized,
    A: AssetStore + ?Sized,
    S: StateStore + ?Sized,
    N: NotificationChannel + ?Sized,
{
    pub fn new(reconciler: StateReconciler<G, A>, store: Arc<S>, notifier: Arc<N>) -> Self {
        Self {
            reconciler,
            store,
            notifier,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Sessions with a dispatch in flight or queued.
    pub fn active_sessions(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Runs one command against the stored mirror for `key` and returns the
    /// mirror as saved.
    ///
    /// A transport failure aborts before the save: the stored document stays
    /// as it was and nothing is published. Business rejections are saved and
    /// published like any other outcome, with the message in `error`.
    #[instrument(skip_all, fields(key = %key, user = %identity.username, command = command.name()))]
    pub async fn dispatch(
        &self,
        key: &SessionKey,
        identity: &Identity,
        command: Command,
    ) -> Result<(UserState, CommandOutcome), SessionError> {
        let lock = self.lock_for(key);
        let guard = lock.lock().await;
        let result = self.run(key, identity, command).await;
        drop(guard);
        self.release(key, lock);
        result
    }

    /// [`dispatch`](Self::dispatch) with a key that has not been validated yet.
    pub async fn dispatch_raw(
        &self,
        raw_key: &str,
        identity: &Identity,
        command: Command,
    ) -> Result<(UserState, CommandOutcome), SessionError> {
        let key = SessionKey::new(raw_key)?;
        self.dispatch(&key, identity, command).await
    }

    /// Reads the stored mirror, waiting for any dispatch in flight on `key`.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn snapshot(&self, key: &SessionKey) -> Result<UserState, SessionError> {
        let lock = self.lock_for(key);
        let guard = lock.lock().await;
        let result = load_or_new(&*self.store, key).await;
        drop(guard);
        self.release(key, lock);
        Ok(result?)
    }

    async fn run(
        &self,
        key: &SessionKey,
        identity: &Identity,
        command: Command,
    ) -> Result<(UserState, CommandOutcome), SessionError> {
        let local = command.is_local();
        let mut state = load_or_new(&*self.store, key).await?;

        let outcome = match self.reconciler.apply(&mut state, identity, command).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "command aborted, stored state unchanged");
                return Err(err.into());
            }
        };

        self.store.save(key, &state).await?;

        // View-only changes stay with the session that made them.
        if local {
            debug!("local command, not published");
        } else {
            self.notifier
                .publish(&SessionGroup::for_identity(identity), &state);
        }

        info!(success = outcome.is_success(), error = ?state.error, "command applied");
        Ok((state, outcome))
    }

    fn lock_for(&self, key: &SessionKey) -> SessionLock {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn release(&self, key: &SessionKey, lock: SessionLock) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map and `lock` hold it: nobody else is waiting on this key.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }
}
