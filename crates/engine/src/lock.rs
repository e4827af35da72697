//! Process-wide reader/writer lock serializing engine mutations.
//!
//! The lock is handed out as an explicit [`EngineSession`] that travels
//! through the call chain. Inner functions offered a session reuse it
//! without reacquiring; mutating operations refuse a read session with
//! [`EngineError::LockUpgrade`].
//!
//! Sub-step failures inside a session can be recorded with
//! [`EngineSession::capture`] instead of aborting the scope. The recorded
//! errors surface together when the outermost scope calls
//! [`EngineSession::finish`], so a failure in one sub-step does not mask
//! the others or leave the pool in a mid-state.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

enum SessionGuard {
    Read(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Write(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

#[derive(Clone, Default)]
pub struct EngineLock {
    inner: Arc<RwLock<()>>,
}

impl EngineLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> EngineSession {
        let guard = Arc::clone(&self.inner).read_owned().await;
        EngineSession {
            mode: LockMode::Read,
            _guard: SessionGuard::Read(guard),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub async fn write(&self) -> EngineSession {
        let guard = Arc::clone(&self.inner).write_owned().await;
        EngineSession {
            mode: LockMode::Write,
            _guard: SessionGuard::Write(guard),
            errors: Mutex::new(Vec::new()),
        }
    }
}

pub struct EngineSession {
    mode: LockMode,
    _guard: SessionGuard,
    errors: Mutex<Vec<EngineError>>,
}

impl EngineSession {
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Mutating operations must already hold the writer lock.
    pub fn require_write(&self) -> EngineResult<()> {
        match self.mode {
            LockMode::Write => Ok(()),
            LockMode::Read => Err(EngineError::LockUpgrade),
        }
    }

    /// Record a sub-step failure without aborting the session.
    pub fn capture<T>(&self, result: EngineResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                tracing::error!(%error, "engine operation failed inside session");
                self.errors.lock().push(error);
                None
            }
        }
    }

    /// Close the session, surfacing every captured failure at once.
    pub fn finish(self) -> EngineResult<()> {
        let mut errors = self.errors.into_inner();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(EngineError::Group(errors)),
        }
    }
}
