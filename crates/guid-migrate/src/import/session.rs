//! Transaction coordinator for one import run.
//!
//! An [`ImportSession`] owns the destination (with its open transaction)
//! and the identity maps accumulated so far. The whole import is one unit of
//! work: [`ImportSession::commit`] makes it durable, anything else discards
//! it. A session that is dropped while still open hands its target to the
//! target's own drop, which rolls the transaction back.

use tracing::{debug, info, warn};

use super::identity::IdentityMaps;
use crate::core::traits::ImportTarget;
use crate::error::{MigrateError, Result};

/// Lifecycle of an import session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Committed,
    RolledBack,
}

/// Transactional scope of one import run.
pub struct ImportSession {
    target: Option<Box<dyn ImportTarget>>,
    maps: IdentityMaps,
    state: SessionState,
}

impl ImportSession {
    /// Wrap a target whose transaction is already open.
    pub fn new(target: Box<dyn ImportTarget>) -> Self {
        debug!("Import session opened on {}", target.db_type());
        Self {
            target: Some(target),
            maps: IdentityMaps::new(),
            state: SessionState::Open,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    pub fn maps(&self) -> &IdentityMaps {
        &self.maps
    }

    /// The target and the identity maps, borrowed together.
    pub fn parts(&mut self) -> Result<(&mut (dyn ImportTarget + 'static), &mut IdentityMaps)> {
        let closed = self.closed_error();
        match self.target.as_deref_mut() {
            Some(target) => Ok((target, &mut self.maps)),
            None => Err(closed),
        }
    }

    /// Make every change of the session durable.
    pub async fn commit(&mut self) -> Result<()> {
        let target = self.target.take().ok_or_else(|| self.closed_error())?;
        // A failed COMMIT leaves nothing applied either.
        self.state = SessionState::RolledBack;
        target.commit().await?;
        self.state = SessionState::Committed;
        info!("Import committed");
        Ok(())
    }

    /// Discard every change of the session.
    pub async fn rollback(&mut self) -> Result<()> {
        let target = self.target.take().ok_or_else(|| self.closed_error())?;
        self.state = SessionState::RolledBack;
        target.rollback().await?;
        info!("Import rolled back");
        Ok(())
    }

    fn closed_error(&self) -> MigrateError {
        match self.state {
            SessionState::Committed => MigrateError::SessionClosed("already committed"),
            _ => MigrateError::SessionClosed("rolled back"),
        }
    }
}

impl Drop for ImportSession {
    fn drop(&mut self) {
        if self.target.is_some() {
            warn!("Import session dropped without commit; changes are rolled back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::MemoryDatabase;

    #[tokio::test]
    async fn test_commit_after_rollback_fails() {
        let db = MemoryDatabase::new();
        let mut session = ImportSession::new(Box::new(db.begin()));
        assert!(session.is_open());

        session.rollback().await.unwrap();
        assert_eq!(session.state(), SessionState::RolledBack);
        assert!(matches!(
            session.commit().await,
            Err(MigrateError::SessionClosed("rolled back"))
        ));
        assert!(session.parts().is_err());
    }

    #[tokio::test]
    async fn test_commit_closes_session() {
        let db = MemoryDatabase::new();
        let mut session = ImportSession::new(Box::new(db.begin()));
        session.commit().await.unwrap();
        assert_eq!(session.state(), SessionState::Committed);
        assert!(matches!(
            session.rollback().await,
            Err(MigrateError::SessionClosed("already committed"))
        ));
    }
}
