use std::fmt;
use std::sync::Arc;

use super::SessionShared;
use crate::core::{OrmError, Result};

/// Transaction state
///
/// ```text
/// NotStarted ──begin──> Active ──commit──> Committed
///                         │
///                         └──rollback / failed commit──> RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotStarted,
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::NotStarted => write!(f, "NOT_STARTED"),
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// Handle to the transaction of one session.
///
/// A session runs at most one transaction at a time; the handle stays valid
/// after commit or rollback and can begin the next one.
#[derive(Clone)]
pub struct Transaction {
    session: Arc<SessionShared>,
}

impl Transaction {
    pub(crate) fn new(session: Arc<SessionShared>) -> Self {
        Self { session }
    }

    /// Switch the connection to manual commit.
    pub fn begin(&self) -> Result<()> {
        self.session.begin()
    }

    /// Flush, then commit the connection.
    pub fn commit(&self) -> Result<()> {
        self.session.commit()
    }

    /// Discard every managed entity, then roll back the connection.
    pub fn rollback(&self) -> Result<()> {
        self.session.rollback()
    }

    pub fn state(&self) -> Result<TransactionState> {
        self.session.transaction_state()
    }

    pub fn is_active(&self) -> bool {
        self.state().map(|s| s.is_active()).unwrap_or(false)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state() {
            Ok(state) => write!(f, "Transaction({})", state),
            Err(_) => write!(f, "Transaction(?)"),
        }
    }
}

pub(crate) fn require_active(state: TransactionState, operation: &str) -> Result<()> {
    if state.is_active() {
        Ok(())
    } else {
        Err(OrmError::Transaction(format!(
            "cannot {} a transaction in state {}",
            operation, state
        )))
    }
}
