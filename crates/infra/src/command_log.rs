//! Command log: where commands wait to be routed.
//!
//! Commands are written once and never change apart from their status:
//! `pending → consumed → processed | failed`. Claiming a command is the
//! `pending → consumed` step and happens atomically, so one command is handed
//! to one pump at a time. Delivery to the router is at-least-once.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

use strata_core::MessageId;
use strata_events::{Command, CommandStatus};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandLogError {
    #[error("command already logged: {0}")]
    AlreadyExists(MessageId),

    #[error("command not found: {0}")]
    NotFound(MessageId),

    #[error("command {id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: MessageId,
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error("command log storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait CommandLog: Send + Sync {
    /// Write a new command. It is stored as `pending` whatever its status.
    async fn insert(&self, command: Command) -> Result<(), CommandLogError>;

    async fn get(&self, id: &MessageId) -> Result<Option<Command>, CommandLogError>;

    async fn mark(&self, id: &MessageId, status: CommandStatus) -> Result<(), CommandLogError>;

    /// Claim the oldest pending command, marking it consumed.
    async fn claim_next(&self) -> Result<Option<Command>, CommandLogError>;

    /// Oldest pending commands first.
    async fn pending(&self, limit: usize) -> Result<Vec<Command>, CommandLogError>;

    /// Wait until new commands may be pending, or `max_wait` elapses.
    async fn wait_for_pending(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}

#[derive(Debug, Default)]
struct LogInner {
    commands: HashMap<MessageId, Command>,
    pending: VecDeque<MessageId>,
}

/// In-memory command log for tests/dev. Wakes waiters on insert.
#[derive(Debug, Default)]
pub struct InMemoryCommandLog {
    inner: RwLock<LogInner>,
    inserted: Notify,
}

impl InMemoryCommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, LogInner>, CommandLogError> {
        self.inner
            .read()
            .map_err(|_| CommandLogError::Storage("command log lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, LogInner>, CommandLogError> {
        self.inner
            .write()
            .map_err(|_| CommandLogError::Storage("command log lock poisoned".to_string()))
    }

    /// Number of commands currently in `status`.
    pub fn count(&self, status: CommandStatus) -> usize {
        self.read()
            .map(|inner| {
                inner
                    .commands
                    .values()
                    .filter(|c| c.status == Some(status))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl CommandLog for InMemoryCommandLog {
    async fn insert(&self, command: Command) -> Result<(), CommandLogError> {
        {
            let mut inner = self.write()?;
            if inner.commands.contains_key(&command.id) {
                return Err(CommandLogError::AlreadyExists(command.id));
            }
            let id = command.id.clone();
            inner
                .commands
                .insert(id.clone(), command.with_status(CommandStatus::Pending));
            inner.pending.push_back(id);
        }
        self.inserted.notify_waiters();
        Ok(())
    }

    async fn get(&self, id: &MessageId) -> Result<Option<Command>, CommandLogError> {
        Ok(self.read()?.commands.get(id).cloned())
    }

    async fn mark(&self, id: &MessageId, status: CommandStatus) -> Result<(), CommandLogError> {
        let mut inner = self.write()?;
        let command = inner
            .commands
            .get_mut(id)
            .ok_or_else(|| CommandLogError::NotFound(id.clone()))?;
        let from = command.status.unwrap_or(CommandStatus::Pending);
        if !from.can_transition_to(status) {
            return Err(CommandLogError::InvalidTransition {
                id: id.clone(),
                from,
                to: status,
            });
        }
        command.status = Some(status);
        if status != CommandStatus::Pending {
            inner.pending.retain(|p| p != id);
        }
        Ok(())
    }

    async fn claim_next(&self) -> Result<Option<Command>, CommandLogError> {
        let mut inner = self.write()?;
        while let Some(id) = inner.pending.pop_front() {
            if let Some(command) = inner.commands.get_mut(&id) {
                if command.status == Some(CommandStatus::Pending) {
                    command.status = Some(CommandStatus::Consumed);
                    return Ok(Some(command.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn pending(&self, limit: usize) -> Result<Vec<Command>, CommandLogError> {
        let inner = self.read()?;
        Ok(inner
            .pending
            .iter()
            .filter_map(|id| inner.commands.get(id))
            .filter(|c| c.status == Some(CommandStatus::Pending))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn wait_for_pending(&self, max_wait: Duration) {
        let notified = self.inserted.notified();
        if self.count(CommandStatus::Pending) > 0 {
            return;
        }
        let _ = tokio::time::timeout(max_wait, notified).await;
    }
}
