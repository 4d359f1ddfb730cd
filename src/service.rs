// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Ticket service contract.
//!
//! Every storage backend implements [`TicketService`]. Callers only ever see
//! this capability, and pick the backend through configuration with
//! [`open_service`]. Both backends turn each mutation into exactly one
//! appended journal entry, and rebuild ticket state on read by folding the
//! entries in order.
//!
//! # Backends
//!
//! - [`JournalTicketService`] commits entries into the hosted repository
//!   itself, under a reserved ref namespace. Appends are optimistic
//!   compare-and-swap on a ref with bounded retry.
//! - [`ExternalTicketService`] appends entries to lists inside an external
//!   key/value store, relying on the store's atomic append.
//!
//! # Time Bounds
//!
//! Every operation runs against a [`Deadline`] built from the configured
//! timeout. Nothing blocks past it: an expired deadline fails the operation
//! with [`TicketError::Timeout`] before any state changes.
//!
//! # Change Feed
//!
//! After every successful append a [`TicketEvent`] goes out on a broadcast
//! channel. Notification and search indexing subscribe through
//! [`TicketService::subscribe`]. Events are fire and forget: a mutation
//! never fails because nobody listens.

pub mod external;
pub mod journal;

pub use external::{ExternalTicketService, MemoryStore, StoreClient, StoreError};
pub use journal::{JournalTicketService, RefLayout};

use crate::{
    allocator::AllocatorError,
    config::{TicketBackend, TicketSettings},
    git::{GitError, RepositoryHandle},
    ticket::{FieldPatch, JournalEntry, NewTicket, Ticket, TicketFilter, TicketId, TicketPatch},
};

use std::{
    sync::Arc,
    thread::sleep,
    time::{Duration, Instant},
};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Uniform ticket operations shared by every backend.
///
/// Implementations are safe to call from many threads at once.
pub trait TicketService: Send + Sync {
    /// Create new ticket with a freshly allocated id.
    ///
    /// The first journal entry carries the full initial field set. Races on
    /// the allocated id are retried internally.
    ///
    /// # Errors
    ///
    /// - Return [`TicketError::AllocationConflict`] if allocation keeps
    ///   racing past the attempt bound.
    /// - Return [`TicketError::AllocatorUnavailable`] if the id counter
    ///   cannot be reached.
    fn create(&self, repo: &RepositoryHandle, fields: NewTicket, author: &str) -> Result<Ticket>;

    /// Fold ticket journal into current state.
    ///
    /// # Errors
    ///
    /// - Return [`TicketError::TicketNotFound`] if ticket has no journal,
    ///   or was deleted.
    fn get(&self, repo: &RepositoryHandle, id: TicketId) -> Result<Ticket>;

    /// Append one journal entry holding `patch` and an optional comment.
    ///
    /// # Errors
    ///
    /// - Return [`TicketError::TicketNotFound`] if ticket has no journal,
    ///   or was deleted.
    /// - Return [`TicketError::Conflict`] if concurrent writers keep winning
    ///   past the attempt bound.
    fn update(
        &self,
        repo: &RepositoryHandle,
        id: TicketId,
        patch: TicketPatch,
        author: &str,
        comment: Option<&str>,
    ) -> Result<Ticket>;

    /// Materialize every live ticket that matches filter.
    fn list(&self, repo: &RepositoryHandle, filter: &TicketFilter) -> Result<Vec<Ticket>>;

    /// Irreversibly discard every ticket journal of repository.
    ///
    /// This is a destructive administrative operation meant for resets and
    /// tests. The id counter survives, so ids are never handed out twice.
    /// Returns number of tickets discarded.
    fn delete_all(&self, repo: &RepositoryHandle) -> Result<usize>;

    /// Mark single ticket deleted by appending a terminal entry.
    fn delete(&self, repo: &RepositoryHandle, id: TicketId, author: &str) -> Result<()>;

    /// Raw journal of ticket in replay order, deleted tickets included.
    fn journal(&self, repo: &RepositoryHandle, id: TicketId) -> Result<Vec<JournalEntry>>;

    /// Ids of every ticket with a journal, sorted ascending.
    fn ids(&self, repo: &RepositoryHandle) -> Result<Vec<TicketId>>;

    /// Read content of a named attachment.
    ///
    /// # Errors
    ///
    /// - Return [`TicketError::AttachmentNotFound`] if ticket never received
    ///   an attachment with that name.
    fn attachment(&self, repo: &RepositoryHandle, id: TicketId, name: &str) -> Result<Vec<u8>>;

    /// Subscribe to the change feed.
    fn subscribe(&self) -> broadcast::Receiver<TicketEvent>;

    /// Carry every ticket of repository over to its new name.
    ///
    /// Returns `false` if tickets already exist under the new name, in which
    /// case nothing moves.
    fn rename(&self, old: &RepositoryHandle, new: &RepositoryHandle) -> Result<bool>;

    /// Revise text of an existing comment.
    ///
    /// # Errors
    ///
    /// - Return [`TicketError::CommentNotFound`] if ticket has no live
    ///   comment with that id.
    fn edit_comment(
        &self,
        repo: &RepositoryHandle,
        id: TicketId,
        comment: u64,
        text: &str,
        author: &str,
    ) -> Result<Ticket> {
        let patch = TicketPatch::new().edit_comment(comment, text);
        self.update(repo, id, patch, author, None)
    }

    /// Retract an existing comment.
    ///
    /// # Errors
    ///
    /// - Return [`TicketError::CommentNotFound`] if ticket has no live
    ///   comment with that id.
    fn delete_comment(
        &self,
        repo: &RepositoryHandle,
        id: TicketId,
        comment: u64,
        author: &str,
    ) -> Result<Ticket> {
        self.update(repo, id, TicketPatch::new().delete_comment(comment), author, None)
    }

    /// Check if a live ticket exists.
    fn has_ticket(&self, repo: &RepositoryHandle, id: TicketId) -> Result<bool> {
        match self.get(repo, id) {
            Ok(_) => Ok(true),
            Err(TicketError::TicketNotFound { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }
}

/// Construct the backend named by settings.
///
/// # Errors
///
/// - Return [`TicketError::NoStoreClient`] if external backend is selected
///   without a store client.
pub fn open_service(
    settings: &TicketSettings,
    client: Option<Arc<dyn StoreClient>>,
) -> Result<Arc<dyn TicketService>> {
    info!("using {} ticket backend", settings.backend);
    match settings.backend {
        TicketBackend::Journal => Ok(Arc::new(JournalTicketService::new(settings))),
        TicketBackend::External => {
            let client = client.ok_or(TicketError::NoStoreClient)?;
            Ok(Arc::new(ExternalTicketService::new(client, settings)))
        }
    }
}

/// Ticket changed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketEvent {
    pub repository: String,
    pub id: TicketId,

    /// Entry that was just appended.
    pub entry: JournalEntry,

    /// Ticket state after the append, ready for indexing.
    pub ticket: Ticket,
}

/// Broadcast side of the change feed.
#[derive(Debug, Clone)]
pub struct EventFeed {
    sender: broadcast::Sender<TicketEvent>,
}

impl EventFeed {
    pub const CAPACITY: usize = 256;

    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(Self::CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TicketEvent> {
        self.sender.subscribe()
    }

    /// Publish event to current subscribers, if any.
    pub fn publish(&self, event: TicketEvent) {
        let (repository, id) = (event.repository.clone(), event.id);
        if self.sender.send(event).is_err() {
            debug!("no subscribers for change on {repository}#{id}");
        }
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Point in time an operation must finish by.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            expires: Instant::now() + budget,
            budget,
        }
    }

    /// Time left before expiry.
    ///
    /// # Errors
    ///
    /// - Return [`TicketError::Timeout`] if deadline already passed.
    pub fn remaining(&self) -> Result<Duration> {
        self.expires
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .ok_or(TicketError::Timeout {
                after: self.budget,
            })
    }

    /// Fail if deadline already passed.
    pub fn check(&self) -> Result<()> {
        self.remaining().map(|_| ())
    }
}

/// Bounded retry settings shared by backends and allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Start the clock for a new operation.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.timeout)
    }

    /// Attempt numbers to run, never fewer than one.
    pub fn attempts(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.max_attempts.max(1)
    }

    /// Sleep before the next attempt, linearly backing off.
    ///
    /// Never sleeps past the deadline.
    pub fn pause(&self, attempt: u32, deadline: &Deadline) -> Result<()> {
        let wait = self.backoff.saturating_mul(attempt);
        let left = deadline.remaining()?;
        sleep(wait.min(left));
        Ok(())
    }
}

impl From<&TicketSettings> for RetryPolicy {
    fn from(settings: &TicketSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            max_attempts: settings.max_attempts,
            backoff: Duration::from_millis(settings.backoff_ms),
        }
    }
}

/// Fold entries into a live ticket.
///
/// # Errors
///
/// - Return [`TicketError::TicketNotFound`] if journal is empty, or ends
///   up deleted.
pub(crate) fn fold_live(repository: &str, id: TicketId, entries: &[JournalEntry]) -> Result<Ticket> {
    match Ticket::fold(repository, entries) {
        Some(ticket) if !ticket.deleted => Ok(ticket),
        _ => Err(TicketError::TicketNotFound {
            repository: repository.into(),
            id,
        }),
    }
}

/// Comment edits must target a live comment of the current fold.
pub(crate) fn check_comment_edits(ticket: &Ticket, patches: &[FieldPatch]) -> Result<()> {
    for patch in patches {
        let comment = match patch {
            FieldPatch::EditComment { id, .. } | FieldPatch::DeleteComment(id) => *id,
            _ => continue,
        };
        if ticket.comment(comment).is_none() {
            return Err(TicketError::CommentNotFound {
                id: ticket.id,
                comment,
            });
        }
    }

    Ok(())
}

/// Attachment names become path segments and store keys.
pub(crate) fn check_attachment_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(TicketError::InvalidAttachmentName { name: name.into() });
    }

    Ok(())
}

/// All possible error types for ticket operations.
#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    /// Ticket has no journal, or was deleted.
    #[error("ticket {repository}#{id} not found")]
    TicketNotFound { repository: String, id: TicketId },

    /// Compare-and-swap kept losing to concurrent writers.
    #[error("ticket {repository}#{id} kept changing, gave up after {attempts} attempts")]
    Conflict {
        repository: String,
        id: TicketId,
        attempts: u32,
    },

    /// Freshly allocated ids kept colliding with existing journals.
    #[error("could not allocate ticket id for {repository} after {attempts} attempts")]
    AllocationConflict { repository: String, attempts: u32 },

    /// Durable id counter cannot be reached.
    #[error("ticket id allocator unavailable: {reason}")]
    AllocatorUnavailable { reason: String },

    /// Operation ran out of time.
    #[error("operation timed out after {after:?}")]
    Timeout { after: Duration },

    /// Stored journal entry cannot be decoded.
    #[error("malformed journal entry {location}: {reason}")]
    Malformed { location: String, reason: String },

    /// Ticket has no attachment by that name.
    #[error("ticket {id} has no attachment {name:?}")]
    AttachmentNotFound { id: TicketId, name: String },

    /// Ticket has no live comment with that id.
    #[error("ticket {id} has no comment {comment}")]
    CommentNotFound { id: TicketId, comment: u64 },

    /// Attachment name is unusable as a path segment.
    #[error("invalid attachment name {name:?}")]
    InvalidAttachmentName { name: String },

    /// External backend selected, but no store client given.
    #[error("external ticket backend requires a store client")]
    NoStoreClient,

    /// External store failure.
    #[error(transparent)]
    Store(StoreError),

    /// Git object access failure.
    #[error(transparent)]
    Git(#[from] GitError),

    /// Journal entry cannot be encoded.
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

impl From<git2::Error> for TicketError {
    fn from(error: git2::Error) -> Self {
        Self::Git(GitError::Git2(error))
    }
}

impl From<StoreError> for TicketError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Timeout { after } => Self::Timeout { after },
            other => Self::Store(other),
        }
    }
}

impl From<AllocatorError> for TicketError {
    fn from(error: AllocatorError) -> Self {
        match error {
            AllocatorError::Timeout { after } => Self::Timeout { after },
            AllocatorError::Contended {
                repository,
                attempts,
            } => Self::AllocationConflict {
                repository,
                attempts,
            },
            AllocatorError::Unavailable { reason } => Self::AllocatorUnavailable { reason },
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = TicketError> = std::result::Result<T, E>;
