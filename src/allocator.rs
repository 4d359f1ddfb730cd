// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Ticket id allocation.
//!
//! Ticket ids are handed out per repository from a durable counter that
//! lives next to whichever backend is active. Allocation is an atomic
//! increment: two concurrent callers never receive the same id, and an id is
//! never handed out twice, even after every ticket was discarded.
//!
//! # Counter Ref
//!
//! The journal backend keeps its counter on a dedicated ref inside the
//! ticket namespace, see [`RefLayout::counter_ref`]. The ref points at a
//! commit whose tree holds a single `last-id` blob with the last id handed
//! out in decimal. Allocation bumps it by compare-and-swap, the same way
//! journal appends work. A missing counter ref is seeded from the highest
//! ticket id already present in the bucket refs, so counting resumes
//! correctly for repositories that lost their counter.
//!
//! # Counter Key
//!
//! The external backend uses the store's native increment on a counter key
//! that sits outside the ticket namespace, and records each handed out id
//! in a per-repository index list that listing relies upon.

use crate::{
    git::{GitRepository, RepositoryHandle},
    service::{external::StoreKeys, Deadline, RefLayout, RetryPolicy, StoreClient, StoreError, TicketError},
    ticket::TicketId,
};

use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};

/// Hands out unique, increasing ticket ids per repository.
pub trait TicketIdAllocator: Send + Sync {
    /// Reserve next id for repository.
    ///
    /// # Errors
    ///
    /// - Return [`AllocatorError::Unavailable`] if the durable counter
    ///   cannot be reached. Callers must never invent an id instead.
    /// - Return [`AllocatorError::Contended`] if concurrent allocations keep
    ///   winning past the attempt bound.
    /// - Return [`AllocatorError::Timeout`] if deadline passes.
    fn allocate(&self, repo: &RepositoryHandle, deadline: &Deadline) -> Result<TicketId>;
}

/// Counter stored on a ref in the hosted repository.
#[derive(Debug, Clone)]
pub struct RefCounterAllocator {
    layout: RefLayout,
    policy: RetryPolicy,
}

impl RefCounterAllocator {
    /// Name of the blob holding the last handed out id.
    pub const COUNTER_BLOB: &'static str = "last-id";

    pub fn new(layout: RefLayout, policy: RetryPolicy) -> Self {
        Self { layout, policy }
    }

    /// Last id handed out, or zero if nothing was ever allocated.
    pub fn current(&self, repo: &RepositoryHandle) -> Result<u64> {
        let git = open(repo)?;
        let tip = git.ref_target(&self.layout.counter_ref()).map_err(unavailable)?;
        self.read_counter(&git, tip)
    }

    fn read_counter(&self, git: &GitRepository, tip: Option<git2::Oid>) -> Result<u64> {
        let Some(tip) = tip else {
            return self.seed(git);
        };

        let tree = git.commit_tree(tip).map_err(unavailable)?;
        let blob = git
            .find_path(tree, Self::COUNTER_BLOB)
            .map_err(unavailable)?;
        let text = git.read_blob_as_text(blob.id).map_err(unavailable)?;
        text.trim().parse::<u64>().map_err(|_| AllocatorError::Unavailable {
            reason: format!("counter ref holds garbage: {:?}", text.trim()),
        })
    }

    // INVARIANT: Never restart below an id that already has a journal.
    fn seed(&self, git: &GitRepository) -> Result<u64> {
        let mut highest = 0;
        for bucket in self.layout.bucket_refs(git).map_err(unavailable)? {
            let Some(tip) = git.ref_target(&bucket).map_err(unavailable)? else {
                continue;
            };
            let tree = git.commit_tree(tip).map_err(unavailable)?;
            for item in git.list_tree(tree).map_err(unavailable)? {
                if let Ok(id) = item.name.parse::<u64>() {
                    highest = highest.max(id);
                }
            }
        }

        debug!("seeding ticket counter at {highest}");
        Ok(highest)
    }
}

impl TicketIdAllocator for RefCounterAllocator {
    #[instrument(skip(self, repo, deadline), fields(repo = %repo.name), level = "debug")]
    fn allocate(&self, repo: &RepositoryHandle, deadline: &Deadline) -> Result<TicketId> {
        let git = open(repo)?;
        let counter = self.layout.counter_ref();

        for attempt in self.policy.attempts() {
            deadline.check()?;
            let tip = git.ref_target(&counter).map_err(unavailable)?;
            let next = self.read_counter(&git, tip)? + 1;

            let blob = git.write_blob(next.to_string().as_bytes()).map_err(unavailable)?;
            let tree = git
                .insert_blob(None, Self::COUNTER_BLOB, blob)
                .map_err(unavailable)?;
            let message = format!("allocate ticket {next}");
            let commit = git
                .create_commit(tree, tip, "ticketry", &message)
                .map_err(unavailable)?;

            deadline.check()?;
            if git
                .compare_and_swap_ref(&counter, tip, commit, &message)
                .map_err(unavailable)?
            {
                return TicketId::new(next).ok_or_else(|| AllocatorError::Unavailable {
                    reason: "counter overflowed".into(),
                });
            }

            debug!("lost counter race on attempt {attempt}");
            self.policy.pause(attempt, deadline)?;
        }

        warn!("ticket counter of {} stayed contended", repo.name);
        Err(AllocatorError::Contended {
            repository: repo.name.clone(),
            attempts: self.policy.max_attempts.max(1),
        })
    }
}

fn open(repo: &RepositoryHandle) -> Result<GitRepository> {
    GitRepository::open(&repo.path).map_err(unavailable)
}

fn unavailable(error: impl std::fmt::Display) -> AllocatorError {
    AllocatorError::Unavailable {
        reason: error.to_string(),
    }
}

/// Counter kept under a key in the external store.
#[derive(Clone)]
pub struct StoreCounterAllocator {
    client: Arc<dyn StoreClient>,
    keys: StoreKeys,
}

impl StoreCounterAllocator {
    pub fn new(client: Arc<dyn StoreClient>, keys: StoreKeys) -> Self {
        Self { client, keys }
    }
}

impl std::fmt::Debug for StoreCounterAllocator {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("StoreCounterAllocator")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl TicketIdAllocator for StoreCounterAllocator {
    #[instrument(skip(self, repo, deadline), fields(repo = %repo.name), level = "debug")]
    fn allocate(&self, repo: &RepositoryHandle, deadline: &Deadline) -> Result<TicketId> {
        let key = self.keys.counter(repo);
        let next = self
            .client
            .increment(&key, deadline.remaining()?)
            .map_err(AllocatorError::from)?;
        let id = TicketId::new(next).ok_or_else(|| AllocatorError::Unavailable {
            reason: format!("counter {key:?} returned zero"),
        })?;

        self.client
            .append(&self.keys.ids(repo), id.to_string().into_bytes(), deadline.remaining()?)
            .map_err(AllocatorError::from)?;

        Ok(id)
    }
}

/// All possible error types for id allocation.
#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    /// Durable counter cannot be reached or read.
    #[error("id counter unavailable: {reason}")]
    Unavailable { reason: String },

    /// Concurrent allocations kept winning.
    #[error("id counter of {repository} contended for {attempts} attempts")]
    Contended { repository: String, attempts: u32 },

    /// Deadline passed.
    #[error("id allocation timed out after {after:?}")]
    Timeout { after: Duration },
}

impl From<StoreError> for AllocatorError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Timeout { after } => Self::Timeout { after },
            other => Self::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

impl From<TicketError> for AllocatorError {
    fn from(error: TicketError) -> Self {
        match error {
            TicketError::Timeout { after } => Self::Timeout { after },
            other => Self::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = AllocatorError> = std::result::Result<T, E>;
