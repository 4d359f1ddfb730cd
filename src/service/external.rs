// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External store ticket journal.
//!
//! Journals live in an external key/value store whose values are ordered
//! lists of byte strings. Each ticket owns one list, and every journal entry
//! is pushed onto it with the store's atomic append. The store serializes
//! concurrent appends to the same key, so there is nothing to retry: one
//! append either lands or fails.
//!
//! # Key Layout
//!
//! All keys of a repository share the repository key, which is its relative
//! name without any ".git" suffix. An optional prefix goes in front of every
//! key, so several deployments can share one store:
//!
//! | Key                                            | Value                            |
//! |------------------------------------------------|----------------------------------|
//! | `<repo>::ticket::<id>::journal`                | JSON journal entries, in order   |
//! | `<repo>::ticket::<id>::seq`                    | per-ticket sequence counter      |
//! | `<repo>::ticket::<id>::attachment::<digest>`   | attachment content               |
//! | `<repo>::ticket::ids`                          | index of allocated ticket ids    |
//! | `<repo>::counter::ticket`                      | id counter                       |
//!
//! Discarding all tickets removes the whole `<repo>::ticket::` namespace.
//! The id counter sits outside of it, so ids are never reused.
//!
//! Attachment content is keyed by its digest, and only reachable through
//! an [`AttachmentRef`](crate::ticket::AttachmentRef) recorded in the
//! journal. Content stored by an update whose entry never landed stays
//! unreachable.

use crate::{
    allocator::{StoreCounterAllocator, TicketIdAllocator},
    config::TicketSettings,
    git::RepositoryHandle,
    service::{
        check_attachment_name, check_comment_edits, fold_live, Deadline, EventFeed, Result,
        RetryPolicy, TicketError, TicketEvent, TicketService,
    },
    ticket::{
        next_stamp, FieldPatch, JournalEntry, NewTicket, Ticket, TicketFilter, TicketId,
        TicketPatch,
    },
};

use chrono::Utc;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

/// Client of an external ordered-list key/value store.
///
/// Every call is bounded by `timeout`. Implementations must fail with
/// [`StoreError::Timeout`] instead of blocking past it.
pub trait StoreClient: Send + Sync {
    /// Read full list stored under key, or `None` if key is absent.
    fn get(&self, key: &str, timeout: Duration) -> Result<Option<Vec<Vec<u8>>>, StoreError>;

    /// Atomically push value onto list under key, creating it if needed.
    ///
    /// Returns `false` if the store refused the write.
    fn append(&self, key: &str, value: Vec<u8>, timeout: Duration) -> Result<bool, StoreError>;

    /// Atomically increment counter under key, returning new value.
    ///
    /// Absent counters start at zero, so the first call returns one.
    fn increment(&self, key: &str, timeout: Duration) -> Result<u64, StoreError>;

    /// Remove every key starting with prefix, returning count removed.
    fn delete_namespace(&self, prefix: &str, timeout: Duration) -> Result<usize, StoreError>;

    /// Atomically move every key starting with `from` over to `to`.
    ///
    /// Returns `false` without moving anything if a key already starts with
    /// `to`.
    fn rename_namespace(&self, from: &str, to: &str, timeout: Duration) -> Result<bool, StoreError>;
}

/// Key naming for external store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreKeys {
    prefix: String,
}

impl StoreKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Prefix shared by every key of repository, counter included.
    pub fn repository(&self, repo: &RepositoryHandle) -> String {
        format!("{}{}::", self.prefix, repo.key())
    }

    /// Namespace holding every ticket key of repository.
    pub fn namespace(&self, repo: &RepositoryHandle) -> String {
        format!("{}ticket::", self.repository(repo))
    }

    pub fn journal(&self, repo: &RepositoryHandle, id: TicketId) -> String {
        format!("{}{id}::journal", self.namespace(repo))
    }

    pub fn seq(&self, repo: &RepositoryHandle, id: TicketId) -> String {
        format!("{}{id}::seq", self.namespace(repo))
    }

    pub fn attachment(&self, repo: &RepositoryHandle, id: TicketId, digest: &str) -> String {
        format!("{}{id}::attachment::{digest}", self.namespace(repo))
    }

    pub fn ids(&self, repo: &RepositoryHandle) -> String {
        format!("{}ids", self.namespace(repo))
    }

    pub fn counter(&self, repo: &RepositoryHandle) -> String {
        format!("{}counter::ticket", self.repository(repo))
    }
}

/// Ticket service that keeps journals in an external store.
pub struct ExternalTicketService {
    client: Arc<dyn StoreClient>,
    keys: StoreKeys,
    policy: RetryPolicy,
    allocator: Arc<dyn TicketIdAllocator>,
    events: EventFeed,
}

impl ExternalTicketService {
    /// Construct external backend with a store counter allocator.
    pub fn new(client: Arc<dyn StoreClient>, settings: &TicketSettings) -> Self {
        let keys = StoreKeys::new(settings.key_prefix.as_str());
        let allocator = Arc::new(StoreCounterAllocator::new(client.clone(), keys.clone()));

        Self {
            client,
            keys,
            policy: RetryPolicy::from(settings),
            allocator,
            events: EventFeed::new(),
        }
    }

    pub fn keys(&self) -> &StoreKeys {
        &self.keys
    }

    /// Decode ticket journal in store order.
    fn read_entries(
        &self,
        repo: &RepositoryHandle,
        id: TicketId,
        deadline: &Deadline,
    ) -> Result<Vec<JournalEntry>> {
        let key = self.keys.journal(repo, id);
        let Some(values) = self.client.get(&key, deadline.remaining()?)? else {
            return Ok(Vec::new());
        };

        values
            .iter()
            .enumerate()
            .map(|(index, value)| {
                let location = format!("{key}[{index}]");
                let text = std::str::from_utf8(value).map_err(|error| TicketError::Malformed {
                    location: location.clone(),
                    reason: error.to_string(),
                })?;
                JournalEntry::from_json(text).map_err(|error| TicketError::Malformed {
                    location,
                    reason: error.to_string(),
                })
            })
            .collect()
    }

    /// Ids recorded in the allocation index.
    fn indexed_ids(&self, repo: &RepositoryHandle, deadline: &Deadline) -> Result<BTreeSet<TicketId>> {
        let key = self.keys.ids(repo);
        let values = self
            .client
            .get(&key, deadline.remaining()?)?
            .unwrap_or_default();

        values
            .iter()
            .map(|value| {
                std::str::from_utf8(value)
                    .ok()
                    .and_then(|text| text.parse::<TicketId>().ok())
                    .ok_or_else(|| TicketError::Malformed {
                        location: key.clone(),
                        reason: format!("bad ticket id {:?}", String::from_utf8_lossy(value)),
                    })
            })
            .collect()
    }

    #[instrument(skip(self, repo, patch, deadline), fields(repo = %repo.name), level = "debug")]
    fn append(
        &self,
        repo: &RepositoryHandle,
        id: TicketId,
        patch: &TicketPatch,
        author: &str,
        comment: Option<&str>,
        fresh: bool,
        deadline: &Deadline,
    ) -> Result<(JournalEntry, Ticket)> {
        for attachment in &patch.attachments {
            check_attachment_name(&attachment.name)?;
        }

        let mut entries = self.read_entries(repo, id, deadline)?;
        if fresh && !entries.is_empty() {
            return Err(TicketError::AllocationConflict {
                repository: repo.name.clone(),
                attempts: 1,
            });
        }
        if !fresh {
            let current = fold_live(&repo.name, id, &entries)?;
            check_comment_edits(&current, &patch.patches)?;
        }

        let mut patches = patch.patches.clone();
        for attachment in &patch.attachments {
            let reference = attachment.to_ref()?;
            let key = self.keys.attachment(repo, id, &reference.digest);
            if self.client.get(&key, deadline.remaining()?)?.is_none() {
                self.store_append(&key, attachment.content.clone(), deadline)?;
            }
            patches.push(FieldPatch::Attach(reference));
        }

        let seq = self
            .client
            .increment(&self.keys.seq(repo, id), deadline.remaining()?)?;
        let (_, timestamp) = next_stamp(entries.last(), Utc::now());
        let entry = JournalEntry {
            ticket: id,
            seq,
            author: author.into(),
            timestamp,
            patches,
            comment: comment.map(Into::into),
        };
        self.store_append(
            &self.keys.journal(repo, id),
            entry.to_json()?.into_bytes(),
            deadline,
        )?;

        // INVARIANT: Fold what the store now holds, since concurrent appends
        // may have landed ahead of ours.
        let entries = match self.read_entries(repo, id, deadline) {
            Ok(current) => current,
            Err(error) => {
                warn!("cannot re-read {}#{id} after append: {error}", repo.name);
                entries.push(entry.clone());
                entries
            }
        };
        let ticket = Ticket::fold(&repo.name, &entries).ok_or_else(|| TicketError::TicketNotFound {
            repository: repo.name.clone(),
            id,
        })?;
        self.events.publish(TicketEvent {
            repository: repo.name.clone(),
            id,
            entry: entry.clone(),
            ticket: ticket.clone(),
        });

        Ok((entry, ticket))
    }

    fn store_append(&self, key: &str, value: Vec<u8>, deadline: &Deadline) -> Result<()> {
        if !self.client.append(key, value, deadline.remaining()?)? {
            return Err(StoreError::Rejected { key: key.into() }.into());
        }

        Ok(())
    }
}

impl TicketService for ExternalTicketService {
    #[instrument(skip(self, repo, initial), fields(repo = %repo.name), level = "debug")]
    fn create(&self, repo: &RepositoryHandle, initial: NewTicket, author: &str) -> Result<Ticket> {
        let deadline = self.policy.deadline();
        let patch = initial.into_patch();

        for attempt in self.policy.attempts() {
            let id = self.allocator.allocate(repo, &deadline)?;
            match self.append(repo, id, &patch, author, None, true, &deadline) {
                Ok((_, ticket)) => {
                    info!("created ticket {}#{id}", repo.name);
                    return Ok(ticket);
                }
                Err(TicketError::AllocationConflict { .. }) => {
                    warn!("ticket id {id} already taken in {}, reallocating", repo.name);
                    self.policy.pause(attempt, &deadline)?;
                }
                Err(error) => return Err(error),
            }
        }

        Err(TicketError::AllocationConflict {
            repository: repo.name.clone(),
            attempts: self.policy.max_attempts.max(1),
        })
    }

    fn get(&self, repo: &RepositoryHandle, id: TicketId) -> Result<Ticket> {
        let entries = self.read_entries(repo, id, &self.policy.deadline())?;
        fold_live(&repo.name, id, &entries)
    }

    fn update(
        &self,
        repo: &RepositoryHandle,
        id: TicketId,
        patch: TicketPatch,
        author: &str,
        comment: Option<&str>,
    ) -> Result<Ticket> {
        let deadline = self.policy.deadline();
        let (_, ticket) = self.append(repo, id, &patch, author, comment, false, &deadline)?;
        Ok(ticket)
    }

    fn list(&self, repo: &RepositoryHandle, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        let deadline = self.policy.deadline();
        let mut tickets = Vec::new();
        for id in self.indexed_ids(repo, &deadline)? {
            let entries = self.read_entries(repo, id, &deadline)?;
            if let Some(ticket) = Ticket::fold(&repo.name, &entries) {
                tickets.push(ticket);
            }
        }

        Ok(filter.apply(tickets))
    }

    fn delete_all(&self, repo: &RepositoryHandle) -> Result<usize> {
        let deadline = self.policy.deadline();
        let discarded = self.ids(repo)?.len();
        let removed = self
            .client
            .delete_namespace(&self.keys.namespace(repo), deadline.remaining()?)?;
        warn!(
            "discarded {discarded} ticket journals of {} ({removed} keys)",
            repo.name
        );

        Ok(discarded)
    }

    fn delete(&self, repo: &RepositoryHandle, id: TicketId, author: &str) -> Result<()> {
        let deadline = self.policy.deadline();
        let patch = TicketPatch {
            patches: vec![FieldPatch::Deleted],
            attachments: Vec::new(),
        };
        self.append(repo, id, &patch, author, None, false, &deadline)?;
        info!("deleted ticket {}#{id}", repo.name);

        Ok(())
    }

    fn journal(&self, repo: &RepositoryHandle, id: TicketId) -> Result<Vec<JournalEntry>> {
        let entries = self.read_entries(repo, id, &self.policy.deadline())?;
        if entries.is_empty() {
            return Err(TicketError::TicketNotFound {
                repository: repo.name.clone(),
                id,
            });
        }

        Ok(entries)
    }

    fn ids(&self, repo: &RepositoryHandle) -> Result<Vec<TicketId>> {
        let deadline = self.policy.deadline();
        let mut ids = Vec::new();
        // INVARIANT: Index may list ids whose create never landed.
        for id in self.indexed_ids(repo, &deadline)? {
            let key = self.keys.journal(repo, id);
            if self.client.get(&key, deadline.remaining()?)?.is_some() {
                ids.push(id);
            }
        }

        Ok(ids)
    }

    fn attachment(&self, repo: &RepositoryHandle, id: TicketId, name: &str) -> Result<Vec<u8>> {
        check_attachment_name(name)?;
        let deadline = self.policy.deadline();
        let missing = || TicketError::AttachmentNotFound {
            id,
            name: name.into(),
        };

        // INVARIANT: Only content recorded by a landed entry is reachable.
        let entries = self.read_entries(repo, id, &deadline)?;
        let digest = Ticket::fold(&repo.name, &entries)
            .and_then(|ticket| ticket.attachments.get(name).map(|found| found.digest.clone()))
            .ok_or_else(missing)?;

        let key = self.keys.attachment(repo, id, &digest);
        self.client
            .get(&key, deadline.remaining()?)?
            .and_then(|mut values| values.pop())
            .ok_or_else(missing)
    }

    fn subscribe(&self) -> broadcast::Receiver<TicketEvent> {
        self.events.subscribe()
    }

    #[instrument(skip(self, old, new), fields(old = %old.name, new = %new.name), level = "debug")]
    fn rename(&self, old: &RepositoryHandle, new: &RepositoryHandle) -> Result<bool> {
        let (from, to) = (self.keys.repository(old), self.keys.repository(new));
        if from == to {
            return Ok(true);
        }

        let deadline = self.policy.deadline();
        let moved = self.client.rename_namespace(&from, &to, deadline.remaining()?)?;
        if moved {
            info!("moved tickets of {} over to {}", old.name, new.name);
        } else {
            warn!("cannot move tickets of {}, {} already has some", old.name, new.name);
        }

        Ok(moved)
    }
}

/// In-process store client.
///
/// Holds everything in memory behind a single lock. Useful for tests and
/// single-node setups. Availability can be toggled to simulate an outage.
#[derive(Debug)]
pub struct MemoryStore {
    data: Mutex<BTreeMap<String, Vec<Vec<u8>>>>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Every key currently stored, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.data.lock().keys().cloned().collect()
    }

    fn with_data<T>(
        &self,
        timeout: Duration,
        action: impl FnOnce(&mut BTreeMap<String, Vec<Vec<u8>>>) -> T,
    ) -> Result<T, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                reason: "memory store switched off".into(),
            });
        }

        let mut data = self
            .data
            .try_lock_for(timeout)
            .ok_or(StoreError::Timeout { after: timeout })?;
        Ok(action(&mut *data))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreClient for MemoryStore {
    fn get(&self, key: &str, timeout: Duration) -> Result<Option<Vec<Vec<u8>>>, StoreError> {
        self.with_data(timeout, |data| data.get(key).cloned())
    }

    fn append(&self, key: &str, value: Vec<u8>, timeout: Duration) -> Result<bool, StoreError> {
        self.with_data(timeout, |data| {
            data.entry(key.to_string()).or_default().push(value);
            true
        })
    }

    fn increment(&self, key: &str, timeout: Duration) -> Result<u64, StoreError> {
        self.with_data(timeout, |data| {
            let slot = data.entry(key.to_string()).or_default();
            let current = slot
                .last()
                .and_then(|value| std::str::from_utf8(value).ok())
                .and_then(|text| text.parse::<u64>().ok())
                .unwrap_or(0);
            let next = current + 1;
            *slot = vec![next.to_string().into_bytes()];
            next
        })
    }

    fn delete_namespace(&self, prefix: &str, timeout: Duration) -> Result<usize, StoreError> {
        self.with_data(timeout, |data| {
            let before = data.len();
            data.retain(|key, _| !key.starts_with(prefix));
            before - data.len()
        })
    }

    fn rename_namespace(&self, from: &str, to: &str, timeout: Duration) -> Result<bool, StoreError> {
        self.with_data(timeout, |data| {
            if data.keys().any(|key| key.starts_with(to)) {
                return false;
            }

            let moved = data
                .keys()
                .filter(|key| key.starts_with(from))
                .cloned()
                .collect::<Vec<_>>();
            for key in moved {
                if let Some(values) = data.remove(&key) {
                    data.insert(format!("{to}{}", &key[from.len()..]), values);
                }
            }
            true
        })
    }
}

/// All possible error types for external store access.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Store did not answer in time.
    #[error("store timed out after {after:?}")]
    Timeout { after: Duration },

    /// Store cannot be reached.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    /// Store refused a write.
    #[error("store rejected write to {key:?}")]
    Rejected { key: String },
}
