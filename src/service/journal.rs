// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git-backed ticket journal.
//!
//! Tickets live inside the hosted repository, on refs under a reserved
//! namespace that never collides with code branches (`refs/tickets` by
//! default). Tickets are spread over one hundred __bucket refs__ by the last
//! two digits of their id, so ticket 326 is filed under `refs/tickets/26`.
//!
//! # Tree Layout
//!
//! The tip commit of a bucket ref holds the complete journal of every
//! ticket in that bucket:
//!
//! ```text
//! 326/
//!     journal/
//!         00000001.json
//!         00000002.json
//!     attachments/
//!         trace.log
//! 426/
//!     journal/
//!         00000001.json
//! ```
//!
//! Each journal entry is its own blob. Appending adds a blob next to the
//! existing ones and never rewrites them, so the tip tree always carries the
//! full entry sequence. Commit history of the bucket ref doubles as an audit
//! trail of every append.
//!
//! # Appending
//!
//! An append is an optimistic compare-and-swap on the bucket ref:
//!
//! 1. Read current tip, and fold the ticket's entries from it.
//! 2. Write the new entry blob, splice it into the tip tree, and commit the
//!    result on top of the tip.
//! 3. Advance the ref only if it still points at the tip read in step one.
//!
//! Losing the swap means another writer appended first. The whole cycle
//! reruns against the fresh tip, up to the configured attempt bound, and
//! surfaces [`TicketError::Conflict`] after that. Writers to different
//! buckets never contend with each other.

use crate::{
    allocator::{RefCounterAllocator, TicketIdAllocator},
    config::TicketSettings,
    git::{GitError, GitRepository, ObjectKind, RepositoryHandle},
    service::{
        check_attachment_name, check_comment_edits, fold_live, Deadline, EventFeed, Result,
        RetryPolicy, TicketError, TicketEvent, TicketService,
    },
    ticket::{
        next_stamp, order_entries, FieldPatch, JournalEntry, NewTicket, Ticket, TicketFilter,
        TicketId, TicketPatch,
    },
};

use chrono::Utc;
use git2::Oid;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

/// Ref and path naming inside the ticket namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefLayout {
    namespace: String,
}

impl RefLayout {
    pub const DEFAULT_NAMESPACE: &'static str = "refs/tickets";

    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Bucket ref holding journal of ticket.
    pub fn bucket_ref(&self, id: TicketId) -> String {
        format!("{}/{}", self.namespace, id.bucket())
    }

    /// Ref holding the id counter.
    pub fn counter_ref(&self) -> String {
        format!("{}/ids", self.namespace)
    }

    /// Every existing bucket ref, sorted.
    pub fn bucket_refs(&self, git: &GitRepository) -> crate::git::Result<Vec<String>> {
        let prefix = format!("{}/", self.namespace);
        let names = git
            .ref_names(&format!("{prefix}*"))?
            .into_iter()
            .filter(|name| {
                name.strip_prefix(&prefix).is_some_and(|bucket| {
                    bucket.len() == 2 && bucket.bytes().all(|b| b.is_ascii_digit())
                })
            })
            .collect();

        Ok(names)
    }

    pub fn journal_dir(&self, id: TicketId) -> String {
        format!("{id}/journal")
    }

    pub fn entry_path(&self, id: TicketId, seq: u64) -> String {
        format!("{id}/journal/{seq:08}.json")
    }

    pub fn attachment_path(&self, id: TicketId, name: &str) -> String {
        format!("{id}/attachments/{name}")
    }
}

impl Default for RefLayout {
    fn default() -> Self {
        Self::new(Self::DEFAULT_NAMESPACE)
    }
}

/// What an append expects to find before writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    /// Ticket must have no journal yet.
    Fresh,

    /// Ticket must exist and be live.
    Live,
}

/// Ticket service that commits journals into the hosted repository.
pub struct JournalTicketService {
    layout: RefLayout,
    policy: RetryPolicy,
    allocator: Arc<dyn TicketIdAllocator>,
    events: EventFeed,
}

impl JournalTicketService {
    /// Construct journal backend with a counter ref allocator.
    pub fn new(settings: &TicketSettings) -> Self {
        let layout = RefLayout::new(settings.ref_namespace.as_str());
        let policy = RetryPolicy::from(settings);
        let allocator = Arc::new(RefCounterAllocator::new(layout.clone(), policy));
        Self::with_allocator(settings, allocator)
    }

    /// Construct journal backend around a custom allocator.
    pub fn with_allocator(settings: &TicketSettings, allocator: Arc<dyn TicketIdAllocator>) -> Self {
        Self {
            layout: RefLayout::new(settings.ref_namespace.as_str()),
            policy: RetryPolicy::from(settings),
            allocator,
            events: EventFeed::new(),
        }
    }

    pub fn layout(&self) -> &RefLayout {
        &self.layout
    }

    fn open(&self, repo: &RepositoryHandle) -> Result<GitRepository> {
        Ok(GitRepository::open(&repo.path)?)
    }

    /// Tip tree of the bucket holding ticket, if the bucket exists.
    fn bucket_tree(&self, git: &GitRepository, id: TicketId) -> Result<Option<(Oid, Oid)>> {
        let Some(tip) = git.ref_target(&self.layout.bucket_ref(id))? else {
            return Ok(None);
        };

        Ok(Some((tip, git.commit_tree(tip)?)))
    }

    /// Read and order every entry of ticket stored in tree.
    fn read_entries(&self, git: &GitRepository, tree: Oid, id: TicketId) -> Result<Vec<JournalEntry>> {
        let dir = self.layout.journal_dir(id);
        let dir = match git.find_path(tree, &dir) {
            Ok(object) if object.kind == ObjectKind::Tree => object,
            Ok(_) | Err(GitError::PathNotFound { .. }) => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let mut entries = Vec::new();
        for item in git.list_tree(dir.id)? {
            let location = format!("{}/{}", self.layout.journal_dir(id), item.name);
            let text = git.read_blob_as_text(item.object.id).map_err(|error| TicketError::Malformed {
                location: location.clone(),
                reason: error.to_string(),
            })?;
            let entry = JournalEntry::from_json(&text).map_err(|error| TicketError::Malformed {
                location: location.clone(),
                reason: error.to_string(),
            })?;
            if entry.ticket != id {
                return Err(TicketError::Malformed {
                    location,
                    reason: format!("entry belongs to ticket {}", entry.ticket),
                });
            }
            entries.push(entry);
        }
        order_entries(&mut entries);

        Ok(entries)
    }

    fn ticket_entries(&self, git: &GitRepository, id: TicketId) -> Result<Vec<JournalEntry>> {
        match self.bucket_tree(git, id)? {
            Some((_, tree)) => self.read_entries(git, tree, id),
            None => Ok(Vec::new()),
        }
    }

    /// Append one entry to ticket journal by compare-and-swap on its bucket.
    ///
    /// Patch is applied against the newest fold on every attempt, so no
    /// concurrent append is ever lost.
    #[instrument(skip(self, repo, patch, deadline), fields(repo = %repo.name), level = "debug")]
    fn append(
        &self,
        repo: &RepositoryHandle,
        id: TicketId,
        patch: &TicketPatch,
        author: &str,
        comment: Option<&str>,
        expect: Expect,
        deadline: &Deadline,
    ) -> Result<(JournalEntry, Ticket)> {
        for attachment in &patch.attachments {
            check_attachment_name(&attachment.name)?;
        }

        let git = self.open(repo)?;
        let bucket = self.layout.bucket_ref(id);
        for attempt in self.policy.attempts() {
            deadline.check()?;
            let tip = git.ref_target(&bucket)?;
            let mut tree = tip.map(|tip| git.commit_tree(tip)).transpose()?;
            let mut entries = match tree {
                Some(tree) => self.read_entries(&git, tree, id)?,
                None => Vec::new(),
            };

            match expect {
                Expect::Fresh if !entries.is_empty() => {
                    return Err(TicketError::AllocationConflict {
                        repository: repo.name.clone(),
                        attempts: attempt,
                    });
                }
                Expect::Live => {
                    let current = fold_live(&repo.name, id, &entries)?;
                    check_comment_edits(&current, &patch.patches)?;
                }
                Expect::Fresh => {}
            }

            let mut patches = patch.patches.clone();
            for attachment in &patch.attachments {
                let blob = git.write_blob(&attachment.content)?;
                let path = self.layout.attachment_path(id, &attachment.name);
                tree = Some(git.insert_blob(tree, &path, blob)?);
                patches.push(FieldPatch::Attach(attachment.to_ref()?));
            }

            let (seq, timestamp) = next_stamp(entries.last(), Utc::now());
            let entry = JournalEntry {
                ticket: id,
                seq,
                author: author.into(),
                timestamp,
                patches,
                comment: comment.map(Into::into),
            };
            let blob = git.write_blob(entry.to_json()?.as_bytes())?;
            let tree = git.insert_blob(tree, &self.layout.entry_path(id, seq), blob)?;
            let message = format!("ticket {id}: entry {seq}");
            let commit = git.create_commit(tree, tip, author, &message)?;

            // INVARIANT: Never swap after deadline, so a timeout leaves no trace.
            deadline.check()?;
            if git.compare_and_swap_ref(&bucket, tip, commit, &message)? {
                entries.push(entry.clone());
                let ticket = Ticket::fold(&repo.name, &entries).ok_or_else(|| {
                    TicketError::TicketNotFound {
                        repository: repo.name.clone(),
                        id,
                    }
                })?;
                self.events.publish(TicketEvent {
                    repository: repo.name.clone(),
                    id,
                    entry: entry.clone(),
                    ticket: ticket.clone(),
                });

                return Ok((entry, ticket));
            }

            debug!("bucket {bucket} moved under us on attempt {attempt}");
            self.policy.pause(attempt, deadline)?;
        }

        warn!("giving up on {}#{id} after sustained contention", repo.name);
        Err(TicketError::Conflict {
            repository: repo.name.clone(),
            id,
            attempts: self.policy.max_attempts.max(1),
        })
    }
}

impl TicketService for JournalTicketService {
    #[instrument(skip(self, repo, initial), fields(repo = %repo.name), level = "debug")]
    fn create(&self, repo: &RepositoryHandle, initial: NewTicket, author: &str) -> Result<Ticket> {
        let deadline = self.policy.deadline();
        let patch = initial.into_patch();

        for attempt in self.policy.attempts() {
            let id = self.allocator.allocate(repo, &deadline)?;
            match self.append(repo, id, &patch, author, None, Expect::Fresh, &deadline) {
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
        self.policy.deadline().check()?;
        let git = self.open(repo)?;
        let entries = self.ticket_entries(&git, id)?;
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
        let (_, ticket) = self.append(repo, id, &patch, author, comment, Expect::Live, &deadline)?;
        Ok(ticket)
    }

    #[instrument(skip(self, repo, filter), fields(repo = %repo.name), level = "debug")]
    fn list(&self, repo: &RepositoryHandle, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        let deadline = self.policy.deadline();
        let git = self.open(repo)?;

        let mut tickets = Vec::new();
        for bucket in self.layout.bucket_refs(&git)? {
            deadline.check()?;
            let Some(tip) = git.ref_target(&bucket)? else {
                continue;
            };
            let tree = git.commit_tree(tip)?;
            for id in ticket_dirs(&git, tree)? {
                let entries = self.read_entries(&git, tree, id)?;
                if let Some(ticket) = Ticket::fold(&repo.name, &entries) {
                    tickets.push(ticket);
                }
            }
        }

        Ok(filter.apply(tickets))
    }

    fn delete_all(&self, repo: &RepositoryHandle) -> Result<usize> {
        self.policy.deadline().check()?;
        let git = self.open(repo)?;
        let buckets = self.layout.bucket_refs(&git)?;

        let mut discarded = 0;
        for bucket in &buckets {
            if let Some(tip) = git.ref_target(bucket)? {
                discarded += ticket_dirs(&git, git.commit_tree(tip)?)?.len();
            }
        }
        git.delete_refs(&buckets)?;
        warn!("discarded {discarded} ticket journals of {}", repo.name);

        Ok(discarded)
    }

    fn delete(&self, repo: &RepositoryHandle, id: TicketId, author: &str) -> Result<()> {
        let deadline = self.policy.deadline();
        let patch = TicketPatch {
            patches: vec![FieldPatch::Deleted],
            attachments: Vec::new(),
        };
        self.append(repo, id, &patch, author, None, Expect::Live, &deadline)?;
        info!("deleted ticket {}#{id}", repo.name);

        Ok(())
    }

    fn journal(&self, repo: &RepositoryHandle, id: TicketId) -> Result<Vec<JournalEntry>> {
        self.policy.deadline().check()?;
        let git = self.open(repo)?;
        let entries = self.ticket_entries(&git, id)?;
        if entries.is_empty() {
            return Err(TicketError::TicketNotFound {
                repository: repo.name.clone(),
                id,
            });
        }

        Ok(entries)
    }

    fn ids(&self, repo: &RepositoryHandle) -> Result<Vec<TicketId>> {
        self.policy.deadline().check()?;
        let git = self.open(repo)?;

        let mut ids = Vec::new();
        for bucket in self.layout.bucket_refs(&git)? {
            if let Some(tip) = git.ref_target(&bucket)? {
                ids.extend(ticket_dirs(&git, git.commit_tree(tip)?)?);
            }
        }
        ids.sort();

        Ok(ids)
    }

    fn attachment(&self, repo: &RepositoryHandle, id: TicketId, name: &str) -> Result<Vec<u8>> {
        check_attachment_name(name)?;
        self.policy.deadline().check()?;
        let git = self.open(repo)?;
        let missing = || TicketError::AttachmentNotFound {
            id,
            name: name.into(),
        };

        let Some((_, tree)) = self.bucket_tree(&git, id)? else {
            return Err(missing());
        };
        match git.find_path(tree, &self.layout.attachment_path(id, name)) {
            Ok(object) if object.kind == ObjectKind::Blob => Ok(git.read_blob(object.id)?),
            Ok(_) | Err(GitError::PathNotFound { .. }) => Err(missing()),
            Err(error) => Err(error.into()),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TicketEvent> {
        self.events.subscribe()
    }

    /// Journals live inside the repository, so they move along with it.
    fn rename(&self, old: &RepositoryHandle, new: &RepositoryHandle) -> Result<bool> {
        self.open(new)?;
        debug!("tickets of {} moved along to {}", old.name, new.name);

        Ok(true)
    }
}

/// Ticket ids with a directory at top level of bucket tree.
fn ticket_dirs(git: &GitRepository, tree: Oid) -> Result<Vec<TicketId>> {
    let ids = git
        .list_tree(tree)?
        .into_iter()
        .filter(|item| item.object.kind == ObjectKind::Tree)
        .filter_map(|item| item.name.parse::<u64>().ok().and_then(TicketId::new))
        .collect::<Vec<_>>();

    Ok(ids)
}
