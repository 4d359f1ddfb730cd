// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Ticket data model.
//!
//! A __ticket__ is never stored as a record of its own. What gets stored is
//! its __journal__: an append-only sequence of [`JournalEntry`] values, each
//! holding a list of [`FieldPatch`] edits plus an optional comment. The
//! current state of a ticket is the left fold of its journal, computed by
//! [`Ticket::fold`].
//!
//! # Journal Ordering
//!
//! Entries carry a timestamp and a per-ticket sequence number. Replay order
//! is timestamp first, sequence number second, see [`order_entries`]. Writers
//! never stamp an entry earlier than the entry it follows, so replay order
//! always agrees with append order even when clocks drift.
//!
//! # Deletion
//!
//! Deleting a single ticket appends a terminal [`FieldPatch::Deleted`]
//! entry. The journal stays intact, but the folded ticket reports itself as
//! deleted and the ticket service treats it as absent.

pub mod filter;

pub use filter::{TicketFilter, TicketOrder};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

/// Ticket number, unique per repository and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(u64);

impl TicketId {
    /// Construct ticket id, rejecting zero.
    pub fn new(number: u64) -> Option<Self> {
        (number >= 1).then_some(Self(number))
    }

    /// Raw ticket number.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Two digit bucket the ticket is filed under, e.g., ticket 326 lives in
    /// bucket "26".
    pub fn bucket(self) -> String {
        format!("{:02}", self.0 % 100)
    }
}

impl Display for TicketId {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{}", self.0)
    }
}

impl FromStr for TicketId {
    type Err = ParseError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        data.trim_start_matches('#')
            .parse::<u64>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| ParseError::new("ticket id", data))
    }
}

/// Ticket workflow status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    New,
    Open,
    Hold,
    Fixed,
    Wontfix,
    Invalid,
    Duplicate,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Self::New,
        Self::Open,
        Self::Hold,
        Self::Fixed,
        Self::Wontfix,
        Self::Invalid,
        Self::Duplicate,
    ];

    /// Status ends the ticket's workflow.
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            Self::Fixed | Self::Wontfix | Self::Invalid | Self::Duplicate
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Open => "open",
            Self::Hold => "hold",
            Self::Fixed => "fixed",
            Self::Wontfix => "wontfix",
            Self::Invalid => "invalid",
            Self::Duplicate => "duplicate",
        }
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ParseError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let wanted = data.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == wanted)
            .ok_or_else(|| ParseError::new("status", data))
    }
}

/// Kind of work a ticket tracks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketKind {
    #[default]
    Request,
    Task,
    Bug,
    Proposal,
}

impl Display for TicketKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Request => "request",
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Proposal => "proposal",
        };
        fmt.write_str(name)
    }
}

impl FromStr for TicketKind {
    type Err = ParseError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data.trim().to_ascii_lowercase().as_str() {
            "request" => Ok(Self::Request),
            "task" => Ok(Self::Task),
            "bug" => Ok(Self::Bug),
            "proposal" => Ok(Self::Proposal),
            _ => Err(ParseError::new("ticket kind", data)),
        }
    }
}

/// Ticket priority.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl FromStr for Priority {
    type Err = ParseError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            _ => Err(ParseError::new("priority", data)),
        }
    }
}

/// Reference to attachment content stored by a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub name: String,

    /// Git blob id of the content, identical across backends.
    pub digest: String,

    pub size: u64,
}

/// Single field edit recorded in a journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldPatch {
    Title(String),
    Description(String),
    Status(Status),
    Kind(TicketKind),
    Priority(Priority),
    Milestone(Option<String>),
    Responsible(Option<String>),
    Topic(Option<String>),
    Label(String),
    Unlabel(String),
    Watch(String),
    Unwatch(String),
    Attach(AttachmentRef),

    /// Replace text of the comment with that id.
    EditComment { id: u64, text: String },

    /// Retract the comment with that id.
    DeleteComment(u64),

    Deleted,
}

/// One immutable record of a ticket mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub ticket: TicketId,

    /// Per-ticket sequence number, strictly increasing in append order.
    pub seq: u64,

    pub author: String,
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<FieldPatch>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl JournalEntry {
    /// Serialize entry to its stored JSON form.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize entry from its stored JSON form.
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    /// Entry carries the terminal deletion marker.
    pub fn is_deletion(&self) -> bool {
        self.patches.iter().any(|patch| matches!(patch, FieldPatch::Deleted))
    }
}

/// Sort entries into replay order.
pub fn order_entries(entries: &mut [JournalEntry]) {
    entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.seq.cmp(&b.seq)));
}

/// Stamp for the entry that follows `previous`.
///
/// Returns the next sequence number, and a timestamp that never goes
/// backwards relative to the previous entry.
pub fn next_stamp(previous: Option<&JournalEntry>, now: DateTime<Utc>) -> (u64, DateTime<Utc>) {
    match previous {
        Some(last) => (last.seq + 1, now.max(last.timestamp)),
        None => (1, now),
    }
}

/// Comment left on a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    /// Sequence number of the entry that carried the comment. Doubles as the
    /// comment id, since sequence numbers never repeat within a ticket.
    pub seq: u64,

    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,

    /// Last revision of the text, if it was ever edited.
    pub edited_by: Option<String>,
    pub edited_at: Option<DateTime<Utc>>,

    /// Comment was retracted. Its text is gone from the view, but not from
    /// the journal.
    pub deleted: bool,
}

/// Materialized view of a ticket.
///
/// Always derived from the journal, so it is a cache and never a source of
/// truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub repository: String,
    pub id: TicketId,
    pub title: String,
    pub description: String,
    pub status: Status,
    pub kind: TicketKind,
    pub priority: Priority,
    pub milestone: Option<String>,
    pub responsible: Option<String>,
    pub topic: Option<String>,
    pub labels: BTreeSet<String>,
    pub watchers: BTreeSet<String>,
    pub attachments: BTreeMap<String, AttachmentRef>,
    pub comments: Vec<Comment>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,

    /// Number of journal entries folded into this view.
    pub revision: usize,
}

impl Ticket {
    /// Fold journal entries into ticket state.
    ///
    /// Entries are applied in the order given. Callers pass entries in
    /// replay order, see [`order_entries`]. Returns `None` for an empty
    /// journal. Folding is pure: the same entries always yield the same
    /// ticket.
    pub fn fold<'a>(
        repository: impl Into<String>,
        entries: impl IntoIterator<Item = &'a JournalEntry>,
    ) -> Option<Self> {
        let mut entries = entries.into_iter();
        let first = entries.next()?;
        let mut ticket = Self {
            repository: repository.into(),
            id: first.ticket,
            title: String::new(),
            description: String::new(),
            status: Status::New,
            kind: TicketKind::default(),
            priority: Priority::default(),
            milestone: None,
            responsible: None,
            topic: None,
            labels: BTreeSet::new(),
            watchers: BTreeSet::new(),
            attachments: BTreeMap::new(),
            comments: Vec::new(),
            created_by: first.author.clone(),
            created_at: first.timestamp,
            updated_by: first.author.clone(),
            updated_at: first.timestamp,
            deleted: false,
            revision: 0,
        };
        ticket.apply(first);
        for entry in entries {
            ticket.apply(entry);
        }

        Some(ticket)
    }

    /// Apply one entry on top of current state.
    pub fn apply(&mut self, entry: &JournalEntry) {
        for patch in &entry.patches {
            match patch {
                FieldPatch::Title(title) => self.title = title.clone(),
                FieldPatch::Description(text) => self.description = text.clone(),
                FieldPatch::Status(status) => self.status = *status,
                FieldPatch::Kind(kind) => self.kind = *kind,
                FieldPatch::Priority(priority) => self.priority = *priority,
                FieldPatch::Milestone(milestone) => self.milestone = milestone.clone(),
                FieldPatch::Responsible(who) => self.responsible = who.clone(),
                FieldPatch::Topic(topic) => self.topic = topic.clone(),
                FieldPatch::Label(label) => {
                    self.labels.insert(label.clone());
                }
                FieldPatch::Unlabel(label) => {
                    self.labels.remove(label);
                }
                FieldPatch::Watch(who) => {
                    self.watchers.insert(who.clone());
                }
                FieldPatch::Unwatch(who) => {
                    self.watchers.remove(who);
                }
                FieldPatch::Attach(attachment) => {
                    self.attachments
                        .insert(attachment.name.clone(), attachment.clone());
                }
                FieldPatch::EditComment { id, text } => {
                    if let Some(comment) = self.comment_mut(*id) {
                        comment.text = text.clone();
                        comment.edited_by = Some(entry.author.clone());
                        comment.edited_at = Some(entry.timestamp);
                    }
                }
                FieldPatch::DeleteComment(id) => {
                    if let Some(comment) = self.comment_mut(*id) {
                        comment.text.clear();
                        comment.deleted = true;
                    }
                }
                FieldPatch::Deleted => self.deleted = true,
            }
        }

        if let Some(text) = &entry.comment {
            self.comments.push(Comment {
                seq: entry.seq,
                author: entry.author.clone(),
                text: text.clone(),
                timestamp: entry.timestamp,
                edited_by: None,
                edited_at: None,
                deleted: false,
            });
        }

        self.updated_by = entry.author.clone();
        self.updated_at = entry.timestamp;
        self.revision += 1;
    }

    /// Comment with that id, unless it was deleted.
    pub fn comment(&self, id: u64) -> Option<&Comment> {
        self.comments
            .iter()
            .find(|comment| comment.seq == id && !comment.deleted)
    }

    fn comment_mut(&mut self, id: u64) -> Option<&mut Comment> {
        self.comments
            .iter_mut()
            .find(|comment| comment.seq == id && !comment.deleted)
    }

    /// Plain text rendition handed to search indexers.
    pub fn index_text(&self) -> String {
        let mut text = format!("{}\n{}\n", self.title, self.description);
        for comment in self.comments.iter().filter(|comment| !comment.deleted) {
            text.push_str(&comment.text);
            text.push('\n');
        }
        text
    }
}

/// Initial field set of a new ticket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    pub kind: TicketKind,
    pub priority: Priority,
    pub milestone: Option<String>,
    pub responsible: Option<String>,
    pub topic: Option<String>,
    pub labels: BTreeSet<String>,
}

impl NewTicket {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn kind(mut self, kind: TicketKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn milestone(mut self, milestone: impl Into<String>) -> Self {
        self.milestone = Some(milestone.into());
        self
    }

    pub fn responsible(mut self, who: impl Into<String>) -> Self {
        self.responsible = Some(who.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    /// Full field set as a patch, so creation is just the first entry.
    pub fn into_patch(self) -> TicketPatch {
        let mut patch = TicketPatch::new()
            .title(self.title)
            .description(self.description)
            .status(Status::New);
        patch.patches.push(FieldPatch::Kind(self.kind));
        patch.patches.push(FieldPatch::Priority(self.priority));
        if self.milestone.is_some() {
            patch.patches.push(FieldPatch::Milestone(self.milestone));
        }
        if self.responsible.is_some() {
            patch.patches.push(FieldPatch::Responsible(self.responsible));
        }
        if self.topic.is_some() {
            patch.patches.push(FieldPatch::Topic(self.topic));
        }
        for label in self.labels {
            patch.patches.push(FieldPatch::Label(label));
        }

        patch
    }
}

/// Attachment content waiting to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    pub name: String,
    pub content: Vec<u8>,
}

impl NewAttachment {
    /// Reference to content once stored, digest computed the way Git names
    /// blobs.
    pub fn to_ref(&self) -> Result<AttachmentRef, git2::Error> {
        let digest = git2::Oid::hash_object(git2::ObjectType::Blob, &self.content)?;
        Ok(AttachmentRef {
            name: self.name.clone(),
            digest: digest.to_string(),
            size: self.content.len() as u64,
        })
    }
}

/// Field-level patch applied atomically by one journal entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketPatch {
    pub patches: Vec<FieldPatch>,
    pub attachments: Vec<NewAttachment>,
}

impl TicketPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.patches.push(FieldPatch::Title(title.into()));
        self
    }

    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.patches.push(FieldPatch::Description(text.into()));
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.patches.push(FieldPatch::Status(status));
        self
    }

    pub fn kind(mut self, kind: TicketKind) -> Self {
        self.patches.push(FieldPatch::Kind(kind));
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.patches.push(FieldPatch::Priority(priority));
        self
    }

    pub fn milestone(mut self, milestone: Option<String>) -> Self {
        self.patches.push(FieldPatch::Milestone(milestone));
        self
    }

    pub fn responsible(mut self, who: Option<String>) -> Self {
        self.patches.push(FieldPatch::Responsible(who));
        self
    }

    pub fn topic(mut self, topic: Option<String>) -> Self {
        self.patches.push(FieldPatch::Topic(topic));
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.patches.push(FieldPatch::Label(label.into()));
        self
    }

    pub fn unlabel(mut self, label: impl Into<String>) -> Self {
        self.patches.push(FieldPatch::Unlabel(label.into()));
        self
    }

    pub fn watch(mut self, who: impl Into<String>) -> Self {
        self.patches.push(FieldPatch::Watch(who.into()));
        self
    }

    pub fn unwatch(mut self, who: impl Into<String>) -> Self {
        self.patches.push(FieldPatch::Unwatch(who.into()));
        self
    }

    pub fn attach(mut self, name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.attachments.push(NewAttachment {
            name: name.into(),
            content: content.into(),
        });
        self
    }

    pub fn edit_comment(mut self, id: u64, text: impl Into<String>) -> Self {
        self.patches.push(FieldPatch::EditComment {
            id,
            text: text.into(),
        });
        self
    }

    pub fn delete_comment(mut self, id: u64) -> Self {
        self.patches.push(FieldPatch::DeleteComment(id));
        self
    }

    /// Patch changes nothing on its own.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty() && self.attachments.is_empty()
    }
}

/// Text does not name a known value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {what}: {value:?}")]
pub struct ParseError {
    what: &'static str,
    value: String,
}

impl ParseError {
    fn new(what: &'static str, value: impl Into<String>) -> Self {
        Self {
            what,
            value: value.into(),
        }
    }
}
