// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Commit diffs.
//!
//! Diffs are computed on demand against a commit's first parent, or against
//! the empty tree for root commits. They are never persisted.

use crate::git::{GitRepository, Result};

use git2::{Delta, DiffFindOptions, DiffOptions, Oid, Patch};
use std::fmt::{Display, Formatter, Result as FmtResult};
use tracing::instrument;

/// Kind of change recorded for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed,
    Copied,
}

impl Display for ChangeKind {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let tag = match self {
            Self::Added => "A",
            Self::Modified => "M",
            Self::Deleted => "D",
            Self::Renamed => "R",
            Self::Copied => "C",
        };
        fmt.write_str(tag)
    }
}

/// Change to a single path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathChange {
    /// Path after the change, or the removed path for deletions.
    pub path: String,

    /// Source path for renames and copies.
    pub old_path: Option<String>,

    pub kind: ChangeKind,

    /// Blob before the change, `None` for additions.
    pub old_id: Option<Oid>,

    /// Blob after the change, `None` for deletions.
    pub new_id: Option<Oid>,

    pub insertions: usize,
    pub deletions: usize,

    /// Unified patch text, `None` for binary content.
    pub patch: Option<String>,
}

/// Diff of a commit relative to its primary parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitDiff {
    pub commit: Oid,
    pub parent: Option<Oid>,

    /// Changes sorted lexicographically by path.
    pub changes: Vec<PathChange>,
}

impl GitRepository {
    /// Diff commit against its first parent.
    ///
    /// Root commits diff against the empty tree, so every path shows up as
    /// [`ChangeKind::Added`]. Renames and copies are detected.
    #[instrument(skip(self), level = "debug")]
    pub fn diff_commit(&self, commit: Oid, context_lines: u32) -> Result<CommitDiff> {
        let repo = self.raw();
        let commit = repo.find_commit(commit)?;
        let tree = commit.tree()?;
        let parent = commit.parents().next();
        let parent_tree = parent.as_ref().map(|p| p.tree()).transpose()?;

        let mut opts = DiffOptions::new();
        opts.context_lines(context_lines);
        let mut diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), Some(&mut opts))?;

        let mut find = DiffFindOptions::new();
        find.renames(true).copies(true);
        diff.find_similar(Some(&mut find))?;

        let mut changes = Vec::new();
        for (idx, delta) in diff.deltas().enumerate() {
            let kind = match delta.status() {
                Delta::Added => ChangeKind::Added,
                Delta::Deleted => ChangeKind::Deleted,
                Delta::Modified | Delta::Typechange => ChangeKind::Modified,
                Delta::Renamed => ChangeKind::Renamed,
                Delta::Copied => ChangeKind::Copied,
                _ => continue,
            };

            let old_path = delta.old_file().path().map(|p| p.to_string_lossy().into_owned());
            let new_path = delta.new_file().path().map(|p| p.to_string_lossy().into_owned());
            let path = match kind {
                ChangeKind::Deleted => old_path.clone(),
                _ => new_path.clone(),
            }
            .unwrap_or_default();
            let old_path = match kind {
                ChangeKind::Renamed | ChangeKind::Copied => old_path,
                _ => None,
            };

            let old_id = Some(delta.old_file().id()).filter(|id| !id.is_zero());
            let new_id = Some(delta.new_file().id()).filter(|id| !id.is_zero());

            let (mut insertions, mut deletions, mut patch_text) = (0, 0, None);
            if let Some(mut patch) = Patch::from_diff(&diff, idx)? {
                if !patch.delta().flags().is_binary() {
                    let (_, added, removed) = patch.line_stats()?;
                    insertions = added;
                    deletions = removed;
                    patch_text = Some(String::from_utf8_lossy(&patch.to_buf()?).into_owned());
                }
            }

            changes.push(PathChange {
                path,
                old_path,
                kind,
                old_id,
                new_id,
                insertions,
                deletions,
                patch: patch_text,
            });
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path).then(a.kind.cmp(&b.kind)));

        Ok(CommitDiff {
            commit: commit.id(),
            parent: parent.map(|p| p.id()),
            changes,
        })
    }
}
