// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git object access.
//!
//! Thin layer over libgit2 that exposes exactly the primitives the ticket
//! subsystem needs from a hosted repository: resolve refs to commits, descend
//! trees by path, read blobs, and compute commit diffs. The write side is
//! equally small: write a blob, splice it into a tree, create a commit, and
//! move a ref with compare-and-swap semantics.
//!
//! # Concurrency
//!
//! Object reads never need locking, because the object database is
//! immutable and content addressed. A [`GitRepository`] wraps a
//! [`git2::Repository`] which is `Send` but not `Sync`. Callers that work
//! from many threads open their own handle per operation, which is cheap.
//!
//! # Refs As Atomic Pointers
//!
//! The only mutable state in a repository is its refs. The
//! [`compare_and_swap_ref`](GitRepository::compare_and_swap_ref) primitive
//! advances a ref only if it still points where the caller last saw it. This
//! is the single point of write contention the ticket journal relies upon.

pub mod diff;
pub mod discover;

pub use diff::{ChangeKind, CommitDiff, PathChange};
pub use discover::{is_repository, DiscoveryOptions, Repositories, RepositoryHandle, RepositoryScan};

use chrono::{DateTime, Utc};
use git2::{BranchType, ErrorCode, FileMode, ObjectType, Oid, Repository, Signature, Tree};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Email attached to every signature this crate writes.
pub const AGENT_EMAIL: &str = "ticketry@localhost";

/// Opened repository handle.
pub struct GitRepository {
    repo: Repository,
}

impl std::fmt::Debug for GitRepository {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("GitRepository")
            .field("path", &self.repo.path())
            .finish()
    }
}

impl GitRepository {
    /// Open repository at target path.
    ///
    /// Works for both bare and non-bare layouts.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::NotARepository`] if nothing resembling a
    ///   repository lives at target path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let repo = Repository::open(path.as_ref()).map_err(|err| match err.code() {
            ErrorCode::NotFound => GitError::NotARepository {
                path: path.as_ref().to_path_buf(),
            },
            _ => GitError::Git2(err),
        })?;

        Ok(Self { repo })
    }

    /// Borrow underlying libgit2 repository.
    pub fn raw(&self) -> &Repository {
        &self.repo
    }

    /// Resolve a symbolic or direct ref name to the commit it points at.
    ///
    /// Accepts anything rev-parse accepts: "HEAD", short branch names, full
    /// ref names, or object ids.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::RefNotFound`] if name does not resolve to a
    ///   commit.
    pub fn resolve_ref(&self, name: &str) -> Result<CommitInfo> {
        let commit = self
            .repo
            .revparse_single(name)
            .and_then(|object| object.peel_to_commit())
            .map_err(|err| match err.code() {
                ErrorCode::NotFound | ErrorCode::UnbornBranch | ErrorCode::InvalidSpec => {
                    GitError::RefNotFound { name: name.into() }
                }
                _ => GitError::Git2(err),
            })?;

        CommitInfo::from_commit(&commit)
    }

    /// Lookup commit by id.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::Git2`] if commit cannot be found.
    pub fn commit(&self, id: Oid) -> Result<CommitInfo> {
        CommitInfo::from_commit(&self.repo.find_commit(id)?)
    }

    /// Current target of a direct ref, or `None` if the ref does not exist.
    pub fn ref_target(&self, name: &str) -> Result<Option<Oid>> {
        match self.repo.refname_to_id(name) {
            Ok(oid) => Ok(Some(oid)),
            Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
            Err(err) => Err(GitError::Git2(err)),
        }
    }

    /// List full names of refs matching glob pattern.
    pub fn ref_names(&self, glob: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for reference in self.repo.references_glob(glob)? {
            if let Some(name) = reference?.name() {
                names.push(name.to_string());
            }
        }
        names.sort();

        Ok(names)
    }

    /// Timestamp of most recent commit across all local branches.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::EmptyRepository`] if no branch points at a
    ///   commit.
    #[instrument(skip(self), level = "debug")]
    pub fn last_change(&self) -> Result<DateTime<Utc>> {
        let mut newest: Option<DateTime<Utc>> = None;
        for branch in self.repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            let Ok(commit) = branch.get().peel_to_commit() else {
                continue;
            };
            let when = git_time_to_utc(commit.time());
            if newest.is_none_or(|current| when > current) {
                newest = Some(when);
            }
        }

        // INVARIANT: Detached or unborn HEAD still counts when it holds a commit.
        if newest.is_none() {
            if let Ok(commit) = self.repo.head().and_then(|head| head.peel_to_commit()) {
                newest = Some(git_time_to_utc(commit.time()));
            }
        }

        newest.ok_or_else(|| GitError::EmptyRepository {
            path: self.repo.path().to_path_buf(),
        })
    }

    /// Descend tree by path segments.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::PathNotFound`] if any segment is missing.
    pub fn find_path(&self, tree: Oid, path: &str) -> Result<ObjectRef> {
        let tree = self.repo.find_tree(tree)?;
        let entry = tree
            .get_path(Path::new(path))
            .map_err(|err| match err.code() {
                ErrorCode::NotFound => GitError::PathNotFound { path: path.into() },
                _ => GitError::Git2(err),
            })?;

        let kind = match entry.kind() {
            Some(ObjectType::Tree) => ObjectKind::Tree,
            Some(ObjectType::Blob) => ObjectKind::Blob,
            _ => ObjectKind::Other,
        };

        Ok(ObjectRef {
            id: entry.id(),
            kind,
            mode: entry.filemode(),
        })
    }

    /// List direct children of a tree, sorted by name.
    pub fn list_tree(&self, tree: Oid) -> Result<Vec<TreeItem>> {
        let tree = self.repo.find_tree(tree)?;
        let mut items = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let kind = match entry.kind() {
                Some(ObjectType::Tree) => ObjectKind::Tree,
                Some(ObjectType::Blob) => ObjectKind::Blob,
                _ => ObjectKind::Other,
            };
            items.push(TreeItem {
                name: String::from_utf8_lossy(entry.name_bytes()).into_owned(),
                object: ObjectRef {
                    id: entry.id(),
                    kind,
                    mode: entry.filemode(),
                },
            });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(items)
    }

    /// Read raw blob content.
    pub fn read_blob(&self, blob: Oid) -> Result<Vec<u8>> {
        Ok(self.repo.find_blob(blob)?.content().to_vec())
    }

    /// Read blob content as text.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::BinaryContent`] if blob looks binary, or is not
    ///   valid UTF-8.
    pub fn read_blob_as_text(&self, blob: Oid) -> Result<String> {
        let object = self.repo.find_blob(blob)?;
        if object.is_binary() {
            return Err(GitError::BinaryContent { id: blob });
        }

        String::from_utf8(object.content().to_vec()).map_err(|_| GitError::BinaryContent { id: blob })
    }

    /// Tree id of target commit.
    pub fn commit_tree(&self, commit: Oid) -> Result<Oid> {
        Ok(self.repo.find_commit(commit)?.tree_id())
    }

    /// Write bytes into the object database as a blob.
    pub fn write_blob(&self, content: &[u8]) -> Result<Oid> {
        Ok(self.repo.blob(content)?)
    }

    /// Produce new tree equal to `base` with a blob placed at `path`.
    ///
    /// Intermediate sub-trees are created as needed. Everything else in
    /// `base` is carried over untouched.
    pub fn insert_blob(&self, base: Option<Oid>, path: &str, blob: Oid) -> Result<Oid> {
        let segments = path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>();
        if segments.is_empty() {
            return Err(GitError::PathNotFound { path: path.into() });
        }

        let base = base.map(|id| self.repo.find_tree(id)).transpose()?;
        splice(&self.repo, base.as_ref(), &segments, blob)
    }

    /// Create commit object without moving any ref.
    pub fn create_commit(
        &self,
        tree: Oid,
        parent: Option<Oid>,
        author: &str,
        message: &str,
    ) -> Result<Oid> {
        let signature = Signature::now(author, AGENT_EMAIL)?;
        let tree = self.repo.find_tree(tree)?;
        let parent = parent.map(|id| self.repo.find_commit(id)).transpose()?;
        let parents = parent.iter().collect::<Vec<_>>();

        Ok(self
            .repo
            .commit(None, &signature, &signature, message, &tree, &parents)?)
    }

    /// Move ref from `expected` to `new` if and only if it still points at
    /// `expected`.
    ///
    /// An `expected` of `None` means the ref must not exist yet. Returns
    /// `false` when another writer moved the ref first, or holds its lock.
    #[instrument(skip(self, log_message), level = "debug")]
    pub fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<Oid>,
        new: Oid,
        log_message: &str,
    ) -> Result<bool> {
        let result = match expected {
            Some(current) => self
                .repo
                .reference_matching(name, new, true, current, log_message),
            None => self.repo.reference(name, new, false, log_message),
        };

        match result {
            Ok(_) => Ok(true),
            Err(err)
                if matches!(
                    err.code(),
                    ErrorCode::Modified | ErrorCode::Exists | ErrorCode::Locked
                ) =>
            {
                debug!("lost ref race on {name}: {}", err.message());
                Ok(false)
            }
            Err(err) => Err(GitError::Git2(err)),
        }
    }

    /// Delete every ref whose full name is in `names`, all or nothing.
    ///
    /// Every ref is locked before any is removed, so concurrent writers can
    /// not sneak an update in between, and a failure leaves all refs intact.
    /// Refs that do not exist are ignored.
    #[instrument(skip(self, names), level = "debug")]
    pub fn delete_refs(&self, names: &[String]) -> Result<usize> {
        let mut transaction = self.repo.transaction()?;
        for name in names {
            transaction.lock_ref(name)?;
        }

        let mut deleted = 0;
        for name in names {
            match self.repo.find_reference(name) {
                Ok(_) => {
                    transaction.remove(name)?;
                    deleted += 1;
                }
                Err(err) if err.code() == ErrorCode::NotFound => continue,
                Err(err) => return Err(GitError::Git2(err)),
            }
        }
        transaction.commit()?;
        debug!("deleted {deleted} refs");

        Ok(deleted)
    }
}

fn splice(repo: &Repository, base: Option<&Tree<'_>>, segments: &[&str], blob: Oid) -> Result<Oid> {
    let mut builder = repo.treebuilder(base)?;
    match segments {
        [name] => {
            builder.insert(*name, blob, i32::from(FileMode::Blob))?;
        }
        [name, rest @ ..] => {
            let subtree = match base.and_then(|tree| tree.get_name(name)) {
                Some(entry) if entry.kind() == Some(ObjectType::Tree) => {
                    Some(repo.find_tree(entry.id())?)
                }
                _ => None,
            };
            let subtree = splice(repo, subtree.as_ref(), rest, blob)?;
            builder.insert(*name, subtree, i32::from(FileMode::Tree))?;
        }
        [] => unreachable!("caller rejects empty paths"),
    }

    Ok(builder.write()?)
}

pub(crate) fn git_time_to_utc(time: git2::Time) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(time.seconds(), 0).unwrap_or_default()
}

/// Commit metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub id: Oid,
    pub author: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub parents: Vec<Oid>,
    pub tree: Oid,
}

impl CommitInfo {
    fn from_commit(commit: &git2::Commit<'_>) -> Result<Self> {
        Ok(Self {
            id: commit.id(),
            author: String::from_utf8_lossy(commit.author().name_bytes()).into_owned(),
            message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
            timestamp: git_time_to_utc(commit.time()),
            parents: commit.parent_ids().collect(),
            tree: commit.tree_id(),
        })
    }
}

/// Kind of object a tree entry references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Other,
}

/// Reference to an object reached through a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRef {
    pub id: Oid,
    pub kind: ObjectKind,
    pub mode: i32,
}

/// Named child of a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeItem {
    pub name: String,
    pub object: ObjectRef,
}

/// All possible error types for Git object access.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// Nothing that looks like a repository exists at path.
    #[error("no repository at {:?}", path.display())]
    NotARepository { path: PathBuf },

    /// Ref name does not resolve to a commit.
    #[error("ref {name:?} not found")]
    RefNotFound { name: String },

    /// Repository has no commits on any branch.
    #[error("repository {:?} has no commits", path.display())]
    EmptyRepository { path: PathBuf },

    /// Path does not exist in tree.
    #[error("path {path:?} not found in tree")]
    PathNotFound { path: String },

    /// Blob cannot be decoded as text.
    #[error("blob {id} is not text")]
    BinaryContent { id: Oid },

    /// Exclusion pattern for discovery is invalid.
    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),
}

/// Friendly result alias :3
pub type Result<T, E = GitError> = std::result::Result<T, E>;
