// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository discovery.
//!
//! Hosted repositories live somewhere under a single root directory, either
//! directly or grouped into plain folders. Discovery walks that root and
//! reports every directory that is a repository, without ever opening one.
//!
//! # What Counts As A Repository
//!
//! A directory is a repository if it holds a `.git` entry (normal layout),
//! or if it has the bare layout itself: a `HEAD` file next to `objects/` and
//! `refs/` directories. Discovery never descends into a repository, so
//! repositories nested inside another repository's work tree stay invisible.
//!
//! # Visibility
//!
//! Dot-prefixed directories are hidden. They are skipped unless the caller
//! asks for hidden entries. The export flag of a handle follows the
//! git-daemon convention of a `git-daemon-export-ok` marker file inside the
//! Git directory. Unexported repositories are skipped when the caller asks
//! for exported repositories only.

use crate::git::Result;

use glob::Pattern;
use ignore::{Walk, WalkBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Marker file that flags a repository as exported.
pub const EXPORT_MARKER: &str = "git-daemon-export-ok";

/// Check if directory is a repository.
pub fn is_repository(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    path.join(".git").exists() || is_bare_layout(path)
}

fn is_bare_layout(path: &Path) -> bool {
    path.join("HEAD").is_file() && path.join("objects").is_dir() && path.join("refs").is_dir()
}

/// Repository handle.
///
/// Identifies a repository by its path relative to the repositories root.
/// Carries read-only metadata gathered from the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepositoryHandle {
    /// Relative name using `/` separators, e.g., "group/project.git".
    pub name: String,

    /// Absolute or root-joined path to the repository directory.
    pub path: PathBuf,

    /// Repository has no work tree.
    pub bare: bool,

    /// Repository carries the export marker.
    pub exported: bool,
}

impl RepositoryHandle {
    /// Construct handle for repository at `path` below `root`.
    pub fn new(root: impl AsRef<Path>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .strip_prefix(root.as_ref())
            .unwrap_or(&path)
            .components()
            .map(|part| part.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let bare = !path.join(".git").exists() && is_bare_layout(&path);
        let gitdir = if bare { path.clone() } else { path.join(".git") };
        let exported = gitdir.join(EXPORT_MARKER).exists();

        Self {
            name,
            path,
            bare,
            exported,
        }
    }

    /// Locate repository by name under root.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::NotARepository`](crate::git::GitError::NotARepository)
    ///   if target directory is not a repository.
    pub fn locate(root: impl AsRef<Path>, name: impl AsRef<str>) -> Result<Self> {
        let path = root.as_ref().join(name.as_ref());
        if !is_repository(&path) {
            return Err(crate::git::GitError::NotARepository { path });
        }

        Ok(Self::new(root, path))
    }

    /// Name with any trailing ".git" removed.
    ///
    /// Used wherever a repository needs a stable key that does not depend on
    /// how it was laid out on disk.
    pub fn key(&self) -> &str {
        self.name.strip_suffix(".git").unwrap_or(&self.name)
    }
}

/// Discovery settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Report dot-prefixed directories too.
    pub include_hidden: bool,

    /// Descend into plain folders to find grouped repositories.
    pub recurse_nested: bool,

    /// Skip repositories with a work tree.
    pub only_bare: bool,

    /// Skip repositories without the export marker.
    pub only_exported: bool,

    /// Maximum folder depth below root, unbounded if `None`.
    pub max_depth: Option<usize>,

    /// Glob patterns on relative paths that prune the walk.
    pub exclusions: Vec<String>,
}

/// Lazy, restartable scan of a repositories root.
///
/// Nothing touches the filesystem until iteration starts. Every call to
/// [`iter`](RepositoryScan::iter) starts a fresh walk, so the scan can be
/// replayed to pick up repositories created in the meantime.
#[derive(Debug, Clone)]
pub struct RepositoryScan {
    root: PathBuf,
    options: DiscoveryOptions,
    exclusions: Vec<Pattern>,
}

impl RepositoryScan {
    /// Construct new scan of root directory.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::Pattern`](crate::git::GitError::Pattern) if an
    ///   exclusion pattern is invalid.
    pub fn new(root: impl Into<PathBuf>, options: DiscoveryOptions) -> Result<Self> {
        let exclusions = options
            .exclusions
            .iter()
            .map(|pattern| Pattern::new(pattern))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            root: root.into(),
            options,
            exclusions,
        })
    }

    /// Root directory being scanned.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a new walk.
    pub fn iter(&self) -> Repositories {
        let max_depth = if self.options.recurse_nested {
            self.options.max_depth
        } else {
            Some(1)
        };

        let root = self.root.clone();
        let exclusions = self.exclusions.clone();
        let mut builder = WalkBuilder::new(&self.root);
        builder
            .standard_filters(false)
            .hidden(!self.options.include_hidden)
            .follow_links(false)
            .max_depth(max_depth)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                if entry.depth() == 0 {
                    return true;
                }

                if !entry.file_type().is_some_and(|kind| kind.is_dir()) {
                    return false;
                }

                // INVARIANT: Never walk into repository internals or work trees.
                if entry.path().parent().is_some_and(is_repository) {
                    return false;
                }

                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                if let Some(pattern) = exclusions.iter().find(|p| p.matches_path(relative)) {
                    debug!("excluding {} because of rule {}", relative.display(), pattern);
                    return false;
                }

                true
            });

        Repositories {
            walk: builder.build(),
            root: self.root.clone(),
            only_bare: self.options.only_bare,
            only_exported: self.options.only_exported,
        }
    }
}

impl<'a> IntoIterator for &'a RepositoryScan {
    type Item = RepositoryHandle;
    type IntoIter = Repositories;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over discovered repositories, in file name order.
pub struct Repositories {
    walk: Walk,
    root: PathBuf,
    only_bare: bool,
    only_exported: bool,
}

impl Iterator for Repositories {
    type Item = RepositoryHandle;

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.walk.by_ref() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("skipping unreadable path: {err}");
                    continue;
                }
            };

            if entry.depth() == 0 || !is_repository(entry.path()) {
                continue;
            }

            let handle = RepositoryHandle::new(&self.root, entry.path());
            if (self.only_bare && !handle.bare) || (self.only_exported && !handle.exported) {
                debug!("filtering out {}", handle.name);
                continue;
            }

            return Some(handle);
        }

        None
    }
}
