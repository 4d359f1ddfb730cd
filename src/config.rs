// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout for configuration files that Ticketry uses to simplify
//! the process of serialization and deserialization. File I/O is left to the
//! caller to figure out.

use crate::git::{DiscoveryOptions, RepositoryScan};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    path::PathBuf,
    str::FromStr,
};

/// Ticketry configuration file layout.
///
/// # General Layout
///
/// A configuration file is composed of two tables: repositories and
/// tickets. The repositories table says where hosted repositories live on
/// disk and how to discover them. The tickets table selects the ticket
/// storage backend and bounds how long and how often it may try before
/// giving up. Every field is optional and falls back to a sensible default.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Repository discovery settings.
    pub repositories: RepositorySettings,

    /// Ticket storage settings.
    pub tickets: TicketSettings,
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: Config = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on repositories root field.
        config.repositories.root = PathBuf::from(
            shellexpand::full(config.repositories.root.to_string_lossy().as_ref())
                .map_err(ConfigError::ShellExpansion)?
                .into_owned(),
        );

        Ok(config)
    }
}

impl Display for Config {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// Where repositories live, and which ones count.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RepositorySettings {
    /// Directory holding every hosted repository.
    pub root: PathBuf,

    /// Report dot-prefixed repositories.
    pub include_hidden: bool,

    /// Look for repositories inside plain folders below root.
    pub recurse_nested: bool,

    /// Only report bare repositories.
    pub only_bare: bool,

    /// Only report repositories carrying the git-daemon export marker.
    pub only_exported: bool,

    /// Maximum folder depth searched below root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<usize>,

    /// Glob patterns of relative paths to skip.
    pub exclusions: Vec<String>,
}

impl RepositorySettings {
    /// Discovery options described by these settings.
    pub fn discovery(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            include_hidden: self.include_hidden,
            recurse_nested: self.recurse_nested,
            only_bare: self.only_bare,
            only_exported: self.only_exported,
            max_depth: self.max_depth,
            exclusions: self.exclusions.clone(),
        }
    }

    /// Scan of root directory using these settings.
    ///
    /// # Errors
    ///
    /// - Return [`GitError::Pattern`](crate::git::GitError::Pattern) if an
    ///   exclusion is not a valid glob.
    pub fn scan(&self) -> crate::git::Result<RepositoryScan> {
        RepositoryScan::new(&self.root, self.discovery())
    }
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            root: crate::path::default_repositories_dir()
                .unwrap_or_else(|_| PathBuf::from("repositories")),
            include_hidden: false,
            recurse_nested: true,
            only_bare: false,
            only_exported: false,
            max_depth: None,
            exclusions: Vec::new(),
        }
    }
}

/// Ticket storage backend selection.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketBackend {
    /// Journal committed into the hosted repository.
    #[default]
    Journal,

    /// Journal kept in an external key/value store.
    External,
}

impl Display for TicketBackend {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Journal => fmt.write_str("journal"),
            Self::External => fmt.write_str("external"),
        }
    }
}

/// Ticket storage settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TicketSettings {
    /// Backend to store tickets with.
    pub backend: TicketBackend,

    /// Ref namespace reserved for journal backend.
    pub ref_namespace: String,

    /// Prefix put in front of every external store key.
    pub key_prefix: String,

    /// Time budget of a single operation in milliseconds.
    pub timeout_ms: u64,

    /// Attempts made before giving up on contended writes.
    pub max_attempts: u32,

    /// Base delay between attempts in milliseconds, grows linearly.
    pub backoff_ms: u64,
}

impl Default for TicketSettings {
    fn default() -> Self {
        Self {
            backend: TicketBackend::Journal,
            ref_namespace: "refs/tickets".into(),
            key_prefix: String::new(),
            timeout_ms: 5000,
            max_attempts: 8,
            backoff_ms: 2,
        }
    }
}

/// Configuration error types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}
