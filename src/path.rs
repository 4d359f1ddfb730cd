// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine relevent path information for external files that need to be
//! interacted with, or managed in some way.

use std::path::PathBuf;

/// Determine default absolute path to configuration file.
///
/// Uses XDG Base Directory path `$XDG_CONFIG_HOME/ticketry/config.toml`.
/// Does not check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_config_file() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join("ticketry").join("config.toml"))
        .ok_or(NoWayHome)
}

/// Determine default absolute path to repositories root.
///
/// Uses XDG Base Directory path `$XDG_DATA_HOME/ticketry-repos` as the
/// default root that hosted repositories are discovered under. Does not
/// check if the path returned actually exists.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
///
/// # See Also
///
/// - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)
pub fn default_repositories_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|path| path.join("ticketry-repos"))
        .ok_or(NoWayHome)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("XDG_CONFIG_HOME", "/tmp/cfg"), ("XDG_DATA_HOME", "/tmp/data")])]
    fn xdg_paths() -> anyhow::Result<()> {
        assert_eq!(default_config_file()?, PathBuf::from("/tmp/cfg/ticketry/config.toml"));
        assert_eq!(default_repositories_dir()?, PathBuf::from("/tmp/data/ticketry-repos"));

        Ok(())
    }
}
