// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{RepoFixture, RepoKind};

use anyhow::Result;
use git2::Signature;
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use std::path::Path;
use ticketry::git::{ChangeKind, DiscoveryOptions, GitError, ObjectKind, RepositoryScan};

#[sealed_test]
fn resolve_refs_to_commits() -> Result<()> {
    let fixture = RepoFixture::new("root", "demo", RepoKind::Normal)?;
    let git = fixture.git()?;
    assert!(matches!(
        git.resolve_ref("HEAD"),
        Err(GitError::RefNotFound { .. })
    ));

    let first = fixture.stage_and_commit("README.md", "hello\n")?;
    let head = git.resolve_ref("HEAD")?;
    assert_eq!(head.id, first);
    assert_eq!(head.author, "John Doe");
    assert!(head.parents.is_empty());
    assert_eq!(git.resolve_ref("main")?.id, first);
    assert_eq!(git.resolve_ref("refs/heads/main")?.id, first);

    let second = fixture.stage_and_commit("README.md", "hello again\n")?;
    let head = git.resolve_ref("HEAD")?;
    assert_eq!(head.id, second);
    assert_eq!(head.parents, vec![first]);

    assert!(matches!(
        git.resolve_ref("no-such-branch"),
        Err(GitError::RefNotFound { .. })
    ));

    Ok(())
}

#[sealed_test]
fn last_change_spans_all_branches() -> Result<()> {
    let fixture = RepoFixture::new("root", "demo", RepoKind::Normal)?;
    assert!(matches!(
        fixture.git()?.last_change(),
        Err(GitError::EmptyRepository { .. })
    ));

    fixture.stage_and_commit_at("main", "a.txt", "a\n", 1_600_000_000)?;
    fixture.stage_and_commit_at("feature", "b.txt", "b\n", 1_700_000_000)?;
    fixture.stage_and_commit_at("main", "c.txt", "c\n", 1_650_000_000)?;

    assert_eq!(fixture.git()?.last_change()?.timestamp(), 1_700_000_000);

    Ok(())
}

#[sealed_test]
fn walk_trees_and_read_blobs() -> Result<()> {
    let fixture = RepoFixture::new("root", "demo", RepoKind::Normal)?;
    fixture.stage_and_commit("src/lib.rs", "pub fn answer() -> u32 { 42 }\n")?;
    let commit = fixture.stage_and_commit("logo.png", [0x89, b'P', b'N', b'G', 0, 0, 1, 2])?;

    let git = fixture.git()?;
    let tree = git.commit_tree(commit)?;
    let names = git
        .list_tree(tree)?
        .into_iter()
        .map(|item| item.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["logo.png", "src"]);

    assert_eq!(git.find_path(tree, "src")?.kind, ObjectKind::Tree);
    let lib = git.find_path(tree, "src/lib.rs")?;
    assert_eq!(lib.kind, ObjectKind::Blob);
    assert_eq!(
        git.read_blob_as_text(lib.id)?,
        "pub fn answer() -> u32 { 42 }\n"
    );
    assert!(matches!(
        git.find_path(tree, "src/main.rs"),
        Err(GitError::PathNotFound { .. })
    ));

    let logo = git.find_path(tree, "logo.png")?;
    assert!(matches!(
        git.read_blob_as_text(logo.id),
        Err(GitError::BinaryContent { .. })
    ));
    assert_eq!(git.read_blob(logo.id)?.len(), 8);

    Ok(())
}

#[sealed_test]
fn diff_commits_against_first_parent() -> Result<()> {
    let fixture = RepoFixture::new("root", "demo", RepoKind::Normal)?;
    let signature = Signature::now("John Doe", "john@doe.com")?;
    let git = fixture.git()?;

    let root = fixture.commit_changes(
        "HEAD",
        &[
            (Path::new("z.txt"), Some(b"zed\n".as_slice())),
            (Path::new("a/b.txt"), Some(b"one\ntwo\n".as_slice())),
        ],
        &signature,
    )?;
    let diff = git.diff_commit(root, 3)?;
    assert_eq!(diff.parent, None);
    let summary = diff
        .changes
        .iter()
        .map(|change| (change.path.as_str(), change.kind, change.insertions))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![("a/b.txt", ChangeKind::Added, 2), ("z.txt", ChangeKind::Added, 1)]
    );
    assert!(diff.changes.iter().all(|change| change.old_id.is_none()));
    assert!(diff.changes[1]
        .patch
        .as_deref()
        .is_some_and(|patch| patch.contains("+zed")));

    let second = fixture.commit_changes(
        "HEAD",
        &[
            (Path::new("z.txt"), Some(b"zed\nzed again\n".as_slice())),
            (Path::new("a/b.txt"), None),
            (Path::new("c.txt"), Some(b"see\n".as_slice())),
        ],
        &signature,
    )?;
    let diff = git.diff_commit(second, 3)?;
    assert_eq!(diff.parent, Some(root));
    let summary = diff
        .changes
        .iter()
        .map(|change| (change.path.as_str(), change.kind, change.insertions, change.deletions))
        .collect::<Vec<_>>();
    assert_eq!(
        summary,
        vec![
            ("a/b.txt", ChangeKind::Deleted, 0, 2),
            ("c.txt", ChangeKind::Added, 1, 0),
            ("z.txt", ChangeKind::Modified, 1, 0),
        ]
    );

    let third = fixture.commit_changes(
        "HEAD",
        &[
            (Path::new("c.txt"), None),
            (Path::new("d.txt"), Some(b"see\n".as_slice())),
        ],
        &signature,
    )?;
    let diff = git.diff_commit(third, 3)?;
    assert_eq!(diff.changes.len(), 1);
    assert_eq!(diff.changes[0].kind, ChangeKind::Renamed);
    assert_eq!(diff.changes[0].path, "d.txt");
    assert_eq!(diff.changes[0].old_path.as_deref(), Some("c.txt"));

    Ok(())
}

#[sealed_test]
fn compare_and_swap_refs() -> Result<()> {
    let fixture = RepoFixture::new("root", "demo.git", RepoKind::Bare)?;
    let git = fixture.git()?;
    let name = "refs/tickets/00";

    let blob = git.write_blob(b"one")?;
    let tree = git.insert_blob(None, "x/y.txt", blob)?;
    let first = git.create_commit(tree, None, "alice", "first")?;
    assert!(git.compare_and_swap_ref(name, None, first, "create")?);
    assert!(!git.compare_and_swap_ref(name, None, first, "create again")?);

    let grown = git.insert_blob(Some(tree), "x/z.txt", blob)?;
    let second = git.create_commit(grown, Some(first), "alice", "second")?;
    assert!(git.compare_and_swap_ref(name, Some(first), second, "advance")?);

    let stale = git.create_commit(grown, Some(first), "bob", "stale")?;
    assert!(!git.compare_and_swap_ref(name, Some(first), stale, "stale")?);
    assert_eq!(git.ref_target(name)?, Some(second));

    let dir = git.find_path(grown, "x")?;
    let names = git
        .list_tree(dir.id)?
        .into_iter()
        .map(|item| item.name)
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["y.txt", "z.txt"]);

    let deleted = git.delete_refs(&[name.to_string(), "refs/tickets/99".to_string()])?;
    assert_eq!(deleted, 1);
    assert_eq!(git.ref_target(name)?, None);

    Ok(())
}

#[sealed_test]
fn delete_refs_is_all_or_nothing() -> Result<()> {
    let fixture = RepoFixture::new("root", "demo.git", RepoKind::Bare)?;
    let git = fixture.git()?;
    let blob = git.write_blob(b"one")?;
    let tree = git.insert_blob(None, "a.txt", blob)?;
    let commit = git.create_commit(tree, None, "alice", "first")?;
    let names = vec!["refs/tickets/00".to_string(), "refs/tickets/05".to_string()];
    for name in &names {
        assert!(git.compare_and_swap_ref(name, None, commit, "create")?);
    }

    // Another writer holds the lock of one bucket.
    let lock = fixture.handle().path.join("refs/tickets/05.lock");
    std::fs::write(&lock, "")?;
    assert!(git.delete_refs(&names).is_err());
    assert_eq!(git.ref_target("refs/tickets/00")?, Some(commit));
    assert_eq!(git.ref_target("refs/tickets/05")?, Some(commit));

    std::fs::remove_file(&lock)?;
    assert_eq!(git.delete_refs(&names)?, 2);
    assert!(git.ref_names("refs/tickets/*")?.is_empty());

    Ok(())
}

#[sealed_test]
fn discover_fixture_repositories() -> Result<()> {
    let alpha = RepoFixture::new("root", "alpha.git", RepoKind::Bare)?;
    RepoFixture::new("root", "group/beta", RepoKind::Normal)?;
    RepoFixture::new("root", ".gamma.git", RepoKind::Bare)?;

    let options = DiscoveryOptions {
        recurse_nested: true,
        ..Default::default()
    };
    let scan = RepositoryScan::new("root", options)?;
    let found = scan.iter().collect::<Vec<_>>();
    let names = found.iter().map(|repo| repo.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["alpha.git", "group/beta"]);
    assert_eq!(found[0], alpha.handle());
    assert!(found[0].bare);
    assert!(!found[1].bare);

    Ok(())
}
