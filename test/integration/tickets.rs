// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{contended_settings, RepoFixture, RepoKind};

use anyhow::Result;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use std::{
    collections::{BTreeSet, VecDeque},
    sync::Arc,
    thread,
    time::Duration,
};
use ticketry::{
    allocator::{AllocatorError, TicketIdAllocator},
    config::TicketSettings,
    git::RepositoryHandle,
    service::{
        Deadline, ExternalTicketService, JournalTicketService, MemoryStore, RefLayout,
        StoreClient, StoreError,
    },
    ticket::FieldPatch,
    NewTicket, Status, TicketError, TicketFilter, TicketId, TicketPatch, TicketService,
};

fn repo() -> Result<RepoFixture> {
    RepoFixture::new("root", "demo.git", RepoKind::Bare)
}

fn id(number: u64) -> TicketId {
    TicketId::new(number).unwrap()
}

/// Hands out a scripted sequence of ids.
struct ScriptedAllocator {
    ids: Mutex<VecDeque<u64>>,
}

impl ScriptedAllocator {
    fn new(ids: impl IntoIterator<Item = u64>) -> Arc<Self> {
        Arc::new(Self {
            ids: Mutex::new(ids.into_iter().collect()),
        })
    }
}

impl TicketIdAllocator for ScriptedAllocator {
    fn allocate(
        &self,
        _: &RepositoryHandle,
        _: &Deadline,
    ) -> Result<TicketId, AllocatorError> {
        self.ids
            .lock()
            .pop_front()
            .and_then(TicketId::new)
            .ok_or(AllocatorError::Unavailable {
                reason: "script ran out".into(),
            })
    }
}

#[sealed_test]
fn example_scenario() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = JournalTicketService::new(&TicketSettings::default());

    let ticket = service.create(&repo, NewTicket::new("Build fails on clean checkout"), "alice")?;
    assert_eq!(ticket.id, id(1));
    assert_eq!(ticket.status, Status::New);

    service.update(&repo, id(1), TicketPatch::new().status(Status::Open), "bob", None)?;
    let ticket = service.get(&repo, id(1))?;
    assert_eq!(ticket.status, Status::Open);
    assert_eq!(ticket.title, "Build fails on clean checkout");

    service.update(
        &repo,
        id(1),
        TicketPatch::new().status(Status::Fixed),
        "bob",
        Some("patched in abc123"),
    )?;
    let ticket = service.get(&repo, id(1))?;
    assert_eq!(ticket.status, Status::Fixed);
    assert_eq!(ticket.comments.len(), 1);
    assert_eq!(ticket.comments[0].text, "patched in abc123");
    assert_eq!(ticket.created_by, "alice");
    assert_eq!(ticket.updated_by, "bob");

    let seqs = service
        .journal(&repo, id(1))?
        .iter()
        .map(|entry| entry.seq)
        .collect::<Vec<_>>();
    assert_eq!(seqs, vec![1, 2, 3]);

    Ok(())
}

#[sealed_test]
fn update_then_get_reflects_patch() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = JournalTicketService::new(&TicketSettings::default());
    let ticket = service.create(
        &repo,
        NewTicket::new("crash on save").label("bug").milestone("1.0"),
        "alice",
    )?;

    let patch = TicketPatch::new()
        .title("crash on save as")
        .label("ui")
        .unlabel("bug")
        .milestone(None)
        .responsible(Some("carol".into()))
        .watch("dave")
        .attach("trace.log", b"panicked at main.rs\n".to_vec());
    let updated = service.update(&repo, ticket.id, patch, "bob", Some("has a trace"))?;
    let fetched = service.get(&repo, ticket.id)?;
    assert_eq!(updated, fetched);

    assert_eq!(fetched.title, "crash on save as");
    assert_eq!(fetched.labels, BTreeSet::from(["ui".to_string()]));
    assert_eq!(fetched.milestone, None);
    assert_eq!(fetched.responsible.as_deref(), Some("carol"));
    assert!(fetched.watchers.contains("dave"));
    assert_eq!(fetched.attachments["trace.log"].size, 20);
    assert_eq!(
        service.attachment(&repo, ticket.id, "trace.log")?,
        b"panicked at main.rs\n"
    );
    assert!(matches!(
        service.attachment(&repo, ticket.id, "core.dump"),
        Err(TicketError::AttachmentNotFound { .. })
    ));
    assert!(matches!(
        service.update(
            &repo,
            ticket.id,
            TicketPatch::new().attach("../escape", b"x".to_vec()),
            "bob",
            None
        ),
        Err(TicketError::InvalidAttachmentName { .. })
    ));

    Ok(())
}

#[sealed_test]
fn update_unknown_ticket_fails() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = JournalTicketService::new(&TicketSettings::default());

    let result = service.update(&repo, id(9), TicketPatch::new().status(Status::Open), "bob", None);
    assert!(matches!(result, Err(TicketError::TicketNotFound { .. })));
    assert!(matches!(
        service.get(&repo, id(9)),
        Err(TicketError::TicketNotFound { .. })
    ));
    assert!(!service.has_ticket(&repo, id(9))?);

    Ok(())
}

#[sealed_test]
fn concurrent_creates_get_distinct_ids() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = Arc::new(JournalTicketService::new(&contended_settings()));

    let workers = (0..6)
        .map(|worker| {
            let service = service.clone();
            let repo = repo.clone();
            thread::spawn(move || -> Result<Vec<TicketId>> {
                let mut ids = Vec::new();
                for n in 0..4 {
                    let fields = NewTicket::new(format!("worker {worker} ticket {n}"));
                    ids.push(service.create(&repo, fields, "bot")?.id);
                }
                Ok(ids)
            })
        })
        .collect::<Vec<_>>();

    let mut ids = Vec::new();
    for worker in workers {
        ids.extend(worker.join().expect("worker panicked")?);
    }
    let distinct = ids.iter().copied().collect::<BTreeSet<_>>();
    assert_eq!(distinct.len(), 24);
    assert_eq!(distinct.first(), Some(&id(1)));
    assert_eq!(distinct.last(), Some(&id(24)));

    let listed = service.list(&repo, &TicketFilter::new())?;
    assert_eq!(listed.len(), 24);
    assert_eq!(service.ids(&repo)?, distinct.into_iter().collect::<Vec<_>>());

    Ok(())
}

#[sealed_test]
fn concurrent_updates_keep_every_patch() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = Arc::new(JournalTicketService::new(&contended_settings()));
    let ticket = service.create(&repo, NewTicket::new("shared"), "alice")?;

    let workers = (0..4)
        .map(|worker| {
            let service = service.clone();
            let repo = repo.clone();
            thread::spawn(move || -> Result<()> {
                for n in 0..3 {
                    let patch = TicketPatch::new().label(format!("w{worker}-{n}"));
                    service.update(&repo, ticket.id, patch, &format!("worker{worker}"), None)?;
                }
                Ok(())
            })
        })
        .collect::<Vec<_>>();
    for worker in workers {
        worker.join().expect("worker panicked")?;
    }

    let ticket = service.get(&repo, ticket.id)?;
    assert_eq!(ticket.labels.len(), 12);
    assert_eq!(ticket.revision, 13);

    let journal = service.journal(&repo, ticket.id)?;
    let seqs = journal.iter().map(|entry| entry.seq).collect::<Vec<_>>();
    assert_eq!(seqs, (1..=13).collect::<Vec<_>>());
    assert!(journal
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp));

    Ok(())
}

#[sealed_test]
fn delete_all_then_list_is_empty() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = JournalTicketService::new(&TicketSettings::default());
    for n in 0..3 {
        service.create(&repo, NewTicket::new(format!("t{n}")), "alice")?;
    }

    assert_eq!(service.delete_all(&repo)?, 3);
    assert!(service.list(&repo, &TicketFilter::new())?.is_empty());
    assert!(service.ids(&repo)?.is_empty());

    let git = fixture.git()?;
    assert!(RefLayout::default().bucket_refs(&git)?.is_empty());

    // INVARIANT: Ids are never reused, even after a reset.
    let ticket = service.create(&repo, NewTicket::new("after reset"), "alice")?;
    assert_eq!(ticket.id, id(4));

    Ok(())
}

#[sealed_test]
fn deleted_ticket_disappears_but_journal_stays() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = JournalTicketService::new(&TicketSettings::default());
    let keep = service.create(&repo, NewTicket::new("keep"), "alice")?;
    let drop = service.create(&repo, NewTicket::new("drop"), "alice")?;

    service.delete(&repo, drop.id, "admin")?;
    assert!(matches!(
        service.get(&repo, drop.id),
        Err(TicketError::TicketNotFound { .. })
    ));
    assert!(matches!(
        service.update(&repo, drop.id, TicketPatch::new().title("again"), "bob", None),
        Err(TicketError::TicketNotFound { .. })
    ));
    assert!(!service.has_ticket(&repo, drop.id)?);
    assert!(service.has_ticket(&repo, keep.id)?);

    let journal = service.journal(&repo, drop.id)?;
    assert_eq!(journal.len(), 2);
    assert_eq!(journal[1].patches, vec![FieldPatch::Deleted]);

    let listed = service.list(&repo, &TicketFilter::new())?;
    assert_eq!(listed.iter().map(|t| t.id).collect::<Vec<_>>(), vec![keep.id]);

    Ok(())
}

#[sealed_test]
fn tickets_share_buckets() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = JournalTicketService::with_allocator(
        &TicketSettings::default(),
        ScriptedAllocator::new([1, 101, 2]),
    );

    for title in ["one", "hundred and one", "two"] {
        service.create(&repo, NewTicket::new(title), "alice")?;
    }
    service.update(&repo, id(101), TicketPatch::new().status(Status::Hold), "bob", None)?;

    assert_eq!(service.get(&repo, id(1))?.status, Status::New);
    assert_eq!(service.get(&repo, id(101))?.status, Status::Hold);
    assert_eq!(service.ids(&repo)?, vec![id(1), id(2), id(101)]);

    let git = fixture.git()?;
    assert_eq!(
        RefLayout::default().bucket_refs(&git)?,
        vec!["refs/tickets/01", "refs/tickets/02"]
    );

    Ok(())
}

#[sealed_test]
fn taken_ids_are_reallocated() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = JournalTicketService::with_allocator(
        &TicketSettings::default(),
        ScriptedAllocator::new([1, 1, 1, 2]),
    );

    service.create(&repo, NewTicket::new("first"), "alice")?;
    let second = service.create(&repo, NewTicket::new("second"), "alice")?;
    assert_eq!(second.id, id(2));
    assert_eq!(service.get(&repo, id(1))?.title, "first");

    let settings = TicketSettings {
        max_attempts: 2,
        ..Default::default()
    };
    let service = JournalTicketService::with_allocator(&settings, ScriptedAllocator::new([1, 2]));
    assert!(matches!(
        service.create(&repo, NewTicket::new("third"), "alice"),
        Err(TicketError::AllocationConflict { .. })
    ));

    Ok(())
}

#[sealed_test]
fn counter_reseeds_from_existing_tickets() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = JournalTicketService::new(&TicketSettings::default());
    for n in 0..3 {
        service.create(&repo, NewTicket::new(format!("t{n}")), "alice")?;
    }

    let git = fixture.git()?;
    git.delete_refs(&[RefLayout::default().counter_ref()])?;

    let ticket = service.create(&repo, NewTicket::new("after lost counter"), "alice")?;
    assert_eq!(ticket.id, id(4));

    Ok(())
}

#[sealed_test]
fn expired_deadline_writes_nothing() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let settings = TicketSettings {
        timeout_ms: 0,
        ..Default::default()
    };
    let service = JournalTicketService::new(&settings);

    assert!(matches!(
        service.create(&repo, NewTicket::new("too slow"), "alice"),
        Err(TicketError::Timeout { .. })
    ));
    assert!(fixture.git()?.ref_names("refs/tickets/*")?.is_empty());

    Ok(())
}

#[sealed_test]
fn missing_repository_means_allocator_unavailable() -> Result<()> {
    let repo = RepositoryHandle::new("root", "root/ghost.git");
    let service = JournalTicketService::new(&TicketSettings::default());

    assert!(matches!(
        service.create(&repo, NewTicket::new("boo"), "alice"),
        Err(TicketError::AllocatorUnavailable { .. })
    ));

    Ok(())
}

#[sealed_test]
fn change_feed_reports_appends() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = JournalTicketService::new(&TicketSettings::default());
    let mut events = service.subscribe();

    let ticket = service.create(&repo, NewTicket::new("watched"), "alice")?;
    service.update(&repo, ticket.id, TicketPatch::new().status(Status::Open), "bob", None)?;

    let created = events.try_recv()?;
    assert_eq!(created.repository, "demo.git");
    assert_eq!(created.entry.seq, 1);
    let updated = events.try_recv()?;
    assert_eq!(updated.entry.seq, 2);
    assert_eq!(updated.ticket.status, Status::Open);
    assert!(updated.ticket.index_text().contains("watched"));

    Ok(())
}

#[sealed_test]
fn list_filters_and_orders() -> Result<()> {
    let fixture = repo()?;
    let repo = fixture.handle();
    let service = JournalTicketService::new(&TicketSettings::default());
    service.create(&repo, NewTicket::new("a").milestone("1.0"), "alice")?;
    service.create(&repo, NewTicket::new("b").label("ui"), "alice")?;
    let c = service.create(&repo, NewTicket::new("c").milestone("1.0"), "alice")?;
    service.update(&repo, c.id, TicketPatch::new().status(Status::Fixed), "bob", None)?;

    let titles = |filter: TicketFilter| -> Result<Vec<String>> {
        Ok(service
            .list(&repo, &filter)?
            .into_iter()
            .map(|ticket| ticket.title)
            .collect())
    };
    assert_eq!(titles(TicketFilter::new())?, vec!["a", "b", "c"]);
    assert_eq!(titles(TicketFilter::new().milestone("1.0"))?, vec!["a", "c"]);
    assert_eq!(titles(TicketFilter::new().active())?, vec!["a", "b"]);
    assert_eq!(titles(TicketFilter::new().label("u*")?)?, vec!["b"]);
    assert_eq!(
        titles(TicketFilter::new().order(ticketry::ticket::TicketOrder::IdDescending))?,
        vec!["c", "b", "a"]
    );

    Ok(())
}

fn store_settings() -> TicketSettings {
    TicketSettings {
        key_prefix: "gb:".into(),
        ..contended_settings()
    }
}

fn store_repo() -> RepositoryHandle {
    RepositoryHandle::new("root", "root/group/demo.git")
}

/// Store whose journal writes fail as if the node went away mid-request.
struct DroppedJournal(Arc<MemoryStore>);

impl StoreClient for DroppedJournal {
    fn get(&self, key: &str, timeout: Duration) -> Result<Option<Vec<Vec<u8>>>, StoreError> {
        self.0.get(key, timeout)
    }

    fn append(&self, key: &str, value: Vec<u8>, timeout: Duration) -> Result<bool, StoreError> {
        if key.ends_with("::journal") {
            return Err(StoreError::Unavailable {
                reason: "connection reset".into(),
            });
        }
        self.0.append(key, value, timeout)
    }

    fn increment(&self, key: &str, timeout: Duration) -> Result<u64, StoreError> {
        self.0.increment(key, timeout)
    }

    fn delete_namespace(&self, prefix: &str, timeout: Duration) -> Result<usize, StoreError> {
        self.0.delete_namespace(prefix, timeout)
    }

    fn rename_namespace(&self, from: &str, to: &str, timeout: Duration) -> Result<bool, StoreError> {
        self.0.rename_namespace(from, to, timeout)
    }
}

#[test]
fn external_concurrent_creates_get_distinct_ids() -> Result<()> {
    let repo = store_repo();
    let service = Arc::new(ExternalTicketService::new(
        Arc::new(MemoryStore::new()),
        &store_settings(),
    ));

    let workers = (0..6)
        .map(|worker| {
            let service = service.clone();
            let repo = repo.clone();
            thread::spawn(move || -> Result<Vec<TicketId>> {
                let mut ids = Vec::new();
                for n in 0..4 {
                    let fields = NewTicket::new(format!("worker {worker} ticket {n}"));
                    ids.push(service.create(&repo, fields, "bot")?.id);
                }
                Ok(ids)
            })
        })
        .collect::<Vec<_>>();

    let mut ids = Vec::new();
    for worker in workers {
        ids.extend(worker.join().expect("worker panicked")?);
    }
    let distinct = ids.iter().copied().collect::<BTreeSet<_>>();
    assert_eq!(distinct.len(), 24);
    assert_eq!(distinct.first(), Some(&id(1)));
    assert_eq!(distinct.last(), Some(&id(24)));

    assert_eq!(service.list(&repo, &TicketFilter::new())?.len(), 24);
    assert_eq!(service.ids(&repo)?, distinct.into_iter().collect::<Vec<_>>());

    Ok(())
}

#[test]
fn external_concurrent_updates_keep_every_patch() -> Result<()> {
    let repo = store_repo();
    let service = Arc::new(ExternalTicketService::new(
        Arc::new(MemoryStore::new()),
        &store_settings(),
    ));
    let ticket = service.create(&repo, NewTicket::new("shared"), "alice")?;

    let workers = (0..4)
        .map(|worker| {
            let service = service.clone();
            let repo = repo.clone();
            thread::spawn(move || -> Result<()> {
                for n in 0..3 {
                    let patch = TicketPatch::new().label(format!("w{worker}-{n}"));
                    service.update(&repo, ticket.id, patch, &format!("worker{worker}"), None)?;
                }
                Ok(())
            })
        })
        .collect::<Vec<_>>();
    for worker in workers {
        worker.join().expect("worker panicked")?;
    }

    let ticket = service.get(&repo, ticket.id)?;
    assert_eq!(ticket.labels.len(), 12);
    assert_eq!(ticket.revision, 13);

    // INVARIANT: Store order may differ from seq order, but no seq repeats.
    let seqs = service
        .journal(&repo, ticket.id)?
        .iter()
        .map(|entry| entry.seq)
        .collect::<BTreeSet<_>>();
    assert_eq!(seqs, (1..=13).collect::<BTreeSet<_>>());

    Ok(())
}

#[test]
fn external_failed_append_writes_no_ticket() -> Result<()> {
    let repo = store_repo();
    let store = Arc::new(MemoryStore::new());
    let healthy = ExternalTicketService::new(store.clone(), &store_settings());
    let ticket = healthy.create(&repo, NewTicket::new("kept"), "alice")?;

    let broken = ExternalTicketService::new(
        Arc::new(DroppedJournal(store.clone())),
        &store_settings(),
    );
    assert!(matches!(
        broken.create(&repo, NewTicket::new("lost"), "alice"),
        Err(TicketError::Store(StoreError::Unavailable { .. }))
    ));
    assert!(matches!(
        broken.update(
            &repo,
            ticket.id,
            TicketPatch::new()
                .title("half written")
                .attach("dump.bin", b"partial".to_vec()),
            "bob",
            None,
        ),
        Err(TicketError::Store(StoreError::Unavailable { .. }))
    ));

    // Nothing of either failed write shows through the healthy client.
    assert_eq!(healthy.ids(&repo)?, vec![ticket.id]);
    let fetched = healthy.get(&repo, ticket.id)?;
    assert_eq!(fetched.title, "kept");
    assert_eq!(fetched.revision, 1);
    assert!(fetched.attachments.is_empty());
    assert!(matches!(
        healthy.attachment(&repo, ticket.id, "dump.bin"),
        Err(TicketError::AttachmentNotFound { .. })
    ));
    assert!(!store.keys().iter().any(|key| key.contains("::2::journal")));

    Ok(())
}
