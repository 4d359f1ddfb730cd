// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use ticketry::{
    config::Config,
    git::{GitRepository, RepositoryHandle},
    path::default_config_file,
    open_service,
    ticket::{Priority, TicketKind, TicketOrder},
    NewTicket, Status, Ticket, TicketFilter, TicketId, TicketPatch, TicketService,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{fs, path::PathBuf, process::exit, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  ticketry [options] <ticketry-command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Path to configuration file.
    #[arg(long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let config = match &self.command {
            Command::InitConfig(_) => Config::default(),
            _ => load_config(self.config.clone())?,
        };

        match self.command {
            Command::InitConfig(opts) => run_init_config(self.config, opts),
            Command::Repos => run_repos(&config),
            Command::LastChange(opts) => run_last_change(&config, opts),
            Command::Diff(opts) => run_diff(&config, opts),
            Command::Create(opts) => run_create(&config, opts),
            Command::Show(opts) => run_show(&config, opts),
            Command::Update(opts) => run_update(&config, opts),
            Command::List(opts) => run_list(&config, opts),
            Command::Journal(opts) => run_journal(&config, opts),
            Command::Delete(opts) => run_delete(&config, opts),
            Command::Reset(opts) => run_reset(&config, opts),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Write default configuration file.
    #[command(override_usage = "ticketry init-config [options]")]
    InitConfig(InitConfigOptions),

    /// List repositories found under configured root.
    #[command(override_usage = "ticketry repos [options]")]
    Repos,

    /// Show timestamp of newest commit in repository.
    #[command(override_usage = "ticketry last-change [options] <repo>")]
    LastChange(RepoOptions),

    /// Show changes introduced by a commit.
    #[command(override_usage = "ticketry diff [options] <repo> [<rev>]")]
    Diff(DiffOptions),

    /// Open new ticket.
    #[command(override_usage = "ticketry create [options] <repo> <title>")]
    Create(CreateOptions),

    /// Show ticket.
    #[command(override_usage = "ticketry show [options] <repo> <id>")]
    Show(TicketOptions),

    /// Change ticket fields or comment on it.
    #[command(override_usage = "ticketry update [options] <repo> <id>")]
    Update(UpdateOptions),

    /// List tickets of repository.
    #[command(override_usage = "ticketry list [options] <repo>")]
    List(ListOptions),

    /// Show raw journal of ticket.
    #[command(override_usage = "ticketry journal [options] <repo> <id>")]
    Journal(TicketOptions),

    /// Mark ticket deleted.
    #[command(override_usage = "ticketry delete [options] <repo> <id>")]
    Delete(TicketOptions),

    /// Discard every ticket of repository.
    #[command(override_usage = "ticketry reset [options] <repo> --yes")]
    Reset(ResetOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct InitConfigOptions {
    /// Overwrite existing configuration file.
    #[arg(short, long)]
    pub force: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RepoOptions {
    /// Repository name relative to root.
    #[arg(required = true, value_name = "repo")]
    pub repo: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct DiffOptions {
    /// Repository name relative to root.
    #[arg(required = true, value_name = "repo")]
    pub repo: String,

    /// Revision to diff against its first parent.
    #[arg(default_value = "HEAD", value_name = "rev")]
    pub rev: String,

    /// Lines of context around each change.
    #[arg(short = 'U', long, default_value_t = 3, value_name = "lines")]
    pub context: u32,

    /// Print full patch text, not just a summary.
    #[arg(short, long)]
    pub patch: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CreateOptions {
    /// Repository name relative to root.
    #[arg(required = true, value_name = "repo")]
    pub repo: String,

    /// Ticket title.
    #[arg(required = true, value_name = "title")]
    pub title: String,

    /// Longer description of the ticket.
    #[arg(short, long, value_name = "text")]
    pub description: Option<String>,

    /// Kind of ticket, e.g., bug or task.
    #[arg(short, long, value_name = "kind")]
    pub kind: Option<TicketKind>,

    /// Ticket priority.
    #[arg(short, long, value_name = "priority")]
    pub priority: Option<Priority>,

    /// Milestone to target.
    #[arg(short, long, value_name = "milestone")]
    pub milestone: Option<String>,

    /// Party responsible for the ticket.
    #[arg(short, long, value_name = "who")]
    pub responsible: Option<String>,

    /// Labels to attach.
    #[arg(short, long, value_name = "label")]
    pub label: Vec<String>,

    /// Author recorded in the journal.
    #[arg(short, long, value_name = "who", default_value_t = default_author())]
    pub author: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct TicketOptions {
    /// Repository name relative to root.
    #[arg(required = true, value_name = "repo")]
    pub repo: String,

    /// Ticket id.
    #[arg(required = true, value_name = "id")]
    pub id: TicketId,

    /// Author recorded in the journal.
    #[arg(short, long, value_name = "who", default_value_t = default_author())]
    pub author: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct UpdateOptions {
    /// Repository name relative to root.
    #[arg(required = true, value_name = "repo")]
    pub repo: String,

    /// Ticket id.
    #[arg(required = true, value_name = "id")]
    pub id: TicketId,

    /// New title.
    #[arg(short, long, value_name = "title")]
    pub title: Option<String>,

    /// New status.
    #[arg(short, long, value_name = "status")]
    pub status: Option<Status>,

    /// New milestone.
    #[arg(short, long, value_name = "milestone")]
    pub milestone: Option<String>,

    /// New responsible party.
    #[arg(short, long, value_name = "who")]
    pub responsible: Option<String>,

    /// Labels to add.
    #[arg(short, long, value_name = "label")]
    pub label: Vec<String>,

    /// Labels to remove.
    #[arg(short, long, value_name = "label")]
    pub unlabel: Vec<String>,

    /// Files to attach.
    #[arg(short = 'f', long, value_name = "path")]
    pub attach: Vec<PathBuf>,

    /// Comment to leave.
    #[arg(short, long, value_name = "text")]
    pub comment: Option<String>,

    /// Replace text of an earlier comment, given as `<id>=<text>`.
    #[arg(long, value_name = "id=text", value_parser = parse_comment_edit)]
    pub edit_comment: Vec<(u64, String)>,

    /// Retract an earlier comment.
    #[arg(long, value_name = "id")]
    pub delete_comment: Vec<u64>,

    /// Author recorded in the journal.
    #[arg(short, long, value_name = "who", default_value_t = default_author())]
    pub author: String,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ListOptions {
    /// Repository name relative to root.
    #[arg(required = true, value_name = "repo")]
    pub repo: String,

    /// Only list tickets with these statuses.
    #[arg(short, long, value_name = "status")]
    pub status: Vec<Status>,

    /// Only list tickets that are not closed.
    #[arg(long, conflicts_with = "status")]
    pub active: bool,

    /// Only list tickets targeting milestone.
    #[arg(short, long, value_name = "milestone")]
    pub milestone: Option<String>,

    /// Only list tickets with a label matching glob.
    #[arg(short, long, value_name = "glob")]
    pub label: Option<String>,

    /// Only list tickets assigned to party.
    #[arg(short, long, value_name = "who")]
    pub responsible: Option<String>,

    /// List newest tickets first.
    #[arg(long)]
    pub newest: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct ResetOptions {
    /// Repository name relative to root.
    #[arg(required = true, value_name = "repo")]
    pub repo: String,

    /// Confirm irreversible removal of every ticket.
    #[arg(long)]
    pub yes: bool,
}

#[tokio::main]
async fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run().await {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    tokio::task::spawn_blocking(move || cli.run()).await?
}

fn default_author() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anonymous".into())
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let explicit = path.is_some();
    let path = match path {
        Some(path) => path,
        None => default_config_file()?,
    };

    if !explicit && !path.exists() {
        return Ok(Config::default());
    }

    let data = fs::read_to_string(&path)
        .with_context(|| format!("cannot read configuration {:?}", path.display()))?;
    Ok(data.parse()?)
}

fn locate(config: &Config, repo: &str) -> Result<RepositoryHandle> {
    Ok(RepositoryHandle::locate(&config.repositories.root, repo)?)
}

// INVARIANT: Never swap in another backend than the one configured.
//   - The command line carries no store client, so an external backend
//     fails loudly here instead of writing into Git.
fn service(config: &Config) -> Result<Arc<dyn TicketService>> {
    Ok(open_service(&config.tickets, None)?)
}

fn run_init_config(path: Option<PathBuf>, opts: InitConfigOptions) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => default_config_file()?,
    };
    if path.exists() && !opts.force {
        anyhow::bail!("configuration {:?} already exists", path.display());
    }

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        mkdirp::mkdirp(parent)?;
    }
    fs::write(&path, Config::default().to_string())?;
    info!("wrote default configuration to {:?}", path.display());

    Ok(())
}

fn run_repos(config: &Config) -> Result<()> {
    for repo in &config.repositories.scan()? {
        let mut flags = Vec::new();
        if repo.bare {
            flags.push("bare");
        }
        if repo.exported {
            flags.push("exported");
        }
        println!("{}\t{}", repo.name, flags.join(","));
    }

    Ok(())
}

fn run_last_change(config: &Config, opts: RepoOptions) -> Result<()> {
    let handle = locate(config, &opts.repo)?;
    let git = GitRepository::open(&handle.path)?;
    println!("{}", git.last_change()?.to_rfc3339());

    Ok(())
}

fn run_diff(config: &Config, opts: DiffOptions) -> Result<()> {
    let handle = locate(config, &opts.repo)?;
    let git = GitRepository::open(&handle.path)?;
    let commit = git.resolve_ref(&opts.rev)?;
    let diff = git.diff_commit(commit.id, opts.context)?;

    println!("commit {}", diff.commit);
    for change in &diff.changes {
        match &change.old_path {
            Some(old) => println!(
                "{}\t{} -> {}\t+{} -{}",
                change.kind, old, change.path, change.insertions, change.deletions
            ),
            None => println!(
                "{}\t{}\t+{} -{}",
                change.kind, change.path, change.insertions, change.deletions
            ),
        }
    }

    if opts.patch {
        for text in diff.changes.iter().filter_map(|change| change.patch.as_deref()) {
            print!("{text}");
        }
    }

    Ok(())
}

fn run_create(config: &Config, opts: CreateOptions) -> Result<()> {
    let handle = locate(config, &opts.repo)?;
    let mut fields = NewTicket::new(opts.title);
    fields.description = opts.description.unwrap_or_default();
    fields.kind = opts.kind.unwrap_or_default();
    fields.priority = opts.priority.unwrap_or_default();
    fields.milestone = opts.milestone;
    fields.responsible = opts.responsible;
    fields.labels.extend(opts.label);

    let ticket = service(config)?.create(&handle, fields, &opts.author)?;
    println!("created ticket #{}", ticket.id);

    Ok(())
}

fn run_show(config: &Config, opts: TicketOptions) -> Result<()> {
    let handle = locate(config, &opts.repo)?;
    let ticket = service(config)?.get(&handle, opts.id)?;
    print_ticket(&ticket);

    Ok(())
}

fn run_update(config: &Config, opts: UpdateOptions) -> Result<()> {
    let handle = locate(config, &opts.repo)?;
    let mut patch = TicketPatch::new();
    if let Some(title) = opts.title {
        patch = patch.title(title);
    }
    if let Some(status) = opts.status {
        patch = patch.status(status);
    }
    if let Some(milestone) = opts.milestone {
        patch = patch.milestone(Some(milestone).filter(|m| !m.is_empty()));
    }
    if let Some(who) = opts.responsible {
        patch = patch.responsible(Some(who).filter(|w| !w.is_empty()));
    }
    for label in opts.label {
        patch = patch.label(label);
    }
    for label in opts.unlabel {
        patch = patch.unlabel(label);
    }
    for path in opts.attach {
        let name = path
            .file_name()
            .with_context(|| format!("{:?} has no file name", path.display()))?
            .to_string_lossy()
            .into_owned();
        let content =
            fs::read(&path).with_context(|| format!("cannot read {:?}", path.display()))?;
        patch = patch.attach(name, content);
    }

    for (id, text) in opts.edit_comment {
        patch = patch.edit_comment(id, text);
    }
    for id in opts.delete_comment {
        patch = patch.delete_comment(id);
    }

    if patch.is_empty() && opts.comment.is_none() {
        anyhow::bail!("nothing to update");
    }

    let ticket = service(config)?.update(
        &handle,
        opts.id,
        patch,
        &opts.author,
        opts.comment.as_deref(),
    )?;
    print_ticket(&ticket);

    Ok(())
}

fn run_list(config: &Config, opts: ListOptions) -> Result<()> {
    let handle = locate(config, &opts.repo)?;
    let mut filter = TicketFilter::new();
    filter.statuses = opts.status;
    if opts.active {
        filter = filter.active();
    }
    if let Some(milestone) = opts.milestone {
        filter = filter.milestone(milestone);
    }
    if let Some(label) = opts.label {
        filter = filter.label(&label)?;
    }
    if let Some(who) = opts.responsible {
        filter = filter.responsible(who);
    }
    if opts.newest {
        filter = filter.order(TicketOrder::CreatedDescending);
    }

    for ticket in service(config)?.list(&handle, &filter)? {
        println!("#{}\t{}\t{}", ticket.id, ticket.status, ticket.title);
    }

    Ok(())
}

fn run_journal(config: &Config, opts: TicketOptions) -> Result<()> {
    let handle = locate(config, &opts.repo)?;
    for entry in service(config)?.journal(&handle, opts.id)? {
        println!("{}", entry.to_json()?);
    }

    Ok(())
}

fn run_delete(config: &Config, opts: TicketOptions) -> Result<()> {
    let handle = locate(config, &opts.repo)?;
    service(config)?.delete(&handle, opts.id, &opts.author)?;

    Ok(())
}

fn run_reset(config: &Config, opts: ResetOptions) -> Result<()> {
    if !opts.yes {
        anyhow::bail!("refusing to discard every ticket of {} without --yes", opts.repo);
    }

    let handle = locate(config, &opts.repo)?;
    let discarded = service(config)?.delete_all(&handle)?;
    println!("discarded {discarded} tickets");

    Ok(())
}

fn parse_comment_edit(value: &str) -> Result<(u64, String)> {
    let (id, text) = value
        .split_once('=')
        .with_context(|| format!("expected <id>=<text>, got {value:?}"))?;
    let id = id
        .trim()
        .parse::<u64>()
        .with_context(|| format!("bad comment id {id:?}"))?;

    Ok((id, text.to_string()))
}

fn print_ticket(ticket: &Ticket) {
    println!("#{} {}", ticket.id, ticket.title);
    println!("status:      {}", ticket.status);
    println!("kind:        {}", ticket.kind);
    if let Some(milestone) = &ticket.milestone {
        println!("milestone:   {milestone}");
    }
    if let Some(who) = &ticket.responsible {
        println!("responsible: {who}");
    }
    if !ticket.labels.is_empty() {
        let labels = ticket.labels.iter().cloned().collect::<Vec<_>>();
        println!("labels:      {}", labels.join(", "));
    }
    for attachment in ticket.attachments.values() {
        println!("attachment:  {} ({} bytes)", attachment.name, attachment.size);
    }
    println!(
        "opened by {} at {}",
        ticket.created_by,
        ticket.created_at.to_rfc3339()
    );
    if !ticket.description.is_empty() {
        println!("\n{}", ticket.description);
    }
    for comment in ticket.comments.iter().filter(|comment| !comment.deleted) {
        let edited = match &comment.edited_by {
            Some(who) => format!(" (edited by {who})"),
            None => String::new(),
        };
        println!(
            "\n[{}] {} at {}{edited}:\n{}",
            comment.seq,
            comment.author,
            comment.timestamp.to_rfc3339(),
            comment.text
        );
    }
}
