//! dersync CLI
//!
//! Thin wrapper around dersync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show identity, device and remote
//! dersync info
//!
//! # Add a task
//! dersync task add "Buy groceries" --priority high --due 2026-11-01
//!
//! # List, edit and complete tasks
//! dersync task list
//! dersync task edit <record_id> --notes "oat milk"
//! dersync task done <record_id>
//!
//! # Share a task with someone
//! dersync grant <record_id> did:der:z... --write
//!
//! # Sync once, or stay running and sync on notices
//! dersync sync
//! dersync watch --interval 60
//! ```
//!
//! Task commands work offline. Commands that talk to the remote store need
//! `remote.url` in `<data_dir>/config.toml` or `DERSYNC_REMOTE_URL`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use dersync_core::config::default_data_dir;
use dersync_core::logging::JsonlLayer;
use dersync_core::sync::{
    BroadcastMedium, Delegation, DelegationScope, PushOutcome, RawEnvelope, RemoteStore,
    SealedEnvelope,
};
use dersync_core::{
    Collection, Did, EngineConfig, GossipMedium, HttpRemoteStore, LocalIdentity, Notifier,
    Permission, Priority, Record, RecordId, Storage, SyncContext, SyncEngine, SyncError,
    SyncOutcome, SyncReport, SyncResult, TaskState,
};
use tracing_subscriber::prelude::*;

/// dersync - Delegated Encrypted Record Sync
#[derive(Parser)]
#[command(name = "dersync")]
#[command(version)]
#[command(about = "dersync - encrypted personal tasks with delegated sharing")]
#[command(
    long_about = "Keeps a personal task list in sync across devices through an untrusted remote store that only ever sees ciphertext, and shares individual tasks with delegates."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.dersync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show identity, device and remote information
    Info,

    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Task management
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Run one sync pass
    Sync {
        /// Only sync this owner's records (default: every tracked owner)
        #[arg(long)]
        owner: Option<String>,
    },

    /// Share one of your tasks with a delegate
    Grant {
        /// Record ID
        record_id: String,
        /// Delegate DID
        delegate: String,
        /// Allow the delegate to edit (default: read only)
        #[arg(long)]
        write: bool,
    },

    /// Stop sharing one of your tasks with a delegate
    Revoke {
        /// Record ID
        record_id: String,
        /// Delegate DID
        delegate: String,
    },

    /// List delegations you have issued
    Delegations,

    /// Stay running: sync periodically and whenever a notice arrives
    Watch {
        /// Seconds between scheduled passes
        #[arg(short, long, default_value = "60")]
        interval: u64,

        /// Peer address to bootstrap the notice medium (JSON, as printed by watch)
        #[arg(long)]
        peer: Vec<String>,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show identity info
    Show,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Add a task
    Add {
        /// Task title
        title: String,
        #[arg(short, long)]
        notes: Option<String>,
        #[arg(short, long, value_enum)]
        priority: Option<PriorityArg>,
        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<String>,
        /// Tag (repeatable)
        #[arg(short, long)]
        tag: Vec<String>,
        #[arg(short, long, default_value = Collection::TASKS)]
        collection: String,
    },
    /// List visible tasks
    List {
        /// Owner DID (default: you)
        #[arg(long)]
        owner: Option<String>,
        #[arg(short, long, default_value = Collection::TASKS)]
        collection: String,
    },
    /// Show one task
    Show {
        record_id: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Edit a task
    Edit {
        record_id: String,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        title: Option<String>,
        #[arg(short, long)]
        notes: Option<String>,
        #[arg(short, long, value_enum)]
        state: Option<StateArg>,
        #[arg(short, long, value_enum)]
        priority: Option<PriorityArg>,
        /// Due date (YYYY-MM-DD)
        #[arg(long)]
        due: Option<String>,
    },
    /// Mark a task done
    Done {
        record_id: String,
        #[arg(long)]
        owner: Option<String>,
    },
    /// Delete a task (removed locally once the remote store confirms)
    Delete {
        record_id: String,
        #[arg(long)]
        owner: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StateArg {
    Inbox,
    Next,
    Waiting,
    Scheduled,
    Someday,
    Done,
}

impl From<StateArg> for TaskState {
    fn from(arg: StateArg) -> Self {
        match arg {
            StateArg::Inbox => TaskState::Inbox,
            StateArg::Next => TaskState::Next,
            StateArg::Waiting => TaskState::Waiting,
            StateArg::Scheduled => TaskState::Scheduled,
            StateArg::Someday => TaskState::Someday,
            StateArg::Done => TaskState::Done,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    None,
    Low,
    Medium,
    High,
    Urgent,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::None => Priority::None,
            PriorityArg::Low => Priority::Low,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::High => Priority::High,
            PriorityArg::Urgent => Priority::Urgent,
        }
    }
}

/// Stand-in remote for installations without `remote.url`.
struct Unconfigured;

impl Unconfigured {
    fn error() -> SyncError {
        SyncError::RemoteUnavailable("no remote store configured".into())
    }
}

#[async_trait]
impl RemoteStore for Unconfigured {
    async fn fetch(&self, _: &Did, _: &Collection, _: Option<u64>) -> SyncResult<Vec<RawEnvelope>> {
        Err(Self::error())
    }

    async fn push(&self, _: Vec<SealedEnvelope>) -> SyncResult<PushOutcome> {
        Err(Self::error())
    }

    async fn grant_delegate(&self, _: &DelegationScope, _: &Did, _: Permission) -> SyncResult<()> {
        Err(Self::error())
    }

    async fn revoke_delegate(&self, _: &DelegationScope, _: &Did) -> SyncResult<()> {
        Err(Self::error())
    }

    async fn list_delegations(&self, _: &Did) -> SyncResult<Vec<Delegation>> {
        Err(Self::error())
    }
}

/// Everything a command needs, opened from the data directory
struct App {
    config: EngineConfig,
    storage: Storage,
    ctx: SyncContext,
}

impl App {
    fn open(config: EngineConfig) -> Result<Self> {
        let storage = Storage::open(config.database_path())
            .with_context(|| format!("Failed to open store in {}", config.data_dir.display()))?;
        let identity: Arc<LocalIdentity> = Arc::new(storage.load_or_create_identity()?);
        let ctx = SyncContext::new(identity, storage.device_id()?);
        Ok(Self {
            config,
            storage,
            ctx,
        })
    }

    fn is_online(&self) -> bool {
        self.config.remote.url.is_some()
    }

    fn require_remote(&self) -> Result<()> {
        if !self.is_online() {
            anyhow::bail!(
                "No remote store configured. Set remote.url in {} or {}",
                self.config.data_dir.join(dersync_core::config::CONFIG_FILE).display(),
                dersync_core::config::REMOTE_URL_ENV
            );
        }
        Ok(())
    }

    fn remote(&self) -> Result<Arc<dyn RemoteStore>> {
        match &self.config.remote.url {
            Some(url) => Ok(Arc::new(HttpRemoteStore::new(
                url.clone(),
                self.ctx.identity.clone(),
                self.config.remote.request_timeout(),
            )?)),
            None => Ok(Arc::new(Unconfigured)),
        }
    }

    fn engine(&self) -> Result<SyncEngine> {
        Ok(SyncEngine::new(
            self.storage.clone(),
            self.remote()?,
            self.ctx.clone(),
            self.config.collection_tags(),
        ))
    }

    fn owner(&self, owner: Option<String>) -> Result<Did> {
        match owner {
            Some(s) => parse_did(&s),
            None => Ok(self.ctx.did()),
        }
    }
}

fn setup_logging(verbosity: u8, config: &EngineConfig) -> Result<()> {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let jsonl = match &config.logging.jsonl_dir {
        Some(dir) => Some(
            JsonlLayer::new(dir, config.device_name.clone())
                .with_context(|| format!("Failed to open log directory {}", dir.display()))?,
        ),
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .init();
    Ok(())
}

fn parse_did(s: &str) -> Result<Did> {
    Did::parse(s).map_err(|e| anyhow::anyhow!("Invalid DID '{}': {}", s, e))
}

/// Parse a YYYY-MM-DD date as midnight UTC, in unix milliseconds
fn parse_due(s: &str) -> Result<i64> {
    let date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| anyhow::anyhow!("Invalid date '{}' (expected YYYY-MM-DD): {}", s, e))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| anyhow::anyhow!("Invalid date '{}'", s))?;
    Ok(midnight.and_utc().timestamp_millis())
}

fn format_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn state_glyph(state: TaskState) -> &'static str {
    match state {
        TaskState::Done => "✓",
        TaskState::Next => "▸",
        TaskState::Waiting => "…",
        _ => "○",
    }
}

fn print_record(record: &Record) {
    let fields = &record.fields;
    println!("Task: {}", fields.title);
    println!("  ID: {}", record.record_id);
    println!("  Owner: {}", record.owner);
    println!("  Collection: {}", record.collection);
    println!("  State: {:?}", fields.state);
    println!("  Priority: {:?}", fields.priority);
    if !fields.notes.is_empty() {
        println!("  Notes: {}", fields.notes);
    }
    if !fields.tags.is_empty() {
        let tags: Vec<&str> = fields.tags.iter().map(String::as_str).collect();
        println!("  Tags: {}", tags.join(", "));
    }
    if let Some(due) = fields.schedule.due {
        println!("  Due: {}", format_millis(due));
    }
    println!("  Created: {}", format_millis(fields.created_at));
    println!("  Updated: {}", format_millis(fields.updated_at));
    println!("  Version: {}{}", record.version, if record.pending { " (pending)" } else { "" });
    for delegate in &record.grants.write {
        println!("  Shared (write): {}", delegate);
    }
    for delegate in &record.grants.read {
        println!("  Shared (read): {}", delegate);
    }
}

fn print_report(owner: &Did, outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Completed(report) => {
            println!("Synced {}: {}", owner.short(), report);
            print_problems(report);
        }
        SyncOutcome::Coalesced => println!("Synced {}: already running", owner.short()),
        SyncOutcome::Deferred(reason) => println!("Synced {}: deferred ({})", owner.short(), reason),
    }
}

fn print_problems(report: &SyncReport) {
    for record_id in &report.permission_denied {
        println!("  ! {}: no write permission", record_id);
    }
    for failure in &report.failures {
        let id = failure
            .record_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("  ! {} ({:?}): {}", id, failure.phase, failure.reason);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = EngineConfig::load(&data_dir)
        .with_context(|| format!("Failed to load config from {}", data_dir.display()))?;
    setup_logging(cli.verbose, &config)?;

    let app = App::open(config)?;

    match cli.command {
        Commands::Info => {
            let engine = app.engine()?;
            let me = engine.did();
            let own = engine.list_records(&me, &Collection::tasks())?.len();

            println!("dersync v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Identity:");
            println!("  DID: {}", me);
            println!();
            println!("Device:");
            println!("  Name: {}", app.config.device_name);
            println!("  ID: {}", app.ctx.device_id);
            println!();
            match &app.config.remote.url {
                Some(url) => println!("Remote: {}", url),
                None => println!("Remote: (offline, not configured)"),
            }
            println!("Collections: {}", app.config.collections.join(", "));
            println!("Data directory: {}", app.config.data_dir.display());
            println!("Tasks: {}", own);
            println!("Tracked owners: {}", engine.tracked_owners()?.len());
        }

        Commands::Identity { action } => match action {
            IdentityAction::Show => {
                let did = app.ctx.did();
                println!("Identity:");
                println!("  DID: {}", did);
                println!("  Short: {}", did.short());
            }
        },

        Commands::Task { action } => {
            let engine = app.engine()?;
            match action {
                TaskAction::Add {
                    title,
                    notes,
                    priority,
                    due,
                    tag,
                    collection,
                } => {
                    let mut fields = dersync_core::TaskFields::titled(title.clone());
                    if let Some(notes) = notes {
                        fields.notes = notes;
                    }
                    if let Some(priority) = priority {
                        fields.priority = priority.into();
                    }
                    if let Some(due) = due {
                        fields.schedule.due = Some(parse_due(&due)?);
                    }
                    fields.tags = tag.into_iter().collect();

                    let record = engine.create_record(Collection::new(collection), fields)?;
                    println!("Added task: {}", title);
                    println!("  ID: {}", record.record_id);
                }

                TaskAction::List { owner, collection } => {
                    let owner = app.owner(owner)?;
                    let mut records = engine.list_records(&owner, &Collection::new(collection))?;
                    records.sort_by_key(|r| r.fields.created_at);

                    if records.is_empty() {
                        println!("No tasks.");
                    } else {
                        println!("Tasks ({}):", records.len());
                        println!();
                        for record in records {
                            let pending = if record.pending { " *" } else { "" };
                            println!(
                                "  {} {} {}{}",
                                state_glyph(record.fields.state),
                                record.record_id,
                                record.fields.title,
                                pending
                            );
                        }
                    }
                }

                TaskAction::Show { record_id, owner } => {
                    let owner = app.owner(owner)?;
                    let id = RecordId::from_string(&record_id);
                    match engine.get_record(&owner, &id)? {
                        Some(record) if record.is_visible() => print_record(&record),
                        _ => anyhow::bail!("Task not found: {}", record_id),
                    }
                }

                TaskAction::Edit {
                    record_id,
                    owner,
                    title,
                    notes,
                    state,
                    priority,
                    due,
                } => {
                    let owner = app.owner(owner)?;
                    let due = due.as_deref().map(parse_due).transpose()?;
                    let record = engine.update_record(&owner, &RecordId::from_string(&record_id), |f| {
                        if let Some(title) = title {
                            f.title = title;
                        }
                        if let Some(notes) = notes {
                            f.notes = notes;
                        }
                        if let Some(state) = state {
                            f.state = state.into();
                        }
                        if let Some(priority) = priority {
                            f.priority = priority.into();
                        }
                        if let Some(due) = due {
                            f.schedule.due = Some(due);
                        }
                    })?;
                    println!("Updated task: {}", record.fields.title);
                }

                TaskAction::Done { record_id, owner } => {
                    let owner = app.owner(owner)?;
                    let record = engine.update_record(&owner, &RecordId::from_string(&record_id), |f| {
                        f.state = TaskState::Done
                    })?;
                    println!("Completed task: {}", record.fields.title);
                }

                TaskAction::Delete { record_id, owner } => {
                    let owner = app.owner(owner)?;
                    let record = engine.soft_delete(&owner, &RecordId::from_string(&record_id))?;
                    println!("Deleted task: {}", record.fields.title);
                }
            }
        }

        Commands::Sync { owner } => {
            app.require_remote()?;
            let engine = app.engine()?;
            let owners = match owner {
                Some(s) => vec![parse_did(&s)?],
                None => engine.tracked_owners()?,
            };
            for owner in owners {
                let outcome = engine.sync_once(&owner).await?;
                print_report(&owner, &outcome);
            }
        }

        Commands::Grant {
            record_id,
            delegate,
            write,
        } => {
            app.require_remote()?;
            let engine = app.engine()?;
            let delegate = parse_did(&delegate)?;
            let permission = if write { Permission::Write } else { Permission::Read };
            engine
                .grant(&RecordId::from_string(&record_id), &delegate, permission)
                .await?;
            println!("Granted {} access to {}", permission, delegate);
            println!("  Run `dersync sync` to seal a copy for them.");
        }

        Commands::Revoke { record_id, delegate } => {
            app.require_remote()?;
            let engine = app.engine()?;
            let delegate = parse_did(&delegate)?;
            engine
                .revoke(&RecordId::from_string(&record_id), &delegate)
                .await?;
            println!("Revoked access for {}", delegate);
        }

        Commands::Delegations => {
            app.require_remote()?;
            let engine = app.engine()?;
            let delegations = engine.delegations().await?;
            if delegations.is_empty() {
                println!("No delegations.");
            } else {
                println!("Delegations ({}):", delegations.len());
                println!();
                for d in delegations {
                    let scope = match &d.scope {
                        DelegationScope::Record { record_id, .. } => format!("record {}", record_id),
                        DelegationScope::Collection { collection, .. } => {
                            format!("collection {}", collection)
                        }
                    };
                    println!("  {} {} {}", d.permission, d.delegate, scope);
                }
            }
        }

        Commands::Watch { interval, peer } => {
            app.require_remote()?;
            run_watch(&app, Duration::from_secs(interval.max(1)), peer).await?;
        }
    }

    Ok(())
}

async fn run_watch(app: &App, interval: Duration, peers: Vec<String>) -> Result<()> {
    let medium = Arc::new(GossipMedium::bind(None).await?);
    for peer in peers {
        let addr: iroh::EndpointAddr = serde_json::from_str(&peer)
            .map_err(|e| anyhow::anyhow!("Invalid peer address '{}': {}", peer, e))?;
        medium.add_peer(addr);
    }

    let notifier = Notifier::new(
        app.ctx.clone(),
        medium.clone() as Arc<dyn BroadcastMedium>,
        app.config.notifier.min_publish_interval(),
    );
    let engine = Arc::new(app.engine()?.with_notifier(Arc::new(notifier)));

    println!("Watching as {}", engine.did());
    println!("  Endpoint: {}", serde_json::to_string(&medium.endpoint_addr())?);
    println!("  Interval: {}s", interval.as_secs());
    println!("Press Ctrl+C to stop.");

    let handles = engine.listen().await?;
    let periodic = Arc::clone(&engine).start_periodic_sync(interval);
    let mut events = engine.subscribe_events();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(dersync_core::SyncEvent::PassCompleted { owner, report }) if report.changed_local() || !report.is_clean() => {
                    println!("Synced {}: {}", owner.short(), report);
                    print_problems(&report);
                }
                Ok(dersync_core::SyncEvent::PassFailed { owner, error }) => {
                    println!("Sync of {} failed: {}", owner.short(), error);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "Event stream lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    println!("Stopping...");
    periodic.abort();
    drop(handles);
    drop(engine);
    match Arc::try_unwrap(medium) {
        Ok(medium) => medium.shutdown().await?,
        Err(_) => tracing::debug!("Medium still referenced, skipping graceful shutdown"),
    }
    Ok(())
}
