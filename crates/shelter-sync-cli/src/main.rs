// ============================================================================
// shelter-sync — CLI inspection tool for the driver offline queue
// ============================================================================
// Usage:
//   shelter-sync stats                     Show journal statistics
//   shelter-sync list [--kind KIND]        List pending actions (FIFO order)
//   shelter-sync export --format json      Export the journal as JSON
//   shelter-sync discard ID                Drop a pending action and revert it
//   shelter-sync clear-conflict ENTITY     Dismiss a conflict flag
//   shelter-sync clear                     Drop every journaled action and entity
//   shelter-sync sync                      Drain the queue against the API
// ============================================================================

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use shelter_sync_core::{
    ActionId, ActionKind, DrainOutcome, HttpRemoteApi, Ledger, QueueJournal, SyncConfig,
    SyncNotice, SyncSession,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Shelter driver sync queue tool
#[derive(Parser)]
#[command(name = "shelter-sync", version, about = "Inspect and drain the driver offline queue")]
struct Cli {
    /// Path to the journal file (default: ~/.shelter/sync.redb)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show journal statistics (pending actions, entities, conflicts)
    Stats,

    /// List pending actions with optional kind filter
    List {
        /// Filter by kind: update-status, upload-photo, update-availability, update-location
        #[arg(long)]
        kind: Option<String>,
    },

    /// Export full journal contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Remove a pending action and revert its optimistic change
    Discard {
        /// Action id as shown by `list`
        id: u64,
    },

    /// Dismiss the conflict flag on an entity
    ClearConflict {
        entity: String,
    },

    /// Drop every pending action and tracked entity from the journal
    Clear,

    /// Send pending actions to SHELTER_API_URL now
    Sync,
}

fn parse_kind(s: &str) -> Result<ActionKind> {
    ActionKind::from_str(s).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown kind '{}'. Valid values: update-status, upload-photo, update-availability, update-location",
            s
        )
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shelter_sync_core=info".parse()?)
                .add_directive("shelter_sync_cli=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = SyncConfig::load();
    if cli.db_path.is_some() {
        config.db_path = cli.db_path;
    }

    match cli.command {
        Commands::Stats => cmd_stats(&config),
        Commands::List { kind } => cmd_list(&config, kind),
        Commands::Export { format } => cmd_export(&config, &format),
        Commands::Discard { id } => cmd_discard(&config, id),
        Commands::ClearConflict { entity } => cmd_clear_conflict(&config, &entity),
        Commands::Clear => cmd_clear(&config),
        Commands::Sync => cmd_sync(&config).await,
    }
}

fn open_journal(config: &SyncConfig) -> Result<QueueJournal> {
    QueueJournal::open(config.db_path.as_deref())
}

fn cmd_stats(config: &SyncConfig) -> Result<()> {
    let journal = open_journal(config)?;
    let stats = journal.stats()?;

    println!("=== Shelter Sync Journal Stats ===");
    println!("Journal:   {}", journal.path().display());
    println!();
    println!("Pending:   {} actions", stats.pending_actions);
    let mut kinds: Vec<_> = stats.pending_by_kind.iter().collect();
    kinds.sort();
    for (kind, count) in kinds {
        println!("  {:20} {}", kind, count);
    }
    println!("Entities:  {}", stats.tracked_entities);
    println!("Conflicts: {}", stats.conflicted_entities);

    Ok(())
}

fn cmd_list(config: &SyncConfig, kind_filter: Option<String>) -> Result<()> {
    let filter = kind_filter.as_deref().map(parse_kind).transpose()?;
    let snapshot = open_journal(config)?.load()?;
    let actions: Vec<_> = snapshot
        .actions
        .iter()
        .filter(|a| filter.map_or(true, |k| a.kind == k))
        .collect();

    if actions.is_empty() {
        println!("No pending actions.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<20}  {:<16}  {:<22}  {}",
        "ID", "KIND", "TARGET", "QUEUED AT", "PAYLOAD"
    );
    println!("{}", "-".repeat(96));

    for action in &actions {
        let payload = action.payload.to_string().chars().take(30).collect::<String>();
        println!(
            "{:<6}  {:<20}  {:<16}  {:<22}  {}",
            action.id.0,
            action.kind,
            action.target_id.as_deref().unwrap_or("-"),
            action.enqueued_at.format("%Y-%m-%d %H:%M:%S UTC"),
            payload
        );
    }

    println!("\nTotal: {} actions", actions.len());
    Ok(())
}

fn cmd_export(config: &SyncConfig, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let journal = open_journal(config)?;
    let snapshot = journal.load()?;
    let stats = journal.stats()?;

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": stats,
        "next_action_id": snapshot.next_action_id,
        "actions": snapshot.actions,
        "entities": snapshot.entities,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn cmd_discard(config: &SyncConfig, id: u64) -> Result<()> {
    let mut ledger = Ledger::restore(open_journal(config)?, config.queue_capacity)?;
    let action = ledger.discard(ActionId(id))?;
    println!("Discarded {}", action.describe());
    Ok(())
}

fn cmd_clear_conflict(config: &SyncConfig, entity: &str) -> Result<()> {
    let mut ledger = Ledger::restore(open_journal(config)?, config.queue_capacity)?;
    if ledger.clear_conflict(entity) {
        println!("Conflict cleared for {}", entity);
    } else {
        println!("{} has no conflict", entity);
    }
    Ok(())
}

fn cmd_clear(config: &SyncConfig) -> Result<()> {
    let removed = open_journal(config)?.clear()?;
    println!("Cleared journal ({} pending actions dropped)", removed);
    Ok(())
}

async fn cmd_sync(config: &SyncConfig) -> Result<()> {
    let api = Arc::new(HttpRemoteApi::new(&config.api_url, config.api_token.clone()));
    let (tx, mut notices) = mpsc::unbounded_channel::<SyncNotice>();
    let session = SyncSession::open(config, api, Arc::new(tx), true)?;

    let pending = session.pending_count().await;
    if pending == 0 {
        println!("Nothing to sync.");
        return Ok(());
    }

    info!("Syncing {} pending actions to {}", pending, config.api_url);
    let report = session.sync_now().await;

    println!("Committed: {}", report.committed.len());
    println!("Discarded: {}", report.discarded.len());
    while let Ok(notice) = notices.try_recv() {
        println!("  ! {}", notice);
    }

    match report.outcome {
        DrainOutcome::Blocked { action_id, retry_in } => {
            let status = session.status().await;
            println!(
                "Blocked on {} ({} still pending); retry in {:?}",
                action_id, status.pending, retry_in
            );
            if let Some(reason) = blocked_reason(&status.state) {
                println!("  reason: {}", reason);
            }
        }
        DrainOutcome::Drained => println!("Queue drained."),
        DrainOutcome::AlreadyDraining => println!("Another sync is in progress."),
    }

    Ok(())
}

fn blocked_reason(state: &shelter_sync_core::SyncState) -> Option<&str> {
    match state {
        shelter_sync_core::SyncState::Blocked { reason, .. } => Some(reason),
        _ => None,
    }
}
