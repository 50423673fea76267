use std::sync::Arc;

use anyhow::Context;
use drivemirrord::analyzer::DuplicateAnalyzer;
use drivemirrord::config::DaemonConfig;
use drivemirrord::context::DriveContext;
use drivemirrord::logging::init_tracing;
use drivemirrord::organize::engine::{OrganizeRequest, OrganizerEngine};
use drivemirrord::sync::engine::{SyncEngine, SyncEvent, SyncOutcome};
use drivemirrord::sync::index::MirrorStore;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const USAGE: &str = "Usage: drivemirrord [COMMAND]

Commands:
  sync                                   Mirror remote changes into the local database (default)
  stats                                  Print item and duplicate totals
  duplicates                             Print duplicate groups, largest first
  organize <folder-id> <start> <end>     File a folder's children into YYYY/MM subfolders
           [--dry-run]                   Only report planned moves
  reset                                  Forget the mirror and the sync cursor
  --help, -h                             Show this help";

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Sync,
    Stats,
    Duplicates,
    Organize(OrganizeRequest),
    Reset,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(command) = args.next() else {
        return Ok(CliMode::Sync);
    };
    let rest: Vec<String> = args.collect();
    let mode = match command.as_str() {
        "--help" | "-h" => return Ok(CliMode::Help),
        "sync" => CliMode::Sync,
        "stats" => CliMode::Stats,
        "duplicates" => CliMode::Duplicates,
        "reset" => CliMode::Reset,
        "organize" => return parse_organize(&rest).map(CliMode::Organize),
        other => anyhow::bail!("unknown command: {other}"),
    };
    if let Some(extra) = rest.first() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(mode)
}

fn parse_organize(args: &[String]) -> anyhow::Result<OrganizeRequest> {
    let mut dry_run = false;
    let mut positional = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            other if other.starts_with("--") => anyhow::bail!("unknown argument: {other}"),
            other => positional.push(other),
        }
    }
    let [folder, start, end] = positional.as_slice() else {
        anyhow::bail!("organize expects <folder-id> <start-year> <end-year>");
    };
    Ok(OrganizeRequest {
        source_folder_id: folder.to_string(),
        start_year: start
            .parse()
            .with_context(|| format!("invalid start year: {start}"))?,
        end_year: end
            .parse()
            .with_context(|| format!("invalid end year: {end}"))?,
        dry_run,
    })
}

#[derive(Serialize)]
struct StatsView {
    items: u64,
    total_size: u64,
    duplicate_groups: u64,
    wasted_bytes: u64,
    mismatched_groups: u64,
    has_cursor: bool,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode output")?
    );
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping at the next checkpoint");
            trigger.cancel();
        }
    });
    cancel
}

async fn run(mode: CliMode, config: &DaemonConfig, store: Arc<MirrorStore>) -> anyhow::Result<()> {
    match mode {
        CliMode::Help => Ok(()),
        CliMode::Stats => {
            let stats = DuplicateAnalyzer::new(store.clone()).stats().await?;
            print_json(&StatsView {
                items: store.get_item_count().await?,
                total_size: store.get_total_size().await?,
                duplicate_groups: stats.group_count,
                wasted_bytes: stats.wasted_bytes,
                mismatched_groups: stats.mismatched_groups,
                has_cursor: store.get_cursor().await?.is_some(),
            })
        }
        CliMode::Duplicates => {
            let report = DuplicateAnalyzer::new(store).report().await?;
            print_json(&report)
        }
        CliMode::Reset => {
            store.clear_all().await?;
            info!("mirror cleared");
            Ok(())
        }
        CliMode::Sync => {
            let client = config.build_client()?;
            let context = DriveContext::new(Arc::new(client), store);
            let (tx, mut rx) = mpsc::unbounded_channel();
            let engine = SyncEngine::new(&context).with_progress(tx);
            let progress = tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if let SyncEvent::PageCommitted { processed, .. } = event {
                        info!(processed, "sync progress");
                    }
                }
            });

            let outcome = engine.run(&cancel_on_ctrl_c()).await.context("sync failed");
            drop(engine);
            let _ = progress.await;
            match outcome? {
                SyncOutcome::AlreadyRunning => Ok(()),
                SyncOutcome::Completed(summary) | SyncOutcome::Cancelled(summary) => {
                    print_json(&summary)
                }
            }
        }
        CliMode::Organize(request) => {
            let client = config.build_client()?;
            let context = DriveContext::new(Arc::new(client), store);
            let engine = OrganizerEngine::new(&context).with_page_size(config.page_size);
            let summary = engine
                .organize(&request, &cancel_on_ctrl_c())
                .await
                .context("organize failed")?;
            print_json(&summary)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("{USAGE}");
        return Ok(());
    }
    init_tracing();

    let config = DaemonConfig::from_env()?;
    let store = MirrorStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open mirror database {}", config.db_path.display()))?;
    let store = Arc::new(store);
    let result = run(mode, &config, store.clone()).await;
    store.close().await;
    result
}
