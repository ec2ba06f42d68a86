//! atomsync CLI
//!
//! Drives a local replica against a remote API: replays recorded inbound
//! messages, runs cold starts and inspects or maintains the store.

use anyhow::{Context, Result, anyhow};
use atomsync_client::{HttpRemote, InboundMessage, RemoteApi};
use atomsync_common::{AtomKey, AtomKind, ChangeSetId, SyncConfig, WorkspaceId};
use atomsync_engine::{SyncEngine, SyncEvent};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "atomsync-cli")]
#[command(about = "atomsync replica driver")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "./atomsync.toml")]
    config: PathBuf,

    /// Replica database file (overrides the config file)
    #[arg(long)]
    data: Option<PathBuf>,

    /// Remote API base URL (overrides the config file)
    #[arg(long)]
    api: Option<String>,

    /// Bearer token for the workspaces this run touches
    #[arg(long, env = "ATOMSYNC_TOKEN")]
    token: Option<String>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply newline-delimited JSON inbound messages from a file
    Ingest {
        file: PathBuf,
    },
    /// Resynchronize one change-set from the remote
    ColdStart {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        change_set: String,
    },
    /// Resynchronize every open change-set of a workspace, HEAD first
    ColdStartAll {
        #[arg(long)]
        workspace: String,
        /// Also resynchronize the deployment-scoped atoms
        #[arg(long)]
        deployment: bool,
    },
    /// Print one atom with its references expanded
    Get {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        change_set: String,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        id: String,
    },
    /// Print every atom of a change-set, one JSON object per line
    Dump {
        #[arg(long)]
        change_set: String,
    },
    /// Drop unreferenced indexes and atoms
    Gc,
    /// Tear down a change-set, optionally cold starting it again
    Ragnarok {
        #[arg(long)]
        workspace: String,
        #[arg(long)]
        change_set: String,
        #[arg(long)]
        restart: bool,
    },
}

fn load_config(args: &Args) -> Result<SyncConfig> {
    let mut config: SyncConfig = if Path::new(&args.config).exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&text).unwrap_or_else(|e| {
            eprintln!("Warning: Failed to parse config file: {e}");
            SyncConfig::default()
        })
    } else {
        SyncConfig::default()
    };

    // CLI takes precedence
    if let Some(data) = &args.data {
        config.store.path.clone_from(data);
    }
    if let Some(api) = &args.api {
        config.remote.base_url.clone_from(api);
    }
    Ok(config)
}

/// Log events while the command runs
fn spawn_event_logger(mut events: mpsc::UnboundedReceiver<SyncEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SyncEvent::LeaseLost { holder } => warn!(holder = %holder, "writer lease lost"),
                SyncEvent::ColdStartFinished {
                    workspace_id,
                    change_set_id,
                    outcome,
                } => info!(
                    workspace = %workspace_id,
                    change_set = ?change_set_id,
                    outcome = ?outcome,
                    "cold start finished"
                ),
                other => debug!(event = ?other, "sync event"),
            }
        }
    });
}

struct Bearer<'a> {
    engine: &'a SyncEngine,
    token: Option<&'a str>,
    applied: HashSet<WorkspaceId>,
}

impl Bearer<'_> {
    fn apply(&mut self, workspace: &WorkspaceId) {
        if let Some(token) = self.token
            && self.applied.insert(workspace.clone())
        {
            self.engine.set_bearer(workspace, token);
        }
    }
}

async fn ingest(engine: &SyncEngine, bearer: &mut Bearer<'_>, file: &Path) -> Result<()> {
    let text =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match InboundMessage::parse(line) {
            Ok(message) => {
                if let Some(pair) = message.pair() {
                    bearer.apply(&pair.workspace_id);
                }
                engine.handle_message(message)?;
                accepted += 1;
            }
            Err(e) => {
                warn!(line = line_no + 1, error = %e, "skipping undecodable message");
                rejected += 1;
            }
        }
    }
    engine.wait_idle().await;
    println!("Ingested {accepted} messages ({rejected} rejected)");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    if let Some(parent) = config.store.path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    info!(store = %config.store.path.display(), api = %config.remote.base_url, "opening replica");

    let remote: Arc<dyn RemoteApi> = Arc::new(HttpRemote::new(&config.remote)?);
    let (engine, events) = SyncEngine::open(config, remote)?;
    spawn_event_logger(events);
    let mut bearer = Bearer {
        engine: &engine,
        token: args.token.as_deref(),
        applied: HashSet::new(),
    };

    let result = run(&engine, &mut bearer, args.command).await;
    drop(bearer);
    engine.shutdown().await?;
    result
}

async fn run(engine: &SyncEngine, bearer: &mut Bearer<'_>, command: Commands) -> Result<()> {
    match command {
        Commands::Ingest { file } => ingest(engine, bearer, &file).await?,
        Commands::ColdStart {
            workspace,
            change_set,
        } => {
            let workspace = WorkspaceId::new(workspace);
            bearer.apply(&workspace);
            let outcome = engine.cold_start(&workspace, &ChangeSetId::new(change_set)).await;
            println!("{outcome:?}");
        }
        Commands::ColdStartAll {
            workspace,
            deployment,
        } => {
            let workspace = WorkspaceId::new(workspace);
            bearer.apply(&workspace);
            if deployment {
                println!("deployment: {:?}", engine.deployment_cold_start(&workspace).await);
            }
            for (change_set, outcome) in engine.cold_start_workspace(&workspace).await? {
                println!("{change_set}: {outcome:?}");
            }
        }
        Commands::Get {
            workspace,
            change_set,
            kind,
            id,
        } => {
            let workspace = WorkspaceId::new(workspace);
            bearer.apply(&workspace);
            let kind: AtomKind = kind.parse()?;
            let key = AtomKey::new(kind, id);
            match engine.get(&workspace, &ChangeSetId::new(change_set), &key)? {
                Some(document) => println!("{}", serde_json::to_string_pretty(&document)?),
                None => {
                    // the miss fired a hammer; let it land before exiting
                    engine.wait_idle().await;
                    return Err(anyhow!("{key} not present yet"));
                }
            }
        }
        Commands::Dump { change_set } => {
            let dump = engine.dump_change_set(&ChangeSetId::new(change_set))?;
            eprintln!("{} -> {}", dump.change_set.id, dump.change_set.index_checksum);
            for atom in dump.atoms {
                let document = atom.to_value()?;
                let line = json!({
                    "kind": atom.kind.as_str(),
                    "id": atom.id,
                    "checksum": atom.checksum,
                    "document": document,
                });
                println!("{line}");
            }
        }
        Commands::Gc => {
            let report = engine.collect_garbage()?;
            println!(
                "Removed {} indexes and {} atoms",
                report.indexes_removed, report.atoms_removed
            );
        }
        Commands::Ragnarok {
            workspace,
            change_set,
            restart,
        } => {
            let workspace = WorkspaceId::new(workspace);
            bearer.apply(&workspace);
            let (report, outcome) = engine
                .ragnarok(&workspace, &ChangeSetId::new(change_set), restart)
                .await?;
            println!(
                "Removed {} indexes, {} atoms, {} weak references",
                report.indexes_removed, report.atoms_removed, report.weak_references_removed
            );
            if let Some(outcome) = outcome {
                println!("{outcome:?}");
            }
        }
    }
    Ok(())
}
