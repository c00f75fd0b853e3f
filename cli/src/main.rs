// reliefmesh: command-line front end for the ReliefMesh core
//
// Identity and pre-key bundle management, config, persisted queue status,
// and an in-process mesh simulation over the local hub transport.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use parking_lot::Mutex;
use reliefmesh_core::message::HelpPayload;
use reliefmesh_core::scheduler::ManualDeviceMonitor;
use reliefmesh_core::store::{SledStorage, StorageBackend};
use reliefmesh_core::{
    Clock, IdentityKeys, IdentityStore, LocalHub, ManualClock, MeshConfig, MeshRouter,
    PreKeyBundle, SystemClock,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "reliefmesh")]
#[command(about = "ReliefMesh: offline mesh messaging for disaster response", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Write logs to a daily rolling file in this directory instead of stderr
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new identity (or show the existing one)
    Init {
        /// Display name shown next to this node's id
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Show identity information
    Identity,
    /// Export this node's pre-key bundle, or verify someone else's
    Bundle {
        /// Base58 bundle to verify instead of exporting ours
        #[arg(long)]
        verify: Option<String>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show persisted queue, dedup and session state
    Status,
    /// Relay a help request down a simulated chain of phones
    Simulate {
        /// Nodes in the chain
        #[arg(short, long)]
        nodes: Option<usize>,
        /// Battery percentage reported by every node
        #[arg(short, long)]
        battery: Option<u8>,
        /// Note attached to the help request
        #[arg(long, default_value = "trapped under rubble, two people")]
        help_note: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _guard = init_logging(cli.json_logs, cli.log_dir.as_deref(), &config.log_level)?;

    match cli.command {
        Commands::Init { name } => cmd_init(&config, name),
        Commands::Identity => cmd_identity(&config),
        Commands::Bundle { verify } => cmd_bundle(&config, verify),
        Commands::Config { action } => cmd_config(config, action),
        Commands::Status => cmd_status(&config),
        Commands::Simulate {
            nodes,
            battery,
            help_note,
        } => {
            let nodes = nodes.unwrap_or(config.simulate.nodes);
            let battery = battery.unwrap_or(config.simulate.battery);
            cmd_simulate(&config, nodes, battery, help_note).await
        }
    }
}

fn init_logging(json: bool, log_dir: Option<&Path>, default_level: &str) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let guard = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "reliefmesh.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            let installed = if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            installed.map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;
            Some(guard)
        }
        None => {
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr);
            let installed = if json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            installed.map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))?;
            None
        }
    };
    Ok(guard)
}

fn open_storage(config: &config::Config) -> Result<Arc<dyn StorageBackend>> {
    let path = config.storage_dir()?;
    let storage = SledStorage::open(&path)
        .with_context(|| format!("Failed to open storage at {}", path.display()))?;
    Ok(Arc::new(storage))
}

fn load_identity(backend: &Arc<dyn StorageBackend>) -> Result<IdentityKeys> {
    IdentityStore::persistent(backend.clone())
        .load_keys()?
        .context("No identity yet. Run `reliefmesh init` first")
}

fn print_identity(keys: &IdentityKeys, nickname: Option<&str>) {
    if let Some(nickname) = nickname {
        println!("  Name:       {}", nickname.bold());
    }
    println!("  ID:         {}", keys.identity_id().bright_cyan());
    println!("  Public Key: {}", keys.public_key_hex().bright_yellow());
}

fn cmd_init(config: &config::Config, name: Option<String>) -> Result<()> {
    println!("{}", "Initializing ReliefMesh...".bold());
    println!();

    println!("  {} Configuration", "✓".green());
    let storage_dir = config.storage_dir()?;
    println!("  {} Storage: {}", "✓".green(), storage_dir.display());

    let backend = open_storage(config)?;
    let store = IdentityStore::persistent(backend);
    let keys = store
        .load_or_generate()
        .context("Failed to initialize identity")?;
    if let Some(name) = &name {
        store.save_nickname(name)?;
    }
    let nickname = store.load_nickname()?;
    info!(identity = %keys.identity_id(), "identity ready");
    println!("  {} Identity ready", "✓".green());
    println!();

    println!("{}", "Identity Information:".bold());
    print_identity(&keys, nickname.as_deref());
    println!();

    println!("{}", "Next steps:".bold());
    println!("  • Share your bundle: {}", "reliefmesh bundle".bright_green());
    println!("  • Try the mesh:      {}", "reliefmesh simulate --nodes 5".bright_green());

    Ok(())
}

fn cmd_identity(config: &config::Config) -> Result<()> {
    let backend = open_storage(config)?;
    let keys = load_identity(&backend)?;
    let nickname = IdentityStore::persistent(backend).load_nickname()?;

    println!("{}", "Identity Information".bold());
    print_identity(&keys, nickname.as_deref());
    println!(
        "  Stored in:  {}",
        config.storage_dir()?.display().to_string().bright_cyan()
    );
    Ok(())
}

fn cmd_bundle(config: &config::Config, verify: Option<String>) -> Result<()> {
    if let Some(text) = verify {
        let bundle = PreKeyBundle::from_base58(text.trim()).context("Not a valid bundle")?;
        bundle.verify().context("Bundle signature does not verify")?;
        println!("{} Bundle verified", "✓".green());
        println!("  Identity: {}", bundle.identity_hex().bright_yellow());
        return Ok(());
    }

    let backend = open_storage(config)?;
    let keys = load_identity(&backend)?;
    let encoded = keys.prekey_bundle().to_base58()?;

    println!("{}", "Pre-key bundle (share out of band, e.g. as a QR code):".bold());
    println!("{}", encoded);
    Ok(())
}

fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} {} = {}", "✓".green(), key, value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown or unset config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:<22} {}", key, value.bright_cyan());
            }
            println!();
            println!("  File: {}", config::Config::config_file()?.display());
        }
    }
    Ok(())
}

fn cmd_status(config: &config::Config) -> Result<()> {
    let backend = open_storage(config)?;
    let keys = load_identity(&backend)?;
    let router = MeshRouter::builder(keys)
        .config(config.mesh_config()?)
        .storage(backend)
        .build()?;

    let queue = router.get_queue_stats();
    let dedup = router.get_dedup_stats();
    let threads = router.session_threads();

    println!("{}", "ReliefMesh Status".bold());
    println!();
    println!("Identity: {}", router.identity().identity_id().bright_cyan());
    println!();
    println!("{}", "Outbound queue".bold());
    println!("  Queued:        {}", queue.total);
    println!("  Ready:         {}", queue.ready);
    println!("  Waiting retry: {}", queue.waiting_retry);
    println!("  Fast path:     {}", queue.fast_path);
    println!();
    println!("{}", "Seen messages".bold());
    println!("  Recent ids:    {} / {}", dedup.lru_len, dedup.lru_capacity);
    println!("  Bloom fill:    {:.1}%", dedup.bloom_fill_ratio * 100.0);
    println!(
        "  Est. FP rate:  {:.3}%",
        dedup.bloom_estimated_fp_rate * 100.0
    );
    println!();
    println!("{}", "Sessions".bold());
    if threads.is_empty() {
        println!("  (none)");
    }
    for thread in threads {
        println!("  {}", thread);
    }
    Ok(())
}

async fn cmd_simulate(
    config: &config::Config,
    nodes: usize,
    battery: u8,
    help_note: String,
) -> Result<()> {
    if !(2..=64).contains(&nodes) {
        anyhow::bail!("--nodes must be between 2 and 64");
    }
    if battery > 100 {
        anyhow::bail!("--battery must be at most 100");
    }
    let mesh = config.mesh_config()?;
    info!(nodes, battery, "starting simulation");
    let names: Vec<String> = (0..nodes).map(|i| format!("node-{}", i)).collect();

    println!(
        "{} {} nodes in a chain, battery {}%",
        "Simulating".bold(),
        nodes,
        battery
    );
    println!();

    let hub = LocalHub::new();
    let clock = ManualClock::new(SystemClock.now_ms());
    let reached: Arc<Mutex<BTreeMap<usize, (u8, Option<String>)>>> =
        Arc::new(Mutex::new(BTreeMap::new()));
    let mut routers = Vec::with_capacity(nodes);

    for (index, name) in names.iter().enumerate() {
        let router = new_sim_node(&mesh, &clock, battery)?;
        router.add_transport(Arc::new(hub.join(name)));
        let sink = reached.clone();
        router.subscribe_incoming(move |msg| {
            sink.lock()
                .entry(index)
                .or_insert((msg.envelope.hop, msg.payload.note().map(str::to_string)));
        });
        routers.push(router);
    }
    for pair in names.windows(2) {
        hub.link(&pair[0], &pair[1]);
    }

    let help = HelpPayload {
        under_rubble: true,
        injured: true,
        people_count: 2,
        note: Some(help_note),
    };
    let id = routers[0].send_help(help, None)?;
    let status = routers[0].get_scheduler_status();
    println!(
        "  {} node-0 queued help {} (mode {}, lean frame: {})",
        "→".bright_green(),
        id,
        status.mode.to_string().bright_yellow(),
        status.lean_frame
    );

    for round in 1..=config.simulate.max_rounds {
        let mut next = Duration::MAX;
        for router in &routers {
            let report = router.tick().await;
            debug!(round, mode = %report.mode, flushed = ?report.flushed, "tick");
            next = next.min(report.next_interval);
        }

        let delivered = reached.lock().len();
        let idle = routers.iter().all(|r| r.get_queue_stats().total == 0);
        if delivered == nodes - 1 || idle {
            println!("  {} settled after {} round(s)", "✓".green(), round);
            break;
        }
        clock.advance(next);
    }

    println!();
    println!("{}", "Delivery".bold());
    let reached = reached.lock();
    for (index, name) in names.iter().enumerate().skip(1) {
        match reached.get(&index) {
            Some((hop, note)) => println!(
                "  {} {:<8} hop {}  note: {}",
                "✓".green(),
                name,
                hop,
                note.as_deref().unwrap_or("(stripped)")
            ),
            None => println!("  {} {:<8} not reached", "✗".red(), name),
        }
    }

    let forwarded: u64 = routers.iter().map(|r| r.stats().forwarded).sum();
    let duplicates: u64 = routers.iter().map(|r| r.stats().duplicates).sum();
    println!();
    println!(
        "Reached {}/{} nodes, {} forwards, {} duplicates suppressed",
        reached.len(),
        nodes - 1,
        forwarded,
        duplicates
    );
    Ok(())
}

fn new_sim_node(mesh: &MeshConfig, clock: &ManualClock, battery: u8) -> Result<MeshRouter> {
    let router = MeshRouter::builder(IdentityKeys::generate())
        .config(mesh.clone())
        .clock(Arc::new(clock.clone()))
        .device_monitor(Arc::new(ManualDeviceMonitor::new(battery)))
        .build()?;
    Ok(router)
}
