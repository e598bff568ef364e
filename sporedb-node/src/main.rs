//! SporeDB node daemon: loads the configuration, unlocks the keyring,
//! opens the store, then runs the engine, the overlay and the
//! application endpoint until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use sporedb_api::ApiServer;
use sporedb_core::core_consensus::{load_policies, Engine};
use sporedb_core::core_keyring::KeyRing;
use sporedb_core::core_myc::{Mycelium, MyceliumConfig};
use sporedb_core::core_store::{SharedStore, SledStore};
use sporedb_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use sporedb_core::shutdown::ShutdownCoordinator;
use sporedb_core::NodeConfig;

#[derive(Parser, Debug)]
#[command(name = "sporedb")]
#[command(author, version, about = "Byzantine-fault-tolerant key-value database node")]
struct Args {
    /// Path of the JSON configuration file.
    #[arg(short, long, default_value = "sporedb.json")]
    config: PathBuf,

    /// Set the log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON formatted logging.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level: LogLevel = args
        .log_level
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    init_logging_with_config(LogConfig::new(level).json_format(args.json_logs))
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let config = NodeConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    // The keyring password comes from the environment only.
    let password =
        std::env::var("PASSWORD").context("PASSWORD environment variable not set")?;

    let keyring = Arc::new(KeyRing::new());
    if config.keyring.exists() {
        keyring
            .load_file(&config.keyring)
            .context("loading keyring")?;
        keyring
            .unlock_private(&password)
            .context("unlocking keyring")?;
    } else {
        warn!(path = %config.keyring.display(), "keyring not found, creating a fresh one");
        keyring
            .create_private(&password)
            .context("creating keyring")?;
        keyring
            .save_file(&config.keyring)
            .context("saving keyring")?;
    }

    let store = SledStore::open(&config.store).context("opening store")?;
    let store = SharedStore::new(Box::new(store));

    let (engine, messages) = Engine::new(store, &config.identity, keyring);
    let policies = load_policies(&config.policies_dir).context("loading policies")?;
    for policy in policies {
        info!(policy = %policy.uuid, quorum = policy.quorum, "policy loaded");
        engine.add_policy(policy)?;
    }

    let shutdown = ShutdownCoordinator::new();
    engine.start(&shutdown);

    let mycelium = Mycelium::start(
        Arc::clone(&engine),
        messages,
        MyceliumConfig {
            listen: config.p2p_listen.clone(),
            peers: config.peers.clone(),
            recovery_quorum: config.recovery_quorum,
            connectivity: config.connectivity,
            fanout: config.fanout,
        },
        shutdown.clone(),
    )
    .await
    .context("starting mycelium")?;

    if !config.api_listen.is_empty() {
        let server = ApiServer::new(Arc::clone(&engine));
        let api_listen = config.api_listen.clone();
        let api_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = server.serve(&api_listen, api_shutdown).await {
                warn!(error = %err, "API endpoint terminated");
            }
        });
    }

    info!(identity = %config.identity, "node started");
    tokio::signal::ctrl_c().await.context("signal handler")?;

    info!("interrupt received, stopping");
    mycelium.close();
    shutdown.shutdown();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    Ok(())
}
