// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]

//! Operator node entrypoint: loads identity, keys, profile and chain,
//! then runs the HTTP API, the serial block ingest, the startup sync, the
//! bus bridge and the point monitor until interrupted.

mod config;
mod http;
mod mqtt;
mod node;
mod sync;

use anyhow::{Context, Result};
use clap::Parser;
use config::NodeConfig;
use node::{Ledger, Node, NodeSink, PointTable};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use vg_bus::BusConnection;
use vg_consensus::KeyDirectory;
use vg_net::spawn_ingest;
use vg_store::{DataLayout, OperatorProfile, StoreError};

#[derive(Parser)]
#[command(name = "voltgrid-node", about = "EV-charging federation operator node")]
struct Cli {
    /// TOML configuration file; file values win over built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Data directory for the chain, keys and control files.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_or_create_profile(
    config: &NodeConfig,
    layout: &DataLayout,
) -> Result<(OperatorProfile, vg_store::OperatorProfileFile)> {
    let file = layout.profile_file(&config.operator_id);
    let profile = match file.load() {
        Ok(profile) => profile,
        Err(StoreError::NotFound(_)) => {
            info!("no operator profile on disk, creating one");
            let profile = OperatorProfile {
                id: config.operator_id.clone(),
                name: format!("Operadora {}", config.operator_id),
                api: config
                    .registry
                    .base_url(&config.operator_id)
                    .unwrap_or_default()
                    .to_string(),
                balance: 0.0,
                plates: HashMap::new(),
                points: config.owned_points(),
            };
            file.save(&profile)?;
            profile
        }
        Err(e) => return Err(e).context("load operator profile"),
    };
    Ok((profile, file))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = NodeConfig::resolve(cli.config.as_ref(), cli.data_dir)?;
    std::fs::create_dir_all(&config.data_dir).context("create data dir")?;
    let layout = DataLayout::new(config.data_dir.clone());

    let priv_key = layout.private_key(&config.operator_id);
    if !priv_key.exists() {
        info!("no private key on disk, generating keypair");
        vg_crypto::generate_keypair(&priv_key, &layout.public_key(&config.operator_id))
            .context("generate keypair")?;
    }

    let (profile, profile_file) = load_or_create_profile(&config, &layout)?;
    // the profile's owned-point list drives the lock table; the config
    // map only seeds it on first start
    let owned_points = if profile.points.is_empty() {
        config.owned_points()
    } else {
        profile.points.clone()
    };

    let chain_file = layout.chain_file(&config.operator_id);
    let chain = chain_file.load_or_seed().context("load chain")?;
    info!(len = chain.len(), "chain loaded");

    let points = PointTable::new(
        &owned_points,
        layout.point_control_file(&config.operator_id),
    )
    .context("load point control")?;
    let keys = KeyDirectory::new(config.data_dir.clone());
    let ledger = Ledger::new(chain, chain_file);

    let operator_id = config.operator_id.clone();
    let broker_host = config.broker_host.clone();
    let broker_port = config.broker_port;
    let bind = config.bind;

    let node = Node::new(config, profile, profile_file, ledger, points, keys, priv_key);

    let (ingest, _ingest_task) = spawn_ingest(Arc::new(NodeSink::new(node.clone())));

    {
        let node = node.clone();
        let ingest = ingest.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(node, ingest, bind).await {
                error!(error = %e, "http server failed");
                std::process::exit(1);
            }
        });
    }

    tokio::spawn(sync::startup(node.clone()));

    let (bus, event_loop) =
        BusConnection::connect(&format!("empresa_{operator_id}"), &broker_host, broker_port);
    node.set_bus(bus.clone());
    tokio::spawn(mqtt::run(node.clone(), bus, event_loop));

    tokio::spawn(node.clone().run_monitor());

    info!(operator = %operator_id, %bind, "operator node started");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
