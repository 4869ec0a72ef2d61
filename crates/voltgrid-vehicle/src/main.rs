// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]

//! Vehicle CLI over the coordinator library: trip reservation,
//! cancellation, recharge and settlement, history and hash verification.
//! Route planning and battery simulation are intentionally out of scope.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use vg_net::PeerRegistry;
use voltgrid_vehicle::Coordinator;

#[derive(Parser)]
#[command(name = "voltgrid-vehicle", about = "EV-charging federation vehicle client")]
struct Cli {
    /// TOML file overriding the reference federation ([peers] and
    /// [points] tables).
    #[arg(long)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Reserve every point of a trip, all-or-nothing.
    ReserveTrip {
        #[arg(long)]
        plate: String,
        /// Charging points in route order.
        points: Vec<String>,
    },
    /// Cancel reservations held by the plate.
    Cancel {
        #[arg(long)]
        plate: String,
        points: Vec<String>,
    },
    /// Record an energy delivery at a point.
    Recharge {
        #[arg(long)]
        plate: String,
        #[arg(long)]
        point: String,
        #[arg(long)]
        amount: f64,
    },
    /// List recharges not yet settled by a payment.
    Pending {
        #[arg(long)]
        plate: String,
    },
    /// Settle every pending recharge.
    PayPending {
        #[arg(long)]
        plate: String,
    },
    /// Full ledger history of the plate.
    History {
        #[arg(long)]
        plate: String,
    },
    /// Totals and pending balance of the plate.
    Status {
        #[arg(long)]
        plate: String,
    },
    /// Look a commit hash up across every operator.
    VerifyHash { hash: String },
}

#[derive(Deserialize, Default)]
struct FederationFile {
    #[serde(default)]
    peers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    points: Option<BTreeMap<String, String>>,
}

fn build_coordinator(config: Option<&PathBuf>) -> Result<Coordinator> {
    let file: FederationFile = match config {
        Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
        None => FederationFile::default(),
    };
    let registry = match file.peers {
        Some(peers) => PeerRegistry::new(peers),
        None => PeerRegistry::reference(),
    };
    let points = file
        .points
        .unwrap_or_else(vg_net::reference_point_operators);
    Ok(Coordinator::new(registry, points))
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let cli = Cli::parse();
    let coordinator = build_coordinator(cli.config.as_ref())?;

    match cli.command {
        CliCommand::ReserveTrip { plate, points } => {
            if points.is_empty() {
                bail!("at least one point is required");
            }
            match coordinator.reserve_route(&plate, &points).await {
                Ok(confirmed) => {
                    println!("trip reserved ({} points):", confirmed.len());
                    for (point, hash) in confirmed {
                        println!("  {point}: {hash}");
                    }
                }
                Err(e) => bail!("trip not reserved: {e}"),
            }
        }
        CliCommand::Cancel { plate, points } => {
            let canceled = coordinator.cancel(&plate, &points).await?;
            println!("canceled {canceled} reservation(s)");
        }
        CliCommand::Recharge { plate, point, amount } => {
            let hash = coordinator.recharge(&plate, &point, amount).await?;
            println!("recharge recorded at {point}: {hash}");
        }
        CliCommand::Pending { plate } => {
            let pending = coordinator.pending_recharges(&plate).await?;
            if pending.is_empty() {
                println!("no pending recharges");
            }
            for tx in pending {
                println!("{}: {:.2} (operator {})", tx.point, tx.amount, tx.operator);
            }
        }
        CliCommand::PayPending { plate } => {
            let settled = coordinator.pay_pending(&plate).await?;
            if settled.is_empty() {
                println!("nothing to settle");
            }
            for (tx, hash) in settled {
                println!("paid {:.2} for {}: {hash}", tx.amount, tx.point);
            }
        }
        CliCommand::History { plate } => {
            let history = coordinator.history(&plate).await?;
            println!("{} event(s) for {plate}:", history.len());
            for block in history {
                println!(
                    "  [{}] {} {} {:.2} at {} ({})",
                    block.index,
                    block.timestamp,
                    block.tx.kind.as_wire(),
                    block.tx.amount,
                    block.tx.point,
                    block.hash
                );
            }
        }
        CliCommand::Status { plate } => {
            let summary = coordinator.status_summary(&plate).await?;
            println!("recharges: {}", summary.recharges);
            println!("payments:  {}", summary.payments);
            println!("recharged: {:.2}", summary.recharged_total);
            println!("paid:      {:.2}", summary.paid_total);
            println!("pending:   {:.2}", summary.pending_balance());
        }
        CliCommand::VerifyHash { hash } => match coordinator.verify_hash(&hash).await? {
            Some((operator, block)) => {
                println!("hash found at operator {operator}:");
                println!("  kind:      {}", block.tx.kind.as_wire());
                println!("  plate:     {}", block.tx.plate);
                println!("  point:     {}", block.tx.point);
                println!("  amount:    {:.2}", block.tx.amount);
                println!("  timestamp: {}", block.timestamp);
                println!("  index:     {}", block.index);
            }
            None => println!("hash not found at any operator"),
        },
    }
    Ok(())
}
