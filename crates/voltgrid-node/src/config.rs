// SPDX-License-Identifier: AGPL-3.0-only

//! Node configuration: the mandatory `EMPRESA_ID` identity, file
//! locations, peer addresses and tunables. A TOML file takes precedence
//! over CLI defaults; the reference three-operator federation is built in.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use vg_net::PeerRegistry;

pub const OPERATOR_ID_ENV: &str = "EMPRESA_ID";

#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub peers: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub points: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub broker_host: Option<String>,
    #[serde(default)]
    pub broker_port: Option<u16>,
    #[serde(default)]
    pub reservation_ttl_secs: Option<u64>,
    #[serde(default)]
    pub monitor_interval_secs: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub operator_id: String,
    pub data_dir: PathBuf,
    pub bind: SocketAddr,
    pub registry: PeerRegistry,
    /// point-id to owning operator-id for the whole federation.
    pub point_operators: BTreeMap<String, String>,
    pub broker_host: String,
    pub broker_port: u16,
    pub reservation_ttl_secs: u64,
    pub monitor_interval_secs: u64,
}

impl NodeConfig {
    /// Resolve the effective configuration. `EMPRESA_ID` must be set and
    /// be the three-character operator id; the HTTP port is `8<id>`.
    pub fn resolve(config_path: Option<&PathBuf>, data_dir_cli: Option<PathBuf>) -> Result<Self> {
        let operator_id =
            std::env::var(OPERATOR_ID_ENV).map_err(|_| anyhow!("{OPERATOR_ID_ENV} not set"))?;
        if operator_id.len() != 3 || !operator_id.chars().all(|c| c.is_ascii_digit()) {
            bail!("{OPERATOR_ID_ENV} must be a three-digit operator id, got '{operator_id}'");
        }

        let file: ConfigFile = match config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read config {}", path.display()))?;
                toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?
            }
            None => ConfigFile::default(),
        };

        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .or(data_dir_cli)
            .unwrap_or_else(|| PathBuf::from("data"));

        let bind: SocketAddr = match &file.bind {
            Some(addr) => addr
                .parse()
                .with_context(|| format!("invalid bind addr '{addr}'"))?,
            None => {
                let port: u16 = format!("8{operator_id}")
                    .parse()
                    .with_context(|| format!("derive port from operator id '{operator_id}'"))?;
                SocketAddr::from(([0, 0, 0, 0], port))
            }
        };

        let registry = match file.peers {
            Some(peers) => PeerRegistry::new(peers),
            None => PeerRegistry::reference(),
        };
        if registry.base_url(&operator_id).is_none() {
            bail!("operator '{operator_id}' missing from the peer registry");
        }

        let point_operators = file
            .points
            .unwrap_or_else(vg_net::reference_point_operators);

        Ok(Self {
            operator_id,
            data_dir,
            bind,
            registry,
            point_operators,
            broker_host: file.broker_host.unwrap_or_else(|| "broker".to_string()),
            broker_port: file.broker_port.unwrap_or(1883),
            reservation_ttl_secs: file.reservation_ttl_secs.unwrap_or(300),
            monitor_interval_secs: file.monitor_interval_secs.unwrap_or(30),
        })
    }

    /// Points this operator owns, in registry order.
    pub fn owned_points(&self) -> Vec<String> {
        self.point_operators
            .iter()
            .filter(|(_, op)| **op == self.operator_id)
            .map(|(point, _)| point.clone())
            .collect()
    }
}
