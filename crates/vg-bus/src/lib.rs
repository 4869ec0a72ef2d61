// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]
#![deny(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]

//! Pub/sub side of the federation: topic names, the comma-separated ASCII
//! message forms exchanged with vehicles, and a thin MQTT connection
//! wrapper. The wire strings are interface contracts shared with every
//! deployed vehicle; formatting is centralised here so both the node and
//! the vehicle client agree byte-for-byte.

use core::fmt;
use rumqttc::{AsyncClient, ClientError, EventLoop, MqttOptions, QoS};
use std::time::Duration;
use tracing::debug;

/// Commands from any vehicle.
pub const TOPIC_CLIENT: &str = "mensagens/cliente";

/// Operator-private topic.
pub fn operator_topic(operator_id: &str) -> String {
    format!("mensagens/empresa/{operator_id}")
}

/// Per-vehicle reply topic.
pub fn plate_topic(plate: &str) -> String {
    format!("{TOPIC_CLIENT}/{plate}")
}

#[derive(Debug)]
pub enum BusError {
    Malformed(String),
    UnknownVerb(String),
    Mqtt(String),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(m) => write!(f, "malformed message: {m}"),
            Self::UnknownVerb(v) => write!(f, "unknown verb: {v}"),
            Self::Mqtt(e) => write!(f, "mqtt: {e}"),
        }
    }
}

impl std::error::Error for BusError {}
impl From<ClientError> for BusError {
    fn from(e: ClientError) -> Self {
        Self::Mqtt(e.to_string())
    }
}

// ============================
// Inbound commands
// ============================

/// `<verb>,<plate>[,<args>...]` published by vehicles on
/// `mensagens/cliente`.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientCommand {
    Reservation { plate: String, point: String },
    Recharge { plate: String, point: String, amount: f64 },
    Status { plate: String },
    Cancel { plate: String, point: String },
}

impl ClientCommand {
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        let mut fields = parts.iter().copied();
        let verb = fields
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BusError::Malformed(raw.to_string()))?;
        let plate = fields
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| BusError::Malformed(raw.to_string()))?
            .to_string();
        match verb {
            "RESERVA" => {
                let point = fields
                    .next()
                    .ok_or_else(|| BusError::Malformed(raw.to_string()))?
                    .to_string();
                Ok(Self::Reservation { plate, point })
            }
            "RECARGA" => {
                let point = fields
                    .next()
                    .ok_or_else(|| BusError::Malformed(raw.to_string()))?
                    .to_string();
                let amount: f64 = fields
                    .next()
                    .ok_or_else(|| BusError::Malformed(raw.to_string()))?
                    .parse()
                    .map_err(|_| BusError::Malformed(raw.to_string()))?;
                Ok(Self::Recharge { plate, point, amount })
            }
            "STATUS" => Ok(Self::Status { plate }),
            "CANCELAR" => {
                let point = fields
                    .next()
                    .ok_or_else(|| BusError::Malformed(raw.to_string()))?
                    .to_string();
                Ok(Self::Cancel { plate, point })
            }
            other => Err(BusError::UnknownVerb(other.to_string())),
        }
    }

    pub fn to_wire(&self) -> String {
        match self {
            Self::Reservation { plate, point } => format!("RESERVA,{plate},{point}"),
            Self::Recharge { plate, point, amount } => {
                format!("RECARGA,{plate},{point},{amount:.2}")
            }
            Self::Status { plate } => format!("STATUS,{plate}"),
            Self::Cancel { plate, point } => format!("CANCELAR,{plate},{point}"),
        }
    }
}

/// Peer-to-peer traffic on `mensagens/empresa/<id>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperatorMessage {
    Sync,
    StatusUpdate { point: String, state: String },
}

impl OperatorMessage {
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        let mut fields = parts.iter().copied();
        let verb = fields
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BusError::Malformed(raw.to_string()))?;
        match verb {
            "SYNC" => Ok(Self::Sync),
            "STATUS_UPDATE" => {
                let point = fields
                    .next()
                    .ok_or_else(|| BusError::Malformed(raw.to_string()))?
                    .to_string();
                let state = fields
                    .next()
                    .ok_or_else(|| BusError::Malformed(raw.to_string()))?
                    .to_string();
                Ok(Self::StatusUpdate { point, state })
            }
            other => Err(BusError::UnknownVerb(other.to_string())),
        }
    }
}

// ============================
// Outbound replies
// ============================

/// `<verb>,<point>,<payload>` published to `mensagens/cliente/<plate>`.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientReply {
    ReservationConfirmed { point: String, hash: String },
    ReservationError { point: String, reason: String },
    RechargeConfirmed { point: String, amount: f64, hash: String },
    RechargeDenied { point: String, reason: String },
    PointReleased { point: String, reason: String },
    ReservationExpired { point: String, reason: String },
    ReservationCanceled { point: String, reason: String },
    CancelConfirmed { point: String, reason: String },
    PointDisconnected { point: String, reason: String },
    StatusSummary {
        recharges: u64,
        payments: u64,
        recharged_total: f64,
        paid_total: f64,
        pending: f64,
    },
}

impl ClientReply {
    pub fn to_wire(&self) -> String {
        match self {
            Self::ReservationConfirmed { point, hash } => {
                format!("reserva_confirmada,{point},{hash}")
            }
            Self::ReservationError { point, reason } => format!("reserva_erro,{point},{reason}"),
            Self::RechargeConfirmed { point, amount, hash } => {
                format!("recarga_confirmada,{point},{amount:.2},{hash}")
            }
            Self::RechargeDenied { point, reason } => format!("recarga_negada,{point},{reason}"),
            Self::PointReleased { point, reason } => format!("ponto_liberado,{point},{reason}"),
            Self::ReservationExpired { point, reason } => {
                format!("reserva_expirada,{point},{reason}")
            }
            Self::ReservationCanceled { point, reason } => {
                format!("reserva_cancelada,{point},{reason}")
            }
            Self::CancelConfirmed { point, reason } => {
                format!("cancelamento_confirmado,{point},{reason}")
            }
            Self::PointDisconnected { point, reason } => {
                format!("ponto_desconectado,{point},{reason}")
            }
            Self::StatusSummary {
                recharges,
                payments,
                recharged_total,
                paid_total,
                pending,
            } => format!(
                "status_resposta,{recharges},{payments},{recharged_total:.2},{paid_total:.2},{pending:.2}"
            ),
        }
    }

    /// Parse a reply payload back into its typed form; the vehicle side
    /// uses this when waiting on its own topic.
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        let mut fields = parts.iter().copied();
        let verb = fields
            .next()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BusError::Malformed(raw.to_string()))?;
        let mut next = |raw: &str| -> Result<String, BusError> {
            fields
                .next()
                .map(str::to_string)
                .ok_or_else(|| BusError::Malformed(raw.to_string()))
        };
        match verb {
            "reserva_confirmada" => Ok(Self::ReservationConfirmed {
                point: next(raw)?,
                hash: next(raw)?,
            }),
            "reserva_erro" => Ok(Self::ReservationError {
                point: next(raw)?,
                reason: next(raw)?,
            }),
            "recarga_confirmada" => {
                let point = next(raw)?;
                let amount: f64 = next(raw)?
                    .parse()
                    .map_err(|_| BusError::Malformed(raw.to_string()))?;
                let hash = next(raw)?;
                Ok(Self::RechargeConfirmed { point, amount, hash })
            }
            "recarga_negada" => Ok(Self::RechargeDenied {
                point: next(raw)?,
                reason: next(raw)?,
            }),
            "ponto_liberado" => Ok(Self::PointReleased {
                point: next(raw)?,
                reason: next(raw)?,
            }),
            "reserva_expirada" => Ok(Self::ReservationExpired {
                point: next(raw)?,
                reason: next(raw)?,
            }),
            "reserva_cancelada" => Ok(Self::ReservationCanceled {
                point: next(raw)?,
                reason: next(raw)?,
            }),
            "cancelamento_confirmado" => Ok(Self::CancelConfirmed {
                point: next(raw)?,
                reason: next(raw)?,
            }),
            "ponto_desconectado" => Ok(Self::PointDisconnected {
                point: next(raw)?,
                reason: next(raw)?,
            }),
            "status_resposta" => {
                let mut num = |raw: &str| -> Result<f64, BusError> {
                    next(raw)?
                        .parse()
                        .map_err(|_| BusError::Malformed(raw.to_string()))
                };
                Ok(Self::StatusSummary {
                    recharges: num(raw)? as u64,
                    payments: num(raw)? as u64,
                    recharged_total: num(raw)?,
                    paid_total: num(raw)?,
                    pending: num(raw)?,
                })
            }
            other => Err(BusError::UnknownVerb(other.to_string())),
        }
    }
}

// ============================
// Connection
// ============================

/// Thin wrapper around the MQTT client; QoS 0 everywhere, matching the
/// broker contract of the deployment.
#[derive(Clone)]
pub struct BusConnection {
    client: AsyncClient,
}

impl BusConnection {
    /// Build a connection; the caller owns the event loop and must poll
    /// it for the connection to make progress.
    pub fn connect(client_id: &str, broker_host: &str, broker_port: u16) -> (Self, EventLoop) {
        let mut options = MqttOptions::new(client_id, broker_host, broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, event_loop) = AsyncClient::new(options, 64);
        (Self { client }, event_loop)
    }

    pub async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.client.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        debug!(topic, payload, "bus publish");
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics() {
        assert_eq!(operator_topic("001"), "mensagens/empresa/001");
        assert_eq!(plate_topic("ABC1234"), "mensagens/cliente/ABC1234");
    }

    #[test]
    fn parse_client_commands() {
        assert_eq!(
            ClientCommand::parse("RESERVA,ABC1234,Salvador").expect("parse"),
            ClientCommand::Reservation {
                plate: "ABC1234".to_string(),
                point: "Salvador".to_string()
            }
        );
        assert_eq!(
            ClientCommand::parse("RECARGA,ABC1234,Salvador,42.5").expect("parse"),
            ClientCommand::Recharge {
                plate: "ABC1234".to_string(),
                point: "Salvador".to_string(),
                amount: 42.5
            }
        );
        assert_eq!(
            ClientCommand::parse("STATUS,ABC1234").expect("parse"),
            ClientCommand::Status { plate: "ABC1234".to_string() }
        );
        assert_eq!(
            ClientCommand::parse("CANCELAR,ABC1234,Salvador").expect("parse"),
            ClientCommand::Cancel {
                plate: "ABC1234".to_string(),
                point: "Salvador".to_string()
            }
        );
    }

    #[test]
    fn reject_malformed_commands() {
        assert!(matches!(ClientCommand::parse(""), Err(BusError::Malformed(_))));
        assert!(matches!(ClientCommand::parse("RESERVA"), Err(BusError::Malformed(_))));
        assert!(matches!(
            ClientCommand::parse("RESERVA,ABC1234"),
            Err(BusError::Malformed(_))
        ));
        assert!(matches!(
            ClientCommand::parse("RECARGA,ABC1234,Salvador,muito"),
            Err(BusError::Malformed(_))
        ));
        assert!(matches!(
            ClientCommand::parse("DESCONHECIDO,ABC1234"),
            Err(BusError::UnknownVerb(_))
        ));
    }

    #[test]
    fn parse_operator_messages() {
        assert_eq!(OperatorMessage::parse("SYNC,agora").expect("parse"), OperatorMessage::Sync);
        assert_eq!(
            OperatorMessage::parse("STATUS_UPDATE,Salvador,offline").expect("parse"),
            OperatorMessage::StatusUpdate {
                point: "Salvador".to_string(),
                state: "offline".to_string()
            }
        );
    }

    #[test]
    fn reply_wire_forms() {
        assert_eq!(
            ClientReply::ReservationConfirmed {
                point: "Salvador".to_string(),
                hash: "abc123".to_string()
            }
            .to_wire(),
            "reserva_confirmada,Salvador,abc123"
        );
        assert_eq!(
            ClientReply::RechargeConfirmed {
                point: "Salvador".to_string(),
                amount: 42.5,
                hash: "abc123".to_string()
            }
            .to_wire(),
            "recarga_confirmada,Salvador,42.50,abc123"
        );
        assert_eq!(
            ClientReply::StatusSummary {
                recharges: 2,
                payments: 1,
                recharged_total: 52.5,
                paid_total: 10.0,
                pending: 42.5
            }
            .to_wire(),
            "status_resposta,2,1,52.50,10.00,42.50"
        );
    }

    #[test]
    fn reply_roundtrip() {
        for reply in [
            ClientReply::ReservationConfirmed {
                point: "Salvador".to_string(),
                hash: "abc".to_string(),
            },
            ClientReply::ReservationExpired {
                point: "Natal".to_string(),
                reason: "timeout".to_string(),
            },
            ClientReply::RechargeConfirmed {
                point: "Recife".to_string(),
                amount: 10.0,
                hash: "ff".to_string(),
            },
        ] {
            assert_eq!(ClientReply::parse(&reply.to_wire()).expect("parse"), reply);
        }
    }

    #[test]
    fn command_wire_roundtrip() {
        let cmd = ClientCommand::Recharge {
            plate: "ABC1234".to_string(),
            point: "Salvador".to_string(),
            amount: 42.5,
        };
        assert_eq!(ClientCommand::parse(&cmd.to_wire()).expect("parse"), cmd);
    }
}
