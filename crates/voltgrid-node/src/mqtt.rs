// SPDX-License-Identifier: AGPL-3.0-only

//! Bus side of the node: subscribes to the shared client topic and the
//! operator-private topic, routes commands through the same commit path
//! as the REST handlers, and answers on the vehicle's own topic.

use crate::node::{CommitError, Node};
use rumqttc::{Event, EventLoop, Packet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use vg_bus::{BusConnection, ClientCommand, ClientReply, OperatorMessage, TOPIC_CLIENT};

pub async fn run(node: Arc<Node>, bus: BusConnection, mut event_loop: EventLoop) {
    let operator_topic = vg_bus::operator_topic(node.operator_id());
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(operator = node.operator_id(), "connected to broker");
                for topic in [TOPIC_CLIENT, operator_topic.as_str()] {
                    if let Err(e) = bus.subscribe(topic).await {
                        warn!(topic, error = %e, "subscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).to_string();
                node.metrics.bus_in.fetch_add(1, Ordering::Relaxed);
                let node = node.clone();
                let topic = publish.topic.clone();
                let operator_topic = operator_topic.clone();
                tokio::spawn(async move {
                    if topic == TOPIC_CLIENT {
                        dispatch_client(node, &payload).await;
                    } else if topic == operator_topic {
                        dispatch_operator(node, &payload).await;
                    }
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "broker connection lost, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn dispatch_client(node: Arc<Node>, payload: &str) {
    let command = match ClientCommand::parse(payload) {
        Ok(c) => c,
        Err(e) => {
            warn!(payload, error = %e, "unparseable client message");
            return;
        }
    };
    match command {
        ClientCommand::Reservation { plate, point } => handle_reservation(node, plate, point).await,
        ClientCommand::Recharge { plate, point, amount } => {
            handle_recharge(node, plate, point, amount).await
        }
        ClientCommand::Status { plate } => handle_status(node, plate).await,
        ClientCommand::Cancel { plate, point } => handle_cancel(node, plate, point).await,
    }
}

async fn handle_reservation(node: Arc<Node>, plate: String, point: String) {
    // commands fan out to every operator; only the owner answers
    if !node.owns_point(&point) {
        return;
    }
    if !node.is_point_online(&point) {
        node.publish_reply(
            &plate,
            &ClientReply::PointDisconnected {
                point: point.clone(),
                reason: format!("Ponto {point} esta desconectado"),
            },
        )
        .await;
        return;
    }
    match node.reserve(&plate, &point).await {
        Ok(hash) => {
            node.publish_reply(&plate, &ClientReply::ReservationConfirmed { point, hash })
                .await;
        }
        Err(e) => {
            let reason = reservation_failure_reason(&e);
            warn!(plate, point, error = %e, "bus reservation rejected");
            node.publish_reply(&plate, &ClientReply::ReservationError { point, reason })
                .await;
        }
    }
}

fn reservation_failure_reason(e: &CommitError) -> String {
    match e {
        CommitError::Conflict(_) => "Ponto ja esta reservado por outro veiculo".to_string(),
        CommitError::Duplicate | CommitError::Stale => "Bloco duplicado".to_string(),
        CommitError::Consensus(_) => "Consenso nao atingido".to_string(),
        CommitError::Crypto(_) => "Erro na assinatura digital".to_string(),
        _ => "Falha ao processar reserva".to_string(),
    }
}

async fn handle_recharge(node: Arc<Node>, plate: String, point: String, amount: f64) {
    if !node.owns_point(&point) {
        node.publish_reply(
            &plate,
            &ClientReply::RechargeDenied {
                point,
                reason: "Ponto nao pertence a esta operadora".to_string(),
            },
        )
        .await;
        return;
    }
    match node.recharge(&plate, &point, amount).await {
        Ok(hash) => {
            node.publish_reply(
                &plate,
                &ClientReply::RechargeConfirmed { point, amount, hash },
            )
            .await;
        }
        Err(e) => {
            warn!(plate, point, error = %e, "bus recharge rejected");
            node.publish_reply(
                &plate,
                &ClientReply::RechargeDenied {
                    point,
                    reason: reservation_failure_reason(&e),
                },
            )
            .await;
        }
    }
}

async fn handle_status(node: Arc<Node>, plate: String) {
    let summary = {
        let ledger = node.ledger.lock().await;
        ledger.chain.summary_for_plate(&plate)
    };
    node.publish_reply(
        &plate,
        &ClientReply::StatusSummary {
            recharges: summary.recharges,
            payments: summary.payments,
            recharged_total: summary.recharged_total,
            paid_total: summary.paid_total,
            pending: summary.pending_balance(),
        },
    )
    .await;
}

async fn handle_cancel(node: Arc<Node>, plate: String, point: String) {
    if !node.owns_point(&point) {
        return;
    }
    node.cancel(&plate, std::slice::from_ref(&point)).await;
    node.publish_reply(
        &plate,
        &ClientReply::CancelConfirmed {
            point,
            reason: "Reserva cancelada com sucesso".to_string(),
        },
    )
    .await;
}

async fn dispatch_operator(node: Arc<Node>, payload: &str) {
    let message = match OperatorMessage::parse(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!(payload, error = %e, "unparseable operator message");
            return;
        }
    };
    match message {
        OperatorMessage::Sync => {
            info!("sync requested over the bus; catch-up is handled by the http sync rounds");
        }
        OperatorMessage::StatusUpdate { point, state } => {
            if !node.owns_point(&point) {
                return;
            }
            match state.as_str() {
                "online" => node.apply_point_state(&point, true).await,
                "offline" => node.apply_point_state(&point, false).await,
                other => warn!(point, state = other, "unknown point state"),
            }
        }
    }
}
