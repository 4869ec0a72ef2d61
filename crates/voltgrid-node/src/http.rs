// SPDX-License-Identifier: AGPL-3.0-only

//! REST surface of the operator node. Wire paths and the Portuguese
//! body field names are interface contracts shared with the deployed
//! vehicles and peers.

use crate::node::{CommitError, Node};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use vg_consensus::validate_full_chain;
use vg_net::IngestService;
use vg_types::{Block, Chain, Transaction};

const MAX_BODY_BYTES: usize = 1_048_576;
const BODY_READ_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

// ============================
// Wire DTOs
// ============================

#[derive(Deserialize)]
struct MultiPointRequest {
    #[serde(rename = "placa_veiculo")]
    plate: String,
    #[serde(rename = "pontos", default)]
    points: Vec<String>,
    #[serde(rename = "empresa_id", default)]
    _origin: String,
}

#[derive(Serialize)]
struct PointOutcome {
    status: String,
    #[serde(rename = "ponto")]
    point: String,
    #[serde(rename = "mensagem")]
    message: String,
    #[serde(rename = "empresa_id")]
    operator_id: String,
    hash: String,
}

#[derive(Deserialize)]
struct HashLookupRequest {
    hash: String,
}

// ============================
// Response helpers
// ============================

fn response_with(status: StatusCode, body: Body, content_type: &'static str) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    response_with(status, Body::from(value.to_string()), "application/json")
}

fn empty_response(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

fn commit_error_response(point: &str, e: CommitError) -> Response<Body> {
    let (status, message) = match &e {
        CommitError::NotOwned(_) => (
            StatusCode::NOT_FOUND,
            format!("Ponto {point} nao pertence a esta operadora"),
        ),
        CommitError::Conflict(_) => (
            StatusCode::CONFLICT,
            format!("Ponto {point} nao esta disponivel para reserva"),
        ),
        CommitError::Duplicate | CommitError::Stale => {
            (StatusCode::CONFLICT, "Bloco duplicado".to_string())
        }
        CommitError::Consensus(f) => (
            StatusCode::PRECONDITION_FAILED,
            format!("Consenso nao atingido: {f}"),
        ),
        CommitError::Crypto(_) | CommitError::Store(_) | CommitError::Internal(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Falha interna ao processar transacao".to_string(),
        ),
    };
    warn!(point, error = %e, %status, "write rejected");
    json_response(
        status,
        serde_json::json!({ "status": "error", "message": message }),
    )
}

/// Read a JSON body within the size cap and decode it; `Err` carries the
/// ready-made 4xx response.
async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Body>) -> Result<T, Response<Body>> {
    let body = match tokio::time::timeout(BODY_READ_TIMEOUT, hyper::body::to_bytes(req.into_body()))
        .await
    {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            return Err(json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "status": "error", "message": format!("read body: {e}") }),
            ))
        }
        Err(_) => {
            return Err(json_response(
                StatusCode::REQUEST_TIMEOUT,
                serde_json::json!({ "status": "error", "message": "read timeout" }),
            ))
        }
    };
    if body.len() > MAX_BODY_BYTES {
        return Err(empty_response(StatusCode::PAYLOAD_TOO_LARGE));
    }
    serde_json::from_slice(&body).map_err(|e| {
        json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "status": "error", "message": format!("bad json: {e}") }),
        )
    })
}

// ============================
// Handlers
// ============================

async fn get_blockchain(node: &Arc<Node>) -> Response<Body> {
    let chain = node.ledger.lock().await.chain.clone();
    match serde_json::to_string(&chain) {
        Ok(body) => response_with(StatusCode::OK, Body::from(body), "application/json"),
        Err(_) => empty_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn post_block(ingest: &IngestService, req: Request<Body>) -> Response<Body> {
    let block: Block = match read_json(req).await {
        Ok(b) => b,
        Err(resp) => return resp,
    };
    match ingest.enqueue(block).await {
        Ok(()) => empty_response(StatusCode::ACCEPTED),
        Err(e) => {
            warn!(error = %e, "ingest enqueue failed");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn post_sync(node: &Arc<Node>, req: Request<Body>) -> Response<Body> {
    let remote: Chain = match read_json(req).await {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let mut ledger = node.ledger.lock().await;
    let adoptable =
        remote.len() > ledger.chain.len() && validate_full_chain(&remote, &node.keys).is_ok();
    if !adoptable {
        info!(remote_len = remote.len(), local_len = ledger.chain.len(), "sync offer ignored");
        return empty_response(StatusCode::FORBIDDEN);
    }
    match ledger.replace_and_save(remote) {
        Ok(()) => {
            info!(len = ledger.chain.len(), "chain adopted via sync offer");
            empty_response(StatusCode::OK)
        }
        Err(e) => {
            warn!(error = %e, "persist adopted chain failed");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn post_reservation(node: &Arc<Node>, req: Request<Body>) -> Response<Body> {
    let tx: Transaction = match read_json(req).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    if !node.owns_point(&tx.point) {
        return empty_response(StatusCode::NOT_FOUND);
    }
    match node.reserve(&tx.plate, &tx.point).await {
        Ok(hash) => json_response(
            StatusCode::CREATED,
            serde_json::json!({
                "status": "success",
                "hash": hash,
                "message": format!("Reserva confirmada para {} no ponto {}", tx.plate, tx.point),
            }),
        ),
        Err(e) => commit_error_response(&tx.point, e),
    }
}

async fn post_recharge(node: &Arc<Node>, req: Request<Body>) -> Response<Body> {
    let tx: Transaction = match read_json(req).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match node.recharge(&tx.plate, &tx.point, tx.amount).await {
        Ok(hash) => json_response(
            StatusCode::CREATED,
            serde_json::json!({ "status": "success", "hash": hash }),
        ),
        Err(e) => commit_error_response(&tx.point, e),
    }
}

async fn post_payment(node: &Arc<Node>, req: Request<Body>) -> Response<Body> {
    let tx: Transaction = match read_json(req).await {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    match node
        .payment(&tx.plate, &tx.point, tx.amount, &tx.operator)
        .await
    {
        Ok(hash) => json_response(
            StatusCode::CREATED,
            serde_json::json!({ "status": "success", "hash": hash }),
        ),
        Err(e) => commit_error_response(&tx.point, e),
    }
}

async fn get_status(node: &Arc<Node>) -> Response<Body> {
    let ledger = node.ledger.lock().await;
    let last_hash = ledger.chain.tip().map(|b| b.hash.clone()).unwrap_or_default();
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "status": "online",
            "empresa_id": node.operator_id(),
            "blockchain_info": {
                "total_blocos": ledger.chain.len(),
                "ultimo_hash": last_hash,
            },
        }),
    )
}

async fn post_hash_lookup(node: &Arc<Node>, req: Request<Body>) -> Response<Body> {
    let lookup: HashLookupRequest = match read_json(req).await {
        Ok(l) => l,
        Err(resp) => return resp,
    };
    let ledger = node.ledger.lock().await;
    match ledger.chain.find_by_hash(&lookup.hash) {
        Some(block) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "encontrado": true,
                "empresa_id": node.operator_id(),
                "bloco": block,
                "mensagem": "Hash encontrado na blockchain",
            }),
        ),
        None => json_response(
            StatusCode::OK,
            serde_json::json!({
                "encontrado": false,
                "empresa_id": node.operator_id(),
                "mensagem": "Hash nao encontrado nesta operadora",
            }),
        ),
    }
}

async fn get_history(node: &Arc<Node>, req: &Request<Body>) -> Response<Body> {
    let plate = req
        .uri()
        .query()
        .and_then(|q| {
            q.split('&')
                .find_map(|pair| pair.strip_prefix("placa="))
        })
        .unwrap_or("")
        .to_string();
    if plate.is_empty() {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "status": "error", "message": "Parametro 'placa' obrigatorio" }),
        );
    }
    let ledger = node.ledger.lock().await;
    let transactions: Vec<serde_json::Value> = ledger
        .chain
        .history_for_plate(&plate)
        .into_iter()
        .map(|block| {
            serde_json::json!({
                "index": block.index,
                "timestamp": block.timestamp,
                "tipo": block.tx.kind.as_wire(),
                "ponto": block.tx.point,
                "valor": block.tx.amount,
                "empresa": block.tx.operator,
                "hash": block.hash,
            })
        })
        .collect();
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "placa": plate,
            "empresa_id": node.operator_id(),
            "total": transactions.len(),
            "transacoes": transactions,
        }),
    )
}

/// Coordinated multi-point reservation: local points go through the
/// shared commit path, foreign points are forwarded to their operator.
/// Partial failures are reported per point; compensation is owned by the
/// vehicle-side coordinator.
async fn post_multi_reservation(node: &Arc<Node>, req: Request<Body>) -> Response<Body> {
    let request: MultiPointRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    let mut outcomes: Vec<PointOutcome> = Vec::with_capacity(request.points.len());
    for point in &request.points {
        if node.owns_point(point) {
            let outcome = match node.reserve(&request.plate, point).await {
                Ok(hash) => PointOutcome {
                    status: "confirmado".to_string(),
                    point: point.clone(),
                    message: "Reserva confirmada".to_string(),
                    operator_id: node.operator_id().to_string(),
                    hash,
                },
                Err(e) => PointOutcome {
                    status: "falha".to_string(),
                    point: point.clone(),
                    message: e.to_string(),
                    operator_id: node.operator_id().to_string(),
                    hash: String::new(),
                },
            };
            outcomes.push(outcome);
            continue;
        }
        outcomes.push(forward_reservation(node, &request.plate, point).await);
    }

    let success = !outcomes.is_empty() && outcomes.iter().all(|o| o.status == "confirmado");
    match serde_json::to_value(&outcomes) {
        Ok(reservations) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "placa": request.plate,
                "reservas": reservations,
                "total": outcomes.len(),
                "sucesso": success,
            }),
        ),
        Err(_) => empty_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn forward_reservation(node: &Arc<Node>, plate: &str, point: &str) -> PointOutcome {
    let failure = |message: String, operator: &str| PointOutcome {
        status: "falha".to_string(),
        point: point.to_string(),
        message,
        operator_id: operator.to_string(),
        hash: String::new(),
    };

    let Some(owner) = node.config.point_operators.get(point) else {
        return failure("Ponto desconhecido na federacao".to_string(), node.operator_id());
    };
    let Some(base_url) = node.config.registry.base_url(owner) else {
        return failure(format!("Operadora {owner} fora do registro"), owner);
    };

    let tx = Transaction::reservation(plate, point, owner);
    match node
        .peer_client
        .post_json(&format!("{base_url}/reserva"), &tx)
        .await
    {
        Ok((status, body)) if status == StatusCode::CREATED => {
            let hash = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("hash").and_then(|h| h.as_str()).map(str::to_string))
                .unwrap_or_default();
            PointOutcome {
                status: "confirmado".to_string(),
                point: point.to_string(),
                message: "Reserva confirmada".to_string(),
                operator_id: owner.clone(),
                hash,
            }
        }
        Ok((status, _)) => failure(format!("Operadora {owner} respondeu {status}"), owner),
        Err(e) => failure(format!("Falha ao contatar operadora {owner}: {e}"), owner),
    }
}

async fn post_cancellation(node: &Arc<Node>, req: Request<Body>) -> Response<Body> {
    let request: MultiPointRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let canceled = node.cancel(&request.plate, &request.points).await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "placa": request.plate,
            "cancelados": canceled,
            "status": "success",
            "empresa_id": node.operator_id(),
        }),
    )
}

async fn get_point_status(node: &Arc<Node>) -> Response<Body> {
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "empresa_id": node.operator_id(),
            "pontos": node.connectivity_snapshot(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    )
}

// ============================
// Router
// ============================

async fn route(
    node: Arc<Node>,
    ingest: IngestService,
    req: Request<Body>,
) -> Response<Body> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    match (method, path.as_str()) {
        (Method::GET, "/blockchain") => get_blockchain(&node).await,
        (Method::POST, "/bloco") => post_block(&ingest, req).await,
        (Method::POST, "/sincronizar") => post_sync(&node, req).await,
        (Method::POST, "/reserva") => post_reservation(&node, req).await,
        (Method::POST, "/recarga") => post_recharge(&node, req).await,
        (Method::POST, "/pagamento") => post_payment(&node, req).await,
        (Method::GET, "/api/status") => get_status(&node).await,
        (Method::POST, "/api/verificar-hash") => post_hash_lookup(&node, req).await,
        (Method::GET, "/api/historico") => get_history(&node, &req).await,
        (Method::POST, "/api/reservas") => post_multi_reservation(&node, req).await,
        (Method::POST, "/api/cancelamento") => post_cancellation(&node, req).await,
        (Method::GET, "/api/pontos/status") => get_point_status(&node).await,
        (Method::GET, "/metrics") => response_with(
            StatusCode::OK,
            Body::from(node.metrics.render_prometheus()),
            "text/plain; version=0.0.4",
        ),
        _ => empty_response(StatusCode::NOT_FOUND),
    }
}

pub async fn serve(
    node: Arc<Node>,
    ingest: IngestService,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let node = node.clone();
        let ingest = ingest.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let node = node.clone();
                let ingest = ingest.clone();
                async move { Ok::<_, Infallible>(route(node, ingest, req).await) }
            }))
        }
    });
    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(%addr, "http api listening");
    server.await?;
    Ok(())
}
