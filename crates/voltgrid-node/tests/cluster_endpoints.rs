// SPDX-License-Identifier: AGPL-3.0-only
#![forbid(unsafe_code)]

//! End-to-end scenarios against real node processes. Ignored by default:
//! they bind local ports and spawn sibling binaries.

use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::cargo::cargo_bin;
use hyper::{Body, Client, Method, Request, StatusCode, Uri};
use tokio::time::sleep;

fn unique_tmp(prefix: &str) -> std::path::PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("voltgrid_e2e_{}_{}", prefix, nanos))
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn write_node_config(
    dir: &std::path::Path,
    operator_id: &str,
    data_dir: &std::path::Path,
    ports: &[(&str, u16)],
    ttl_secs: u64,
) -> std::path::PathBuf {
    let mut peers = String::new();
    for (id, port) in ports {
        peers.push_str(&format!("\"{id}\" = \"http://127.0.0.1:{port}\"\n"));
    }
    let my_port = ports
        .iter()
        .find(|(id, _)| id == &operator_id)
        .map(|(_, p)| *p)
        .expect("own port");
    let config = format!(
        "data_dir = \"{}\"\nbind = \"127.0.0.1:{}\"\nbroker_host = \"127.0.0.1\"\nreservation_ttl_secs = {}\n\n[peers]\n{}\n[points]\n\"Salvador\" = \"001\"\n\"Aracaju\" = \"001\"\n\"Recife\" = \"002\"\n",
        data_dir.display(),
        my_port,
        ttl_secs,
        peers
    );
    let path = dir.join(format!("node_{operator_id}.toml"));
    std::fs::write(&path, config).expect("write config");
    path
}

fn spawn_node(config: &std::path::Path, operator_id: &str) -> Child {
    Command::new(cargo_bin("voltgrid-node"))
        .arg("--config")
        .arg(config)
        .env("EMPRESA_ID", operator_id)
        .env("RUST_LOG", "info")
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("spawn voltgrid-node")
}

async fn wait_ready(client: &Client<hyper::client::HttpConnector>, port: u16, secs: u64) -> bool {
    let deadline = Instant::now() + Duration::from_secs(secs);
    loop {
        if Instant::now() > deadline {
            return false;
        }
        let uri: Uri = format!("http://127.0.0.1:{port}/blockchain").parse().unwrap();
        match client.get(uri).await {
            Ok(resp) if resp.status() == StatusCode::OK => return true,
            _ => sleep(Duration::from_millis(100)).await,
        }
    }
}

async fn post_json(
    client: &Client<hyper::client::HttpConnector>,
    port: u16,
    path: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let uri: Uri = format!("http://127.0.0.1:{port}{path}").parse().unwrap();
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = client.request(req).await.expect("post");
    let status = resp.status();
    let bytes = hyper::body::to_bytes(resp.into_body()).await.expect("body");
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, value)
}

async fn fetch_chain(
    client: &Client<hyper::client::HttpConnector>,
    port: u16,
) -> serde_json::Value {
    let uri: Uri = format!("http://127.0.0.1:{port}/blockchain").parse().unwrap();
    let resp = client.get(uri).await.expect("get chain");
    let bytes = hyper::body::to_bytes(resp.into_body()).await.expect("body");
    serde_json::from_slice(&bytes).expect("chain json")
}

async fn wait_chain_len(
    client: &Client<hyper::client::HttpConnector>,
    port: u16,
    expected: usize,
    secs: u64,
) -> bool {
    let deadline = Instant::now() + Duration::from_secs(secs);
    loop {
        if Instant::now() > deadline {
            return false;
        }
        let chain = fetch_chain(client, port).await;
        if chain["blocos"].as_array().map(Vec::len) == Some(expected) {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
}

fn reservation_tx(plate: &str, point: &str, operator: &str) -> serde_json::Value {
    serde_json::json!({
        "tipo": "RESERVA", "placa": plate, "valor": 0.0,
        "ponto": point, "empresa": operator,
    })
}

#[tokio::test]
#[ignore]
async fn fresh_genesis_single_operator() {
    let base = unique_tmp("genesis");
    let data_dir = base.join("data");
    std::fs::create_dir_all(&data_dir).expect("data dir");

    let port = free_port();
    let config = write_node_config(&base, "001", &data_dir, &[("001", port)], 300);
    let mut child = spawn_node(&config, "001");

    let client: Client<hyper::client::HttpConnector> = Client::new();
    assert!(wait_ready(&client, port, 20).await, "node not ready");

    let chain = fetch_chain(&client, port).await;
    let blocks = chain["blocos"].as_array().expect("blocos");
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0]["index"], 0);
    assert_eq!(blocks[0]["transacao"]["tipo"], "GENESIS");
    assert_eq!(blocks[0]["autor"], "GENESIS");
    assert!(data_dir.join("chain_001.json").exists());
    assert!(data_dir.join("empresa_001_private.pem").exists());

    let _ = child.kill();
    let _ = child.wait();
}

#[tokio::test]
#[ignore]
async fn two_operator_federation_flow() {
    let base = unique_tmp("federation");
    let data_dir = base.join("data");
    std::fs::create_dir_all(&data_dir).expect("data dir");

    let port_a = free_port();
    let port_b = free_port();
    let ports = [("001", port_a), ("002", port_b)];
    let config_a = write_node_config(&base, "001", &data_dir, &ports, 300);
    let config_b = write_node_config(&base, "002", &data_dir, &ports, 300);
    let mut node_a = spawn_node(&config_a, "001");
    let mut node_b = spawn_node(&config_b, "002");

    let client: Client<hyper::client::HttpConnector> = Client::new();
    assert!(wait_ready(&client, port_a, 30).await, "001 not ready");
    assert!(wait_ready(&client, port_b, 30).await, "002 not ready");

    // single reservation commits on both chains with the same hash
    let (status, body) =
        post_json(&client, port_a, "/reserva", reservation_tx("ABC1234", "Salvador", "001")).await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    let hash = body["hash"].as_str().expect("hash").to_string();
    assert!(wait_chain_len(&client, port_a, 2, 5).await);
    assert!(wait_chain_len(&client, port_b, 2, 5).await);
    for port in [port_a, port_b] {
        let chain = fetch_chain(&client, port).await;
        assert_eq!(chain["blocos"][1]["hash"].as_str(), Some(hash.as_str()));
    }

    // a second plate is rejected while the point is held
    let (status, _) =
        post_json(&client, port_a, "/reserva", reservation_tx("XYZ9999", "Salvador", "001")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(wait_chain_len(&client, port_a, 2, 2).await);

    // cancel, then the other plate may take the point
    let (status, body) = post_json(
        &client,
        port_a,
        "/api/cancelamento",
        serde_json::json!({ "placa_veiculo": "ABC1234", "pontos": ["Salvador"] }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelados"], 1);

    let (status, _) =
        post_json(&client, port_a, "/reserva", reservation_tx("XYZ9999", "Salvador", "001")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(wait_chain_len(&client, port_a, 3, 5).await);
    assert!(wait_chain_len(&client, port_b, 3, 5).await);

    // recharge releases the point, payment settles and funds the operator
    let (status, _) = post_json(
        &client,
        port_a,
        "/recarga",
        serde_json::json!({
            "tipo": "RECARGA", "placa": "XYZ9999", "valor": 42.5,
            "ponto": "Salvador", "empresa": "001",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(wait_chain_len(&client, port_b, 4, 5).await);
    let (status, _) = post_json(
        &client,
        port_a,
        "/pagamento",
        serde_json::json!({
            "tipo": "PAGAMENTO", "placa": "XYZ9999", "valor": 42.5,
            "ponto": "Salvador", "empresa": "001",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(wait_chain_len(&client, port_b, 5, 5).await);

    let profile: serde_json::Value = serde_json::from_slice(
        &std::fs::read(data_dir.join("empresa_001.json")).expect("profile"),
    )
    .expect("profile json");
    assert_eq!(profile["saldo_atual"].as_f64(), Some(42.5));

    // history covers every event of the plate
    let uri: Uri = format!("http://127.0.0.1:{port_a}/api/historico?placa=XYZ9999")
        .parse()
        .unwrap();
    let resp = client.get(uri).await.expect("history");
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = hyper::body::to_bytes(resp.into_body()).await.expect("body");
    let history: serde_json::Value = serde_json::from_slice(&bytes).expect("history json");
    assert_eq!(history["total"], 3);

    // corruption repair: stop 002, damage its chain file, restart
    let _ = node_b.kill();
    let _ = node_b.wait();
    let chain_b_path = data_dir.join("chain_002.json");
    let mut damaged: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&chain_b_path).expect("read chain"))
            .expect("chain json");
    let original = damaged["blocos"][1]["hash"].as_str().expect("hash").to_string();
    let flipped = if original.starts_with('0') {
        format!("1{}", &original[1..])
    } else {
        format!("0{}", &original[1..])
    };
    damaged["blocos"][1]["hash"] = serde_json::Value::String(flipped.clone());
    std::fs::write(&chain_b_path, damaged.to_string()).expect("write damaged chain");

    let mut node_b = spawn_node(&config_b, "002");
    assert!(wait_ready(&client, port_b, 30).await, "002 not ready after repair");
    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let chain = fetch_chain(&client, port_b).await;
        if chain["blocos"][1]["hash"].as_str() == Some(original.as_str()) {
            break;
        }
        assert!(Instant::now() < deadline, "002 did not repair its chain");
        sleep(Duration::from_millis(200)).await;
    }
    assert!(wait_chain_len(&client, port_b, 5, 5).await);

    // consensus failure: with 002 gone no write may commit anywhere
    let _ = node_b.kill();
    let _ = node_b.wait();
    let (status, _) = post_json(
        &client,
        port_a,
        "/recarga",
        serde_json::json!({
            "tipo": "RECARGA", "placa": "XYZ9999", "valor": 10.0,
            "ponto": "Aracaju", "empresa": "001",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert!(wait_chain_len(&client, port_a, 5, 2).await);

    let _ = node_a.kill();
    let _ = node_a.wait();
}

#[tokio::test]
#[ignore]
async fn reservation_expires_by_timeout() {
    let base = unique_tmp("timeout");
    let data_dir = base.join("data");
    std::fs::create_dir_all(&data_dir).expect("data dir");

    let port = free_port();
    let config = write_node_config(&base, "001", &data_dir, &[("001", port)], 2);
    let mut child = spawn_node(&config, "001");

    let client: Client<hyper::client::HttpConnector> = Client::new();
    assert!(wait_ready(&client, port, 20).await, "node not ready");

    let (status, _) =
        post_json(&client, port, "/reserva", reservation_tx("ABC1234", "Salvador", "001")).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) =
        post_json(&client, port, "/reserva", reservation_tx("XYZ9999", "Salvador", "001")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // after the ttl the point is released and another plate may take it
    sleep(Duration::from_secs(3)).await;
    let (status, _) =
        post_json(&client, port, "/reserva", reservation_tx("XYZ9999", "Salvador", "001")).await;
    assert_eq!(status, StatusCode::CREATED);

    let _ = child.kill();
    let _ = child.wait();
}
