// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::Request;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use signer::{SoftCertificateDecoder, SoftDeviceProvider, TokenManager, TokenSpec};
use signer_server::metrics::SignerMetrics;
use signer_server::response::GenericResponse;
use signer_server::rpc;
use signer_server::server::Server;
use signer_server::state::SignerState;

const JSON_SIZE_LIMIT: u64 = 4096;

struct Client {
    connections: mpsc::Sender<io::Result<(DuplexStream, SocketAddr)>>,
}

struct Reply {
    status: u16,
    head: String,
    body: String,
}

impl Reply {
    fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

impl Client {
    fn spawn<R, F>(respond: R) -> Self
    where
        R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send + 'static,
    {
        let (connections, mut rx) = mpsc::channel(4);
        let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        tokio::spawn(async move { Server::new(8).serve(stream, respond).await });
        Self { connections }
    }

    async fn send(&self, raw: &[u8]) -> Reply {
        let (mut client, server_side) = tokio::io::duplex(1 << 16);
        self.connections
            .send(Ok((server_side, SocketAddr::from(([127, 0, 0, 1], 4000)))))
            .await
            .unwrap();
        client.write_all(raw).await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();

        let (head, body) = response.split_once("\r\n\r\n").unwrap();
        let status = head.split(' ').nth(1).unwrap().parse().unwrap();
        Reply {
            status,
            head: head.to_ascii_lowercase(),
            body: body.to_owned(),
        }
    }

    async fn get(&self, path: &str) -> Reply {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: signer\r\nConnection: close\r\n\r\n");
        self.send(raw.as_bytes()).await
    }

    async fn rpc(&self, body: &str) -> Reply {
        let raw = format!(
            "POST /rpc HTTP/1.1\r\nHost: signer\r\nConnection: close\r\n\
             X-Request-ID: req-42\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        self.send(raw.as_bytes()).await
    }
}

async fn signer_state() -> Arc<SignerState> {
    let manager = Arc::new(TokenManager::new(
        Arc::new(SoftDeviceProvider),
        Arc::new(SoftCertificateDecoder),
    ));
    manager.start(vec![TokenSpec::software("0")]).await.unwrap();
    let metrics = Arc::new(SignerMetrics::new().unwrap());
    Arc::new(SignerState::new(manager, metrics, JSON_SIZE_LIMIT))
}

fn main_plane(state: &Arc<SignerState>) -> Client {
    let state = state.clone();
    Client::spawn(move |request, _| rpc::respond(state.clone(), request))
}

#[tokio::test]
async fn software_token_flow_over_http() {
    let state = signer_state().await;
    let client = main_plane(&state);

    let reply = client
        .rpc(&json!({"method": "initSoftwareToken", "params": {"password": "1234"}}).to_string())
        .await;
    assert_eq!(reply.status, 200, "{}", reply.body);
    assert!(reply.head.contains("x-request-id: req-42"), "{}", reply.head);

    let reply = client
        .rpc(
            &json!({
                "method": "generateKey",
                "params": {"tokenId": "0", "keyLabel": "signing", "algorithm": "ED25519"},
            })
            .to_string(),
        )
        .await;
    assert_eq!(reply.status, 200, "{}", reply.body);
    let key_id = reply.json()["id"].as_str().unwrap().to_owned();

    let reply = client.rpc(r#"{"method": "getTokens"}"#).await;
    assert_eq!(reply.status, 200, "{}", reply.body);
    let tokens = reply.json();
    assert_eq!(tokens[0]["id"], "0");
    assert_eq!(tokens[0]["active"], true);
    assert_eq!(tokens[0]["keys"][0]["id"], key_id);

    state.manager().shutdown().await;
}

#[tokio::test]
async fn coded_faults_are_500s_with_fault_codes() {
    let state = signer_state().await;
    let client = main_plane(&state);

    let reply = client
        .rpc(r#"{"method": "getCertForHash", "params": {"certHash": "nope"}}"#)
        .await;
    assert_eq!(reply.status, 500);
    let fault = reply.json();
    assert_eq!(fault["status"], "INTERNAL");
    assert_eq!(fault["code"], 13);
    assert_eq!(fault["faultCode"], "Signer.CertNotFound");
    assert_eq!(fault["faultDetail"], "nope");

    assert_eq!(state.metrics.requests.get(), 1);
    assert_eq!(state.metrics.coded_faults.get(), 1);
    assert_eq!(state.metrics.in_flight_count(), 0);
}

#[tokio::test]
async fn malformed_requests_are_400s() {
    let state = signer_state().await;
    let client = main_plane(&state);

    for body in [r#"{"method": "launchMissiles"}"#, "not json"] {
        let reply = client.rpc(body).await;
        assert_eq!(reply.status, 400, "{}", reply.body);
        let fault = reply.json();
        assert_eq!(fault["status"], "INVALID_ARGUMENT");
        assert_eq!(fault["faultCode"], "Signer.InvalidRequest");
    }
    assert_eq!(state.metrics.bad_requests.get(), 2);
    assert_eq!(state.metrics.coded_faults.get(), 0);
}

#[tokio::test]
async fn bodies_need_a_length_within_the_limit() {
    let state = signer_state().await;
    let client = main_plane(&state);

    let padding = " ".repeat(JSON_SIZE_LIMIT as usize);
    let reply = client.rpc(&format!(r#"{{"method": "getTokens"}}{padding}"#)).await;
    assert_eq!(reply.status, 413);

    let reply = client
        .send(b"POST /rpc HTTP/1.1\r\nHost: signer\r\nConnection: close\r\n\r\n")
        .await;
    assert_eq!(reply.status, 411);

    assert_eq!(state.metrics.requests.get(), 2);
    assert_eq!(state.metrics.bad_requests.get(), 2);
}

#[tokio::test]
async fn version_and_unknown_routes() {
    let state = signer_state().await;
    let client = main_plane(&state);

    let reply = client.get("/version").await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.json()["server_version"], env!("CARGO_PKG_VERSION"));

    assert_eq!(client.get("/rpc").await.status, 404);
    assert_eq!(client.get("/metrics").await.status, 404);
}

#[tokio::test]
async fn monitoring_plane_serves_metrics() {
    let state = signer_state().await;
    let client = main_plane(&state);
    client.rpc(r#"{"method": "getTokens"}"#).await;

    let monitoring = {
        let state = state.clone();
        Client::spawn(move |request, _| rpc::respond_to_monitoring_plane(state.clone(), request))
    };
    let reply = monitoring.get("/metrics").await;
    assert_eq!(reply.status, 200);
    assert!(reply.body.contains("signer_total_requests 1"), "{}", reply.body);
    assert!(reply.body.contains("signer_requests_in_flight 0"), "{}", reply.body);

    assert_eq!(monitoring.get("/rpc").await.status, 404);
}
