// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Request routing for the main and monitoring planes.

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_LENGTH};
use hyper::{Method, Request, StatusCode};
use tracing::{debug, info, warn};

use signer::Gateway;
use signer_protocol::http::REQUEST_ID_HEADER;
use signer_protocol::version::SignerVersion;
use signer_protocol::{RequestId, RpcStatus};

use crate::response::{self, ErrResponse, GenericResponse, ResponseResult};
use crate::state::SignerState;

pub async fn respond(state: Arc<SignerState>, request: Request<Incoming>) -> GenericResponse {
    let request_id = RequestId::from(request.headers());
    let mut response = match (request.method(), request.uri().path()) {
        (&Method::POST, "/rpc") => match rpc(&state, &request_id, request).await {
            Ok(r) | Err(ErrResponse(r)) => r,
        },
        (&Method::GET, "/version") => version(),
        _ => response::not_found(),
    };
    if let Ok(value) = HeaderValue::from_str(&request_id.0) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

pub async fn respond_to_monitoring_plane(
    state: Arc<SignerState>,
    request: Request<Incoming>,
) -> GenericResponse {
    match (request.method(), request.uri().path()) {
        (&Method::GET, "/metrics") => match state.metrics.render() {
            Ok(text) => response::text(StatusCode::OK, text),
            Err(e) => response::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format_args!("couldn't render metrics: {e}"),
            ),
        },
        _ => response::not_found(),
    }
}

fn version() -> GenericResponse {
    let version = SignerVersion {
        server_version: env!("CARGO_PKG_VERSION").to_owned(),
    };
    response::serialized(StatusCode::OK, &version)
}

async fn rpc(
    state: &SignerState,
    request_id: &RequestId,
    request: Request<Incoming>,
) -> ResponseResult {
    let metrics = &state.metrics;
    metrics.requests.inc();
    let _in_flight = metrics.in_flight();

    let body = read_body(request, state.json_size_limit)
        .await
        .inspect_err(|_| metrics.bad_requests.inc())?;

    let outcome = match Gateway::decode(&body) {
        Ok(request) => state.gateway.handle(request_id, request).await,
        Err(fault) => {
            info!("{request_id}: rejecting undecodable request: {}", fault.message);
            Err(fault)
        }
    };

    match outcome {
        Ok(result) => {
            debug!("{request_id}: succeeded");
            Ok(response::serialized(StatusCode::OK, &result))
        }
        Err(fault) => {
            match fault.status {
                RpcStatus::InvalidArgument => metrics.bad_requests.inc(),
                RpcStatus::Internal | RpcStatus::Unknown if fault.is_coded() => {
                    metrics.coded_faults.inc()
                }
                RpcStatus::Internal | RpcStatus::Unknown => metrics.unexpected_failures.inc(),
            }
            Ok(response::fault(&fault))
        }
    }
}

/// Reads a body whose declared length is within `limit`.
async fn read_body(request: Request<Incoming>, limit: u64) -> Result<Bytes, ErrResponse> {
    let declared = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| {
            ErrResponse(response::text(
                StatusCode::LENGTH_REQUIRED,
                "A valid Content-Length is required",
            ))
        })?;
    if declared > limit {
        warn!("Rejecting {declared} byte request body; the limit is {limit}");
        return Err(ErrResponse(response::text(
            StatusCode::PAYLOAD_TOO_LARGE,
            format_args!("Request body is limited to {limit} bytes"),
        )));
    }

    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    Limited::new(request.into_body(), limit)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| {
            ErrResponse(response::text(
                StatusCode::BAD_REQUEST,
                format_args!("Couldn't read request body: {e}"),
            ))
        })
}
