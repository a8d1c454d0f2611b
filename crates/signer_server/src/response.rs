// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Response-related helpers

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use signer_protocol::{RpcFault, RpcStatus};

/// Type-erased HTTP response
pub type GenericResponse = Response<BoxBody<Bytes, anyhow::Error>>;

/// A response that ends request handling early, for use with `?`.
pub struct ErrResponse(pub GenericResponse);

pub type ResponseResult = Result<GenericResponse, ErrResponse>;

/// Return a [`GenericResponse`] with known content.
pub fn full(
    status: StatusCode,
    content_type: &'static str,
    content: impl Into<Bytes>,
) -> GenericResponse {
    let body = Full::new(content.into())
        .map_err(anyhow::Error::from)
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Return a plain text response with known content.
pub fn text(status: StatusCode, content: impl ToString) -> GenericResponse {
    full(status, "text/plain; charset=utf-8", content.to_string())
}

/// Return a JSON response with known content.
pub fn json(status: StatusCode, content: impl Into<Bytes>) -> GenericResponse {
    full(status, "application/json", content)
}

/// Serialize `value` into a JSON response, or a 500 if that somehow fails.
pub fn serialized(status: StatusCode, value: &impl Serialize) -> GenericResponse {
    match serde_json::to_vec(value) {
        Ok(body) => json(status, body),
        Err(e) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format_args!("couldn't serialize response: {e}"),
        ),
    }
}

/// Return a plain text "404 not found" response with appropriate status code
pub fn not_found() -> GenericResponse {
    text(StatusCode::NOT_FOUND, "404 not found")
}

/// HTTP status carrying a fault: client mistakes are 400, everything else 500.
pub fn fault_status(fault: &RpcFault) -> StatusCode {
    match fault.status {
        RpcStatus::InvalidArgument => StatusCode::BAD_REQUEST,
        RpcStatus::Internal | RpcStatus::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Return the fault envelope with its matching status code.
pub fn fault(fault: &RpcFault) -> GenericResponse {
    serialized(fault_status(fault), fault)
}
