// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire types shared between the signer and the services that call it.
//!
//! Everything that crosses the RPC boundary lives here: the request enum, the
//! result records, and the fault envelope used to report failures.

pub mod base64_bytes;
pub mod codes;
pub mod fault;
#[cfg(feature = "http")]
pub mod http;
pub mod request;
pub mod requests;
pub mod types;
pub mod version;

pub use base64_bytes::Base64Bytes;
pub use fault::{FaultDetail, RpcFault, RpcStatus};
pub use request::{Pin, SignerRequest};
pub use requests::RequestId;
pub use types::*;
