// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The signer engine: tokens, their keys, certificate requests and certificates.
//!
//! Every token gets its own worker thread, which is the only thing allowed to touch that
//! token's device or model. [`TokenManager`] routes operations to the right worker, and
//! [`Gateway`] maps wire requests onto the manager and failures onto wire faults.

pub mod device;
pub mod error;
pub mod gateway;
pub mod index;
pub mod model;
pub mod operations;
pub mod registry;
pub mod soft_token;
pub mod worker;

pub use device::{
    CertificateDecoder, DecodeError, DecodedCertificate, DeviceError, DeviceKey, DeviceProvider,
    TokenDevice,
};
pub use error::{Entity, OperationError, SignerError};
pub use gateway::Gateway;
pub use registry::{TokenManager, TokenSpec};
pub use soft_token::{SoftCertificateDecoder, SoftDeviceProvider, SoftToken};
