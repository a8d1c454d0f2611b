// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capabilities the engine needs from the outside world: a cryptographic device per token,
//! a way to open one, and a way to make sense of certificate bytes.
//!
//! Device calls may block. They are only ever made from the owning token's worker thread,
//! so implementations don't need internal locking.

use signer_protocol::{CertRequestFormat, KeyAlgorithm, KeyUsage, Pin, SignAlgorithm};
use time::OffsetDateTime;

use crate::registry::TokenSpec;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("PIN rejected")]
    PinIncorrect,
    #[error("device unreachable: {0}")]
    Unreachable(String),
    #[error("no key with id {0:?} on device")]
    KeyMissing(String),
    #[error("no certificate with id {0:?} on device")]
    CertificateMissing(String),
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(KeyAlgorithm),
    #[error("device not initialized")]
    NotInitialized,
    #[error("not logged in")]
    NotLoggedIn,
    #[error("{0}")]
    Internal(String),
}

/// A key pair as created by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceKey {
    pub id: String,
    pub public_key: Vec<u8>,
}

/// What goes into a certificate signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrParams {
    pub subject_name: String,
    pub subject_alt_name: Option<String>,
    pub key_usage: KeyUsage,
    pub format: CertRequestFormat,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfSignedParams {
    pub common_name: String,
    pub key_usage: KeyUsage,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

/// One cryptographic token: a software keystore or a hardware slot.
pub trait TokenDevice: Send + 'static {
    fn is_initialized(&self) -> bool;

    /// Sets the initial PIN of a blank token. Leaves the token logged in.
    fn initialize(&mut self, pin: &Pin) -> Result<(), DeviceError>;

    fn login(&mut self, pin: &Pin) -> Result<(), DeviceError>;

    fn logout(&mut self) -> Result<(), DeviceError>;

    fn change_pin(&mut self, old_pin: &Pin, new_pin: &Pin) -> Result<(), DeviceError>;

    fn generate_key(&mut self, label: &str, algorithm: KeyAlgorithm)
        -> Result<DeviceKey, DeviceError>;

    fn delete_key(&mut self, key_id: &str) -> Result<(), DeviceError>;

    fn sign(
        &mut self,
        key_id: &str,
        algorithm: SignAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, DeviceError>;

    fn generate_cert_request(
        &mut self,
        key_id: &str,
        params: &CsrParams,
    ) -> Result<Vec<u8>, DeviceError>;

    fn generate_self_signed_cert(
        &mut self,
        key_id: &str,
        params: &SelfSignedParams,
    ) -> Result<Vec<u8>, DeviceError>;

    fn store_certificate(
        &mut self,
        key_id: &str,
        cert_id: &str,
        cert: &[u8],
    ) -> Result<(), DeviceError>;

    fn delete_certificate(&mut self, key_id: &str, cert_id: &str) -> Result<(), DeviceError>;

    /// Releases the device. Called once, from the worker thread, when the token is torn down.
    fn close(&mut self) {}
}

/// Opens the device behind a configured token.
pub trait DeviceProvider: Send + Sync + 'static {
    fn open(&self, spec: &TokenSpec) -> Result<Box<dyn TokenDevice>, DeviceError>;
}

/// The parts of a certificate the engine cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCertificate {
    /// Lowercase content hash; used as the certificate id.
    pub hash: String,
    pub public_key: Vec<u8>,
    pub subject: String,
    /// Usage the certificate was issued for, if it says.
    pub key_usage: Option<KeyUsage>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

pub trait CertificateDecoder: Send + Sync + 'static {
    fn decode(&self, cert: &[u8]) -> Result<DecodedCertificate, DecodeError>;
}
