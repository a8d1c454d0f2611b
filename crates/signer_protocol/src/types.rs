// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Enumerations and result records that appear in requests and responses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::Base64Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenType {
    Software,
    HardwareSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    Ok,
    NotInitialized,
    NotAvailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyUsage {
    Authentication,
    Signing,
}

impl fmt::Display for KeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyUsage::Authentication => f.write_str("AUTHENTICATION"),
            KeyUsage::Signing => f.write_str("SIGNING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
    Ed25519,
}

impl KeyAlgorithm {
    pub fn sign_mechanism(self) -> SignMechanism {
        match self {
            KeyAlgorithm::Rsa => SignMechanism::RsaPkcs,
            KeyAlgorithm::Ec => SignMechanism::Ecdsa,
            KeyAlgorithm::Ed25519 => SignMechanism::Eddsa,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAlgorithm::Rsa => f.write_str("RSA"),
            KeyAlgorithm::Ec => f.write_str("EC"),
            KeyAlgorithm::Ed25519 => f.write_str("ED25519"),
        }
    }
}

/// PKCS#11 mechanism a key signs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignMechanism {
    #[serde(rename = "CKM_RSA_PKCS")]
    RsaPkcs,
    #[serde(rename = "CKM_ECDSA")]
    Ecdsa,
    #[serde(rename = "CKM_EDDSA")]
    Eddsa,
}

/// Signature algorithm requested by a caller of `sign`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignAlgorithm {
    #[serde(rename = "SHA256withRSA")]
    Sha256WithRsa,
    #[serde(rename = "SHA384withRSA")]
    Sha384WithRsa,
    #[serde(rename = "SHA512withRSA")]
    Sha512WithRsa,
    #[serde(rename = "SHA256withECDSA")]
    Sha256WithEcdsa,
    #[serde(rename = "SHA384withECDSA")]
    Sha384WithEcdsa,
    #[serde(rename = "SHA512withECDSA")]
    Sha512WithEcdsa,
    #[serde(rename = "Ed25519")]
    Ed25519,
}

impl SignAlgorithm {
    /// The mechanism a key must have to produce this kind of signature.
    pub fn mechanism(self) -> SignMechanism {
        use SignAlgorithm::*;
        match self {
            Sha256WithRsa | Sha384WithRsa | Sha512WithRsa => SignMechanism::RsaPkcs,
            Sha256WithEcdsa | Sha384WithEcdsa | Sha512WithEcdsa => SignMechanism::Ecdsa,
            Ed25519 => SignMechanism::Eddsa,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CertRequestFormat {
    Der,
    Pem,
}

/// Registration state of a certificate.
///
/// Travels as a free-form string so that an unknown value is reported by the engine
/// as an invalid request rather than as an undecodable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertStatus {
    #[serde(rename = "saved")]
    Saved,
    #[serde(rename = "registration in progress")]
    RegistrationInProgress,
    #[serde(rename = "registered")]
    Registered,
    #[serde(rename = "deletion in progress")]
    DeletionInProgress,
    #[serde(rename = "global error")]
    GlobalError,
}

impl CertStatus {
    pub const ALL: [CertStatus; 5] = [
        CertStatus::Saved,
        CertStatus::RegistrationInProgress,
        CertStatus::Registered,
        CertStatus::DeletionInProgress,
        CertStatus::GlobalError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CertStatus::Saved => "saved",
            CertStatus::RegistrationInProgress => "registration in progress",
            CertStatus::Registered => "registered",
            CertStatus::DeletionInProgress => "deletion in progress",
            CertStatus::GlobalError => "global error",
        }
    }
}

impl fmt::Display for CertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown certificate status {0:?}")]
pub struct UnknownCertStatus(pub String);

impl FromStr for CertStatus {
    type Err = UnknownCertStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownCertStatus(s.to_owned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub friendly_name: String,
    pub active: bool,
    pub read_only: bool,
    pub available: bool,
    pub status: TokenStatus,
    pub keys: Vec<KeyInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    pub id: String,
    pub label: String,
    pub friendly_name: String,
    pub usage: Option<KeyUsage>,
    pub algorithm: KeyAlgorithm,
    pub sign_mechanism: SignMechanism,
    pub public_key: Base64Bytes,
    pub cert_requests: Vec<CertRequestInfo>,
    pub certs: Vec<CertificateInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertRequestInfo {
    pub id: String,
    pub owner_id: Option<String>,
    pub subject_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_alt_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_profile: Option<String>,
    pub format: CertRequestFormat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    /// Content hash of the certificate; also its id.
    pub id: String,
    pub owner_id: Option<String>,
    pub active: bool,
    pub status: CertStatus,
    pub certificate_bytes: Base64Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewed_cert_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewal_error: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub next_planned_renewal: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenInfoAndKeyId {
    pub token_info: TokenInfo,
    pub key_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyIdInfo {
    pub key_id: String,
    pub sign_mechanism: SignMechanism,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedCertRequestInfo {
    pub cert_req_id: String,
    pub cert_request: Base64Bytes,
    pub format: CertRequestFormat,
    pub key_id: String,
    pub owner_id: Option<String>,
    pub key_usage: KeyUsage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportedCertInfo {
    pub cert_id: String,
}
