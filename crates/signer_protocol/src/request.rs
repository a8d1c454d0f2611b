// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The RPC surface of the signer.
//!
//! A request travels as `{"method": "<name>", "params": {...}}`; methods without
//! parameters may omit `params`.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{Base64Bytes, CertRequestFormat, KeyAlgorithm, KeyUsage, SignAlgorithm};

/// A token PIN or password. Wiped from memory when dropped, never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Pin(String);

impl Pin {
    pub fn new(pin: impl Into<String>) -> Self {
        Self(pin.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pin(***)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum SignerRequest {
    #[serde(rename_all = "camelCase")]
    InitSoftwareToken { password: Pin },
    GetTokens,
    #[serde(rename_all = "camelCase")]
    GetToken { token_id: String },
    #[serde(rename_all = "camelCase")]
    ActivateToken { token_id: String, password: Pin },
    #[serde(rename_all = "camelCase")]
    DeactivateToken { token_id: String },
    #[serde(rename_all = "camelCase")]
    SetTokenFriendlyName {
        token_id: String,
        friendly_name: String,
    },
    #[serde(rename_all = "camelCase")]
    UpdateTokenPin {
        token_id: String,
        old_pin: Pin,
        new_pin: Pin,
    },

    #[serde(rename_all = "camelCase")]
    GenerateKey {
        token_id: String,
        key_label: String,
        algorithm: KeyAlgorithm,
    },
    #[serde(rename_all = "camelCase")]
    DeleteKey {
        key_id: String,
        delete_from_device: bool,
    },
    #[serde(rename_all = "camelCase")]
    SetKeyFriendlyName {
        key_id: String,
        friendly_name: String,
    },
    #[serde(rename_all = "camelCase")]
    GetSignMechanism { key_id: String },
    #[serde(rename_all = "camelCase")]
    Sign {
        key_id: String,
        sign_algorithm: SignAlgorithm,
        digest: Base64Bytes,
    },

    #[serde(rename_all = "camelCase")]
    GenerateCertRequest {
        key_id: String,
        #[serde(default)]
        owner_id: Option<String>,
        key_usage: KeyUsage,
        subject_name: String,
        #[serde(default)]
        alt_name: Option<String>,
        #[serde(default)]
        certificate_profile: Option<String>,
        format: CertRequestFormat,
    },
    #[serde(rename_all = "camelCase")]
    RegenerateCertRequest {
        cert_request_id: String,
        format: CertRequestFormat,
    },
    #[serde(rename_all = "camelCase")]
    DeleteCertRequest { cert_request_id: String },

    #[serde(rename_all = "camelCase")]
    GenerateSelfSignedCert {
        key_id: String,
        #[serde(default)]
        owner_id: Option<String>,
        key_usage: KeyUsage,
        common_name: String,
        #[serde(with = "time::serde::rfc3339")]
        not_before: OffsetDateTime,
        #[serde(with = "time::serde::rfc3339")]
        not_after: OffsetDateTime,
    },
    #[serde(rename_all = "camelCase")]
    ImportCert {
        cert_bytes: Base64Bytes,
        initial_status: String,
        #[serde(default)]
        owner_id: Option<String>,
        #[serde(default)]
        activate: bool,
    },
    #[serde(rename_all = "camelCase")]
    ActivateCert { cert_id: String },
    #[serde(rename_all = "camelCase")]
    DeactivateCert { cert_id: String },
    #[serde(rename_all = "camelCase")]
    DeleteCert { cert_id: String },
    #[serde(rename_all = "camelCase")]
    SetCertStatus { cert_id: String, status: String },
    #[serde(rename_all = "camelCase")]
    SetRenewedCertHash { cert_id: String, hash: String },
    #[serde(rename_all = "camelCase")]
    SetRenewalError {
        cert_id: String,
        error_message: String,
    },
    #[serde(rename_all = "camelCase")]
    SetNextPlannedRenewal {
        cert_id: String,
        #[serde(with = "time::serde::rfc3339")]
        next_renewal_time: OffsetDateTime,
    },
    #[serde(rename_all = "camelCase")]
    GetCertForHash { cert_hash: String },
    #[serde(rename_all = "camelCase")]
    GetKeyIdForCertHash { cert_hash: String },
    #[serde(rename_all = "camelCase")]
    GetTokenAndKeyIdForCertHash { cert_hash: String },
    #[serde(rename_all = "camelCase")]
    GetTokenAndKeyIdForCertRequestId { cert_request_id: String },
    #[serde(rename_all = "camelCase")]
    GetTokenForKeyId { key_id: String },
    #[serde(rename_all = "camelCase")]
    GetOcspResponses { cert_hashes: Vec<String> },
    #[serde(rename_all = "camelCase")]
    SetOcspResponses {
        cert_hashes: Vec<String>,
        responses: Vec<Base64Bytes>,
    },
}

impl SignerRequest {
    /// Wire name of the method, for logs and metrics.
    pub fn method(&self) -> &'static str {
        use SignerRequest::*;
        match self {
            InitSoftwareToken { .. } => "initSoftwareToken",
            GetTokens => "getTokens",
            GetToken { .. } => "getToken",
            ActivateToken { .. } => "activateToken",
            DeactivateToken { .. } => "deactivateToken",
            SetTokenFriendlyName { .. } => "setTokenFriendlyName",
            UpdateTokenPin { .. } => "updateTokenPin",
            GenerateKey { .. } => "generateKey",
            DeleteKey { .. } => "deleteKey",
            SetKeyFriendlyName { .. } => "setKeyFriendlyName",
            GetSignMechanism { .. } => "getSignMechanism",
            Sign { .. } => "sign",
            GenerateCertRequest { .. } => "generateCertRequest",
            RegenerateCertRequest { .. } => "regenerateCertRequest",
            DeleteCertRequest { .. } => "deleteCertRequest",
            GenerateSelfSignedCert { .. } => "generateSelfSignedCert",
            ImportCert { .. } => "importCert",
            ActivateCert { .. } => "activateCert",
            DeactivateCert { .. } => "deactivateCert",
            DeleteCert { .. } => "deleteCert",
            SetCertStatus { .. } => "setCertStatus",
            SetRenewedCertHash { .. } => "setRenewedCertHash",
            SetRenewalError { .. } => "setRenewalError",
            SetNextPlannedRenewal { .. } => "setNextPlannedRenewal",
            GetCertForHash { .. } => "getCertForHash",
            GetKeyIdForCertHash { .. } => "getKeyIdForCertHash",
            GetTokenAndKeyIdForCertHash { .. } => "getTokenAndKeyIdForCertHash",
            GetTokenAndKeyIdForCertRequestId { .. } => "getTokenAndKeyIdForCertRequestId",
            GetTokenForKeyId { .. } => "getTokenForKeyId",
            GetOcspResponses { .. } => "getOcspResponses",
            SetOcspResponses { .. } => "setOcspResponses",
        }
    }
}
