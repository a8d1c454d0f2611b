// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use crate::device::DeviceError;

/// Kind of object a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Entity {
    Token,
    Key,
    CertRequest,
    Certificate,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Entity::Token => "Token",
            Entity::Key => "Key",
            Entity::CertRequest => "Certificate request",
            Entity::Certificate => "Certificate",
        };
        f.write_str(s)
    }
}

/// A modeled failure of a signer operation.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: Entity, id: String },
    #[error("Token '{token_id}' not available")]
    TokenNotAvailable { token_id: String },
    #[error("Token '{token_id}' is read only")]
    TokenReadOnly { token_id: String },
    #[error("Key '{key_id}' is a {actual} key, {requested} was requested")]
    WrongKeyUsage {
        key_id: String,
        actual: signer_protocol::KeyUsage,
        requested: signer_protocol::KeyUsage,
    },
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("PIN incorrect for token '{token_id}'")]
    PinIncorrect { token_id: String },
    #[error("Device error on token '{token_id}': {source}")]
    Device {
        token_id: String,
        #[source]
        source: DeviceError,
    },
}

impl SignerError {
    pub fn not_found(entity: Entity, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Maps a device failure for `token_id`. Callers handle the side effects of
    /// [`DeviceError::Unreachable`] themselves.
    pub fn from_device(token_id: &str, source: DeviceError) -> Self {
        match source {
            DeviceError::PinIncorrect => Self::PinIncorrect {
                token_id: token_id.to_owned(),
            },
            DeviceError::Unreachable(_) => Self::TokenNotAvailable {
                token_id: token_id.to_owned(),
            },
            DeviceError::KeyMissing(id) => Self::not_found(Entity::Key, id),
            DeviceError::CertificateMissing(id) => Self::not_found(Entity::Certificate, id),
            DeviceError::UnsupportedAlgorithm(alg) => {
                Self::invalid_request(format!("algorithm {alg} is not supported by this token"))
            }
            source => Self::Device {
                token_id: token_id.to_owned(),
                source,
            },
        }
    }
}

/// What a caller of the engine gets back when an operation fails.
///
/// `Signer` errors are part of the contract and are reported with their codes;
/// `Unexpected` ones (a panicking operation, a result that can't be serialized)
/// are reported without any detail.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("unexpected failure: {0:#}")]
    Unexpected(anyhow::Error),
}

impl OperationError {
    pub fn as_signer(&self) -> Option<&SignerError> {
        match self {
            OperationError::Signer(e) => Some(e),
            OperationError::Unexpected(_) => None,
        }
    }
}
