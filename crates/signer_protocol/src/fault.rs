// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fault envelope returned for every failed RPC.
//!
//! A fault is either *coded* (a known domain condition, carrying at least a `faultCode`) or
//! *opaque* (something unexpected broke; no detail fields at all). Callers should branch on
//! [`RpcFault::fault_code`] / [`FaultDetail::translation_code`] rather than parsing
//! [`RpcFault::message`], and must treat an opaque fault as an unknown outcome.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport-independent status of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcStatus {
    /// The request could not be decoded or failed shape validation.
    InvalidArgument,
    /// A modeled domain condition; the detail record says which one.
    Internal,
    /// Something not modeled went wrong. No detail is attached.
    Unknown,
}

impl RpcStatus {
    /// Stable numeric form of the status.
    pub const fn code(self) -> u16 {
        match self {
            RpcStatus::Unknown => 2,
            RpcStatus::InvalidArgument => 3,
            RpcStatus::Internal => 13,
        }
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RpcStatus::InvalidArgument => "INVALID_ARGUMENT",
            RpcStatus::Internal => "INTERNAL",
            RpcStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Structured metadata attached to a coded fault.
///
/// Each field is present only if the originating condition set it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation_code: Option<String>,
}

impl FaultDetail {
    pub fn with_code(fault_code: impl Into<String>) -> Self {
        Self {
            fault_code: Some(fault_code.into()),
            ..Default::default()
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.fault_actor = Some(actor.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.fault_detail = Some(detail.into());
        self
    }

    pub fn string(mut self, fault_string: impl Into<String>) -> Self {
        self.fault_string = Some(fault_string.into());
        self
    }

    pub fn translation(mut self, translation_code: impl Into<String>) -> Self {
        self.translation_code = Some(translation_code.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Fault envelope sent back in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{status}: {message}")]
pub struct RpcFault {
    pub status: RpcStatus,
    /// Numeric form of `status`, for callers that only look at numbers.
    pub code: u16,
    pub message: String,
    #[serde(flatten)]
    pub detail: FaultDetail,
}

impl RpcFault {
    /// A known domain condition.
    pub fn coded(message: impl Into<String>, detail: FaultDetail) -> Self {
        Self {
            status: RpcStatus::Internal,
            code: RpcStatus::Internal.code(),
            message: message.into(),
            detail,
        }
    }

    /// A request that could not be decoded.
    pub fn invalid_argument(message: impl Into<String>, detail: FaultDetail) -> Self {
        Self {
            status: RpcStatus::InvalidArgument,
            code: RpcStatus::InvalidArgument.code(),
            message: message.into(),
            detail,
        }
    }

    /// An unexpected failure. Carries no detail, so it can't be mistaken for a domain condition.
    pub fn opaque(message: impl Into<String>) -> Self {
        Self {
            status: RpcStatus::Unknown,
            code: RpcStatus::Unknown.code(),
            message: message.into(),
            detail: FaultDetail::default(),
        }
    }

    pub fn is_coded(&self) -> bool {
        self.detail.fault_code.is_some()
    }

    pub fn fault_code(&self) -> Option<&str> {
        self.detail.fault_code.as_deref()
    }

    pub fn translation_code(&self) -> Option<&str> {
        self.detail.translation_code.as_deref()
    }
}
