// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Turns decoded requests into registry calls, and results or failures into wire values.
//!
//! This is the only place where [`OperationError`]s become [`RpcFault`]s.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use signer_protocol::codes::*;
use signer_protocol::{Base64Bytes, FaultDetail, RequestId, RpcFault, SignerRequest};
use tracing::{debug, warn};

use crate::error::{Entity, OperationError, SignerError};
use crate::operations::{CertRequestParams, SelfSignedCertParams};
use crate::registry::TokenManager;

/// Message sent with every opaque fault.
pub const UNEXPECTED_FAILURE_MESSAGE: &str = "internal error";

pub struct Gateway {
    manager: Arc<TokenManager>,
}

fn to_value<T: Serialize>(result: T) -> Result<Value, OperationError> {
    serde_json::to_value(result).map_err(|e| OperationError::Unexpected(e.into()))
}

impl Gateway {
    pub fn new(manager: Arc<TokenManager>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<TokenManager> {
        &self.manager
    }

    /// Decodes a request body. Anything that doesn't decode is an invalid argument.
    pub fn decode(body: &[u8]) -> Result<SignerRequest, RpcFault> {
        serde_json::from_slice(body).map_err(|e| {
            let message = format!("malformed request: {e}");
            RpcFault::invalid_argument(
                message.clone(),
                FaultDetail::with_code(with_prefix(X_INVALID_REQUEST))
                    .string(message)
                    .translation(TR_INVALID_REQUEST),
            )
        })
    }

    pub async fn handle(
        &self,
        request_id: &RequestId,
        request: SignerRequest,
    ) -> Result<Value, RpcFault> {
        let method = request.method();
        debug!("{request_id}: handling {method}");
        self.dispatch(request).await.map_err(|err| {
            let fault = translate(&err);
            match &err {
                OperationError::Signer(e) => debug!("{request_id}: {method} failed: {e}"),
                OperationError::Unexpected(e) => {
                    warn!("{request_id}: {method} failed unexpectedly: {e:?}")
                }
            }
            fault
        })
    }

    async fn dispatch(&self, request: SignerRequest) -> Result<Value, OperationError> {
        let m = &self.manager;
        match request {
            SignerRequest::InitSoftwareToken { password } => {
                to_value(m.init_software_token(password).await?)
            }
            SignerRequest::GetTokens => to_value(m.tokens().await?),
            SignerRequest::GetToken { token_id } => to_value(m.token(&token_id).await?),
            SignerRequest::ActivateToken { token_id, password } => {
                to_value(m.activate_token(&token_id, password).await?)
            }
            SignerRequest::DeactivateToken { token_id } => {
                to_value(m.deactivate_token(&token_id).await?)
            }
            SignerRequest::SetTokenFriendlyName {
                token_id,
                friendly_name,
            } => to_value(m.set_token_friendly_name(&token_id, friendly_name).await?),
            SignerRequest::UpdateTokenPin {
                token_id,
                old_pin,
                new_pin,
            } => to_value(m.update_token_pin(&token_id, old_pin, new_pin).await?),

            SignerRequest::GenerateKey {
                token_id,
                key_label,
                algorithm,
            } => to_value(m.generate_key(&token_id, key_label, algorithm).await?),
            SignerRequest::DeleteKey {
                key_id,
                delete_from_device,
            } => to_value(m.delete_key(&key_id, delete_from_device).await?),
            SignerRequest::SetKeyFriendlyName {
                key_id,
                friendly_name,
            } => to_value(m.set_key_friendly_name(&key_id, friendly_name).await?),
            SignerRequest::GetSignMechanism { key_id } => {
                to_value(m.sign_mechanism(&key_id).await?)
            }
            SignerRequest::Sign {
                key_id,
                sign_algorithm,
                digest,
            } => {
                let signature = m.sign(&key_id, sign_algorithm, digest.into_inner()).await?;
                to_value(Base64Bytes(signature))
            }

            SignerRequest::GenerateCertRequest {
                key_id,
                owner_id,
                key_usage,
                subject_name,
                alt_name,
                certificate_profile,
                format,
            } => {
                let params = CertRequestParams {
                    owner_id,
                    key_usage,
                    subject_name,
                    alt_name,
                    certificate_profile,
                    format,
                };
                to_value(m.generate_cert_request(&key_id, params).await?)
            }
            SignerRequest::RegenerateCertRequest {
                cert_request_id,
                format,
            } => to_value(m.regenerate_cert_request(&cert_request_id, format).await?),
            SignerRequest::DeleteCertRequest { cert_request_id } => {
                to_value(m.delete_cert_request(&cert_request_id).await?)
            }

            SignerRequest::GenerateSelfSignedCert {
                key_id,
                owner_id,
                key_usage,
                common_name,
                not_before,
                not_after,
            } => {
                let params = SelfSignedCertParams {
                    owner_id,
                    key_usage,
                    common_name,
                    not_before,
                    not_after,
                };
                let cert = m.generate_self_signed_cert(&key_id, params).await?;
                to_value(Base64Bytes(cert))
            }
            SignerRequest::ImportCert {
                cert_bytes,
                initial_status,
                owner_id,
                activate,
            } => {
                let cert_id = m
                    .import_certificate(cert_bytes.into_inner(), initial_status, owner_id, activate)
                    .await?;
                to_value(signer_protocol::ImportedCertInfo { cert_id })
            }
            SignerRequest::ActivateCert { cert_id } => {
                to_value(m.set_cert_active(&cert_id, true).await?)
            }
            SignerRequest::DeactivateCert { cert_id } => {
                to_value(m.set_cert_active(&cert_id, false).await?)
            }
            SignerRequest::DeleteCert { cert_id } => to_value(m.delete_certificate(&cert_id).await?),
            SignerRequest::SetCertStatus { cert_id, status } => {
                to_value(m.set_cert_status(&cert_id, status).await?)
            }
            SignerRequest::SetRenewedCertHash { cert_id, hash } => {
                to_value(m.set_renewed_cert_hash(&cert_id, hash).await?)
            }
            SignerRequest::SetRenewalError {
                cert_id,
                error_message,
            } => to_value(m.set_renewal_error(&cert_id, error_message).await?),
            SignerRequest::SetNextPlannedRenewal {
                cert_id,
                next_renewal_time,
            } => to_value(m.set_next_planned_renewal(&cert_id, next_renewal_time).await?),
            SignerRequest::GetCertForHash { cert_hash } => {
                to_value(m.cert_for_hash(&cert_hash).await?)
            }
            SignerRequest::GetKeyIdForCertHash { cert_hash } => {
                to_value(m.key_id_for_cert_hash(&cert_hash).await?)
            }
            SignerRequest::GetTokenAndKeyIdForCertHash { cert_hash } => {
                to_value(m.token_and_key_for_cert_hash(&cert_hash).await?)
            }
            SignerRequest::GetTokenAndKeyIdForCertRequestId { cert_request_id } => {
                to_value(m.token_and_key_for_csr_id(&cert_request_id).await?)
            }
            SignerRequest::GetTokenForKeyId { key_id } => {
                to_value(m.token_for_key_id(&key_id).await?)
            }
            SignerRequest::GetOcspResponses { cert_hashes } => {
                let responses: Vec<Option<Base64Bytes>> = m
                    .ocsp_responses(&cert_hashes)
                    .into_iter()
                    .map(|r| r.map(Base64Bytes))
                    .collect();
                to_value(responses)
            }
            SignerRequest::SetOcspResponses {
                cert_hashes,
                responses,
            } => {
                let responses = responses.into_iter().map(Base64Bytes::into_inner).collect();
                to_value(m.set_ocsp_responses(cert_hashes, responses)?)
            }
        }
    }
}

/// Builds the wire fault for a failed operation.
pub fn translate(err: &OperationError) -> RpcFault {
    match err {
        OperationError::Signer(e) => coded_fault(e),
        OperationError::Unexpected(_) => RpcFault::opaque(UNEXPECTED_FAILURE_MESSAGE),
    }
}

fn coded_fault(err: &SignerError) -> RpcFault {
    let (code, translation, detail): (&str, &str, Option<&str>) = match err {
        SignerError::NotFound { entity, id } => {
            let (code, translation) = match entity {
                Entity::Token => (X_TOKEN_NOT_FOUND, TR_TOKEN_NOT_FOUND),
                Entity::Key => (X_KEY_NOT_FOUND, TR_KEY_NOT_FOUND),
                Entity::CertRequest => (X_CSR_NOT_FOUND, TR_CSR_NOT_FOUND),
                Entity::Certificate => (X_CERT_NOT_FOUND, TR_CERT_NOT_FOUND),
            };
            (code, translation, Some(id.as_str()))
        }
        SignerError::TokenNotAvailable { token_id } => (
            X_TOKEN_NOT_AVAILABLE,
            TR_TOKEN_NOT_AVAILABLE,
            Some(token_id.as_str()),
        ),
        SignerError::TokenReadOnly { token_id } => {
            (X_TOKEN_READONLY, TR_TOKEN_READONLY, Some(token_id.as_str()))
        }
        SignerError::WrongKeyUsage { key_id, .. } => {
            (X_WRONG_KEY_USAGE, TR_WRONG_KEY_USAGE, Some(key_id.as_str()))
        }
        SignerError::InvalidCertificate(_) => {
            (X_INCORRECT_CERTIFICATE, TR_INVALID_CERTIFICATE, None)
        }
        SignerError::InvalidRequest(_) => (X_INVALID_REQUEST, TR_INVALID_REQUEST, None),
        SignerError::PinIncorrect { token_id } => {
            (X_PIN_INCORRECT, TR_PIN_INCORRECT, Some(token_id.as_str()))
        }
        SignerError::Device { token_id, .. } => {
            (X_INTERNAL_ERROR, TR_INTERNAL_ERROR, Some(token_id.as_str()))
        }
    };

    let message = err.to_string();
    let mut fault_detail = FaultDetail::with_code(with_prefix(code))
        .string(message.clone())
        .translation(translation);
    if let Some(detail) = detail {
        fault_detail = fault_detail.detail(detail);
    }
    RpcFault::coded(message, fault_detail)
}
