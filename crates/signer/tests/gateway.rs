// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

mod common;

use common::*;
use serde_json::{json, Value};
use signer::gateway::UNEXPECTED_FAILURE_MESSAGE;
use signer::{DeviceError, Gateway};
use signer_protocol::{RequestId, RpcFault, RpcStatus};
use tracing_test::traced_test;

async fn call(gateway: &Gateway, request: Value) -> Result<Value, RpcFault> {
    let body = serde_json::to_vec(&request).unwrap();
    let request = Gateway::decode(&body)?;
    gateway
        .handle(&RequestId::new_unique_with_prefix("test"), request)
        .await
}

async fn fubar_gateway() -> (std::sync::Arc<SpyProvider>, Gateway) {
    let (provider, manager) = fubar().await;
    (provider, Gateway::new(manager))
}

#[tokio::test]
async fn get_cert_for_hash_returns_certificate() {
    let (_provider, gateway) = fubar_gateway().await;
    let cert = call(
        &gateway,
        json!({"method": "getCertForHash", "params": {"certHash": "ok-cert"}}),
    )
    .await
    .unwrap();
    assert_eq!(cert["id"], "ok-cert");
    assert_eq!(cert["active"], true);
    assert_eq!(cert["status"], "registered");
}

#[tokio::test]
async fn missing_certificate_is_a_coded_fault() {
    let (_provider, gateway) = fubar_gateway().await;
    let fault = call(
        &gateway,
        json!({"method": "getCertForHash", "params": {"certHash": "not-found-cert"}}),
    )
    .await
    .unwrap_err();

    assert_eq!(fault.status, RpcStatus::Internal);
    assert_eq!(fault.fault_code(), Some("Signer.CertNotFound"));
    assert_eq!(fault.detail.fault_detail.as_deref(), Some("not-found-cert"));
    assert_eq!(fault.detail.fault_string.as_deref(), Some(fault.message.as_str()));

    let wire = serde_json::to_value(&fault).unwrap();
    assert_eq!(wire["status"], "INTERNAL");
    assert_eq!(wire["code"], 13);
    assert_eq!(wire["faultCode"], "Signer.CertNotFound");
    assert_eq!(wire["translationCode"], "cert_with_id_not_found");
    assert!(wire.get("faultActor").is_none());
}

#[tokio::test]
async fn delete_cert_round_trip() {
    let (provider, gateway) = fubar_gateway().await;
    let result = call(
        &gateway,
        json!({"method": "deleteCert", "params": {"certId": "ok-cert-sign"}}),
    )
    .await
    .unwrap();
    assert_eq!(result, Value::Null);
    assert_eq!(provider.state("fubar").count("delete_certificate"), 1);

    let fault = call(
        &gateway,
        json!({"method": "deleteCert", "params": {"certId": "ok-cert-sign"}}),
    )
    .await
    .unwrap_err();
    assert_eq!(fault.fault_code(), Some("Signer.CertNotFound"));
}

#[tokio::test]
async fn device_failure_becomes_internal_error_fault() {
    let (provider, gateway) = fubar_gateway().await;
    provider
        .state("fubar")
        .fail("delete_certificate", DeviceError::Internal("slot jammed".into()));

    let fault = call(
        &gateway,
        json!({"method": "deleteCert", "params": {"certId": "ok-cert-sign"}}),
    )
    .await
    .unwrap_err();
    assert_eq!(fault.fault_code(), Some("Signer.InternalError"));
    assert_eq!(fault.detail.fault_detail.as_deref(), Some("fubar"));
}

#[tokio::test]
async fn sign_returns_base64_signature() {
    let (_provider, gateway) = fubar_gateway().await;
    let signature = call(
        &gateway,
        json!({
            "method": "sign",
            "params": {"keyId": "sign-key", "signAlgorithm": "SHA256withRSA", "digest": "ZGlnZXN0"},
        }),
    )
    .await
    .unwrap();
    // "signed:digest"
    assert_eq!(signature, "c2lnbmVkOmRpZ2VzdA==");
}

#[tokio::test]
async fn wrong_key_usage_names_the_key() {
    let (_provider, gateway) = fubar_gateway().await;
    let fault = call(
        &gateway,
        json!({
            "method": "generateCertRequest",
            "params": {
                "keyId": "sign-key",
                "keyUsage": "AUTHENTICATION",
                "subjectName": "CN=ss1",
                "format": "DER",
            },
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(fault.fault_code(), Some("Signer.WrongKeyUsage"));
    assert_eq!(fault.detail.fault_detail.as_deref(), Some("sign-key"));
}

#[tokio::test]
async fn token_state_faults() {
    let (_provider, gateway) = fubar_gateway().await;
    call(
        &gateway,
        json!({"method": "deactivateToken", "params": {"tokenId": "fubar"}}),
    )
    .await
    .unwrap();

    let fault = call(
        &gateway,
        json!({
            "method": "generateKey",
            "params": {"tokenId": "fubar", "keyLabel": "x", "algorithm": "RSA"},
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(fault.fault_code(), Some("Signer.TokenNotAvailable"));
    assert_eq!(fault.detail.fault_detail.as_deref(), Some("fubar"));

    let fault = call(
        &gateway,
        json!({"method": "activateToken", "params": {"tokenId": "fubar", "password": "0000"}}),
    )
    .await
    .unwrap_err();
    assert_eq!(fault.fault_code(), Some("Signer.PinIncorrect"));
}

#[test]
fn malformed_requests_are_invalid_arguments() {
    for body in [
        &b"not json"[..],
        br#"{"method": "noSuchMethod"}"#,
        br#"{"method": "getCertForHash", "params": {}}"#,
        br#"{"method": "sign", "params": {"keyId": "k", "signAlgorithm": "MD5", "digest": ""}}"#,
    ] {
        let fault = Gateway::decode(body).unwrap_err();
        assert_eq!(fault.status, RpcStatus::InvalidArgument);
        assert_eq!(fault.code, 3);
        assert_eq!(fault.fault_code(), Some("Signer.InvalidRequest"));
    }
}

#[tokio::test]
async fn get_tokens_lists_every_token() {
    let (_provider, gateway) = fubar_gateway().await;
    let tokens = call(&gateway, json!({"method": "getTokens"})).await.unwrap();
    let tokens = tokens.as_array().unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0]["id"], "fubar");
    assert_eq!(tokens[0]["keys"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn ocsp_responses_round_trip() {
    let (_provider, gateway) = fubar_gateway().await;
    call(
        &gateway,
        json!({
            "method": "setOcspResponses",
            "params": {"certHashes": ["ok-cert"], "responses": ["b2s="]},
        }),
    )
    .await
    .unwrap();

    let responses = call(
        &gateway,
        json!({"method": "getOcspResponses", "params": {"certHashes": ["ok-cert", "nope"]}}),
    )
    .await
    .unwrap();
    assert_eq!(responses, json!(["b2s=", null]));

    let fault = call(
        &gateway,
        json!({
            "method": "setOcspResponses",
            "params": {"certHashes": ["a", "b"], "responses": ["b2s="]},
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(fault.fault_code(), Some("Signer.InvalidRequest"));
}

#[traced_test]
#[tokio::test]
async fn unexpected_failures_are_opaque_and_logged() {
    let (provider, gateway) = fubar_gateway().await;
    provider.state("fubar").panic_on("sign");

    let fault = call(
        &gateway,
        json!({
            "method": "sign",
            "params": {"keyId": "sign-key", "signAlgorithm": "SHA256withRSA", "digest": "ZA=="},
        }),
    )
    .await
    .unwrap_err();

    assert_eq!(fault.status, RpcStatus::Unknown);
    assert_eq!(fault.code, 2);
    assert_eq!(fault.message, UNEXPECTED_FAILURE_MESSAGE);
    assert!(!fault.is_coded());
    assert!(fault.detail.is_empty());
    assert!(!fault.message.contains("panic"));
    assert!(logs_contain("sign failed unexpectedly"));

    // The token keeps serving.
    call(
        &gateway,
        json!({"method": "getToken", "params": {"tokenId": "fubar"}}),
    )
    .await
    .unwrap();
}
