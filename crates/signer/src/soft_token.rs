// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! An in-memory software token with Ed25519 keys.
//!
//! Certificate requests and certificates produced here are signed JSON documents. The
//! binary ("DER") form is the JSON envelope; the PEM form wraps that envelope with the
//! usual `CERTIFICATE REQUEST` / `CERTIFICATE` tags. [`SoftCertificateDecoder`] reads both.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use pem::{encode_config, EncodeConfig, LineEnding, Pem};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use signer_protocol::{
    Base64Bytes, CertRequestFormat, KeyAlgorithm, KeyUsage, Pin, SignAlgorithm, TokenType,
};
use time::OffsetDateTime;

use crate::device::{
    CertificateDecoder, CsrParams, DecodeError, DecodedCertificate, DeviceError, DeviceKey,
    DeviceProvider, SelfSignedParams, TokenDevice,
};
use crate::registry::TokenSpec;

pub const CERTIFICATE_TAG: &str = "CERTIFICATE";
pub const CERTIFICATE_REQUEST_TAG: &str = "CERTIFICATE REQUEST";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DocumentKind {
    CertificateRequest,
    Certificate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    kind: DocumentKind,
    subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subject_alt_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    serial: Option<String>,
    key_usage: KeyUsage,
    public_key: Base64Bytes,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    not_before: Option<OffsetDateTime>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    not_after: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedDocument {
    document: String,
    signature: Base64Bytes,
}

fn seal(document: &Document, key: &SigningKey) -> Result<Vec<u8>, serde_json::Error> {
    let document = serde_json::to_string(document)?;
    let signature = key.sign(document.as_bytes()).to_bytes().to_vec();
    serde_json::to_vec(&SignedDocument {
        document,
        signature: Base64Bytes(signature),
    })
}

fn to_pem(tag: &str, der: Vec<u8>) -> Vec<u8> {
    let config = EncodeConfig::new().set_line_ending(LineEnding::LF);
    encode_config(&Pem::new(tag, der), config).into_bytes()
}

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Creates a certificate for `public_key`, signed by `issuer_key`. Returns the binary form.
pub fn issue_certificate(
    issuer_key: &SigningKey,
    issuer: &str,
    subject: &str,
    public_key: &[u8],
    key_usage: KeyUsage,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<Vec<u8>, serde_json::Error> {
    let document = Document {
        kind: DocumentKind::Certificate,
        subject: subject.to_owned(),
        subject_alt_name: None,
        issuer: Some(issuer.to_owned()),
        serial: Some(random_hex(8)),
        key_usage,
        public_key: Base64Bytes(public_key.to_vec()),
        not_before: Some(not_before),
        not_after: Some(not_after),
    };
    seal(&document, issuer_key)
}

pub struct SoftToken {
    pin_salt: [u8; 16],
    pin_hash: Option<[u8; 32]>,
    logged_in: bool,
    keys: BTreeMap<String, SigningKey>,
    certs: BTreeMap<String, (String, Vec<u8>)>,
}

impl Default for SoftToken {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftToken {
    pub fn new() -> Self {
        let mut pin_salt = [0u8; 16];
        OsRng.fill_bytes(&mut pin_salt);
        Self {
            pin_salt,
            pin_hash: None,
            logged_in: false,
            keys: BTreeMap::new(),
            certs: BTreeMap::new(),
        }
    }

    fn hash_pin(&self, pin: &Pin) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.pin_salt);
        hasher.update(pin.expose().as_bytes());
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hasher.finalize());
        hash
    }

    fn check_pin(&self, pin: &Pin) -> Result<(), DeviceError> {
        match self.pin_hash {
            None => Err(DeviceError::NotInitialized),
            Some(expected) if expected == self.hash_pin(pin) => Ok(()),
            Some(_) => Err(DeviceError::PinIncorrect),
        }
    }

    fn signing_key(&self, key_id: &str) -> Result<&SigningKey, DeviceError> {
        if !self.logged_in {
            return Err(DeviceError::NotLoggedIn);
        }
        self.keys
            .get(key_id)
            .ok_or_else(|| DeviceError::KeyMissing(key_id.to_owned()))
    }
}

impl TokenDevice for SoftToken {
    fn is_initialized(&self) -> bool {
        self.pin_hash.is_some()
    }

    fn initialize(&mut self, pin: &Pin) -> Result<(), DeviceError> {
        if self.pin_hash.is_some() {
            return Err(DeviceError::Internal("token already initialized".into()));
        }
        self.pin_hash = Some(self.hash_pin(pin));
        self.logged_in = true;
        Ok(())
    }

    fn login(&mut self, pin: &Pin) -> Result<(), DeviceError> {
        self.check_pin(pin)?;
        self.logged_in = true;
        Ok(())
    }

    fn logout(&mut self) -> Result<(), DeviceError> {
        self.logged_in = false;
        Ok(())
    }

    fn change_pin(&mut self, old_pin: &Pin, new_pin: &Pin) -> Result<(), DeviceError> {
        self.check_pin(old_pin)?;
        self.pin_hash = Some(self.hash_pin(new_pin));
        Ok(())
    }

    fn generate_key(
        &mut self,
        _label: &str,
        algorithm: KeyAlgorithm,
    ) -> Result<DeviceKey, DeviceError> {
        if !self.logged_in {
            return Err(DeviceError::NotLoggedIn);
        }
        if algorithm != KeyAlgorithm::Ed25519 {
            return Err(DeviceError::UnsupportedAlgorithm(algorithm));
        }
        let key = SigningKey::generate(&mut OsRng);
        let id = random_hex(20).to_uppercase();
        let public_key = key.verifying_key().to_bytes().to_vec();
        self.keys.insert(id.clone(), key);
        Ok(DeviceKey { id, public_key })
    }

    fn delete_key(&mut self, key_id: &str) -> Result<(), DeviceError> {
        self.signing_key(key_id)?;
        self.keys.remove(key_id);
        self.certs.retain(|_, (owner, _)| owner != key_id);
        Ok(())
    }

    fn sign(
        &mut self,
        key_id: &str,
        algorithm: SignAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        let key = self.signing_key(key_id)?;
        if algorithm != SignAlgorithm::Ed25519 {
            return Err(DeviceError::Internal(format!(
                "{algorithm:?} is not supported by software keys"
            )));
        }
        Ok(key.sign(digest).to_bytes().to_vec())
    }

    fn generate_cert_request(
        &mut self,
        key_id: &str,
        params: &CsrParams,
    ) -> Result<Vec<u8>, DeviceError> {
        let key = self.signing_key(key_id)?;
        let document = Document {
            kind: DocumentKind::CertificateRequest,
            subject: params.subject_name.clone(),
            subject_alt_name: params.subject_alt_name.clone(),
            issuer: None,
            serial: None,
            key_usage: params.key_usage,
            public_key: Base64Bytes(key.verifying_key().to_bytes().to_vec()),
            not_before: None,
            not_after: None,
        };
        let der = seal(&document, key).map_err(|e| DeviceError::Internal(e.to_string()))?;
        Ok(match params.format {
            CertRequestFormat::Der => der,
            CertRequestFormat::Pem => to_pem(CERTIFICATE_REQUEST_TAG, der),
        })
    }

    fn generate_self_signed_cert(
        &mut self,
        key_id: &str,
        params: &SelfSignedParams,
    ) -> Result<Vec<u8>, DeviceError> {
        let key = self.signing_key(key_id)?;
        let subject = format!("CN={}", params.common_name);
        issue_certificate(
            key,
            &subject,
            &subject,
            &key.verifying_key().to_bytes(),
            params.key_usage,
            params.not_before,
            params.not_after,
        )
        .map_err(|e| DeviceError::Internal(e.to_string()))
    }

    fn store_certificate(
        &mut self,
        key_id: &str,
        cert_id: &str,
        cert: &[u8],
    ) -> Result<(), DeviceError> {
        self.signing_key(key_id)?;
        self.certs
            .insert(cert_id.to_owned(), (key_id.to_owned(), cert.to_vec()));
        Ok(())
    }

    fn delete_certificate(&mut self, key_id: &str, cert_id: &str) -> Result<(), DeviceError> {
        self.signing_key(key_id)?;
        match self.certs.get(cert_id) {
            Some((owner, _)) if owner == key_id => {
                self.certs.remove(cert_id);
                Ok(())
            }
            _ => Err(DeviceError::CertificateMissing(cert_id.to_owned())),
        }
    }

    fn close(&mut self) {
        self.logged_in = false;
        self.keys.clear();
        self.certs.clear();
    }
}

/// Opens a fresh [`SoftToken`] for every software token. Hardware slots can't be reached.
#[derive(Debug, Default)]
pub struct SoftDeviceProvider;

impl DeviceProvider for SoftDeviceProvider {
    fn open(&self, spec: &TokenSpec) -> Result<Box<dyn TokenDevice>, DeviceError> {
        match spec.token_type {
            TokenType::Software => Ok(Box::new(SoftToken::new())),
            TokenType::HardwareSlot => Err(DeviceError::Unreachable(format!(
                "no hardware module available for slot {}",
                spec.id
            ))),
        }
    }
}

/// Reads certificates made by [`SoftToken`] or [`issue_certificate`]. Certificate ids are
/// the lowercase hex SHA-256 of the binary form.
#[derive(Debug, Default)]
pub struct SoftCertificateDecoder;

impl CertificateDecoder for SoftCertificateDecoder {
    fn decode(&self, cert: &[u8]) -> Result<DecodedCertificate, DecodeError> {
        let der = if cert.starts_with(b"-----BEGIN") {
            let pem = pem::parse(cert).map_err(|e| DecodeError(format!("bad PEM: {e}")))?;
            if pem.tag() != CERTIFICATE_TAG {
                return Err(DecodeError(format!("unexpected PEM tag {}", pem.tag())));
            }
            pem.into_contents()
        } else {
            cert.to_vec()
        };

        let signed: SignedDocument =
            serde_json::from_slice(&der).map_err(|e| DecodeError(format!("not a certificate: {e}")))?;
        let document: Document = serde_json::from_str(&signed.document)
            .map_err(|e| DecodeError(format!("not a certificate: {e}")))?;
        if document.kind != DocumentKind::Certificate {
            return Err(DecodeError("document is not a certificate".into()));
        }

        if document.issuer.as_deref() == Some(document.subject.as_str()) {
            verify_self_signature(&document, &signed)?;
        }

        Ok(DecodedCertificate {
            hash: hex::encode(Sha256::digest(&der)),
            public_key: document.public_key.into_inner(),
            subject: document.subject,
            key_usage: Some(document.key_usage),
        })
    }
}

fn verify_self_signature(document: &Document, signed: &SignedDocument) -> Result<(), DecodeError> {
    let public_key: [u8; 32] = document
        .public_key
        .as_slice()
        .try_into()
        .map_err(|_| DecodeError("bad public key length".into()))?;
    let verifying_key = VerifyingKey::from_bytes(&public_key)
        .map_err(|e| DecodeError(format!("bad public key: {e}")))?;
    let signature = Signature::from_slice(signed.signature.as_slice())
        .map_err(|e| DecodeError(format!("bad signature: {e}")))?;
    verifying_key
        .verify(signed.document.as_bytes(), &signature)
        .map_err(|_| DecodeError("signature does not match".into()))
}
