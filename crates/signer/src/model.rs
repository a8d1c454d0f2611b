// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory model of one token's subtree.
//!
//! A [`Token`] is owned by its worker; nothing outside the worker thread holds a reference
//! into it. Callers see [`TokenInfo`] snapshots instead.

use signer_protocol::{
    Base64Bytes, CertRequestFormat, CertRequestInfo, CertStatus, CertificateInfo, KeyAlgorithm,
    KeyInfo, KeyUsage, SignMechanism, TokenInfo, TokenStatus, TokenType,
};
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct Token {
    pub id: String,
    pub token_type: TokenType,
    pub friendly_name: String,
    pub active: bool,
    pub read_only: bool,
    pub status: TokenStatus,
    pub keys: Vec<Key>,
}

#[derive(Debug, Clone)]
pub struct Key {
    pub id: String,
    pub label: String,
    pub friendly_name: String,
    /// Set by the first CSR or certificate attached to the key, then fixed.
    pub usage: Option<KeyUsage>,
    pub algorithm: KeyAlgorithm,
    pub public_key: Vec<u8>,
    pub cert_requests: Vec<CertRequest>,
    pub certs: Vec<Certificate>,
}

#[derive(Debug, Clone)]
pub struct CertRequest {
    pub id: String,
    pub owner_id: Option<String>,
    pub subject_name: String,
    pub subject_alt_name: Option<String>,
    pub certificate_profile: Option<String>,
    pub format: CertRequestFormat,
}

#[derive(Debug, Clone)]
pub struct Certificate {
    pub id: String,
    pub bytes: Vec<u8>,
    pub owner_id: Option<String>,
    pub active: bool,
    pub status: CertStatus,
    pub renewed_cert_hash: Option<String>,
    pub renewal_error: Option<String>,
    pub next_planned_renewal: Option<OffsetDateTime>,
}

impl Token {
    pub fn new(id: String, token_type: TokenType, friendly_name: String, read_only: bool) -> Self {
        Self {
            id,
            token_type,
            friendly_name,
            active: false,
            read_only,
            status: TokenStatus::NotInitialized,
            keys: vec![],
        }
    }

    pub fn is_available(&self) -> bool {
        self.status != TokenStatus::NotAvailable
    }

    pub fn key(&self, key_id: &str) -> Option<&Key> {
        self.keys.iter().find(|k| k.id == key_id)
    }

    pub fn key_mut(&mut self, key_id: &str) -> Option<&mut Key> {
        self.keys.iter_mut().find(|k| k.id == key_id)
    }

    /// Finds the key holding certificate `cert_id`.
    pub fn key_for_cert(&self, cert_id: &str) -> Option<&Key> {
        self.keys.iter().find(|k| k.cert(cert_id).is_some())
    }

    pub fn key_for_csr(&self, csr_id: &str) -> Option<&Key> {
        self.keys.iter().find(|k| k.cert_request(csr_id).is_some())
    }

    pub fn key_for_csr_mut(&mut self, csr_id: &str) -> Option<&mut Key> {
        self.keys
            .iter_mut()
            .find(|k| k.cert_request(csr_id).is_some())
    }

    pub fn remove_key(&mut self, key_id: &str) -> Option<Key> {
        let pos = self.keys.iter().position(|k| k.id == key_id)?;
        Some(self.keys.remove(pos))
    }

    pub fn info(&self) -> TokenInfo {
        TokenInfo {
            id: self.id.clone(),
            token_type: self.token_type,
            friendly_name: self.friendly_name.clone(),
            active: self.active,
            read_only: self.read_only,
            available: self.is_available(),
            status: self.status,
            keys: self.keys.iter().map(Key::info).collect(),
        }
    }
}

impl Key {
    pub fn sign_mechanism(&self) -> SignMechanism {
        self.algorithm.sign_mechanism()
    }

    pub fn cert(&self, cert_id: &str) -> Option<&Certificate> {
        self.certs.iter().find(|c| c.id == cert_id)
    }

    pub fn cert_mut(&mut self, cert_id: &str) -> Option<&mut Certificate> {
        self.certs.iter_mut().find(|c| c.id == cert_id)
    }

    pub fn cert_request(&self, csr_id: &str) -> Option<&CertRequest> {
        self.cert_requests.iter().find(|c| c.id == csr_id)
    }

    pub fn remove_cert(&mut self, cert_id: &str) -> Option<Certificate> {
        let pos = self.certs.iter().position(|c| c.id == cert_id)?;
        Some(self.certs.remove(pos))
    }

    pub fn remove_cert_request(&mut self, csr_id: &str) -> Option<CertRequest> {
        let pos = self.cert_requests.iter().position(|c| c.id == csr_id)?;
        Some(self.cert_requests.remove(pos))
    }

    pub fn info(&self) -> KeyInfo {
        KeyInfo {
            id: self.id.clone(),
            label: self.label.clone(),
            friendly_name: self.friendly_name.clone(),
            usage: self.usage,
            algorithm: self.algorithm,
            sign_mechanism: self.sign_mechanism(),
            public_key: Base64Bytes(self.public_key.clone()),
            cert_requests: self.cert_requests.iter().map(CertRequest::info).collect(),
            certs: self.certs.iter().map(Certificate::info).collect(),
        }
    }
}

impl CertRequest {
    pub fn info(&self) -> CertRequestInfo {
        CertRequestInfo {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            subject_name: self.subject_name.clone(),
            subject_alt_name: self.subject_alt_name.clone(),
            certificate_profile: self.certificate_profile.clone(),
            format: self.format,
        }
    }
}

impl Certificate {
    pub fn new(id: String, bytes: Vec<u8>, owner_id: Option<String>, status: CertStatus) -> Self {
        Self {
            id,
            bytes,
            owner_id,
            active: false,
            status,
            renewed_cert_hash: None,
            renewal_error: None,
            next_planned_renewal: None,
        }
    }

    pub fn info(&self) -> CertificateInfo {
        CertificateInfo {
            id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            active: self.active,
            status: self.status,
            certificate_bytes: Base64Bytes(self.bytes.clone()),
            renewed_cert_hash: self.renewed_cert_hash.clone(),
            renewal_error: self.renewal_error.clone(),
            next_planned_renewal: self.next_planned_renewal,
        }
    }
}
