// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Everything a token worker can do to its token.
//!
//! Each method runs on the worker thread with exclusive access to the token. Checks happen
//! in a fixed order before the device is touched: token active, token writable, referenced
//! object present, key usage consistent, input well-formed. The model and the shared index
//! are only changed after the device call (if any) succeeded.

use std::sync::Arc;

use signer_protocol::{
    CertRequestFormat, CertStatus, CertificateInfo, GeneratedCertRequestInfo, KeyAlgorithm,
    KeyIdInfo, KeyInfo, KeyUsage, Pin, SignAlgorithm, SignMechanism, TokenInfo,
    TokenInfoAndKeyId, TokenStatus, TokenType,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::{
    CertificateDecoder, CsrParams, DecodedCertificate, DeviceError, SelfSignedParams,
    TokenDevice,
};
use crate::error::{Entity, SignerError};
use crate::index::Index;
use crate::model::{CertRequest, Certificate, Key, Token};
use crate::registry::TokenSpec;

/// Parameters of a new certificate signing request.
#[derive(Debug, Clone)]
pub struct CertRequestParams {
    pub owner_id: Option<String>,
    pub key_usage: KeyUsage,
    pub subject_name: String,
    pub alt_name: Option<String>,
    pub certificate_profile: Option<String>,
    pub format: CertRequestFormat,
}

#[derive(Debug, Clone)]
pub struct SelfSignedCertParams {
    pub owner_id: Option<String>,
    pub key_usage: KeyUsage,
    pub common_name: String,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ImportParams {
    pub cert_bytes: Vec<u8>,
    pub decoded: DecodedCertificate,
    pub initial_status: String,
    pub owner_id: Option<String>,
    pub activate: bool,
}

/// State owned by one token worker.
pub struct TokenState {
    token: Token,
    device: Option<Box<dyn TokenDevice>>,
    index: Arc<Index>,
    decoder: Arc<dyn CertificateDecoder>,
}

impl TokenState {
    pub fn new(
        spec: &TokenSpec,
        device: Result<Box<dyn TokenDevice>, DeviceError>,
        index: Arc<Index>,
        decoder: Arc<dyn CertificateDecoder>,
    ) -> Self {
        let mut token = Token::new(
            spec.id.clone(),
            spec.token_type,
            spec.friendly_name.clone(),
            spec.read_only,
        );
        let device = match device {
            Ok(device) => {
                if device.is_initialized() {
                    token.status = TokenStatus::Ok;
                }
                Some(device)
            }
            Err(e) => {
                warn!("token {} is not available: {e}", spec.id);
                token.status = TokenStatus::NotAvailable;
                None
            }
        };
        Self {
            token,
            device,
            index,
            decoder,
        }
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn close(&mut self) {
        if let Some(device) = self.device.as_deref_mut() {
            device.close();
        }
        self.token.active = false;
    }

    fn not_available(&self) -> SignerError {
        SignerError::TokenNotAvailable {
            token_id: self.token.id.clone(),
        }
    }

    fn with_device<R>(
        &mut self,
        f: impl FnOnce(&mut dyn TokenDevice) -> Result<R, DeviceError>,
    ) -> Result<R, SignerError> {
        let Some(device) = self.device.as_deref_mut() else {
            return Err(self.not_available());
        };
        f(device).map_err(|e| self.device_failed(e))
    }

    fn device_failed(&mut self, e: DeviceError) -> SignerError {
        if let DeviceError::Unreachable(reason) = &e {
            warn!(
                "token {} became unreachable, marking it unavailable: {reason}",
                self.token.id
            );
            self.token.status = TokenStatus::NotAvailable;
            self.token.active = false;
        }
        SignerError::from_device(&self.token.id, e)
    }

    fn duplicate_key_id(&self, key_id: &str) -> SignerError {
        warn!(
            "token {} reported key id {key_id}, which is already in use",
            self.token.id
        );
        SignerError::Device {
            token_id: self.token.id.clone(),
            source: DeviceError::Internal(format!("key id '{key_id}' is already in use")),
        }
    }

    fn require_available(&self) -> Result<(), SignerError> {
        if self.token.is_available() && self.device.is_some() {
            Ok(())
        } else {
            Err(self.not_available())
        }
    }

    fn require_active(&self) -> Result<(), SignerError> {
        self.require_available()?;
        if self.token.active {
            Ok(())
        } else {
            Err(self.not_available())
        }
    }

    /// Preconditions of anything that changes the token's structure.
    fn require_writable(&self) -> Result<(), SignerError> {
        self.require_active()?;
        if self.token.read_only {
            Err(SignerError::TokenReadOnly {
                token_id: self.token.id.clone(),
            })
        } else {
            Ok(())
        }
    }

    fn key(&self, key_id: &str) -> Result<&Key, SignerError> {
        self.token
            .key(key_id)
            .ok_or_else(|| SignerError::not_found(Entity::Key, key_id))
    }

    fn key_mut(&mut self, key_id: &str) -> Result<&mut Key, SignerError> {
        self.token
            .key_mut(key_id)
            .ok_or_else(|| SignerError::not_found(Entity::Key, key_id))
    }

    fn cert_mut(&mut self, cert_id: &str) -> Result<&mut Certificate, SignerError> {
        self.token
            .keys
            .iter_mut()
            .find_map(|k| k.cert_mut(cert_id))
            .ok_or_else(|| SignerError::not_found(Entity::Certificate, cert_id))
    }

    fn key_id_for_cert(&self, cert_id: &str) -> Result<String, SignerError> {
        self.token
            .key_for_cert(cert_id)
            .map(|k| k.id.clone())
            .ok_or_else(|| SignerError::not_found(Entity::Certificate, cert_id))
    }

    pub fn info(&self) -> TokenInfo {
        self.token.info()
    }

    /// Sets the first PIN of a blank software token and logs in with it.
    pub fn initialize(&mut self, pin: &Pin) -> Result<(), SignerError> {
        self.require_available()?;
        if self.token.token_type != TokenType::Software {
            return Err(SignerError::invalid_request(format!(
                "Token '{}' is not a software token",
                self.token.id
            )));
        }
        if self.token.status != TokenStatus::NotInitialized {
            return Err(SignerError::invalid_request(format!(
                "Token '{}' is already initialized",
                self.token.id
            )));
        }
        if pin.is_empty() {
            return Err(SignerError::invalid_request("PIN must not be empty"));
        }
        self.with_device(|d| d.initialize(pin))?;
        self.token.status = TokenStatus::Ok;
        self.token.active = true;
        info!("initialized software token {}", self.token.id);
        Ok(())
    }

    pub fn activate(&mut self, pin: &Pin) -> Result<(), SignerError> {
        self.require_available()?;
        if self.token.status == TokenStatus::NotInitialized {
            return Err(SignerError::invalid_request(format!(
                "Token '{}' is not initialized",
                self.token.id
            )));
        }
        if self.token.active {
            return Ok(());
        }
        self.with_device(|d| d.login(pin))?;
        self.token.active = true;
        info!("activated token {}", self.token.id);
        Ok(())
    }

    /// Activates with a PIN from configuration, initializing a blank software token first.
    pub fn login_with_configured_pin(&mut self, pin: &Pin) -> Result<(), SignerError> {
        if self.token.status == TokenStatus::NotInitialized
            && self.token.token_type == TokenType::Software
        {
            self.initialize(pin)
        } else {
            self.activate(pin)
        }
    }

    pub fn deactivate(&mut self) -> Result<(), SignerError> {
        if !self.token.active {
            return Ok(());
        }
        self.with_device(|d| d.logout())?;
        self.token.active = false;
        info!("deactivated token {}", self.token.id);
        Ok(())
    }

    pub fn update_pin(&mut self, old_pin: &Pin, new_pin: &Pin) -> Result<(), SignerError> {
        self.require_available()?;
        if self.token.status == TokenStatus::NotInitialized {
            return Err(SignerError::invalid_request(format!(
                "Token '{}' is not initialized",
                self.token.id
            )));
        }
        if new_pin.is_empty() {
            return Err(SignerError::invalid_request("PIN must not be empty"));
        }
        self.with_device(|d| d.change_pin(old_pin, new_pin))?;
        info!("changed PIN of token {}", self.token.id);
        Ok(())
    }

    pub fn set_friendly_name(&mut self, name: String) -> Result<(), SignerError> {
        self.token.friendly_name = name;
        Ok(())
    }

    pub fn generate_key(
        &mut self,
        label: &str,
        algorithm: KeyAlgorithm,
    ) -> Result<KeyInfo, SignerError> {
        self.require_writable()?;
        let generated = self.with_device(|d| d.generate_key(label, algorithm))?;
        if self.token.key(&generated.id).is_some() {
            // The existing key may be what the device just overwrote, so it stays.
            return Err(self.duplicate_key_id(&generated.id));
        }
        if !self
            .index
            .claim_key(&self.token.id, &generated.id, &generated.public_key)
        {
            if let Some(device) = self.device.as_deref_mut() {
                if let Err(e) = device.delete_key(&generated.id) {
                    warn!(
                        "couldn't discard key {} on token {}: {e}",
                        generated.id, self.token.id
                    );
                }
            }
            return Err(self.duplicate_key_id(&generated.id));
        }
        let key = Key {
            id: generated.id,
            label: label.to_owned(),
            friendly_name: label.to_owned(),
            usage: None,
            algorithm,
            public_key: generated.public_key,
            cert_requests: vec![],
            certs: vec![],
        };
        info!("generated {algorithm} key {} on token {}", key.id, self.token.id);
        let info = key.info();
        self.token.keys.push(key);
        Ok(info)
    }

    /// Removes the key from the model. The key material itself is only destroyed if
    /// `purge_from_device` is set.
    pub fn delete_key(&mut self, key_id: &str, purge_from_device: bool) -> Result<(), SignerError> {
        self.require_writable()?;
        self.key(key_id)?;
        if purge_from_device {
            self.with_device(|d| d.delete_key(key_id))?;
        }
        self.token.remove_key(key_id);
        self.index.remove_key(&self.token.id, key_id);
        info!(
            "deleted key {key_id} from token {} (purged from device: {purge_from_device})",
            self.token.id
        );
        Ok(())
    }

    pub fn set_key_friendly_name(&mut self, key_id: &str, name: String) -> Result<(), SignerError> {
        self.key_mut(key_id)?.friendly_name = name;
        Ok(())
    }

    pub fn sign_mechanism(&self, key_id: &str) -> Result<SignMechanism, SignerError> {
        Ok(self.key(key_id)?.sign_mechanism())
    }

    pub fn sign(
        &mut self,
        key_id: &str,
        algorithm: SignAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, SignerError> {
        self.require_active()?;
        let key = self.key(key_id)?;
        if digest.is_empty() {
            return Err(SignerError::invalid_request("digest must not be empty"));
        }
        if algorithm.mechanism() != key.sign_mechanism() {
            return Err(SignerError::invalid_request(format!(
                "{algorithm:?} can't be used with a {} key",
                key.algorithm
            )));
        }
        debug!("signing with key {key_id} on token {}", self.token.id);
        self.with_device(|d| d.sign(key_id, algorithm, digest))
    }

    pub fn generate_cert_request(
        &mut self,
        key_id: &str,
        params: CertRequestParams,
    ) -> Result<GeneratedCertRequestInfo, SignerError> {
        self.require_writable()?;
        let key = self.key(key_id)?;
        check_usage(key, params.key_usage)?;
        validate_subject(&params.subject_name)?;
        validate_owner(params.key_usage, &params.owner_id)?;

        let csr_params = CsrParams {
            subject_name: params.subject_name.clone(),
            subject_alt_name: params.alt_name.clone(),
            key_usage: params.key_usage,
            format: params.format,
        };
        let cert_request = self.with_device(|d| d.generate_cert_request(key_id, &csr_params))?;

        let csr = CertRequest {
            id: Uuid::new_v4().to_string(),
            owner_id: params.owner_id,
            subject_name: params.subject_name,
            subject_alt_name: params.alt_name,
            certificate_profile: params.certificate_profile,
            format: params.format,
        };
        let result = GeneratedCertRequestInfo {
            cert_req_id: csr.id.clone(),
            cert_request: cert_request.into(),
            format: csr.format,
            key_id: key_id.to_owned(),
            owner_id: csr.owner_id.clone(),
            key_usage: params.key_usage,
        };
        self.index.insert_csr(&self.token.id, key_id, &csr.id);
        let key = self.key_mut(key_id)?;
        key.usage = Some(params.key_usage);
        key.cert_requests.push(csr);
        info!(
            "generated certificate request {} for key {key_id}",
            result.cert_req_id
        );
        Ok(result)
    }

    pub fn regenerate_cert_request(
        &mut self,
        csr_id: &str,
        format: CertRequestFormat,
    ) -> Result<GeneratedCertRequestInfo, SignerError> {
        self.require_writable()?;
        let key = self
            .token
            .key_for_csr(csr_id)
            .ok_or_else(|| SignerError::not_found(Entity::CertRequest, csr_id))?;
        let key_id = key.id.clone();
        let key_usage = key.usage.ok_or_else(|| {
            SignerError::invalid_request(format!("Key '{key_id}' has no usage"))
        })?;
        let csr = key
            .cert_request(csr_id)
            .ok_or_else(|| SignerError::not_found(Entity::CertRequest, csr_id))?;
        let owner_id = csr.owner_id.clone();
        let csr_params = CsrParams {
            subject_name: csr.subject_name.clone(),
            subject_alt_name: csr.subject_alt_name.clone(),
            key_usage,
            format,
        };

        let cert_request = self.with_device(|d| d.generate_cert_request(&key_id, &csr_params))?;

        if let Some(csr) = self
            .token
            .key_for_csr_mut(csr_id)
            .and_then(|k| k.cert_requests.iter_mut().find(|c| c.id == csr_id))
        {
            csr.format = format;
        }
        Ok(GeneratedCertRequestInfo {
            cert_req_id: csr_id.to_owned(),
            cert_request: cert_request.into(),
            format,
            key_id,
            owner_id,
            key_usage,
        })
    }

    pub fn delete_cert_request(&mut self, csr_id: &str) -> Result<(), SignerError> {
        self.require_writable()?;
        let key = self
            .token
            .key_for_csr_mut(csr_id)
            .ok_or_else(|| SignerError::not_found(Entity::CertRequest, csr_id))?;
        key.remove_cert_request(csr_id);
        self.index.remove_csr(csr_id);
        info!("deleted certificate request {csr_id}");
        Ok(())
    }

    pub fn generate_self_signed_cert(
        &mut self,
        key_id: &str,
        params: SelfSignedCertParams,
    ) -> Result<Vec<u8>, SignerError> {
        self.require_writable()?;
        let key = self.key(key_id)?;
        check_usage(key, params.key_usage)?;
        if params.common_name.trim().is_empty() {
            return Err(SignerError::invalid_request("common name must not be empty"));
        }
        if params.not_after <= params.not_before {
            return Err(SignerError::invalid_request(
                "notAfter must be later than notBefore",
            ));
        }
        validate_owner(params.key_usage, &params.owner_id)?;

        let device_params = SelfSignedParams {
            common_name: params.common_name,
            key_usage: params.key_usage,
            not_before: params.not_before,
            not_after: params.not_after,
        };
        let cert = self.with_device(|d| d.generate_self_signed_cert(key_id, &device_params))?;
        let decoded = self
            .decoder
            .decode(&cert)
            .map_err(|e| SignerError::InvalidCertificate(e.to_string()))?;
        if self.index.contains_cert(&decoded.hash) {
            return Err(SignerError::InvalidCertificate(format!(
                "certificate {} already exists",
                decoded.hash
            )));
        }
        self.with_device(|d| d.store_certificate(key_id, &decoded.hash, &cert))?;

        let mut stored = Certificate::new(
            decoded.hash.clone(),
            cert.clone(),
            params.owner_id,
            CertStatus::Registered,
        );
        stored.active = true;
        self.index.insert_cert(&self.token.id, key_id, &decoded.hash);
        let key = self.key_mut(key_id)?;
        key.usage = Some(params.key_usage);
        key.certs.push(stored);
        info!("generated self-signed certificate {} for key {key_id}", decoded.hash);
        Ok(cert)
    }

    /// Attaches an issued certificate to `key_id`, consuming the request it answers.
    pub fn import_certificate(
        &mut self,
        key_id: &str,
        params: ImportParams,
    ) -> Result<String, SignerError> {
        self.require_writable()?;
        let key = self.key(key_id)?;
        let usage = match (key.usage, params.decoded.key_usage) {
            (Some(actual), Some(requested)) if actual != requested => {
                return Err(SignerError::WrongKeyUsage {
                    key_id: key_id.to_owned(),
                    actual,
                    requested,
                })
            }
            (Some(usage), _) | (None, Some(usage)) => usage,
            (None, None) => {
                return Err(SignerError::InvalidCertificate(
                    "the certificate's key usage can't be determined".into(),
                ))
            }
        };
        let status: CertStatus = params
            .initial_status
            .parse()
            .map_err(|e| SignerError::invalid_request(format!("{e}")))?;
        let hash = params.decoded.hash;
        if self.index.contains_cert(&hash) {
            return Err(SignerError::InvalidCertificate(format!(
                "certificate {hash} already exists"
            )));
        }

        self.with_device(|d| d.store_certificate(key_id, &hash, &params.cert_bytes))?;

        let subject = params.decoded.subject;
        let key = self.key_mut(key_id)?;
        let answered = key
            .cert_requests
            .iter()
            .position(|csr| csr.subject_name == subject)
            .map(|pos| key.cert_requests.remove(pos));
        let owner_id = params
            .owner_id
            .or_else(|| answered.as_ref().and_then(|csr| csr.owner_id.clone()));
        let mut cert = Certificate::new(hash.clone(), params.cert_bytes, owner_id, status);
        cert.active = params.activate;
        key.usage = Some(usage);
        key.certs.push(cert);

        if let Some(csr) = &answered {
            self.index.remove_csr(&csr.id);
        }
        self.index.insert_cert(&self.token.id, key_id, &hash);
        info!("imported certificate {hash} for key {key_id}");
        Ok(hash)
    }

    pub fn set_cert_active(&mut self, cert_id: &str, active: bool) -> Result<(), SignerError> {
        self.cert_mut(cert_id)?.active = active;
        Ok(())
    }

    pub fn delete_certificate(&mut self, cert_id: &str) -> Result<(), SignerError> {
        self.require_writable()?;
        let key_id = self.key_id_for_cert(cert_id)?;
        self.with_device(|d| d.delete_certificate(&key_id, cert_id))?;
        if let Some(key) = self.token.key_mut(&key_id) {
            key.remove_cert(cert_id);
        }
        self.index.remove_cert(cert_id);
        info!("deleted certificate {cert_id} from key {key_id}");
        Ok(())
    }

    pub fn set_cert_status(&mut self, cert_id: &str, status: &str) -> Result<(), SignerError> {
        let cert = self.cert_mut(cert_id)?;
        cert.status = status
            .parse()
            .map_err(|e| SignerError::invalid_request(format!("{e}")))?;
        Ok(())
    }

    pub fn set_renewed_cert_hash(&mut self, cert_id: &str, hash: String) -> Result<(), SignerError> {
        self.cert_mut(cert_id)?.renewed_cert_hash = Some(hash);
        Ok(())
    }

    pub fn set_renewal_error(&mut self, cert_id: &str, message: String) -> Result<(), SignerError> {
        self.cert_mut(cert_id)?.renewal_error = Some(message);
        Ok(())
    }

    pub fn set_next_planned_renewal(
        &mut self,
        cert_id: &str,
        at: OffsetDateTime,
    ) -> Result<(), SignerError> {
        self.cert_mut(cert_id)?.next_planned_renewal = Some(at);
        Ok(())
    }

    pub fn cert_info(&self, cert_id: &str) -> Result<CertificateInfo, SignerError> {
        self.token
            .keys
            .iter()
            .find_map(|k| k.cert(cert_id))
            .map(Certificate::info)
            .ok_or_else(|| SignerError::not_found(Entity::Certificate, cert_id))
    }

    pub fn key_id_info(&self, cert_id: &str) -> Result<KeyIdInfo, SignerError> {
        let key = self
            .token
            .key_for_cert(cert_id)
            .ok_or_else(|| SignerError::not_found(Entity::Certificate, cert_id))?;
        Ok(KeyIdInfo {
            key_id: key.id.clone(),
            sign_mechanism: key.sign_mechanism(),
        })
    }

    pub fn token_and_key(&self, key_id: &str) -> Result<TokenInfoAndKeyId, SignerError> {
        self.key(key_id)?;
        Ok(TokenInfoAndKeyId {
            token_info: self.token.info(),
            key_id: key_id.to_owned(),
        })
    }
}

fn check_usage(key: &Key, requested: KeyUsage) -> Result<(), SignerError> {
    match key.usage {
        Some(actual) if actual != requested => Err(SignerError::WrongKeyUsage {
            key_id: key.id.clone(),
            actual,
            requested,
        }),
        _ => Ok(()),
    }
}

/// Accepts distinguished names of the form `C=FI, O=Org, CN=name`.
fn validate_subject(subject: &str) -> Result<(), SignerError> {
    let well_formed = !subject.trim().is_empty()
        && subject.split(',').all(|rdn| {
            matches!(rdn.split_once('='), Some((attr, value))
                if !attr.trim().is_empty() && !value.trim().is_empty())
        });
    if well_formed {
        Ok(())
    } else {
        Err(SignerError::invalid_request(format!(
            "malformed subject name {subject:?}"
        )))
    }
}

fn validate_owner(usage: KeyUsage, owner_id: &Option<String>) -> Result<(), SignerError> {
    match (usage, owner_id) {
        (KeyUsage::Signing, None) => Err(SignerError::invalid_request(
            "signing certificates need an owner",
        )),
        _ => Ok(()),
    }
}
