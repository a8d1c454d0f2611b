// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Knows every configured token, owns its worker, and routes each operation to the worker
//! that owns the object it names.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::join_all;
use signer_protocol::{
    CertRequestFormat, CertificateInfo, GeneratedCertRequestInfo, KeyAlgorithm, KeyIdInfo,
    KeyInfo, Pin, SignAlgorithm, SignMechanism, TokenInfo, TokenInfoAndKeyId, TokenStatus,
    TokenType,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::device::{CertificateDecoder, DeviceError, DeviceProvider};
use crate::error::{Entity, OperationError, SignerError};
use crate::index::Index;
use crate::operations::{CertRequestParams, ImportParams, SelfSignedCertParams, TokenState};
use crate::worker::Worker;

/// How a token is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSpec {
    pub id: String,
    pub token_type: TokenType,
    pub friendly_name: String,
    pub read_only: bool,
    /// Log in with this PIN as soon as the token is registered.
    pub pin: Option<Pin>,
}

impl TokenSpec {
    pub fn software(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            friendly_name: format!("softToken-{id}"),
            id,
            token_type: TokenType::Software,
            read_only: false,
            pin: None,
        }
    }
}

pub type TokenWorker = Worker<TokenState>;

struct TokenHandle {
    spec: TokenSpec,
    worker: TokenWorker,
}

pub struct TokenManager {
    tokens: RwLock<Vec<Arc<TokenHandle>>>,
    index: Arc<Index>,
    ocsp_responses: RwLock<HashMap<String, Vec<u8>>>,
    provider: Arc<dyn DeviceProvider>,
    decoder: Arc<dyn CertificateDecoder>,
}

type Result<T, E = OperationError> = std::result::Result<T, E>;

fn normalize_hash(hash: &str) -> String {
    hash.trim().to_lowercase()
}

fn unavailable_info(spec: &TokenSpec) -> TokenInfo {
    TokenInfo {
        id: spec.id.clone(),
        token_type: spec.token_type,
        friendly_name: spec.friendly_name.clone(),
        active: false,
        read_only: spec.read_only,
        available: false,
        status: TokenStatus::NotAvailable,
        keys: vec![],
    }
}

impl TokenManager {
    pub fn new(provider: Arc<dyn DeviceProvider>, decoder: Arc<dyn CertificateDecoder>) -> Self {
        Self {
            tokens: RwLock::new(vec![]),
            index: Arc::new(Index::default()),
            ocsp_responses: RwLock::new(HashMap::new()),
            provider,
            decoder,
        }
    }

    /// Registers every token in `specs`, in order.
    pub async fn start(&self, specs: Vec<TokenSpec>) -> Result<()> {
        for spec in specs {
            self.add_token(spec).await?;
        }
        Ok(())
    }

    pub fn token_ids(&self) -> Vec<String> {
        self.handles().iter().map(|h| h.spec.id.clone()).collect()
    }

    fn handles(&self) -> Vec<Arc<TokenHandle>> {
        self.tokens
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Starts a worker for `spec` and, if the spec carries a PIN, logs in with it. A failed
    /// login leaves the token registered but inactive.
    pub async fn add_token(&self, spec: TokenSpec) -> Result<()> {
        let handle = {
            let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
            if tokens.iter().any(|h| h.spec.id == spec.id) {
                return Err(SignerError::invalid_request(format!(
                    "Token '{}' is already registered",
                    spec.id
                ))
                .into());
            }
            // Opening a device may block, so it happens on the new worker's thread.
            let init = {
                let spec = spec.clone();
                let provider = self.provider.clone();
                let index = self.index.clone();
                let decoder = self.decoder.clone();
                move || TokenState::new(&spec, provider.open(&spec), index, decoder)
            };
            let worker = Worker::spawn(spec.id.clone(), init, TokenState::close).map_err(|e| {
                SignerError::Device {
                    token_id: spec.id.clone(),
                    source: DeviceError::Internal(format!("couldn't start worker: {e}")),
                }
            })?;
            let handle = Arc::new(TokenHandle { spec, worker });
            tokens.push(handle.clone());
            handle
        };
        info!("registered token {}", handle.spec.id);

        if let Some(pin) = handle.spec.pin.clone() {
            let login = handle
                .worker
                .call(move |s| s.login_with_configured_pin(&pin))
                .await;
            if let Err(e) = login {
                warn!("couldn't log in to token {}: {e}", handle.spec.id);
            }
        }
        Ok(())
    }

    /// Drains the token's worker, then forgets it and everything it owned.
    pub async fn remove_token(&self, token_id: &str) -> Result<()> {
        let handle = {
            let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
            let pos = tokens
                .iter()
                .position(|h| h.spec.id == token_id)
                .ok_or_else(|| SignerError::not_found(Entity::Token, token_id))?;
            tokens.remove(pos)
        };
        handle.worker.stop().await;
        self.index.remove_token(token_id);
        info!("removed token {token_id}");
        Ok(())
    }

    /// Brings the registered tokens in line with `specs`: new ones are added, missing ones
    /// removed, and changed ones restarted. Failures are logged and don't stop the rest.
    pub async fn reconfigure(&self, specs: Vec<TokenSpec>) {
        let current = self.handles();
        for handle in &current {
            let keep = specs.iter().any(|s| s == &handle.spec);
            if !keep {
                if let Err(e) = self.remove_token(&handle.spec.id).await {
                    warn!("couldn't remove token {}: {e}", handle.spec.id);
                }
            }
        }
        for spec in specs {
            let unchanged = current.iter().any(|h| h.spec == spec);
            if !unchanged {
                let id = spec.id.clone();
                if let Err(e) = self.add_token(spec).await {
                    warn!("couldn't add token {id}: {e}");
                }
            }
        }
    }

    /// Drains and stops every worker.
    pub async fn shutdown(&self) {
        let handles = {
            let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *tokens)
        };
        join_all(handles.iter().map(|h| h.worker.stop())).await;
        for handle in &handles {
            self.index.remove_token(&handle.spec.id);
        }
        info!("stopped {} token workers", handles.len());
    }

    fn resolve_by_token_id(&self, token_id: &str) -> Result<Arc<TokenHandle>, SignerError> {
        self.handles()
            .into_iter()
            .find(|h| h.spec.id == token_id)
            .ok_or_else(|| SignerError::not_found(Entity::Token, token_id))
    }

    fn resolve_by_key_id(&self, key_id: &str) -> Result<Arc<TokenHandle>, SignerError> {
        self.index
            .token_for_key(key_id)
            .and_then(|token_id| self.resolve_by_token_id(&token_id).ok())
            .ok_or_else(|| SignerError::not_found(Entity::Key, key_id))
    }

    fn resolve_by_cert_hash(
        &self,
        cert_hash: &str,
    ) -> Result<(Arc<TokenHandle>, String), SignerError> {
        self.index
            .key_for_cert(cert_hash)
            .and_then(|r| Some((self.resolve_by_token_id(&r.token_id).ok()?, r.key_id)))
            .ok_or_else(|| SignerError::not_found(Entity::Certificate, cert_hash))
    }

    fn resolve_by_csr_id(&self, csr_id: &str) -> Result<(Arc<TokenHandle>, String), SignerError> {
        self.index
            .key_for_csr(csr_id)
            .and_then(|r| Some((self.resolve_by_token_id(&r.token_id).ok()?, r.key_id)))
            .ok_or_else(|| SignerError::not_found(Entity::CertRequest, csr_id))
    }

    /// Initializes the first configured software token with `pin`.
    pub async fn init_software_token(&self, pin: Pin) -> Result<()> {
        let handle = self
            .handles()
            .into_iter()
            .find(|h| h.spec.token_type == TokenType::Software)
            .ok_or_else(|| SignerError::invalid_request("no software token is configured"))?;
        handle.worker.call(move |s| s.initialize(&pin)).await
    }

    /// Snapshots of all tokens, collected from every worker concurrently. A token whose
    /// worker can't answer is listed as unavailable.
    pub async fn tokens(&self) -> Result<Vec<TokenInfo>> {
        let handles = self.handles();
        let infos = join_all(handles.iter().map(|h| h.worker.call(|s| Ok(s.info())))).await;
        Ok(handles
            .iter()
            .zip(infos)
            .map(|(handle, info)| {
                info.unwrap_or_else(|e| {
                    debug!("listing token {} as unavailable: {e}", handle.spec.id);
                    unavailable_info(&handle.spec)
                })
            })
            .collect())
    }

    pub async fn token(&self, token_id: &str) -> Result<TokenInfo> {
        let handle = self.resolve_by_token_id(token_id)?;
        handle.worker.call(|s| Ok(s.info())).await
    }

    pub async fn activate_token(&self, token_id: &str, pin: Pin) -> Result<()> {
        let handle = self.resolve_by_token_id(token_id)?;
        handle.worker.call(move |s| s.activate(&pin)).await
    }

    pub async fn deactivate_token(&self, token_id: &str) -> Result<()> {
        let handle = self.resolve_by_token_id(token_id)?;
        handle.worker.call(|s| s.deactivate()).await
    }

    pub async fn set_token_friendly_name(&self, token_id: &str, name: String) -> Result<()> {
        let handle = self.resolve_by_token_id(token_id)?;
        handle.worker.call(move |s| s.set_friendly_name(name)).await
    }

    pub async fn update_token_pin(&self, token_id: &str, old_pin: Pin, new_pin: Pin) -> Result<()> {
        let handle = self.resolve_by_token_id(token_id)?;
        handle
            .worker
            .call(move |s| s.update_pin(&old_pin, &new_pin))
            .await
    }

    pub async fn generate_key(
        &self,
        token_id: &str,
        label: String,
        algorithm: KeyAlgorithm,
    ) -> Result<KeyInfo> {
        let handle = self.resolve_by_token_id(token_id)?;
        handle
            .worker
            .call(move |s| s.generate_key(&label, algorithm))
            .await
    }

    pub async fn delete_key(&self, key_id: &str, purge_from_device: bool) -> Result<()> {
        let handle = self.resolve_by_key_id(key_id)?;
        let key_id = key_id.to_owned();
        handle
            .worker
            .call(move |s| s.delete_key(&key_id, purge_from_device))
            .await
    }

    pub async fn set_key_friendly_name(&self, key_id: &str, name: String) -> Result<()> {
        let handle = self.resolve_by_key_id(key_id)?;
        let key_id = key_id.to_owned();
        handle
            .worker
            .call(move |s| s.set_key_friendly_name(&key_id, name))
            .await
    }

    pub async fn sign_mechanism(&self, key_id: &str) -> Result<SignMechanism> {
        let handle = self.resolve_by_key_id(key_id)?;
        let key_id = key_id.to_owned();
        handle.worker.call(move |s| s.sign_mechanism(&key_id)).await
    }

    pub async fn sign(
        &self,
        key_id: &str,
        algorithm: SignAlgorithm,
        digest: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let handle = self.resolve_by_key_id(key_id)?;
        let key_id = key_id.to_owned();
        handle
            .worker
            .call(move |s| s.sign(&key_id, algorithm, &digest))
            .await
    }

    pub async fn generate_cert_request(
        &self,
        key_id: &str,
        params: CertRequestParams,
    ) -> Result<GeneratedCertRequestInfo> {
        let handle = self.resolve_by_key_id(key_id)?;
        let key_id = key_id.to_owned();
        handle
            .worker
            .call(move |s| s.generate_cert_request(&key_id, params))
            .await
    }

    pub async fn regenerate_cert_request(
        &self,
        csr_id: &str,
        format: CertRequestFormat,
    ) -> Result<GeneratedCertRequestInfo> {
        let (handle, _) = self.resolve_by_csr_id(csr_id)?;
        let csr_id = csr_id.to_owned();
        handle
            .worker
            .call(move |s| s.regenerate_cert_request(&csr_id, format))
            .await
    }

    pub async fn delete_cert_request(&self, csr_id: &str) -> Result<()> {
        let (handle, _) = self.resolve_by_csr_id(csr_id)?;
        let csr_id = csr_id.to_owned();
        handle
            .worker
            .call(move |s| s.delete_cert_request(&csr_id))
            .await
    }

    pub async fn generate_self_signed_cert(
        &self,
        key_id: &str,
        params: SelfSignedCertParams,
    ) -> Result<Vec<u8>> {
        let handle = self.resolve_by_key_id(key_id)?;
        let key_id = key_id.to_owned();
        handle
            .worker
            .call(move |s| s.generate_self_signed_cert(&key_id, params))
            .await
    }

    /// Attaches `cert_bytes` to the key whose public key it certifies. Returns the new
    /// certificate's id.
    pub async fn import_certificate(
        &self,
        cert_bytes: Vec<u8>,
        initial_status: String,
        owner_id: Option<String>,
        activate: bool,
    ) -> Result<String> {
        let decoded = self
            .decoder
            .decode(&cert_bytes)
            .map_err(|e| SignerError::InvalidCertificate(e.to_string()))?;
        let key_ref = self
            .index
            .key_for_public_key(&decoded.public_key)
            .ok_or_else(|| SignerError::not_found(Entity::Key, hex::encode(&decoded.public_key)))?;
        let handle = self
            .resolve_by_token_id(&key_ref.token_id)
            .map_err(|_| SignerError::not_found(Entity::Key, key_ref.key_id.clone()))?;
        let params = ImportParams {
            cert_bytes,
            decoded,
            initial_status,
            owner_id,
            activate,
        };
        handle
            .worker
            .call(move |s| s.import_certificate(&key_ref.key_id, params))
            .await
    }

    pub async fn set_cert_active(&self, cert_id: &str, active: bool) -> Result<()> {
        let cert_id = normalize_hash(cert_id);
        let (handle, _) = self.resolve_by_cert_hash(&cert_id)?;
        handle
            .worker
            .call(move |s| s.set_cert_active(&cert_id, active))
            .await
    }

    pub async fn delete_certificate(&self, cert_id: &str) -> Result<()> {
        let cert_id = normalize_hash(cert_id);
        let (handle, _) = self.resolve_by_cert_hash(&cert_id)?;
        handle
            .worker
            .call(move |s| s.delete_certificate(&cert_id))
            .await
    }

    pub async fn set_cert_status(&self, cert_id: &str, status: String) -> Result<()> {
        let cert_id = normalize_hash(cert_id);
        let (handle, _) = self.resolve_by_cert_hash(&cert_id)?;
        handle
            .worker
            .call(move |s| s.set_cert_status(&cert_id, &status))
            .await
    }

    pub async fn set_renewed_cert_hash(&self, cert_id: &str, hash: String) -> Result<()> {
        let cert_id = normalize_hash(cert_id);
        let (handle, _) = self.resolve_by_cert_hash(&cert_id)?;
        handle
            .worker
            .call(move |s| s.set_renewed_cert_hash(&cert_id, hash))
            .await
    }

    pub async fn set_renewal_error(&self, cert_id: &str, message: String) -> Result<()> {
        let cert_id = normalize_hash(cert_id);
        let (handle, _) = self.resolve_by_cert_hash(&cert_id)?;
        handle
            .worker
            .call(move |s| s.set_renewal_error(&cert_id, message))
            .await
    }

    pub async fn set_next_planned_renewal(&self, cert_id: &str, at: OffsetDateTime) -> Result<()> {
        let cert_id = normalize_hash(cert_id);
        let (handle, _) = self.resolve_by_cert_hash(&cert_id)?;
        handle
            .worker
            .call(move |s| s.set_next_planned_renewal(&cert_id, at))
            .await
    }

    pub async fn cert_for_hash(&self, cert_hash: &str) -> Result<CertificateInfo> {
        let cert_hash = normalize_hash(cert_hash);
        let (handle, _) = self.resolve_by_cert_hash(&cert_hash)?;
        handle.worker.call(move |s| s.cert_info(&cert_hash)).await
    }

    pub async fn key_id_for_cert_hash(&self, cert_hash: &str) -> Result<KeyIdInfo> {
        let cert_hash = normalize_hash(cert_hash);
        let (handle, _) = self.resolve_by_cert_hash(&cert_hash)?;
        handle.worker.call(move |s| s.key_id_info(&cert_hash)).await
    }

    pub async fn token_and_key_for_cert_hash(&self, cert_hash: &str) -> Result<TokenInfoAndKeyId> {
        let cert_hash = normalize_hash(cert_hash);
        let (handle, key_id) = self.resolve_by_cert_hash(&cert_hash)?;
        handle.worker.call(move |s| s.token_and_key(&key_id)).await
    }

    pub async fn token_and_key_for_csr_id(&self, csr_id: &str) -> Result<TokenInfoAndKeyId> {
        let (handle, key_id) = self.resolve_by_csr_id(csr_id)?;
        handle.worker.call(move |s| s.token_and_key(&key_id)).await
    }

    pub async fn token_for_key_id(&self, key_id: &str) -> Result<TokenInfo> {
        let handle = self.resolve_by_key_id(key_id)?;
        let key_id = key_id.to_owned();
        handle
            .worker
            .call(move |s| s.token_and_key(&key_id).map(|t| t.token_info))
            .await
    }

    /// Cached OCSP responses for `cert_hashes`, one entry per hash, in the same order.
    pub fn ocsp_responses(&self, cert_hashes: &[String]) -> Vec<Option<Vec<u8>>> {
        let cache = self
            .ocsp_responses
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        cert_hashes
            .iter()
            .map(|h| cache.get(&normalize_hash(h)).cloned())
            .collect()
    }

    pub fn set_ocsp_responses(
        &self,
        cert_hashes: Vec<String>,
        responses: Vec<Vec<u8>>,
    ) -> Result<(), SignerError> {
        if cert_hashes.len() != responses.len() {
            return Err(SignerError::invalid_request(format!(
                "got {} certificate hashes but {} OCSP responses",
                cert_hashes.len(),
                responses.len()
            )));
        }
        let mut cache = self
            .ocsp_responses
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for (hash, response) in cert_hashes.into_iter().zip(responses) {
            cache.insert(normalize_hash(&hash), response);
        }
        Ok(())
    }
}
