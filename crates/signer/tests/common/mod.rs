// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use signer::device::{CsrParams, SelfSignedParams};
use signer::{
    CertificateDecoder, DecodeError, DecodedCertificate, DeviceError, DeviceKey, DeviceProvider,
    TokenDevice, TokenManager, TokenSpec,
};
use signer_protocol::{KeyAlgorithm, KeyUsage, Pin, SignAlgorithm, TokenType};

pub const PIN: &str = "1234";

/// Observations and knobs shared between a test and one [`SpyDevice`].
#[derive(Default)]
pub struct SpyState {
    calls: Mutex<Vec<&'static str>>,
    in_flight: AtomicBool,
    pub overlaps: AtomicUsize,
    pub closed: AtomicBool,
    pub delay: Mutex<Duration>,
    failures: Mutex<HashMap<&'static str, DeviceError>>,
    panics: Mutex<Option<&'static str>>,
    rendezvous: Mutex<Option<Arc<AtomicUsize>>>,
}

impl SpyState {
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|m| **m == method).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Makes every later call to `method` fail with `err`.
    pub fn fail(&self, method: &'static str, err: DeviceError) {
        self.failures.lock().unwrap().insert(method, err);
    }

    pub fn panic_on(&self, method: &'static str) {
        *self.panics.lock().unwrap() = Some(method);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Makes `sign` wait until `parties` devices sharing `counter` are all inside `sign`.
    pub fn rendezvous(&self, counter: Arc<AtomicUsize>) {
        *self.rendezvous.lock().unwrap() = Some(counter);
    }

    fn enter(&self, method: &'static str) -> Result<InFlight<'_>, DeviceError> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let guard = InFlight(self);
        self.calls.lock().unwrap().push(method);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if *self.panics.lock().unwrap() == Some(method) {
            panic!("spy device told to panic in {method}");
        }
        match self.failures.lock().unwrap().get(method) {
            Some(err) => Err(err.clone()),
            None => Ok(guard),
        }
    }
}

struct InFlight<'a>(&'a SpyState);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.store(false, Ordering::SeqCst);
    }
}

/// A device that records every call and flags any two calls that overlap in time.
///
/// Key ids equal their labels, public keys are `pk-<label>`, and self-signed certificates
/// come out in the format [`IdentityDecoder`] reads.
pub struct SpyDevice {
    state: Arc<SpyState>,
    initialized: bool,
    pin: String,
    keys: Vec<String>,
    certs: Vec<(String, String)>,
}

impl SpyDevice {
    pub fn new(state: Arc<SpyState>) -> Self {
        Self {
            state,
            initialized: true,
            pin: PIN.into(),
            keys: vec![],
            certs: vec![],
        }
    }

    fn has_key(&self, key_id: &str) -> Result<(), DeviceError> {
        if self.keys.iter().any(|k| k == key_id) {
            Ok(())
        } else {
            Err(DeviceError::KeyMissing(key_id.into()))
        }
    }
}

impl TokenDevice for SpyDevice {
    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn initialize(&mut self, pin: &Pin) -> Result<(), DeviceError> {
        let _g = self.state.enter("initialize")?;
        self.pin = pin.expose().to_owned();
        self.initialized = true;
        Ok(())
    }

    fn login(&mut self, pin: &Pin) -> Result<(), DeviceError> {
        let _g = self.state.enter("login")?;
        if pin.expose() == self.pin {
            Ok(())
        } else {
            Err(DeviceError::PinIncorrect)
        }
    }

    fn logout(&mut self) -> Result<(), DeviceError> {
        let _g = self.state.enter("logout")?;
        Ok(())
    }

    fn change_pin(&mut self, old_pin: &Pin, new_pin: &Pin) -> Result<(), DeviceError> {
        let _g = self.state.enter("change_pin")?;
        if old_pin.expose() != self.pin {
            return Err(DeviceError::PinIncorrect);
        }
        self.pin = new_pin.expose().to_owned();
        Ok(())
    }

    fn generate_key(
        &mut self,
        label: &str,
        _algorithm: KeyAlgorithm,
    ) -> Result<DeviceKey, DeviceError> {
        let _g = self.state.enter("generate_key")?;
        self.keys.push(label.to_owned());
        Ok(DeviceKey {
            id: label.to_owned(),
            public_key: format!("pk-{label}").into_bytes(),
        })
    }

    fn delete_key(&mut self, key_id: &str) -> Result<(), DeviceError> {
        let _g = self.state.enter("delete_key")?;
        self.has_key(key_id)?;
        self.keys.retain(|k| k != key_id);
        Ok(())
    }

    fn sign(
        &mut self,
        key_id: &str,
        _algorithm: SignAlgorithm,
        digest: &[u8],
    ) -> Result<Vec<u8>, DeviceError> {
        let _g = self.state.enter("sign")?;
        self.has_key(key_id)?;
        let rendezvous = self.state.rendezvous.lock().unwrap().clone();
        if let Some(counter) = rendezvous {
            counter.fetch_add(1, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(5);
            while counter.load(Ordering::SeqCst) < 2 {
                if Instant::now() > deadline {
                    return Err(DeviceError::Internal("nobody else showed up".into()));
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        let mut signature = b"signed:".to_vec();
        signature.extend_from_slice(digest);
        Ok(signature)
    }

    fn generate_cert_request(
        &mut self,
        key_id: &str,
        params: &CsrParams,
    ) -> Result<Vec<u8>, DeviceError> {
        let _g = self.state.enter("generate_cert_request")?;
        self.has_key(key_id)?;
        Ok(format!("csr:{}", params.subject_name).into_bytes())
    }

    fn generate_self_signed_cert(
        &mut self,
        key_id: &str,
        params: &SelfSignedParams,
    ) -> Result<Vec<u8>, DeviceError> {
        let _g = self.state.enter("generate_self_signed_cert")?;
        self.has_key(key_id)?;
        Ok(identity_cert(
            &format!("self-{}", params.common_name),
            params.key_usage,
            key_id,
        ))
    }

    fn store_certificate(
        &mut self,
        key_id: &str,
        cert_id: &str,
        _cert: &[u8],
    ) -> Result<(), DeviceError> {
        let _g = self.state.enter("store_certificate")?;
        self.has_key(key_id)?;
        self.certs.push((key_id.to_owned(), cert_id.to_owned()));
        Ok(())
    }

    fn delete_certificate(&mut self, key_id: &str, cert_id: &str) -> Result<(), DeviceError> {
        let _g = self.state.enter("delete_certificate")?;
        let before = self.certs.len();
        self.certs.retain(|(k, c)| !(k == key_id && c == cert_id));
        if self.certs.len() == before {
            return Err(DeviceError::CertificateMissing(cert_id.into()));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.state.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out [`SpyDevice`]s and keeps their [`SpyState`]s by token id.
#[derive(Default)]
pub struct SpyProvider {
    states: Mutex<HashMap<String, Arc<SpyState>>>,
    unreachable: Mutex<Vec<String>>,
    panicking: Mutex<Vec<String>>,
    held: Mutex<HashMap<String, mpsc::Receiver<()>>>,
    opened_on: Mutex<HashMap<String, String>>,
}

impl SpyProvider {
    pub fn state(&self, token_id: &str) -> Arc<SpyState> {
        self.states
            .lock()
            .unwrap()
            .entry(token_id.to_owned())
            .or_default()
            .clone()
    }

    pub fn make_unreachable(&self, token_id: &str) {
        self.unreachable.lock().unwrap().push(token_id.to_owned());
    }

    pub fn panic_on_open(&self, token_id: &str) {
        self.panicking.lock().unwrap().push(token_id.to_owned());
    }

    /// Makes opening `token_id` block until the returned sender fires (or five seconds pass).
    pub fn hold_open(&self, token_id: &str) -> mpsc::Sender<()> {
        let (release, held) = mpsc::channel();
        self.held.lock().unwrap().insert(token_id.to_owned(), held);
        release
    }

    /// Name of the thread that opened `token_id`'s device.
    pub fn opened_on(&self, token_id: &str) -> Option<String> {
        self.opened_on.lock().unwrap().get(token_id).cloned()
    }
}

impl DeviceProvider for SpyProvider {
    fn open(&self, spec: &TokenSpec) -> Result<Box<dyn TokenDevice>, DeviceError> {
        let thread = std::thread::current().name().unwrap_or_default().to_owned();
        self.opened_on.lock().unwrap().insert(spec.id.clone(), thread);
        let held = self.held.lock().unwrap().remove(&spec.id);
        if let Some(held) = held {
            let _ = held.recv_timeout(Duration::from_secs(5));
        }
        if self.panicking.lock().unwrap().contains(&spec.id) {
            panic!("spy provider told to panic opening {}", spec.id);
        }
        if self.unreachable.lock().unwrap().contains(&spec.id) {
            return Err(DeviceError::Unreachable("unplugged".into()));
        }
        Ok(Box::new(SpyDevice::new(self.state(&spec.id))))
    }
}

/// Certificates in tests are plain text: `<hash>;<usage>;<key id>[;<subject>]`. The hash
/// doubles as the certificate id and the public key is `pk-<key id>`.
pub struct IdentityDecoder;

pub fn identity_cert(hash: &str, usage: KeyUsage, key_id: &str) -> Vec<u8> {
    format!("{hash};{usage};{key_id}").into_bytes()
}

pub fn identity_cert_for_subject(
    hash: &str,
    usage: KeyUsage,
    key_id: &str,
    subject: &str,
) -> Vec<u8> {
    format!("{hash};{usage};{key_id};{subject}").into_bytes()
}

impl CertificateDecoder for IdentityDecoder {
    fn decode(&self, cert: &[u8]) -> Result<DecodedCertificate, DecodeError> {
        let text = std::str::from_utf8(cert).map_err(|e| DecodeError(e.to_string()))?;
        let parts: Vec<&str> = text.split(';').collect();
        let (hash, usage, key_id, subject) = match parts[..] {
            [hash, usage, key_id] => (hash, usage, key_id, hash),
            [hash, usage, key_id, subject] => (hash, usage, key_id, subject),
            _ => return Err(DecodeError(format!("not a test certificate: {text:?}"))),
        };
        let key_usage = match usage {
            "AUTHENTICATION" => Some(KeyUsage::Authentication),
            "SIGNING" => Some(KeyUsage::Signing),
            _ => None,
        };
        Ok(DecodedCertificate {
            hash: hash.to_owned(),
            public_key: format!("pk-{key_id}").into_bytes(),
            subject: subject.to_owned(),
            key_usage,
        })
    }
}

pub fn spec(id: &str) -> TokenSpec {
    TokenSpec {
        id: id.to_owned(),
        token_type: TokenType::HardwareSlot,
        friendly_name: format!("slot {id}"),
        read_only: false,
        pin: Some(Pin::new(PIN)),
    }
}

pub fn manager(provider: &Arc<SpyProvider>) -> Arc<TokenManager> {
    Arc::new(TokenManager::new(provider.clone(), Arc::new(IdentityDecoder)))
}

/// Token `fubar` holding key `sign-key` (signing, with certificate `ok-cert-sign`) and key
/// `auth-key` (authentication, with certificate `ok-cert`).
pub async fn fubar() -> (Arc<SpyProvider>, Arc<TokenManager>) {
    let provider = Arc::new(SpyProvider::default());
    let manager = manager(&provider);
    manager.start(vec![spec("fubar")]).await.unwrap();

    manager
        .generate_key("fubar", "sign-key".into(), KeyAlgorithm::Rsa)
        .await
        .unwrap();
    manager
        .generate_key("fubar", "auth-key".into(), KeyAlgorithm::Rsa)
        .await
        .unwrap();
    manager
        .import_certificate(
            identity_cert("ok-cert-sign", KeyUsage::Signing, "sign-key"),
            "registered".into(),
            Some("FI/GOV/1234".into()),
            true,
        )
        .await
        .unwrap();
    manager
        .import_certificate(
            identity_cert("ok-cert", KeyUsage::Authentication, "auth-key"),
            "registered".into(),
            None,
            true,
        )
        .await
        .unwrap();
    (provider, manager)
}
