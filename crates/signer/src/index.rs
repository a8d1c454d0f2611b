// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reverse lookups from keys, certificates, CSRs and public keys to their owners.
//!
//! Only token workers write here, and only from inside the operation that changed the
//! model, before the operation's result is sent back. Readers therefore never observe an
//! id whose creating call hasn't returned yet.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRef {
    pub token_id: String,
    pub key_id: String,
}

impl KeyRef {
    pub fn new(token_id: &str, key_id: &str) -> Self {
        Self {
            token_id: token_id.to_owned(),
            key_id: key_id.to_owned(),
        }
    }
}

#[derive(Debug, Default)]
struct Maps {
    keys: HashMap<String, String>,
    certs: HashMap<String, KeyRef>,
    csrs: HashMap<String, KeyRef>,
    public_keys: HashMap<Vec<u8>, KeyRef>,
}

#[derive(Debug, Default)]
pub struct Index {
    maps: RwLock<Maps>,
}

impl Index {
    // A panicking worker can't leave the maps half-updated (every write is a single
    // insert or retain), so a poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.maps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.maps.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn token_for_key(&self, key_id: &str) -> Option<String> {
        self.read().keys.get(key_id).cloned()
    }

    pub fn key_for_cert(&self, cert_hash: &str) -> Option<KeyRef> {
        self.read().certs.get(cert_hash).cloned()
    }

    pub fn key_for_csr(&self, csr_id: &str) -> Option<KeyRef> {
        self.read().csrs.get(csr_id).cloned()
    }

    pub fn key_for_public_key(&self, public_key: &[u8]) -> Option<KeyRef> {
        self.read().public_keys.get(public_key).cloned()
    }

    pub fn contains_cert(&self, cert_hash: &str) -> bool {
        self.read().certs.contains_key(cert_hash)
    }

    /// Routes `key_id` to `token_id`, unless some token already owns that id. Returns
    /// whether the key was published.
    #[must_use]
    pub fn claim_key(&self, token_id: &str, key_id: &str, public_key: &[u8]) -> bool {
        let mut maps = self.write();
        if maps.keys.contains_key(key_id) {
            return false;
        }
        maps.keys.insert(key_id.to_owned(), token_id.to_owned());
        maps.public_keys
            .insert(public_key.to_vec(), KeyRef::new(token_id, key_id));
        true
    }

    pub fn insert_cert(&self, token_id: &str, key_id: &str, cert_hash: &str) {
        self.write()
            .certs
            .insert(cert_hash.to_owned(), KeyRef::new(token_id, key_id));
    }

    pub fn insert_csr(&self, token_id: &str, key_id: &str, csr_id: &str) {
        self.write()
            .csrs
            .insert(csr_id.to_owned(), KeyRef::new(token_id, key_id));
    }

    pub fn remove_cert(&self, cert_hash: &str) {
        self.write().certs.remove(cert_hash);
    }

    pub fn remove_csr(&self, csr_id: &str) {
        self.write().csrs.remove(csr_id);
    }

    /// Drops `token_id`'s key and everything attached to it.
    pub fn remove_key(&self, token_id: &str, key_id: &str) {
        let mut maps = self.write();
        if maps.keys.get(key_id).is_some_and(|owner| owner == token_id) {
            maps.keys.remove(key_id);
        }
        let owned = |r: &KeyRef| r.token_id == token_id && r.key_id == key_id;
        maps.certs.retain(|_, r| !owned(r));
        maps.csrs.retain(|_, r| !owned(r));
        maps.public_keys.retain(|_, r| !owned(r));
    }

    /// Drops every entry that belongs to `token_id`.
    pub fn remove_token(&self, token_id: &str) {
        let mut maps = self.write();
        maps.keys.retain(|_, t| t != token_id);
        maps.certs.retain(|_, r| r.token_id != token_id);
        maps.csrs.retain(|_, r| r.token_id != token_id);
        maps.public_keys.retain(|_, r| r.token_id != token_id);
    }
}
