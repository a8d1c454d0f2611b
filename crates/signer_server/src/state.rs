// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Arc, Mutex, PoisonError};

use signer::{Gateway, TokenManager};

use crate::config::ConfigHash;
use crate::metrics::SignerMetrics;

pub struct SignerState {
    pub gateway: Gateway,
    pub metrics: Arc<SignerMetrics>,
    pub json_size_limit: u64,
    /// Hash of the config the token set was last built from.
    config_hash: Mutex<Option<ConfigHash>>,
}

impl SignerState {
    pub fn new(manager: Arc<TokenManager>, metrics: Arc<SignerMetrics>, json_size_limit: u64) -> Self {
        Self {
            gateway: Gateway::new(manager),
            metrics,
            json_size_limit,
            config_hash: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<TokenManager> {
        self.gateway.manager()
    }

    /// Records `hash` as current, returning whether it differs from the previous one.
    pub fn swap_config_hash(&self, hash: ConfigHash) -> bool {
        let mut current = self
            .config_hash
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        current.replace(hash) != Some(hash)
    }
}
