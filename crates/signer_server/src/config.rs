// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The server's TOML config.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::warn;

use signer::TokenSpec;
use signer_protocol::{Pin, TokenType};

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Main plane, serving `/rpc` and `/version`.
    #[serde(default = "Config::default_address")]
    pub address: SocketAddr,

    /// Monitoring plane, serving `/metrics`. Disabled if unset.
    #[serde(default)]
    pub monitoring_address: Option<SocketAddr>,

    /// Connections beyond this many get a minimal 503.
    #[serde(default = "Config::default_max_connections")]
    pub max_connections: usize,

    /// Largest accepted `/rpc` body, in bytes.
    #[serde(default = "Config::default_json_size_limit")]
    pub json_size_limit: u64,

    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    pub id: String,

    #[serde(rename = "type")]
    pub token_type: TokenType,

    #[serde(default)]
    pub friendly_name: Option<String>,

    #[serde(default)]
    pub read_only: bool,

    /// File holding the PIN used to log in at startup.
    #[serde(default)]
    pub pin_file: Option<PathBuf>,
}

/// SHA-256 of the raw config file, used to skip reloads that change nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfigHash(pub [u8; 32]);

impl std::fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Config {
    pub fn default_address() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 8080))
    }

    pub fn default_max_connections() -> usize {
        1024
    }

    pub fn default_json_size_limit() -> u64 {
        1_000_000
    }

    /// Reads and parses the config at `path`, resolving relative paths against its directory.
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<(Self, ConfigHash)> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("Couldn't open config TOML: {path:?}"))?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&Sha256::digest(&raw));
        let hash = ConfigHash(hash);
        let text = String::from_utf8(raw)
            .with_context(|| format!("Couldn't interpret config TOML as UTF-8: {path:?}"))?;
        let config = Self::parse(&text)
            .with_context(|| format!("Couldn't parse config TOML: {path:?}"))?;
        let base = path.parent().unwrap_or(Path::new("."));
        Ok((config.relative_to(base), hash))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(text)?;
        if config.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        Ok(config)
    }

    /// Returns a version of the config with its paths relative to `base`.
    pub fn relative_to(mut self, base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        for token in &mut self.tokens {
            token.pin_file = token.pin_file.take().map(|p| base.join(p));
        }
        self
    }

    /// Turns the `[[tokens]]` entries into token specs, reading PIN files along the way.
    ///
    /// Entries that repeat an earlier id are skipped. A PIN file that can't be read leaves
    /// the token registered but logged out.
    pub async fn token_specs(&self) -> Vec<TokenSpec> {
        let mut seen = HashSet::new();
        let mut specs = vec![];
        for token in &self.tokens {
            if !seen.insert(token.id.as_str()) {
                warn!("Ignoring duplicate config entry for token {}", token.id);
                continue;
            }
            let pin = match &token.pin_file {
                Some(path) => match read_pin(path).await {
                    Ok(pin) => Some(pin),
                    Err(e) => {
                        warn!("Token {} will start logged out: {e:#}", token.id);
                        None
                    }
                },
                None => None,
            };
            specs.push(TokenSpec {
                id: token.id.clone(),
                token_type: token.token_type,
                friendly_name: token
                    .friendly_name
                    .clone()
                    .unwrap_or_else(|| default_friendly_name(token)),
                read_only: token.read_only,
                pin,
            });
        }
        specs
    }
}

fn default_friendly_name(token: &TokenConfig) -> String {
    match token.token_type {
        TokenType::Software => format!("softToken-{}", token.id),
        TokenType::HardwareSlot => format!("slot-{}", token.id),
    }
}

async fn read_pin(path: &Path) -> anyhow::Result<Pin> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading PIN file {path:?}"))?;
    let pin = Pin::new(contents.trim());
    if pin.is_empty() {
        anyhow::bail!("PIN file {path:?} is empty");
    }
    Ok(pin)
}
