// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// A per-request ID passed to us by the caller as an HTTP header, or made up on arrival.
/// It prefixes every log line written while serving the request, so one call can be
/// followed through the transport, the gateway and the token worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl FromStr for RequestId {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(String::from(s)))
    }
}

impl RequestId {
    pub const FIELD: &'static str = "X-Request-ID";

    pub fn new_unique() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new_unique_with_prefix(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", Uuid::new_v4()))
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self, std::str::Utf8Error> {
        let s = std::str::from_utf8(b)?;
        Ok(Self(String::from(s)))
    }

    pub fn unknown() -> Self {
        Self("unknown".into())
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == "unknown"
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ids_are_unique() {
        let a = RequestId::new_unique_with_prefix("signer");
        let b = RequestId::new_unique_with_prefix("signer");
        assert!(a.0.starts_with("signer-"));
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_non_utf8() {
        assert!(RequestId::from_bytes(&[0xff, 0xfe]).is_err());
        assert_eq!(RequestId::from_bytes(b"abc").unwrap().0, "abc");
    }
}
