// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Stable fault and translation codes.
//!
//! Fault codes are sent prefixed with [`SIGNER_X`] (e.g. `Signer.CertNotFound`) so callers
//! that aggregate faults from several backends can tell where a fault came from. These values
//! are part of the wire contract and must not change.

pub const SIGNER_X: &str = "Signer";

pub const X_TOKEN_NOT_FOUND: &str = "TokenNotFound";
pub const X_KEY_NOT_FOUND: &str = "KeyNotFound";
pub const X_CSR_NOT_FOUND: &str = "CsrNotFound";
pub const X_CERT_NOT_FOUND: &str = "CertNotFound";
pub const X_TOKEN_NOT_AVAILABLE: &str = "TokenNotAvailable";
pub const X_TOKEN_READONLY: &str = "TokenReadonly";
pub const X_WRONG_KEY_USAGE: &str = "WrongKeyUsage";
pub const X_INCORRECT_CERTIFICATE: &str = "IncorrectCertificate";
pub const X_INVALID_REQUEST: &str = "InvalidRequest";
pub const X_PIN_INCORRECT: &str = "PinIncorrect";
pub const X_INTERNAL_ERROR: &str = "InternalError";

pub const TR_TOKEN_NOT_FOUND: &str = "token_not_found";
pub const TR_KEY_NOT_FOUND: &str = "key_not_found";
pub const TR_CSR_NOT_FOUND: &str = "csr_not_found";
pub const TR_CERT_NOT_FOUND: &str = "cert_with_id_not_found";
pub const TR_TOKEN_NOT_AVAILABLE: &str = "token_not_available";
pub const TR_TOKEN_READONLY: &str = "token_readonly";
pub const TR_WRONG_KEY_USAGE: &str = "wrong_key_usage";
pub const TR_INVALID_CERTIFICATE: &str = "invalid_certificate";
pub const TR_INVALID_REQUEST: &str = "invalid_request";
pub const TR_PIN_INCORRECT: &str = "pin_incorrect";
pub const TR_INTERNAL_ERROR: &str = "internal_error";

/// Joins [`SIGNER_X`] and a bare code, e.g. `with_prefix(X_KEY_NOT_FOUND)` is `Signer.KeyNotFound`.
pub fn with_prefix(code: &str) -> String {
    format!("{SIGNER_X}.{code}")
}

/// Inverse of [`with_prefix`]: returns the bare code if `fault_code` came from the signer.
pub fn strip_prefix(fault_code: &str) -> Option<&str> {
    fault_code
        .strip_prefix(SIGNER_X)
        .and_then(|rest| rest.strip_prefix('.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_round_trip() {
        let code = with_prefix(X_CERT_NOT_FOUND);
        assert_eq!(code, "Signer.CertNotFound");
        assert_eq!(strip_prefix(&code), Some(X_CERT_NOT_FOUND));
    }

    #[test]
    fn foreign_codes_are_not_stripped() {
        assert_eq!(strip_prefix("Proxy.CertNotFound"), None);
        assert_eq!(strip_prefix("SignerCertNotFound"), None);
    }
}
