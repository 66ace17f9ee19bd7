// SPDX-FileCopyrightText: 2019-2023 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca

//! Small validation and normalization helpers shared by the directory and
//! the PGP adapter.

use rand::RngCore;

/// Normalize an email address the way the directory stores it: trimmed and
/// lowercased. This is not an RFC 5321 validator; syntax is whatever the
/// OpenPGP library accepted when parsing the user ID.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Is `s` exactly `len` lowercase hex characters?
pub fn is_lower_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

/// Derive the 16-char key ID from a 40-char fingerprint (invariant 1).
pub fn key_id_from_fingerprint(fingerprint: &str) -> String {
    let fp = fingerprint.to_lowercase();
    fp[fp.len().saturating_sub(16)..].to_string()
}

/// Generate a fresh 32-char lowercase-hex nonce.
///
/// Backed by `rand`'s OS-seeded RNG; nonces are single-use proof of
/// out-of-band delivery, not long-lived secrets, but are still generated
/// with a CSPRNG since they gate ownership of a mailbox.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_32_lowercase_hex_chars() {
        let nonce = generate_nonce();
        assert!(is_lower_hex(&nonce, 32), "nonce was {nonce}");
    }

    #[test]
    fn nonces_are_not_repeated() {
        assert_ne!(generate_nonce(), generate_nonce());
    }

    #[test]
    fn key_id_is_last_16_chars_of_fingerprint() {
        let fp = "0123456789abcdef0123456789abcdef01234567";
        assert_eq!(key_id_from_fingerprint(fp).len(), 16);
        assert!(fp.ends_with(&key_id_from_fingerprint(fp)));
    }

    #[test]
    fn email_is_normalized() {
        assert_eq!(normalize_email(" Alice@Example.ORG "), "alice@example.org");
    }
}
