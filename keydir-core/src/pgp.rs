// SPDX-FileCopyrightText: 2019-2023 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca

//! The PGP Adapter: wraps `sequoia-openpgp` so the key directory only ever
//! has to deal with armored text and plain Rust values, never with
//! `Cert`/`Packet` directly.

use std::collections::HashSet;
use std::convert::TryInto;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sequoia_openpgp::cert::amalgamation::{ValidAmalgamation, ValidateAmalgamation};
use sequoia_openpgp::cert::CertParser;
use sequoia_openpgp::packet::{Signature, UserID};
use sequoia_openpgp::parse::Parse;
use sequoia_openpgp::policy::StandardPolicy;
use sequoia_openpgp::serialize::SerializeInto;
use sequoia_openpgp::types::RevocationStatus;
use sequoia_openpgp::{Cert, Packet};

use crate::error::Error;
use crate::model::{PendingSig, SignedUser, UserIdStatus};
use crate::validate::normalize_email;

const BEGIN_MARK: &str = "-----BEGIN PGP PUBLIC KEY BLOCK-----";
const END_MARK: &str = "-----END PGP PUBLIC KEY BLOCK-----";

static SP: StandardPolicy<'static> = StandardPolicy::new();

type Result<T> = std::result::Result<T, Error>;

/// A user ID as seen at parse time, before any directory state is attached.
#[derive(Debug, Clone)]
pub struct ParsedUserId {
    pub status: UserIdStatus,
    pub name: Option<String>,
    pub email: String,
}

/// The result of [`parse_key`]: everything the Key Directory needs to build
/// a `KeyRecord` skeleton.
#[derive(Debug, Clone)]
pub struct ParsedKey {
    pub fingerprint: String,
    pub key_id: String,
    pub created: DateTime<Utc>,
    pub algorithm: String,
    pub key_size: Option<u32>,
    pub user_ids: Vec<ParsedUserId>,
    pub has_organisation_uid: bool,
}

/// The primary user of a key, as returned by [`get_primary_user`].
#[derive(Debug, Clone, Default)]
pub struct PrimaryUser {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// What [`inspect_signature`] can recover from a raw third-party
/// certification packet without access to the issuer's own key.
#[derive(Debug, Clone, Default)]
pub struct SignatureInfo {
    pub issuer_fingerprint: Option<String>,
    pub created: Option<DateTime<Utc>>,
}

/// Decode a raw signature packet (as stored in a pending-signatures batch)
/// and recover its issuer fingerprint and creation time.
pub fn inspect_signature(signature: &[u8]) -> Result<SignatureInfo> {
    let packet =
        Packet::from_bytes(signature).map_err(|e| Error::InternalParseError(e.to_string()))?;
    let sig = match packet {
        Packet::Signature(s) => s,
        _ => return Err(Error::InternalParseError("not a signature packet".into())),
    };
    Ok(SignatureInfo {
        issuer_fingerprint: sig.issuer_fingerprint().map(|fp| fp.to_hex().to_lowercase()),
        created: sig.signature_creation_time().map(DateTime::<Utc>::from),
    })
}

/// Extract the single `BEGIN/END PGP PUBLIC KEY BLOCK` segment from `text`,
/// rejecting anything that isn't exactly one such block.
pub fn trim_armor(text: &str) -> Result<String> {
    let start = text
        .find(BEGIN_MARK)
        .ok_or_else(|| Error::MalformedKey("no PGP public key block found".into()))?;
    let end = text[start..]
        .find(END_MARK)
        .ok_or_else(|| Error::MalformedKey("unterminated PGP public key block".into()))?;
    let end = start + end + END_MARK.len();

    if text[end..].contains(BEGIN_MARK) {
        return Err(Error::MalformedKey(
            "more than one PGP public key block found".into(),
        ));
    }

    Ok(text[start..end].to_string())
}

/// Extract just the fingerprint of a single armored primary key, without
/// the liveness/per-user-ID validation [`parse_key`] performs. Lets a
/// caller (a Storage selector, a test) derive the invariant-1 relationship
/// between fingerprint and key ID without re-running a full parse.
pub fn fingerprint_of(armored: &str) -> Result<String> {
    let cert = to_cert(armored)?;
    Ok(cert.fingerprint().to_hex().to_lowercase())
}

/// Parse a single armored primary public key into a [`ParsedKey`].
///
/// `is_organisation_email` implements the configured domain policy
/// (`publicKey.restrictionRegEx`); it decides `has_organisation_uid`.
pub fn parse_key(armored: &str, is_organisation_email: impl Fn(&str) -> bool) -> Result<ParsedKey> {
    let trimmed = trim_armor(armored)?;

    let certs: std::result::Result<Vec<Cert>, _> =
        CertParser::from_bytes(trimmed.as_bytes())
            .map_err(|e| Error::InternalParseError(e.to_string()))?
            .collect();
    let mut certs = certs.map_err(|e| Error::MalformedKey(e.to_string()))?;

    if certs.len() != 1 {
        return Err(Error::MalformedKey(
            "expected exactly one primary key, found a bundle".into(),
        ));
    }
    let cert = certs.remove(0);

    let fingerprint = cert.fingerprint().to_hex().to_lowercase();
    if fingerprint.len() != 40 {
        return Err(Error::MalformedKey(
            "only v4 keys (40 hex char fingerprints) are supported".into(),
        ));
    }
    let key_id = crate::validate::key_id_from_fingerprint(&fingerprint);

    let created: SystemTime = cert.primary_key().creation_time();
    let reference_time = std::cmp::max(SystemTime::now(), created);

    let valid_cert = cert
        .with_policy(&SP, reference_time)
        .map_err(|e| Error::MalformedKey(format!("primary key does not verify: {e}")))?;
    valid_cert
        .primary_key()
        .alive()
        .map_err(|e| Error::MalformedKey(format!("primary key is not alive: {e}")))?;

    let algorithm = format!("{:?}", cert.primary_key().pk_algo());
    let key_size = cert.primary_key().mpis().bits();

    let mut user_ids = Vec::new();
    let mut has_organisation_uid = false;

    for ua in cert.userids() {
        let userid = ua.userid();

        let name = match userid.name() {
            Ok(name) => name,
            Err(_) => continue, // malformed userid string: drop silently
        };
        let email = match userid.email() {
            Ok(Some(email)) => normalize_email(&email),
            Ok(None) => continue, // no email in userid: nothing to verify, drop
            Err(_) => continue,
        };

        let status = match ua.with_policy(&SP, reference_time) {
            Ok(valid_ua) => match valid_ua.revocation_status() {
                RevocationStatus::Revoked(_) => UserIdStatus::Revoked,
                _ => {
                    let expired = valid_ua
                        .binding_signature()
                        .signature_expiration_time()
                        .map(|expiry| expiry <= reference_time)
                        .unwrap_or(false);
                    if expired {
                        UserIdStatus::Expired
                    } else {
                        UserIdStatus::Valid
                    }
                }
            },
            Err(_) => UserIdStatus::Invalid,
        };

        if status == UserIdStatus::Valid && is_organisation_email(&email) {
            has_organisation_uid = true;
        }

        user_ids.push(ParsedUserId { status, name, email });
    }

    Ok(ParsedKey {
        fingerprint,
        key_id,
        created: created.into(),
        algorithm,
        key_size: key_size.map(|b| b as u32),
        user_ids,
        has_organisation_uid,
    })
}

/// Rebuild `cert`'s packet stream keeping only components for which
/// `keep_userid`/`keep_user_attribute` return true. Primary key material,
/// subkeys and their binding signatures always survive.
fn retain_components(
    cert: &Cert,
    keep_userid: impl Fn(&UserID) -> bool,
    keep_user_attribute: bool,
) -> Result<Cert> {
    let mut kept: Vec<Packet> = Vec::new();
    let mut keep_following_sigs = true;

    for packet in cert.clone().into_packets() {
        match &packet {
            Packet::PublicKey(_)
            | Packet::SecretKey(_)
            | Packet::PublicSubkey(_)
            | Packet::SecretSubkey(_) => {
                keep_following_sigs = true;
                kept.push(packet);
            }
            Packet::UserID(uid) => {
                keep_following_sigs = keep_userid(uid);
                if keep_following_sigs {
                    kept.push(packet);
                }
            }
            Packet::UserAttribute(_) => {
                keep_following_sigs = keep_user_attribute;
                if keep_following_sigs {
                    kept.push(packet);
                }
            }
            Packet::Signature(_) => {
                if keep_following_sigs {
                    kept.push(packet);
                }
            }
            _ => kept.push(packet),
        }
    }

    kept.try_into()
        .map_err(|e: anyhow::Error| Error::InternalParseError(e.to_string()))
}

/// Retain only user IDs whose normalized email is in `emails`. User
/// attributes are always retained.
pub fn filter_by_user_ids(armored: &str, emails: &HashSet<String>) -> Result<String> {
    let cert = to_cert(armored)?;
    let filtered = retain_components(
        &cert,
        |uid| {
            uid.email()
                .ok()
                .flatten()
                .map(|e| emails.contains(&normalize_email(&e)))
                .unwrap_or(false)
        },
        true,
    )?;
    cert_to_armored(&filtered)
}

/// Drop the user ID matching `email`; everything else is retained.
pub fn remove_user_id(email: &str, armored: &str) -> Result<String> {
    let target = normalize_email(email);
    let cert = to_cert(armored)?;
    let filtered = retain_components(
        &cert,
        |uid| {
            uid.email()
                .ok()
                .flatten()
                .map(|e| normalize_email(&e) != target)
                .unwrap_or(true)
        },
        true,
    )?;
    cert_to_armored(&filtered)
}

fn signature_bytes(sig: &Signature) -> Result<Vec<u8>> {
    Packet::from(sig.clone())
        .to_vec()
        .map_err(|e| Error::InternalParseError(e.to_string()))
}

/// For every user (by userid string) present in both `src` and `cmp`,
/// remove third-party certifications from `src` that are byte-identical to
/// none of `cmp`'s certifications, returning them as a pending-signatures
/// batch instead.
///
/// If `src` and `cmp` do not share a primary key fingerprint, `src` is
/// returned unchanged with an empty batch.
pub fn filter_by_signatures(
    src_armored: &str,
    cmp_armored: &str,
) -> Result<(String, Vec<PendingSig>)> {
    let src = to_cert(src_armored)?;
    let cmp = to_cert(cmp_armored)?;

    if src.fingerprint() != cmp.fingerprint() {
        return Ok((src_armored.to_string(), Vec::new()));
    }

    let now = SystemTime::now();

    let mut cmp_sigs_by_uid: std::collections::HashMap<Vec<u8>, Vec<Vec<u8>>> = Default::default();
    for ua in cmp.userids() {
        let key = ua.userid().value().to_vec();
        let mut sigs = Vec::new();
        for sig in ua.bundle().certifications() {
            sigs.push(signature_bytes(sig)?);
        }
        cmp_sigs_by_uid.insert(key, sigs);
    }

    let mut new_sigs = Vec::new();
    let mut drop: Vec<Vec<u8>> = Vec::new();

    for ua in src.userids() {
        let key = ua.userid().value().to_vec();
        let known = cmp_sigs_by_uid.get(&key);

        for sig in ua.bundle().certifications() {
            if let Some(expiry) = sig.signature_expiration_time() {
                if expiry < now {
                    continue; // expired third-party sigs are not carried forward
                }
            }

            let bytes = signature_bytes(sig)?;
            let already_present = known.map(|k| k.contains(&bytes)).unwrap_or(false);
            if !already_present {
                drop.push(bytes.clone());
                new_sigs.push(PendingSig {
                    user: SignedUser {
                        user_id: Some(ua.userid().to_string()),
                        user_attribute: None,
                    },
                    signature: bytes,
                });
            }
        }
    }

    if new_sigs.is_empty() {
        return Ok((src_armored.to_string(), Vec::new()));
    }

    let mut kept: Vec<Packet> = Vec::new();
    for packet in src.into_packets() {
        if let Packet::Signature(sig) = &packet {
            if sig.typ().is_certification() {
                let bytes = signature_bytes(sig)?;
                if drop.contains(&bytes) {
                    continue;
                }
            }
        }
        kept.push(packet);
    }
    let cleaned: Cert = kept
        .try_into()
        .map_err(|e: anyhow::Error| Error::InternalParseError(e.to_string()))?;

    Ok((cert_to_armored(&cleaned)?, new_sigs))
}

/// Merge two armored representations of the same primary key, adding
/// whatever subkeys/self-signatures either side has that the other lacks.
/// Does not introduce third-party certifications; those must already have
/// been stripped via [`filter_by_signatures`].
pub fn update_key(base_armored: &str, update_armored: &str) -> Result<String> {
    let base = to_cert(base_armored)?;
    let update = to_cert(update_armored)?;

    let merged = base
        .merge_public(update)
        .map_err(|e| Error::InternalParseError(e.to_string()))?;

    cert_to_armored(&merged)
}

/// Re-attach a previously stripped third-party certification.
pub fn add_signature(armored: &str, sig: &PendingSig) -> Result<String> {
    let cert = to_cert(armored)?;
    let packet = Packet::from_bytes(&sig.signature)
        .map_err(|e| Error::InternalParseError(e.to_string()))?;
    let signature = match packet {
        Packet::Signature(s) => s,
        _ => return Err(Error::InternalParseError("not a signature packet".into())),
    };
    let merged = cert
        .insert_packets(vec![Packet::from(signature)])
        .map_err(|e| Error::InternalParseError(e.to_string()))?;
    cert_to_armored(&merged)
}

/// The most-significant user of this key (latest valid self-signature,
/// primary-flag-aware).
pub fn get_primary_user(armored: &str) -> Result<PrimaryUser> {
    let cert = to_cert(armored)?;
    let valid_cert = cert
        .with_policy(&SP, None)
        .map_err(|e| Error::InternalParseError(e.to_string()))?;

    match valid_cert.primary_userid() {
        Ok(primary) => {
            let userid = primary.userid();
            Ok(PrimaryUser {
                name: userid.name().ok().flatten(),
                email: userid.email().ok().flatten().map(|e| normalize_email(&e)),
            })
        }
        Err(_) => Ok(PrimaryUser::default()),
    }
}

fn to_cert(armored: &str) -> Result<Cert> {
    Cert::from_bytes(armored.as_bytes()).map_err(|e| Error::MalformedKey(e.to_string()))
}

/// The armored public-key representation of `cert`.
pub fn cert_to_armored(cert: &Cert) -> Result<String> {
    let bytes = cert
        .armored()
        .to_vec()
        .map_err(|e| Error::InternalParseError(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| Error::InternalParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_armor_rejects_missing_block() {
        assert!(trim_armor("not a key").is_err());
    }

    #[test]
    fn trim_armor_rejects_multiple_blocks() {
        let one = format!("{BEGIN_MARK}\nfoo\n{END_MARK}");
        let two = format!("{one}\n{one}");
        assert!(trim_armor(&two).is_err());
    }

    #[test]
    fn trim_armor_extracts_surrounded_block() {
        let block = format!("{BEGIN_MARK}\nfoo\n{END_MARK}");
        let text = format!("Hi,\n\nhere is my key:\n\n{block}\n\nthanks");
        assert_eq!(trim_armor(&text).unwrap(), block);
    }

    fn make_cert(emails: &[&str]) -> Cert {
        let mut builder = sequoia_openpgp::cert::CertBuilder::new();
        for email in emails {
            builder = builder.add_userid(UserID::from(format!("Test User <{email}>")));
        }
        builder.generate().unwrap().0
    }

    #[test]
    fn parse_key_enumerates_valid_user_ids() {
        let cert = make_cert(&["alice@example.org", "alice@work.example.org"]);
        let armored = cert_to_armored(&cert).unwrap();

        let parsed = parse_key(&armored, |_| true).unwrap();
        assert_eq!(parsed.fingerprint, cert.fingerprint().to_hex().to_lowercase());
        assert_eq!(parsed.key_id.len(), 16);
        assert_eq!(parsed.user_ids.len(), 2);
        assert!(parsed.user_ids.iter().all(|u| u.status == UserIdStatus::Valid));
    }

    #[test]
    fn parse_key_reports_organisation_uid_by_policy() {
        let cert = make_cert(&["alice@example.org"]);
        let armored = cert_to_armored(&cert).unwrap();

        let parsed = parse_key(&armored, |email| email.ends_with("@example.org")).unwrap();
        assert!(parsed.has_organisation_uid);

        let parsed = parse_key(&armored, |email| email.ends_with("@other.org")).unwrap();
        assert!(!parsed.has_organisation_uid);
    }

    #[test]
    fn parse_key_rejects_a_multi_cert_bundle() {
        let cert1 = make_cert(&["alice@example.org"]);
        let cert2 = make_cert(&["bob@example.org"]);
        let bundle = format!("{}\n{}", cert_to_armored(&cert1).unwrap(), cert_to_armored(&cert2).unwrap());

        let err = parse_key(&bundle, |_| true).unwrap_err();
        assert!(matches!(err, Error::MalformedKey(_)));
    }

    #[test]
    fn filter_by_user_ids_keeps_only_the_requested_email() {
        let cert = make_cert(&["alice@example.org", "alice@work.example.org"]);
        let armored = cert_to_armored(&cert).unwrap();

        let only = HashSet::from(["alice@example.org".to_string()]);
        let filtered = filter_by_user_ids(&armored, &only).unwrap();

        let parsed = parse_key(&filtered, |_| true).unwrap();
        assert_eq!(parsed.user_ids.len(), 1);
        assert_eq!(parsed.user_ids[0].email, "alice@example.org");
    }

    #[test]
    fn remove_user_id_drops_only_the_matching_email() {
        let cert = make_cert(&["alice@example.org", "alice@work.example.org"]);
        let armored = cert_to_armored(&cert).unwrap();

        let removed = remove_user_id("alice@example.org", &armored).unwrap();
        let parsed = parse_key(&removed, |_| true).unwrap();
        assert_eq!(parsed.user_ids.len(), 1);
        assert_eq!(parsed.user_ids[0].email, "alice@work.example.org");
    }
}
