// SPDX-FileCopyrightText: 2019-2023 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca

//! The Key Directory: the state machine and merge engine that owns every
//! invariant in the data model. This is the only module that talks to both
//! the [`crate::storage::Storage`] and [`crate::mailer::Mailer`] ports; the
//! rest of the crate is either pure (PGP Adapter, validation helpers) or a
//! reference implementation of a port.

use std::collections::HashSet;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};

use crate::config::Config;
use crate::error::Error;
use crate::mailer::{MailContext, Mailer, Template};
use crate::model::{KeyRecord, PendingSignatures, PublicKeyRecord, UserIdRecord, UserIdStatus};
use crate::pgp;
use crate::storage::{Selector, Storage};
use crate::validate::{generate_nonce, normalize_email};

/// Input to [`KeyDirectory::put`].
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub public_key_armored: String,
    /// Optional filter restricting which user IDs of the submitted key are
    /// considered in this upload.
    pub emails: Option<Vec<String>>,
}

/// What a successful [`KeyDirectory::put`] reports back to its caller.
#[derive(Debug, Clone)]
pub struct PutOutcome {
    pub key_id: String,
    pub fingerprint: String,
}

/// A predicate set for [`KeyDirectory::get_verified`] / [`KeyDirectory::get`]:
/// any non-empty field matches.
#[derive(Debug, Clone, Default)]
pub struct Lookup {
    pub user_ids: Option<Vec<String>>,
    pub fingerprint: Option<String>,
    pub key_id: Option<String>,
}

impl Lookup {
    pub fn by_key_id(key_id: impl Into<String>) -> Self {
        Self {
            key_id: Some(key_id.into()),
            ..Default::default()
        }
    }

    pub fn by_email(email: impl Into<String>) -> Self {
        Self {
            user_ids: Some(vec![email.into()]),
            ..Default::default()
        }
    }

    pub fn by_fingerprint(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: Some(fingerprint.into()),
            ..Default::default()
        }
    }
}

/// One resolved pending-signature entry, as returned by
/// [`KeyDirectory::get_pending_signatures`].
#[derive(Debug, Clone)]
pub struct PendingSignatureInfo {
    pub issuer_fingerprint: Option<String>,
    pub created: Option<DateTime<Utc>>,
    /// The issuer's primary user, or `"[unknown identity]"` if the issuer's
    /// key is not itself verified in this directory.
    pub user_id: String,
    /// `md5(base64(signature))`, the identifier the confirmation UI lets a
    /// user select by.
    pub hash: String,
}

pub struct KeyDirectory {
    config: Config,
    storage: Arc<dyn Storage>,
    mailer: Arc<dyn Mailer>,
}

impl KeyDirectory {
    pub fn new(config: Config, storage: Arc<dyn Storage>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            config,
            storage,
            mailer,
        }
    }

    /// Remove every stored record with no verified user ID whose `uploaded`
    /// timestamp is older than the configured purge horizon. Opportunistic:
    /// callers are expected to swallow and log failures (see [`Self::put`]).
    pub async fn purge_expired(&self) -> Result<u64, Error> {
        let horizon = Utc::now() - chrono::Duration::days(self.config.purge_time_in_days as i64);
        self.storage
            .remove(&Selector::And(vec![
                Selector::NoVerifiedUserId,
                Selector::UploadedLt(horizon),
            ]))
            .await
    }

    /// §4.5 — the only predicate-based lookup that requires a verified hit.
    pub async fn get_verified(&self, lookup: &Lookup) -> Result<Option<KeyRecord>, Error> {
        let mut predicates = Vec::new();

        if let Some(fp) = &lookup.fingerprint {
            predicates.push(Selector::And(vec![
                Selector::FingerprintEq(fp.to_lowercase()),
                Selector::HasVerifiedUserId,
            ]));
        }
        if let Some(key_id) = &lookup.key_id {
            predicates.push(Selector::And(vec![
                Selector::KeyIdEq(key_id.to_lowercase()),
                Selector::HasVerifiedUserId,
            ]));
        }
        if let Some(emails) = &lookup.user_ids {
            for email in emails {
                predicates.push(Selector::AnyVerifiedUserIdEmailEq(normalize_email(email)));
            }
        }

        if predicates.is_empty() {
            return Err(Error::InvalidRequest(
                "getVerified requires at least one of fingerprint, keyId, userIds".into(),
            ));
        }

        self.storage.get(&Selector::Or(predicates)).await
    }

    /// §4.10 — a verified lookup with internal fields stripped.
    pub async fn get(&self, lookup: &Lookup) -> Result<PublicKeyRecord, Error> {
        let record = self.get_verified(lookup).await?.ok_or(Error::KeyNotFound)?;
        Ok(record.into_public())
    }

    /// §4.2 — upload.
    pub async fn put(&self, req: PutRequest) -> Result<PutOutcome, Error> {
        if let Err(e) = self.purge_expired().await {
            tracing::warn!(error = %e, "lazy purge failed, continuing upload");
        }

        let parsed = pgp::parse_key(&req.public_key_armored, |email| {
            self.config.is_organisation_email(email)
        })?;

        if self.config.restrict_user_origin && !parsed.has_organisation_uid {
            return Err(Error::NoOrganisationUid);
        }

        let mut candidates: Vec<UserIdRecord> = parsed
            .user_ids
            .iter()
            .map(|u| UserIdRecord::new(u.name.clone(), u.email.clone(), u.status))
            .collect();

        if let Some(emails) = &req.emails {
            let wanted: HashSet<String> = emails.iter().map(|e| normalize_email(e)).collect();
            candidates.retain(|u| wanted.contains(&u.email));
            if candidates.len() != emails.len() {
                return Err(Error::UserIdMismatch);
            }
        }

        let existing = self.get_verified(&Lookup::by_key_id(parsed.key_id.clone())).await?;

        match existing {
            None => self.put_fresh(parsed, candidates, &req.public_key_armored).await,
            Some(existing) => {
                self.put_merge(parsed, candidates, existing, &req.public_key_armored).await
            }
        }
    }

    /// §4.2 case A — no existing verified record for this `keyId`.
    async fn put_fresh(
        &self,
        parsed: pgp::ParsedKey,
        candidates: Vec<UserIdRecord>,
        armored: &str,
    ) -> Result<PutOutcome, Error> {
        let mut users: Vec<UserIdRecord> = candidates
            .into_iter()
            .filter(|u| u.status == Some(UserIdStatus::Valid))
            .collect();

        if users.is_empty() {
            return Err(Error::NoValidUserIds);
        }

        for user in &mut users {
            attach_shadow(armored, user)?;
            if !self.config.restrict_user_origin || self.config.is_organisation_email(&user.email) {
                user.notify = true;
            }
        }

        let mut record = KeyRecord {
            key_id: parsed.key_id.clone(),
            fingerprint: parsed.fingerprint.clone(),
            user_ids: users,
            created: parsed.created,
            uploaded: Utc::now(),
            algorithm: parsed.algorithm,
            key_size: parsed.key_size,
            public_key_armored: None,
            pending_signatures: None,
        };

        self.dispatch_challenges(&mut record.user_ids, &record.key_id, "verify")
            .await?;

        let outcome = PutOutcome {
            key_id: record.key_id.clone(),
            fingerprint: record.fingerprint.clone(),
        };

        // An unverified, purge-eligible leftover may share this keyId; a
        // fresh upload always wins over it.
        self.storage
            .remove(&Selector::KeyIdEq(record.key_id.clone()))
            .await?;
        self.storage.create(record).await?;

        Ok(outcome)
    }

    /// §4.2 case B / §4.3 — merge into an existing verified record.
    async fn put_merge(
        &self,
        parsed: pgp::ParsedKey,
        candidates: Vec<UserIdRecord>,
        mut existing: KeyRecord,
        armored: &str,
    ) -> Result<PutOutcome, Error> {
        let verified_emails: HashSet<String> = existing
            .user_ids
            .iter()
            .filter(|u| u.verified)
            .map(|u| u.email.clone())
            .collect();

        let mut valid_users: Vec<UserIdRecord> = candidates
            .into_iter()
            .filter(|u| u.status == Some(UserIdStatus::Valid) && !verified_emails.contains(&u.email))
            .collect();
        for user in &mut valid_users {
            attach_shadow(armored, user)?;
            user.notify = true;
        }

        let valid_emails: HashSet<String> = valid_users.iter().map(|u| u.email.clone()).collect();
        let pending_users: Vec<UserIdRecord> = existing
            .user_ids
            .iter()
            .filter(|u| !u.verified && !valid_emails.contains(&u.email))
            .cloned()
            .collect();
        let verified_users: Vec<UserIdRecord> =
            existing.user_ids.iter().filter(|u| u.verified).cloned().collect();

        let mut merged_users = valid_users;
        merged_users.extend(pending_users);
        merged_users.extend(verified_users);

        let merged_verified_emails: HashSet<String> = merged_users
            .iter()
            .filter(|u| u.verified)
            .map(|u| u.email.clone())
            .collect();
        let new_filtered_armored = pgp::filter_by_user_ids(armored, &merged_verified_emails)?;

        let existing_armored = existing.public_key_armored.clone().ok_or_else(|| {
            Error::InternalParseError("existing verified record has no armored body".into())
        })?;
        let (cleaned_armored, new_sigs) =
            pgp::filter_by_signatures(&new_filtered_armored, &existing_armored)?;
        let merged_armored = pgp::update_key(&existing_armored, &cleaned_armored)?;

        let new_sigs_present = !new_sigs.is_empty();
        let pending_signatures = match (existing.pending_signatures.take(), new_sigs.is_empty()) {
            (batch, true) => batch,
            (None, false) => Some(PendingSignatures {
                nonce: generate_nonce(),
                sigs: new_sigs,
            }),
            (Some(mut batch), false) => {
                let known: HashSet<&[u8]> = batch.sigs.iter().map(|s| s.signature.as_slice()).collect();
                for sig in new_sigs {
                    if !known.contains(sig.signature.as_slice()) {
                        batch.sigs.push(sig);
                    }
                }
                Some(batch)
            }
        };

        self.dispatch_challenges(&mut merged_users, &existing.key_id, "verify")
            .await?;

        if new_sigs_present {
            let primary = pgp::get_primary_user(&merged_armored)?;
            if let Some(email) = primary.email.clone() {
                let ctx = MailContext {
                    user_id: email,
                    key_id: existing.key_id.clone(),
                    verification_link: self.config.origin.verification_link(
                        "checkSignatures",
                        &existing.key_id,
                        pending_signatures.as_ref().map(|p| p.nonce.as_str()).unwrap_or(""),
                    ),
                    public_key_armored: None,
                };
                self.mailer.send(Template::CheckNewSigs, ctx).await?;
            }
        }

        let merged = KeyRecord {
            key_id: existing.key_id.clone(),
            fingerprint: existing.fingerprint.clone(),
            user_ids: merged_users,
            created: existing.created,
            uploaded: Utc::now(),
            algorithm: parsed.algorithm,
            key_size: parsed.key_size,
            public_key_armored: Some(merged_armored),
            pending_signatures,
        };

        let outcome = PutOutcome {
            key_id: merged.key_id.clone(),
            fingerprint: merged.fingerprint.clone(),
        };

        self.storage.remove(&Selector::KeyIdEq(merged.key_id.clone())).await?;
        self.storage.create(merged).await?;

        Ok(outcome)
    }

    /// §4.4 — generate a nonce and send a challenge for every user ID with
    /// `notify = true`, clearing the flag once the mail is away.
    async fn dispatch_challenges(
        &self,
        users: &mut [UserIdRecord],
        key_id: &str,
        op: &str,
    ) -> Result<(), Error> {
        for user in users.iter_mut() {
            if !user.notify {
                continue;
            }
            let nonce = generate_nonce();
            let link = self.config.origin.verification_link(op, key_id, &nonce);
            let ctx = MailContext {
                user_id: user.email.clone(),
                key_id: key_id.to_string(),
                verification_link: link,
                public_key_armored: user.public_key_armored.clone(),
            };
            self.mailer.send(Template::VerifyKey, ctx).await?;
            user.nonce = Some(nonce);
            user.notify = false;
        }
        Ok(())
    }

    /// §4.6 — confirm ownership of one user ID.
    pub async fn verify(&self, key_id: &str, nonce: &str) -> Result<String, Error> {
        let key_id = key_id.to_lowercase();
        let mut record = self
            .storage
            .get(&Selector::And(vec![
                Selector::KeyIdEq(key_id.clone()),
                Selector::AnyUserIdNonceEq(nonce.to_string()),
            ]))
            .await?
            .ok_or(Error::UserIdNotFound)?;

        // Re-dispatch any still-outstanding challenges on this record before
        // acting on the one the caller is confirming (§9 open question:
        // kept as explicit policy, matching the documented source behavior).
        self.dispatch_challenges(&mut record.user_ids, &record.key_id, "verify")
            .await?;

        let idx = record
            .user_ids
            .iter()
            .position(|u| u.nonce.as_deref() == Some(nonce))
            .ok_or(Error::UserIdNotFound)?;

        let email = record.user_ids[idx].email.clone();
        let shadow = record.user_ids[idx]
            .public_key_armored
            .clone()
            .ok_or_else(|| Error::InternalParseError("verified user ID has no shadow body".into()))?;

        let new_armored = match &record.public_key_armored {
            Some(existing) => pgp::update_key(existing, &shadow)?,
            None => shadow,
        };

        self.storage
            .remove(&Selector::And(vec![
                Selector::KeyIdNe(key_id.clone()),
                Selector::AnyUserIdEmailEq(email.clone()),
            ]))
            .await?;

        record.public_key_armored = Some(new_armored);
        record.user_ids[idx].verified = true;
        record.user_ids[idx].nonce = None;
        record.user_ids[idx].public_key_armored = None;

        self.storage.update(&key_id, record).await?;
        Ok(email)
    }

    /// §4.7 — confirm a selection of pending third-party certifications.
    pub async fn verify_signatures(
        &self,
        key_id: &str,
        nonce: &str,
        selected_hashes: &[String],
    ) -> Result<String, Error> {
        let key_id = key_id.to_lowercase();
        let mut record = self
            .storage
            .get(&Selector::And(vec![
                Selector::KeyIdEq(key_id.clone()),
                Selector::PendingSignaturesNonceEq(nonce.to_string()),
            ]))
            .await?
            .ok_or(Error::SignaturesNotFound)?;

        let pending = record
            .pending_signatures
            .take()
            .ok_or(Error::SignaturesNotFound)?;

        let mut armored = record.public_key_armored.clone().ok_or_else(|| {
            Error::InternalParseError("record has pending signatures but no armored body".into())
        })?;

        for sig in &pending.sigs {
            if selected_hashes.contains(&signature_selection_hash(&sig.signature)) {
                let with_sig = pgp::add_signature(&armored, sig)?;
                armored = pgp::update_key(&armored, &with_sig)?;
            }
        }

        record.public_key_armored = Some(armored.clone());
        self.storage.update(&key_id, record).await?;

        let primary = pgp::get_primary_user(&armored)?;
        primary
            .email
            .ok_or_else(|| Error::InternalParseError("key has no primary user after merge".into()))
    }

    /// §4.8 — resolve a pending-signatures batch for display.
    pub async fn get_pending_signatures(
        &self,
        lookup: &Lookup,
        nonce: &str,
    ) -> Result<Vec<PendingSignatureInfo>, Error> {
        let record = self.get_verified(lookup).await?.ok_or(Error::KeyNotFound)?;
        let pending = record
            .pending_signatures
            .as_ref()
            .filter(|p| p.nonce == nonce)
            .ok_or(Error::InvalidNonce)?;

        let mut out = Vec::with_capacity(pending.sigs.len());
        for sig in &pending.sigs {
            let info = pgp::inspect_signature(&sig.signature)?;
            let issuer = match &info.issuer_fingerprint {
                Some(fp) => {
                    let issuer_record = self
                        .get_verified(&Lookup::by_fingerprint(fp.clone()))
                        .await?;
                    match issuer_record.and_then(|r| r.public_key_armored) {
                        Some(armored) => pgp::get_primary_user(&armored)
                            .ok()
                            .and_then(|u| u.email)
                            .unwrap_or_else(|| "[unknown identity]".to_string()),
                        None => "[unknown identity]".to_string(),
                    }
                }
                None => "[unknown identity]".to_string(),
            };

            out.push(PendingSignatureInfo {
                issuer_fingerprint: info.issuer_fingerprint,
                created: info.created,
                user_id: issuer,
                hash: signature_selection_hash(&sig.signature),
            });
        }
        Ok(out)
    }

    /// §4.9 — flag one or all user IDs of a record for removal confirmation.
    pub async fn request_remove(&self, key_id: Option<&str>, email: Option<&str>) -> Result<(), Error> {
        let lookup = match (key_id, email) {
            (Some(k), _) => Lookup::by_key_id(k),
            (None, Some(e)) => Lookup::by_email(e),
            (None, None) => {
                return Err(Error::InvalidRequest(
                    "requestRemove requires keyId or email".into(),
                ))
            }
        };
        let mut record = self.get_verified(&lookup).await?.ok_or(Error::KeyNotFound)?;

        let target_email = email.map(normalize_email);
        let mut matched = false;
        for user in &mut record.user_ids {
            if let Some(target) = &target_email {
                if &user.email != target {
                    continue;
                }
            }
            matched = true;
            let nonce = generate_nonce();
            let link = self
                .config
                .origin
                .verification_link("verifyRemove", &record.key_id, &nonce);
            self.mailer
                .send(
                    Template::VerifyRemove,
                    MailContext {
                        user_id: user.email.clone(),
                        key_id: record.key_id.clone(),
                        verification_link: link,
                        public_key_armored: None,
                    },
                )
                .await?;
            user.nonce = Some(nonce);
        }

        if !matched {
            return Err(Error::KeyNotFound);
        }

        self.storage.update(&record.key_id.clone(), record).await
    }

    /// §4.9 — complete a removal challenge.
    pub async fn verify_remove(&self, key_id: &str, nonce: &str) -> Result<String, Error> {
        let key_id = key_id.to_lowercase();
        let mut record = self
            .storage
            .get(&Selector::And(vec![
                Selector::KeyIdEq(key_id.clone()),
                Selector::AnyUserIdNonceEq(nonce.to_string()),
            ]))
            .await?
            .ok_or(Error::UserIdNotFound)?;

        if record.user_ids.len() == 1 {
            let email = record.user_ids[0].email.clone();
            self.storage.remove(&Selector::KeyIdEq(key_id)).await?;
            return Ok(email);
        }

        let idx = record
            .user_ids
            .iter()
            .position(|u| u.nonce.as_deref() == Some(nonce))
            .ok_or(Error::UserIdNotFound)?;
        let email = record.user_ids[idx].email.clone();

        if record.user_ids[idx].verified {
            let verified_count = record.user_ids.iter().filter(|u| u.verified).count();
            if verified_count >= 2 {
                let armored = record.public_key_armored.as_ref().ok_or_else(|| {
                    Error::InternalParseError("verified user ID without an armored body".into())
                })?;
                record.public_key_armored = Some(pgp::remove_user_id(&email, armored)?);
            } else {
                record.public_key_armored = None;
            }
        }

        record.user_ids.remove(idx);
        self.storage.update(&key_id, record).await?;
        Ok(email)
    }
}

/// Attach a shadow armored body (containing only `user.email`) to `user`,
/// per §4.1 `FilterByUserIds` applied to a single-element set.
fn attach_shadow(armored: &str, user: &mut UserIdRecord) -> Result<(), Error> {
    let only = HashSet::from([user.email.clone()]);
    user.public_key_armored = Some(pgp::filter_by_user_ids(armored, &only)?);
    Ok(())
}

/// `md5(base64(signature))`, the identifier the confirmation UI and
/// `verifySignatures` select pending certifications by.
fn signature_selection_hash(signature: &[u8]) -> String {
    let encoded = BASE64.encode(signature);
    let mut hasher = Md5::new();
    hasher.update(encoded.as_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Origin;
    use crate::mailer::LoggingMailer;
    use crate::storage::memory::MemoryStorage;

    fn test_directory() -> KeyDirectory {
        let config = Config::new(Origin::new("https", "keys.example.org"));
        KeyDirectory::new(config, Arc::new(MemoryStorage::new()), Arc::new(LoggingMailer))
    }

    #[tokio::test]
    async fn get_verified_requires_a_predicate() {
        let dir = test_directory();
        let err = dir.get_verified(&Lookup::default()).await.unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[tokio::test]
    async fn get_fails_not_found_when_nothing_verified() {
        let dir = test_directory();
        let err = dir.get(&Lookup::by_email("nobody@example.org")).await.unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn purge_expired_is_a_no_op_on_an_empty_store() {
        let dir = test_directory();
        assert_eq!(dir.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn put_rejects_malformed_armor() {
        let dir = test_directory();
        let result = dir
            .put(PutRequest {
                public_key_armored: "not a key".into(),
                emails: None,
            })
            .await;
        assert!(matches!(result, Err(Error::MalformedKey(_))));
    }
}
