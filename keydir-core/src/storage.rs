// SPDX-FileCopyrightText: 2019-2023 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca

//! The Storage Port: a document-oriented persistence contract for
//! [`KeyRecord`]s. The Key Directory never touches a database directly, it
//! only ever goes through this trait, so the merge engine in `directory.rs`
//! can be exercised against an in-memory double in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::model::KeyRecord;

/// A predicate over stored [`KeyRecord`]s, mirroring the selector algebra
/// (field equality, `$ne`, `$lt`, `$or`, `$elemMatch`) of a document store.
#[derive(Debug, Clone)]
pub enum Selector {
    FingerprintEq(String),
    KeyIdEq(String),
    KeyIdNe(String),
    /// Matches if any `userIds[i].email` equals the given (normalized) email.
    AnyUserIdEmailEq(String),
    /// Matches if any verified `userIds[i].email` equals the given email.
    AnyVerifiedUserIdEmailEq(String),
    /// Matches if any `userIds[i].nonce` equals the given nonce.
    AnyUserIdNonceEq(String),
    /// Matches if `pendingSignatures.nonce` equals the given nonce.
    PendingSignaturesNonceEq(String),
    UploadedLt(DateTime<Utc>),
    HasVerifiedUserId,
    NoVerifiedUserId,
    And(Vec<Selector>),
    Or(Vec<Selector>),
}

impl Selector {
    pub fn matches(&self, key: &KeyRecord) -> bool {
        match self {
            Selector::FingerprintEq(fp) => &key.fingerprint == fp,
            Selector::KeyIdEq(id) => &key.key_id == id,
            Selector::KeyIdNe(id) => &key.key_id != id,
            Selector::AnyUserIdEmailEq(email) => key.user_ids.iter().any(|u| &u.email == email),
            Selector::AnyVerifiedUserIdEmailEq(email) => {
                key.user_ids.iter().any(|u| u.verified && &u.email == email)
            }
            Selector::AnyUserIdNonceEq(nonce) => {
                key.user_ids.iter().any(|u| u.nonce.as_deref() == Some(nonce.as_str()))
            }
            Selector::PendingSignaturesNonceEq(nonce) => key
                .pending_signatures
                .as_ref()
                .map(|p| &p.nonce == nonce)
                .unwrap_or(false),
            Selector::UploadedLt(t) => &key.uploaded < t,
            Selector::HasVerifiedUserId => key.has_verified_user_id(),
            Selector::NoVerifiedUserId => !key.has_verified_user_id(),
            Selector::And(subs) => subs.iter().all(|s| s.matches(key)),
            Selector::Or(subs) => subs.iter().any(|s| s.matches(key)),
        }
    }
}

/// Document-oriented persistence contract for key records.
///
/// Scoped to a single document type (the original collaborator contract's
/// `DB_TYPE = "publickey"`).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new record. Fails with [`Error::PersistFailed`] if a record
    /// with the same `key_id` already exists.
    async fn create(&self, record: KeyRecord) -> Result<(), Error>;

    /// Return at most one record matching `selector`.
    async fn get(&self, selector: &Selector) -> Result<Option<KeyRecord>, Error>;

    /// Return every record matching `selector`.
    async fn find(&self, selector: &Selector) -> Result<Vec<KeyRecord>, Error>;

    /// Replace the record with the given `key_id` in full.
    async fn update(&self, key_id: &str, record: KeyRecord) -> Result<(), Error>;

    /// Remove every record matching `selector`, returning the count removed.
    async fn remove(&self, selector: &Selector) -> Result<u64, Error>;
}

pub mod memory {
    //! An in-memory [`Storage`] implementation, suitable for tests and for
    //! small single-process deployments.

    use std::collections::HashMap;

    use tokio::sync::RwLock;

    use super::*;

    #[derive(Default)]
    pub struct MemoryStorage {
        by_key_id: RwLock<HashMap<String, KeyRecord>>,
    }

    impl MemoryStorage {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Storage for MemoryStorage {
        async fn create(&self, record: KeyRecord) -> Result<(), Error> {
            let mut map = self.by_key_id.write().await;
            if map.contains_key(&record.key_id) {
                return Err(Error::PersistFailed(format!(
                    "key record for key_id {} already exists",
                    record.key_id
                )));
            }
            map.insert(record.key_id.clone(), record);
            Ok(())
        }

        async fn get(&self, selector: &Selector) -> Result<Option<KeyRecord>, Error> {
            let map = self.by_key_id.read().await;
            Ok(map.values().find(|k| selector.matches(k)).cloned())
        }

        async fn find(&self, selector: &Selector) -> Result<Vec<KeyRecord>, Error> {
            let map = self.by_key_id.read().await;
            Ok(map.values().filter(|k| selector.matches(k)).cloned().collect())
        }

        async fn update(&self, key_id: &str, record: KeyRecord) -> Result<(), Error> {
            let mut map = self.by_key_id.write().await;
            map.insert(key_id.to_string(), record);
            Ok(())
        }

        async fn remove(&self, selector: &Selector) -> Result<u64, Error> {
            let mut map = self.by_key_id.write().await;
            let before = map.len();
            map.retain(|_, k| !selector.matches(k));
            Ok((before - map.len()) as u64)
        }
    }

}
