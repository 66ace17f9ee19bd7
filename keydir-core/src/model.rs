// SPDX-FileCopyrightText: 2019-2023 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca

//! The persisted data model: one [`KeyRecord`] per primary key fingerprint,
//! holding an ordered list of [`UserIdRecord`]s and an optional pending
//! third-party-certification batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parse-time-only status of a user ID, derived fresh on every `ParseKey`
/// call. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserIdStatus {
    Valid,
    Revoked,
    Expired,
    Invalid,
}

/// One User ID bound to a key, and the directory's verification state for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdRecord {
    pub name: Option<String>,
    pub email: String,

    pub verified: bool,

    /// Present while an outstanding challenge exists for this user ID.
    pub nonce: Option<String>,

    /// Shadow armored body containing only this user ID; held while the
    /// user ID is unverified, cleared on verification.
    pub public_key_armored: Option<String>,

    /// Parse-time status; never serialized into storage.
    #[serde(skip)]
    pub status: Option<UserIdStatus>,

    /// Set when this record was newly introduced by the current operation
    /// and therefore requires a challenge email.
    #[serde(skip)]
    pub notify: bool,
}

impl UserIdRecord {
    pub fn new(name: Option<String>, email: String, status: UserIdStatus) -> Self {
        Self {
            name,
            email,
            verified: false,
            nonce: None,
            public_key_armored: None,
            status: Some(status),
            notify: false,
        }
    }
}

/// Identifies which component of a key a third-party certification applies to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedUser {
    pub user_id: Option<String>,
    pub user_attribute: Option<Vec<u8>>,
}

/// One certification awaiting the certified user's confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSig {
    pub user: SignedUser,
    /// Raw signature packet bytes.
    pub signature: Vec<u8>,
}

/// A batch of third-party certifications pending confirmation, all sharing
/// one nonce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSignatures {
    pub nonce: String,
    pub sigs: Vec<PendingSig>,
}

/// A directory record for one primary key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub key_id: String,
    pub fingerprint: String,

    pub user_ids: Vec<UserIdRecord>,

    pub created: DateTime<Utc>,
    pub uploaded: DateTime<Utc>,

    pub algorithm: String,
    pub key_size: Option<u32>,

    /// The canonical armored public key containing only verified user IDs.
    /// `None` while no user ID is yet verified.
    pub public_key_armored: Option<String>,

    pub pending_signatures: Option<PendingSignatures>,
}

impl KeyRecord {
    /// Does any user ID in this record have `verified = true`?
    pub fn has_verified_user_id(&self) -> bool {
        self.user_ids.iter().any(|u| u.verified)
    }

    /// Strip internal/transient fields before handing a record to a caller,
    /// per the `get` operation's contract.
    pub fn into_public(mut self) -> PublicKeyRecord {
        for u in &mut self.user_ids {
            u.nonce = None;
            u.public_key_armored = None;
        }
        let pending_signatures = self.pending_signatures.map(|p| PublicPendingSignatures {
            sigs: p.sigs,
        });

        PublicKeyRecord {
            key_id: self.key_id,
            fingerprint: self.fingerprint,
            user_ids: self.user_ids,
            created: self.created,
            uploaded: self.uploaded,
            algorithm: self.algorithm,
            key_size: self.key_size,
            public_key_armored: self.public_key_armored,
            pending_signatures,
        }
    }
}

/// A [`KeyRecord`] with internal-only fields (per-user-ID nonce and shadow
/// armored body, pending-signature nonce) stripped, as returned by `get`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyRecord {
    pub key_id: String,
    pub fingerprint: String,
    pub user_ids: Vec<UserIdRecord>,
    pub created: DateTime<Utc>,
    pub uploaded: DateTime<Utc>,
    pub algorithm: String,
    pub key_size: Option<u32>,
    pub public_key_armored: Option<String>,
    pub pending_signatures: Option<PublicPendingSignatures>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicPendingSignatures {
    pub sigs: Vec<PendingSig>,
}
