// SPDX-FileCopyrightText: 2019-2023 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca

//! Integration tests for the scenarios in the key directory's contract:
//! fresh upload, verification, email-collision handling, third-party
//! certification merge/confirmation, lazy purge and partial removal.

use std::sync::Arc;

use chrono::Utc;

use keydir_core::config::Origin;
use keydir_core::directory::{Lookup, PutRequest};
use keydir_core::storage::memory::MemoryStorage;
use keydir_core::storage::Selector;
use keydir_core::{Config, Error, KeyDirectory};

mod support;
use support::{armor, certify, make_cert, nonce_from_link, CapturingMailer};

fn new_directory() -> (KeyDirectory, Arc<CapturingMailer>) {
    let config = Config::new(Origin::new("https", "keys.example.org"));
    let mailer = Arc::new(CapturingMailer::new());
    let directory = KeyDirectory::new(config, Arc::new(MemoryStorage::new()), mailer.clone());
    (directory, mailer)
}

/// Scenario 1 — fresh upload, single user ID.
#[tokio::test]
async fn fresh_upload_stores_unverified_record_and_sends_one_challenge() {
    let (dir, mailer) = new_directory();
    let cert = make_cert(&["alice@x.org"]);

    let outcome = dir
        .put(PutRequest {
            public_key_armored: armor(&cert),
            emails: None,
        })
        .await
        .expect("upload succeeds");

    assert_eq!(outcome.fingerprint, cert.fingerprint().to_hex().to_lowercase());
    assert_eq!(mailer.count(), 1);

    let err = dir
        .get(&Lookup::by_email("alice@x.org"))
        .await
        .expect_err("nothing is verified yet");
    assert_eq!(err.http_status(), 404);
}

/// Scenario 2 — verify.
#[tokio::test]
async fn verify_marks_user_id_verified_and_clears_its_nonce() {
    let (dir, mailer) = new_directory();
    let cert = make_cert(&["alice@x.org"]);
    let outcome = dir
        .put(PutRequest {
            public_key_armored: armor(&cert),
            emails: None,
        })
        .await
        .unwrap();

    let nonce = mailer.last_nonce_for("alice@x.org").unwrap();
    let email = dir.verify(&outcome.key_id, &nonce).await.unwrap();
    assert_eq!(email, "alice@x.org");

    let record = dir.get(&Lookup::by_email("alice@x.org")).await.unwrap();
    assert!(record.user_ids[0].verified);
    assert!(record.user_ids[0].nonce.is_none());
    assert!(record.public_key_armored.is_some());
}

/// Scenario 3 — email collision: a newly verified key for the same email
/// displaces a previously verified one.
#[tokio::test]
async fn last_verified_key_wins_per_email() {
    let (dir, mailer) = new_directory();

    let cert1 = make_cert(&["alice@x.org"]);
    let out1 = dir
        .put(PutRequest {
            public_key_armored: armor(&cert1),
            emails: None,
        })
        .await
        .unwrap();
    let nonce1 = mailer.last_nonce_for("alice@x.org").unwrap();
    dir.verify(&out1.key_id, &nonce1).await.unwrap();

    let cert2 = make_cert(&["alice@x.org"]);
    assert_ne!(cert1.fingerprint(), cert2.fingerprint());
    let out2 = dir
        .put(PutRequest {
            public_key_armored: armor(&cert2),
            emails: None,
        })
        .await
        .unwrap();
    let nonce2 = mailer.last_nonce_for("alice@x.org").unwrap();
    dir.verify(&out2.key_id, &nonce2).await.unwrap();

    let record = dir.get(&Lookup::by_email("alice@x.org")).await.unwrap();
    assert_eq!(record.fingerprint, cert2.fingerprint().to_hex().to_lowercase());

    let err = dir
        .get(&Lookup::by_fingerprint(cert1.fingerprint().to_hex().to_lowercase()))
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 404);
}

/// Scenario 4 — merging in a new third-party certification creates a
/// pending-signatures batch, and confirming it re-materializes the sig.
#[tokio::test]
async fn new_certification_is_pending_until_confirmed() {
    let (dir, mailer) = new_directory();

    let user_cert = make_cert(&["alice@x.org"]);
    let out = dir
        .put(PutRequest {
            public_key_armored: armor(&user_cert),
            emails: None,
        })
        .await
        .unwrap();
    let nonce = mailer.last_nonce_for("alice@x.org").unwrap();
    dir.verify(&out.key_id, &nonce).await.unwrap();

    let issuer_cert = make_cert(&["bob@y.org"]);
    let certified = certify(&user_cert, &issuer_cert);

    dir.put(PutRequest {
        public_key_armored: armor(&certified),
        emails: None,
    })
    .await
    .unwrap();

    // re-upload introduced no new user IDs, so no fresh `verifyKey` mail,
    // but exactly one `checkNewSigs` notification.
    let sent = mailer.sent();
    let check_sigs = sent
        .iter()
        .filter(|(t, _)| matches!(t, keydir_core::mailer::Template::CheckNewSigs))
        .count();
    assert_eq!(check_sigs, 1);

    let (_, ctx) = sent
        .iter()
        .rev()
        .find(|(t, _)| matches!(t, keydir_core::mailer::Template::CheckNewSigs))
        .unwrap();
    let sig_nonce = nonce_from_link(&ctx.verification_link);

    let pending = dir
        .get_pending_signatures(&Lookup::by_key_id(out.key_id.clone()), &sig_nonce)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);

    let email = dir
        .verify_signatures(&out.key_id, &sig_nonce, &[pending[0].hash.clone()])
        .await
        .unwrap();
    assert_eq!(email, "alice@x.org");

    // the nonce is single-use: a second confirmation attempt fails.
    let err = dir
        .verify_signatures(&out.key_id, &sig_nonce, &[pending[0].hash.clone()])
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), 404);
}

/// Scenario 5 — purge: an unverified record older than the horizon is
/// removed by the next upload from any client.
#[tokio::test]
async fn lazy_purge_removes_aged_unverified_records() {
    let config = Config::new(Origin::new("https", "keys.example.org"));
    let storage = Arc::new(MemoryStorage::new());
    let mailer = Arc::new(CapturingMailer::new());
    let dir = KeyDirectory::new(config, storage.clone(), mailer);

    let cert = make_cert(&["old@x.org"]);
    dir.put(PutRequest {
        public_key_armored: armor(&cert),
        emails: None,
    })
    .await
    .unwrap();

    // backdate the record past the purge horizon, bypassing the directory
    // (the core never exposes an operation to rewrite `uploaded`).
    let mut record = storage
        .find(&Selector::NoVerifiedUserId)
        .await
        .unwrap()
        .into_iter()
        .next()
        .expect("the upload above was persisted, unverified");
    record.uploaded = Utc::now() - chrono::Duration::days(31);
    let key_id = record.key_id.clone();
    storage.update(&key_id, record).await.unwrap();

    let removed = dir.purge_expired().await.unwrap();
    assert_eq!(removed, 1);
}

/// Scenario 6 — removing one of two verified user IDs leaves the other
/// intact and the record alive.
#[tokio::test]
async fn removing_one_of_two_verified_user_ids_keeps_the_record() {
    let (dir, mailer) = new_directory();
    let cert = make_cert(&["a@x.org", "b@x.org"]);

    let out = dir
        .put(PutRequest {
            public_key_armored: armor(&cert),
            emails: None,
        })
        .await
        .unwrap();

    let nonce_a = mailer.last_nonce_for("a@x.org").unwrap();
    let nonce_b = mailer.last_nonce_for("b@x.org").unwrap();
    dir.verify(&out.key_id, &nonce_a).await.unwrap();
    dir.verify(&out.key_id, &nonce_b).await.unwrap();

    dir.request_remove(None, Some("a@x.org")).await.unwrap();
    let remove_nonce = mailer.last_nonce_for("a@x.org").unwrap();

    let removed_email = dir.verify_remove(&out.key_id, &remove_nonce).await.unwrap();
    assert_eq!(removed_email, "a@x.org");

    let err = dir.get(&Lookup::by_email("a@x.org")).await.unwrap_err();
    assert_eq!(err.http_status(), 404);

    let record = dir.get(&Lookup::by_email("b@x.org")).await.unwrap();
    assert_eq!(record.user_ids.len(), 1);
    assert_eq!(record.user_ids[0].email, "b@x.org");
}

/// `put` rejects a key with no valid user IDs outright.
#[tokio::test]
async fn upload_with_only_filtered_out_emails_is_a_mismatch() {
    let (dir, _mailer) = new_directory();
    let cert = make_cert(&["alice@x.org"]);

    let err = dir
        .put(PutRequest {
            public_key_armored: armor(&cert),
            emails: Some(vec!["someone-else@x.org".to_string()]),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UserIdMismatch));
}
