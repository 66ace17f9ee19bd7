// SPDX-FileCopyrightText: 2019-2023 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca

//! Test-only helpers: generate throwaway `Cert`s and a `Mailer` double that
//! captures dispatched mail so a test can pull the nonce back out of the
//! verification link it contains.

use std::sync::Mutex;

use async_trait::async_trait;
use sequoia_openpgp::cert::CertBuilder;
use sequoia_openpgp::packet::signature::SignatureBuilder;
use sequoia_openpgp::packet::UserID;
use sequoia_openpgp::types::SignatureType;
use sequoia_openpgp::Cert;

use keydir_core::error::Error;
use keydir_core::mailer::{MailContext, Mailer, Template};
use keydir_core::pgp::cert_to_armored;

/// Generate a throwaway cert with one User ID per email in `emails`.
pub fn make_cert(emails: &[&str]) -> Cert {
    let mut builder = CertBuilder::new();
    for email in emails {
        builder = builder.add_userid(UserID::from(format!("Test User <{email}>")));
    }
    let (cert, _revocation) = builder.generate().expect("cert generation");
    cert
}

pub fn armor(cert: &Cert) -> String {
    cert_to_armored(cert).expect("cert serializes")
}

/// Have `signer` certify every User ID of `signee`, returning the signee
/// cert with the added third-party certifications.
pub fn certify(signee: &Cert, signer: &Cert) -> Cert {
    let mut keypair = signer
        .primary_key()
        .key()
        .clone()
        .parts_into_secret()
        .expect("signer has no secret material")
        .into_keypair()
        .expect("signer key is usable");

    let mut packets = Vec::new();
    for ua in signee.userids() {
        let builder = SignatureBuilder::new(SignatureType::GenericCertification);
        let tsig = ua
            .userid()
            .bind(&mut keypair, signee, builder)
            .expect("third-party certification");
        packets.push(tsig.into());
    }

    signee.clone().insert_packets(packets).expect("insert certification packets")
}

/// A [`Mailer`] double that records every dispatched mail so a test can
/// recover the nonce embedded in its verification link.
#[derive(Default)]
pub struct CapturingMailer {
    sent: Mutex<Vec<(Template, MailContext)>>,
}

impl CapturingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Template, MailContext)> {
        self.sent.lock().unwrap().clone()
    }

    /// The nonce from the last mail sent to `user_id`, if any.
    pub fn last_nonce_for(&self, user_id: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, ctx)| ctx.user_id == user_id)
            .map(|(_, ctx)| nonce_from_link(&ctx.verification_link))
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

/// Pull the `nonce=...` query parameter out of a verification link built by
/// `Origin::verification_link`.
pub fn nonce_from_link(link: &str) -> String {
    link.split("nonce=")
        .nth(1)
        .expect("link carries a nonce")
        .split('&')
        .next()
        .unwrap()
        .to_string()
}

#[async_trait]
impl Mailer for CapturingMailer {
    async fn send(&self, template: Template, ctx: MailContext) -> Result<(), Error> {
        self.sent.lock().unwrap().push((template, ctx));
        Ok(())
    }
}
