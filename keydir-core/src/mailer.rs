// SPDX-FileCopyrightText: 2019-2023 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca

//! The Mailer Port: dispatches challenge-response and notification emails.
//! The Key Directory never formats or sends mail itself, it only ever
//! builds a [`MailContext`] and hands it to this trait.

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Error;

/// Which of the three fixed templates a mail belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    /// Confirm ownership of a freshly uploaded or newly added user ID.
    VerifyKey,
    /// Confirm a requested user-ID removal.
    VerifyRemove,
    /// Notify of new third-party certifications awaiting confirmation.
    CheckNewSigs,
}

impl Template {
    pub fn as_str(&self) -> &'static str {
        match self {
            Template::VerifyKey => "verifyKey",
            Template::VerifyRemove => "verifyRemove",
            Template::CheckNewSigs => "checkNewSigs",
        }
    }
}

/// Everything a template needs to render one outbound mail.
#[derive(Debug, Clone, Serialize)]
pub struct MailContext {
    pub user_id: String,
    pub key_id: String,
    /// The `{protocol}://{host}/api/v1/key?op=...&keyId=...&nonce=...` link
    /// the recipient must visit to complete the challenge.
    pub verification_link: String,
    /// Included only for `verifyKey`, so a client can render the key being
    /// confirmed without a second round trip.
    pub public_key_armored: Option<String>,
}

/// Outbound-mail contract implemented by a transport (SMTP, a queue, a test
/// double, ...).
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, template: Template, ctx: MailContext) -> Result<(), Error>;
}

/// A [`Mailer`] that logs the mail it would have sent instead of sending it.
///
/// Suitable for local development and for deployments where challenge links
/// are surfaced through another channel (a log shipper, a support queue).
#[derive(Debug, Default)]
pub struct LoggingMailer;

#[async_trait]
impl Mailer for LoggingMailer {
    async fn send(&self, template: Template, ctx: MailContext) -> Result<(), Error> {
        tracing::info!(
            template = template.as_str(),
            user_id = %ctx.user_id,
            key_id = %ctx.key_id,
            link = %ctx.verification_link,
            "dispatching directory mail"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_mailer_never_fails() {
        let mailer = LoggingMailer;
        let ctx = MailContext {
            user_id: "alice@example.org".into(),
            key_id: "aaaabbbbccccdddd".into(),
            verification_link: "https://directory.example.org/api/v1/key?op=verify&keyId=aaaabbbbccccdddd&nonce=deadbeef".into(),
            public_key_armored: None,
        };
        mailer.send(Template::VerifyKey, ctx).await.unwrap();
    }
}
