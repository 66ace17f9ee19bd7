// SPDX-FileCopyrightText: 2019-2023 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca

//! Directory-wide configuration, threaded through [`crate::directory::KeyDirectory`].

use regex::Regex;

/// The origin (scheme + host) a directory instance is reachable at.
///
/// Verification links handed to the mailer are built from this value, so
/// that the directory core never needs to guess its own public address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub protocol: String,
    pub host: String,
}

impl Origin {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
        }
    }

    /// Build a verification link of the form expected by the mailer
    /// templates: `{protocol}://{host}/api/v1/key?op={op}&keyId={key_id}&nonce={nonce}`.
    pub fn verification_link(&self, op: &str, key_id: &str, nonce: &str) -> String {
        format!(
            "{}://{}/api/v1/key?op={op}&keyId={key_id}&nonce={nonce}",
            self.protocol, self.host
        )
    }
}

/// Recognized configuration options (`publicKey.*` in the original surface).
#[derive(Debug, Clone)]
pub struct Config {
    /// Age (in days) after which an unverified key record becomes eligible
    /// for the lazy purge.
    pub purge_time_in_days: u32,

    /// Require at least one organisation-domain user ID per uploaded key;
    /// restrict challenge dispatch and "activation" to those user IDs.
    pub restrict_user_origin: bool,

    /// Regex user IDs are matched against to decide organisation membership.
    /// Required when `restrict_user_origin` is set.
    pub restriction_regex: Option<Regex>,

    /// This directory instance's externally reachable origin, used to build
    /// verification links.
    pub origin: Origin,
}

impl Config {
    pub fn new(origin: Origin) -> Self {
        Self {
            purge_time_in_days: 30,
            restrict_user_origin: false,
            restriction_regex: None,
            origin,
        }
    }

    /// Does `email` match the configured organisation domain policy?
    ///
    /// Returns `true` unconditionally when no restriction is configured.
    pub fn is_organisation_email(&self, email: &str) -> bool {
        match &self.restriction_regex {
            Some(re) => re.is_match(email),
            None => true,
        }
    }
}
