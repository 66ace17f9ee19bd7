// SPDX-FileCopyrightText: 2019-2023 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca

//! Error kinds for the key directory core, and their HTTP mapping.

use thiserror::Error;

/// All error kinds the core can surface to a caller.
///
/// Each variant corresponds to one of the error kinds in the directory
/// contract, and knows the HTTP status a transport layer should map it to.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("the request was malformed: {0}")]
    InvalidRequest(String),

    #[error("the submitted key could not be parsed: {0}")]
    MalformedKey(String),

    #[error("the submitted key has no valid user IDs")]
    NoValidUserIds,

    #[error("the requested emails do not match the key's user IDs")]
    UserIdMismatch,

    #[error("the submitted key has no user ID in the required organisation domain")]
    NoOrganisationUid,

    #[error("no user ID matches the given nonce")]
    UserIdNotFound,

    #[error("no key record matches the given selector")]
    KeyNotFound,

    #[error("no pending signature batch matches the given nonce")]
    SignaturesNotFound,

    #[error("the nonce is invalid or has expired")]
    InvalidNonce,

    #[error("failed to persist the key record: {0}")]
    PersistFailed(String),

    #[error("an internal parsing error occurred: {0}")]
    InternalParseError(String),
}

impl Error {
    /// The HTTP status a transport layer should render this error as.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::InvalidRequest(_)
            | Error::MalformedKey(_)
            | Error::NoValidUserIds
            | Error::UserIdMismatch
            | Error::NoOrganisationUid => 400,
            Error::UserIdNotFound | Error::KeyNotFound | Error::SignaturesNotFound => 404,
            Error::InvalidNonce => 403,
            Error::PersistFailed(_) | Error::InternalParseError(_) => 500,
        }
    }

    /// Whether this error's message is safe to echo back to the caller.
    ///
    /// Parse and validation failures are produced from the request itself
    /// and carry no sensitive internal detail; storage and parser-internal
    /// failures are logged and rendered generically instead.
    pub fn expose(&self) -> bool {
        !matches!(self, Error::PersistFailed(_) | Error::InternalParseError(_))
    }
}
