// SPDX-FileCopyrightText: 2019-2023 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca

//! Core of an OpenPGP public-key directory service: the key-lifecycle state
//! machine and merge engine, independent of any particular transport,
//! storage backend, or mail transport.
//!
//! A caller assembles a [`directory::KeyDirectory`] from a [`config::Config`],
//! a [`storage::Storage`] implementation and a [`mailer::Mailer`]
//! implementation, then drives every operation through it.

pub mod config;
pub mod directory;
pub mod error;
pub mod mailer;
pub mod model;
pub mod pgp;
pub mod storage;
pub mod validate;

pub use config::{Config, Origin};
pub use directory::{KeyDirectory, Lookup, PendingSignatureInfo, PutOutcome, PutRequest};
pub use error::Error;
