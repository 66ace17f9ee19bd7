// Copyright 2019-2024 Heiko Schaefer <heiko@schaefer.name>
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca
//
// SPDX-FileCopyrightText: 2019-2020 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP surface for the OpenPGP public-key directory core, split out as a
//! library so integration tests can drive a Rocket instance directly
//! instead of spawning the compiled binary.

#[macro_use]
extern crate rocket;

pub mod cli;
pub mod config;
pub mod routes;
pub mod state;
