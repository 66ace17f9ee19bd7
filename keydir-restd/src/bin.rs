// Copyright 2019-2024 Heiko Schaefer <heiko@schaefer.name>
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca
//
// SPDX-FileCopyrightText: 2019-2020 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! HTTP surface for the OpenPGP public-key directory core.

use clap::Parser;
use keydir_restd::cli::{Command, RestdCli};
use keydir_restd::routes;

#[rocket::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = RestdCli::parse();

    let rocket = match cli.cmd {
        Command::Run => routes::build(cli.config).unwrap_or_else(|e| {
            panic!("failed to start keydir-restd: {e}");
        }),
    };

    if let Err(e) = rocket.launch().await {
        tracing::error!(error = %e, "keydir-restd exited with an error");
    }
}
