// Copyright 2019-2024 Heiko Schaefer <heiko@schaefer.name>
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca
//
// SPDX-FileCopyrightText: 2019-2020 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(
    name = "keydir-restd",
    author = "Heiko Schäfer <heiko@schaefer.name>",
    version,
    about = "OpenPGP public-key directory REST daemon."
)]
pub struct RestdCli {
    /// Path to a TOML config file (see `publicKey.*` options). Falls back to
    /// built-in defaults, overridable via `KEYDIR_*` environment variables.
    #[clap(name = "filename", short = 'c', long = "config")]
    pub config: Option<String>,

    #[clap(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run restd
    Run,
}
