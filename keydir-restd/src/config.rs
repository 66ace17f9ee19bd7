// Copyright 2019-2024 Heiko Schaefer <heiko@schaefer.name>
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca
//
// SPDX-FileCopyrightText: 2019-2020 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Loads the `publicKey.*` options (§6 config surface) via `figment`, the
//! way Rocket itself resolves its own `Rocket.toml` + environment config.

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use keydir_core::{Config as CoreConfig, Origin};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestdConfig {
    pub origin_protocol: String,
    pub origin_host: String,
    pub purge_time_in_days: u32,
    pub restrict_user_origin: bool,
    pub restriction_reg_ex: Option<String>,
}

impl Default for RestdConfig {
    fn default() -> Self {
        Self {
            origin_protocol: "https".into(),
            origin_host: "localhost:8000".into(),
            purge_time_in_days: 30,
            restrict_user_origin: false,
            restriction_reg_ex: None,
        }
    }
}

impl RestdConfig {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(RestdConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("KEYDIR_"));
        Ok(figment.extract()?)
    }

    pub fn into_core_config(self) -> anyhow::Result<CoreConfig> {
        let origin = Origin::new(self.origin_protocol, self.origin_host);
        let mut config = CoreConfig::new(origin);
        config.purge_time_in_days = self.purge_time_in_days;
        config.restrict_user_origin = self.restrict_user_origin;
        if let Some(re) = self.restriction_reg_ex {
            config.restriction_regex = Some(Regex::new(&re)?);
        }
        Ok(config)
    }
}
