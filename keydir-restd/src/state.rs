// Copyright 2019-2024 Heiko Schaefer <heiko@schaefer.name>
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca
//
// SPDX-FileCopyrightText: 2019-2020 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use keydir_core::KeyDirectory;

/// Managed Rocket state: the single Key Directory instance the whole
/// process shares.
pub struct AppState {
    pub directory: Arc<KeyDirectory>,
}
