// Copyright 2019-2024 Heiko Schaefer <heiko@schaefer.name>
//
// This file is part of OpenPGP CA
// https://gitlab.com/openpgp-ca/openpgp-ca
//
// SPDX-FileCopyrightText: 2019-2020 Heiko Schaefer <heiko@schaefer.name>
// SPDX-License-Identifier: GPL-3.0-or-later

//! The HTTP surface of §6: a thin Rocket layer translating requests into
//! `KeyDirectory` calls and directory errors into status codes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use keydir_core::directory::{Lookup, PendingSignatureInfo, PutRequest};
use keydir_core::mailer::LoggingMailer;
use keydir_core::storage::memory::MemoryStorage;
use keydir_core::{Error, KeyDirectory};
use rocket::form::FromForm;
use rocket::http::Status;
use rocket::response::{self, Responder};
use rocket::serde::json::Json;
use rocket::{Request, Rocket, State};
use serde::{Deserialize, Serialize};

use crate::config::RestdConfig;
use crate::state::AppState;

pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl<'r> Responder<'r, 'static> for ApiError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let status = Status::new(self.0.http_status());
        let message = if self.0.expose() {
            self.0.to_string()
        } else {
            tracing::error!(error = %self.0, "internal directory error");
            "internal error".to_string()
        };
        let mut response = Json(ErrorBody { error: message }).respond_to(req)?;
        response.set_status(status);
        Ok(response)
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub enum KeyResponse {
    Text(String),
    Record(Json<keydir_core::model::PublicKeyRecord>),
    PendingSignatures(Json<Vec<PendingSignatureView>>),
}

impl<'r> Responder<'r, 'static> for KeyResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        match self {
            KeyResponse::Text(s) => s.respond_to(req),
            KeyResponse::Record(j) => j.respond_to(req),
            KeyResponse::PendingSignatures(j) => j.respond_to(req),
        }
    }
}

#[derive(Serialize)]
pub struct PendingSignatureView {
    pub issuer_fingerprint: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub user_id: String,
    pub hash: String,
}

impl From<PendingSignatureInfo> for PendingSignatureView {
    fn from(info: PendingSignatureInfo) -> Self {
        Self {
            issuer_fingerprint: info.issuer_fingerprint,
            created: info.created,
            user_id: info.user_id,
            hash: info.hash,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(untagged)]
pub enum PostKeyBody {
    ConfirmSignatures {
        #[allow(dead_code)]
        op: String,
        key_id: String,
        nonce: String,
        sig: Vec<String>,
    },
    Upload {
        public_key_armored: String,
        emails: Option<Vec<String>>,
    },
}

#[post("/api/v1/key", data = "<body>")]
async fn post_key(state: &State<AppState>, body: Json<PostKeyBody>) -> ApiResult<Status> {
    match body.into_inner() {
        PostKeyBody::Upload {
            public_key_armored,
            emails,
        } => {
            state
                .directory
                .put(PutRequest {
                    public_key_armored,
                    emails,
                })
                .await?;
            Ok(Status::Created)
        }
        PostKeyBody::ConfirmSignatures { key_id, nonce, sig, .. } => {
            state.directory.verify_signatures(&key_id, &nonce, &sig).await?;
            Ok(Status::Created)
        }
    }
}

#[derive(FromForm)]
pub struct KeyQuery {
    pub op: Option<String>,
    #[field(name = "keyId")]
    pub key_id: Option<String>,
    pub nonce: Option<String>,
    pub fingerprint: Option<String>,
    pub email: Option<String>,
}

fn lookup_from_query(q: &KeyQuery) -> ApiResult<Lookup> {
    if let Some(key_id) = &q.key_id {
        Ok(Lookup::by_key_id(key_id.clone()))
    } else if let Some(fp) = &q.fingerprint {
        Ok(Lookup::by_fingerprint(fp.clone()))
    } else if let Some(email) = &q.email {
        Ok(Lookup::by_email(email.clone()))
    } else {
        Err(Error::InvalidRequest("one of keyId, fingerprint, email is required".into()).into())
    }
}

#[get("/api/v1/key?<q..>")]
async fn get_key(state: &State<AppState>, q: KeyQuery) -> ApiResult<KeyResponse> {
    match q.op.as_deref() {
        Some("verify") => {
            let key_id = q
                .key_id
                .clone()
                .ok_or_else(|| Error::InvalidRequest("keyId is required".into()))?;
            let nonce = q
                .nonce
                .clone()
                .ok_or_else(|| Error::InvalidRequest("nonce is required".into()))?;
            let email = state.directory.verify(&key_id, &nonce).await?;
            Ok(KeyResponse::Text(format!("{email} is now verified")))
        }
        Some("verifyRemove") => {
            let key_id = q
                .key_id
                .clone()
                .ok_or_else(|| Error::InvalidRequest("keyId is required".into()))?;
            let nonce = q
                .nonce
                .clone()
                .ok_or_else(|| Error::InvalidRequest("nonce is required".into()))?;
            let email = state.directory.verify_remove(&key_id, &nonce).await?;
            Ok(KeyResponse::Text(format!("{email} has been removed")))
        }
        Some("checkSignatures") => {
            let lookup = lookup_from_query(&q)?;
            let nonce = q
                .nonce
                .clone()
                .ok_or_else(|| Error::InvalidRequest("nonce is required".into()))?;
            let pending = state.directory.get_pending_signatures(&lookup, &nonce).await?;
            Ok(KeyResponse::PendingSignatures(Json(
                pending.into_iter().map(Into::into).collect(),
            )))
        }
        Some(other) => Err(Error::InvalidRequest(format!("unknown op {other}")).into()),
        None => {
            let lookup = lookup_from_query(&q)?;
            let record = state.directory.get(&lookup).await?;
            Ok(KeyResponse::Record(Json(record)))
        }
    }
}

#[delete("/api/v1/key?<q..>")]
async fn delete_key(state: &State<AppState>, q: KeyQuery) -> ApiResult<Status> {
    state
        .directory
        .request_remove(q.key_id.as_deref(), q.email.as_deref())
        .await?;
    Ok(Status::Accepted)
}

/// Assemble a Rocket instance from a loaded config: build the Key Directory
/// (in-memory storage, logging mailer — a real deployment swaps in its own
/// `Storage`/`Mailer` implementations) and mount the routes above.
pub fn build(config_path: Option<String>) -> anyhow::Result<Rocket<rocket::Build>> {
    let restd_config = RestdConfig::load(config_path.as_deref())?;
    let core_config = restd_config.into_core_config()?;

    let directory = Arc::new(KeyDirectory::new(
        core_config,
        Arc::new(MemoryStorage::new()),
        Arc::new(LoggingMailer),
    ));

    Ok(rocket::build()
        .manage(AppState { directory })
        .mount("/", routes![post_key, get_key, delete_key]))
}
