// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

//! The enclave service, redeeming usage tokens for processing.

use crate::{health, traced, Failure, ForwardedCertificate, PeerCertificate};

use std::sync::Arc;

use anyhow::Context;
use attestation::crypto::TrustAnchor;
use axum::extract::Extension;
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::{Json, Router};
use vddpi_enclave::{Config, Processor, SessionProcessor, SessionReport};

#[derive(Debug)]
pub struct State {
    roots: TrustAnchor,
    sessions: SessionProcessor,
}

impl State {
    pub fn load(config: &Config, processor: Arc<dyn Processor>) -> anyhow::Result<Self> {
        Ok(Self {
            roots: TrustAnchor::load(&config.roots).context("invalid client root")?,
            sessions: SessionProcessor::new(config, processor)?,
        })
    }
}

/// Runs a session over the token blob in the body.
pub async fn process(
    Extension(state): Extension<Arc<State>>,
    peer: PeerCertificate,
    tokens: String,
) -> Result<Json<SessionReport>, Failure> {
    let client = peer.subject(&state.roots)?;
    let report = state.sessions.request(&client, &tokens).await?;
    Ok(Json(report))
}

pub fn app(state: State, forwarded: Option<HeaderName>) -> Router {
    let router = Router::new()
        .route("/", get(health))
        .route("/process", post(process))
        .layer(Extension(Arc::new(state)));

    let router = match forwarded {
        Some(name) => router.layer(Extension(ForwardedCertificate(name))),
        None => router,
    };

    traced(router)
}
