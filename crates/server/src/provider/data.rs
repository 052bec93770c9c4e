// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use super::{Grant, State};
use crate::{Failure, PeerCertificate};

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::Json;
use chrono::Utc;
use serde_json::Value;
use tracing::info;
use usage::{Mismatch, Rejection};
use vddpi_enclave::Acquired;

/// A decoded path segment that names an entry of the data directory.
fn plain_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('.')
        && !segment.contains("..")
        && !segment.contains(&['/', '\\'][..])
}

/// Releases a data item to an attested enclave under the terms saved for
/// its consumer.
pub async fn data(
    Extension(state): Extension<Arc<State>>,
    peer: PeerCertificate,
    Path((data_type, id)): Path<(String, String)>,
) -> Result<Json<Acquired>, Failure> {
    let (subject, attested) = state.attest(&peer)?;
    let attested = attested.ok_or_else(|| {
        Rejection::AttestationRejected(format!("client {subject} is not attested"))
    })?;

    if ![&data_type, &id].iter().all(|s| plain_segment(s)) {
        return Err(Rejection::from(Mismatch::MissingPolicy).into());
    }

    let app_id = attested.mrenclave.to_string();
    let data_id = format!("https://{}/data/{data_type}/{id}", state.host);
    let grant = Grant {
        consumer: &subject,
        app_id: &app_id,
        data_id: &data_id,
    };
    let terms = state
        .store
        .saved(grant)?
        .ok_or(Rejection::PolicyMismatch(Mismatch::MissingPolicy))?;

    let path = state.data_dir.join(&data_type).join(format!("{id}.json"));
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| Rejection::Storage(format!("failed to read {data_id}: {e}")))?;
    let data: Value = serde_json::from_slice(&bytes)
        .map_err(|e| Rejection::Storage(format!("malformed {data_id}: {e}")))?;

    let condition = terms.condition(Utc::now().date_naive());
    info!(
        consumer = %subject,
        app_id = %app_id,
        data_id = %data_id,
        condition = ?condition,
        "released data"
    );

    Ok(Json(Acquired { data, condition }))
}
