// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

//! Decides whether a declaration may be granted under a providing policy.

use crate::declaration::UsageDeclaration;
use crate::error::Mismatch;
use crate::policy::{ProcessingSpec, ProvidingPolicy};
use crate::terms::Terms;

use tracing::debug;

/// Evaluates a verified declaration presented by the certificate subject
/// `subject` for the program described by `spec`.
///
/// Returns the terms to save and grant. The checks run in a fixed order and
/// the first failing one is reported.
pub fn reconcile(
    declaration: &UsageDeclaration,
    subject: &str,
    spec: &ProcessingSpec,
    policy: &ProvidingPolicy,
) -> Result<Terms, Mismatch> {
    if spec.inputs_of(&policy.data_type).next().is_none() {
        return Err(Mismatch::Input);
    }

    if declaration.consumer != subject {
        return Err(Mismatch::Consumer);
    }

    if !policy.permits_consumer(subject) {
        return Err(Mismatch::ConsumerNotAllowed);
    }

    if !policy.permits_app(&declaration.app_id) {
        return Err(Mismatch::AppNotAllowed);
    }

    policy.check_disclosure(&spec.output, declaration.arg_num)?;

    let saved = Terms::reconcile(&policy.terms, &declaration.terms)?;
    debug!(?saved, data_id = %declaration.data_id, "reconciled usage terms");
    Ok(saved)
}
