// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Why a request or a session item was turned away.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("attestation rejected: {0}")]
    AttestationRejected(String),

    #[error(transparent)]
    PolicyMismatch(#[from] Mismatch),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("processing failed: {0}")]
    Processing(String),
}

impl Rejection {
    /// Whether the rejection is the fault of the local service rather than
    /// of the request.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Storage(..) | Self::Processing(..))
    }
}

/// A declaration, token or condition that does not fit the applicable policy.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum Mismatch {
    #[error("malformed declaration field `{0}`")]
    Malformed(&'static str),

    #[error("failed to get data providing policy")]
    MissingPolicy,

    #[error("failed to apply due to input constraints")]
    Input,

    #[error("certificate and declaration information does not match")]
    Consumer,

    #[error("not allowed to provide data to this consumer")]
    ConsumerNotAllowed,

    #[error("not allowed to provide data to this application")]
    AppNotAllowed,

    #[error("not allowed to disclose the processing output")]
    Disclosure,

    #[error("invalid disclosure index")]
    DisclosureIndex,

    #[error("exceeded number of accesses allowed")]
    Counter,

    #[error("location where access is not permitted")]
    Location,

    #[error("exceeded access duration")]
    Duration,

    #[error("exceeding the date of availability")]
    Expiration,

    #[error("token was issued to a different consumer")]
    TokenConsumer,

    #[error("token was issued to a different application")]
    TokenApp,

    #[error("invalid argument number")]
    ArgumentNumber,

    #[error("usage condition is not met")]
    Condition,

    #[error("usage counter is exhausted")]
    Exhausted,
}
