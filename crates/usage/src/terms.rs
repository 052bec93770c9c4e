// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use crate::condition::Condition;
use crate::error::Mismatch;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};

/// Usage terms: the limits attached to a piece of data.
///
/// `None` leaves a dimension unrestricted. A zero counter or duration and
/// an empty location mean the same.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terms {
    /// Number of processing sessions the data may be used in.
    #[serde(default, deserialize_with = "nonzero")]
    pub counter: Option<u32>,

    /// ISO country code the data may be used in.
    #[serde(default, deserialize_with = "nonempty")]
    pub location: Option<String>,

    /// Number of days the data may be kept after it is provided.
    #[serde(default, deserialize_with = "nonzero")]
    pub duration: Option<u32>,

    /// Last day the data may be used.
    #[serde(default)]
    pub expiration_date: Option<NaiveDate>,
}

fn nonzero<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    Ok(Option::<u32>::deserialize(deserializer)?.filter(|n| *n != 0))
}

fn nonempty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.filter(|s| !s.is_empty()))
}

/// Combines one dimension of a policy and a declaration.
///
/// The declared value is kept when `permits(policy, declared)` holds; an
/// absent value on either side defers to the other.
fn tighter<T>(
    policy: Option<T>,
    declared: Option<T>,
    permits: impl Fn(&T, &T) -> bool,
    mismatch: Mismatch,
) -> Result<Option<T>, Mismatch> {
    match (policy, declared) {
        (Some(p), Some(d)) if !permits(&p, &d) => Err(mismatch),
        (_, Some(d)) => Ok(Some(d)),
        (p, None) => Ok(p),
    }
}

fn at_most<T: PartialOrd>(policy: &T, declared: &T) -> bool {
    declared <= policy
}

impl Terms {
    /// Folds the zero and empty sentinels into `None`.
    pub fn normalized(self) -> Self {
        Self {
            counter: self.counter.filter(|n| *n != 0),
            location: self.location.filter(|l| !l.is_empty()),
            duration: self.duration.filter(|n| *n != 0),
            expiration_date: self.expiration_date,
        }
    }

    /// Reconciles declared terms with the terms of a providing policy.
    ///
    /// The result is the terms to be saved for the consumer: for every
    /// dimension, the stricter of the two values. A declaration asking for
    /// more than the policy allows is rejected.
    pub fn reconcile(policy: &Terms, declared: &Terms) -> Result<Terms, Mismatch> {
        let policy = policy.clone().normalized();
        let declared = declared.clone().normalized();

        Ok(Terms {
            counter: tighter(policy.counter, declared.counter, at_most, Mismatch::Counter)?,
            location: tighter(
                policy.location,
                declared.location,
                |p, d| p == d,
                Mismatch::Location,
            )?,
            duration: tighter(policy.duration, declared.duration, at_most, Mismatch::Duration)?,
            expiration_date: tighter(
                policy.expiration_date,
                declared.expiration_date,
                at_most,
                Mismatch::Expiration,
            )?,
        })
    }

    /// The condition handed out with data provided on `today`.
    ///
    /// The effective expiration date is the earlier of `today + duration`
    /// and the saved expiration date.
    pub fn condition(&self, today: NaiveDate) -> Condition {
        let by_duration = self
            .duration
            .and_then(|days| today.checked_add_days(Days::new(days.into())));

        let expiration_date = match (by_duration, self.expiration_date) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        Condition {
            counter: self.counter.map(i64::from),
            location: self.location.clone(),
            expiration_date,
        }
    }
}
