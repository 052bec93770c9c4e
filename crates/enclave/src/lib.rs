// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

//! The enclave side of the data exchange.
//!
//! A consumer hands the enclave the usage tokens it was issued. The
//! [`SessionProcessor`] verifies them, acquires the data from the providers
//! or from the local cache, enforces the usage conditions, runs the
//! [`Processor`] over the collected inputs and keeps the usage counters.

#![warn(rust_2018_idioms, unused_lifetimes, unused_qualifications, clippy::all)]

pub mod cache;
pub mod checker;
pub mod fetch;
pub mod session;

pub use cache::{CacheStore, CachedRecord};
pub use checker::{ConditionChecker, Verdict};
pub use fetch::{Acquired, ProviderClient};
pub use session::{SessionProcessor, SessionReport};

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

fn address() -> String {
    "0.0.0.0".into()
}

fn timeout() -> u64 {
    10
}

/// Enclave configuration, the `[enclave]` section of the config file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The enclave's attested identity certificate (PEM).
    pub crt: PathBuf,

    /// The key of the identity certificate (PEM).
    pub key: PathBuf,

    /// Root certificate for provider servers and token issuers (PEM).
    pub roots: PathBuf,

    /// Directory holding cached data and spent tokens.
    pub cache_dir: PathBuf,

    /// Trusted time service, answering `GET` with `{"datetime": ..}`.
    pub time_url: String,

    /// Trusted geolocation service, answering `POST {"address": ..}` with
    /// `{"countryCode": ..}`.
    pub location_url: String,

    /// Trust anchor for the time and geolocation services (PEM).
    pub api_ca: PathBuf,

    /// Address reported to the geolocation service.
    #[serde(default = "address")]
    pub address: String,

    /// Per-call timeout for external services, in seconds.
    #[serde(default = "timeout")]
    pub timeout: u64,
}

impl Config {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// The data processing function run over the inputs of a session.
///
/// Arguments are passed in `arg_num` order.
pub trait Processor: Send + Sync {
    fn process(&self, args: &[Value]) -> anyhow::Result<String>;
}

/// Returns its inputs unchanged.
#[derive(Copy, Clone, Debug, Default)]
pub struct Echo;

impl Processor for Echo {
    fn process(&self, args: &[Value]) -> anyhow::Result<String> {
        match args {
            [Value::String(s)] => Ok(s.clone()),
            [one] => Ok(one.to_string()),
            many => Ok(serde_json::to_string(many)?),
        }
    }
}
