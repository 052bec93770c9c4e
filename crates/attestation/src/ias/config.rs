// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use crate::Measurements;

use std::collections::HashSet;

use serde::Deserialize;

/// Quote statuses that are never accepted.
pub const REJECTED_STATUSES: [&str; 5] = [
    "SIGNATURE_INVALID",
    "GROUP_REVOKED",
    "SIGNATURE_REVOKED",
    "KEY_REVOKED",
    "SIGRL_VERSION_MISMATCH",
];

fn rejected_statuses() -> HashSet<String> {
    REJECTED_STATUSES.iter().map(|s| s.to_string()).collect()
}

fn allow_debug() -> bool {
    true
}

#[derive(Clone, Deserialize, Debug, Eq, PartialEq)]
pub struct Config {
    /// Values of `isvEnclaveQuoteStatus` that fail attestation.
    #[serde(default = "rejected_statuses")]
    pub rejected_statuses: HashSet<String>,

    /// Values for `mrsigner` and `mrenclave` in the quote body.
    #[serde(default, flatten)]
    pub measurements: Measurements<32>,

    /// Value for `isv_prodid`, do not allow other ids.
    pub enclave_product_id: Option<u16>,

    /// Minimum value for `isv_svn`.
    pub enclave_security_version: Option<u16>,

    /// Whether enclaves launched in debug mode are accepted.
    #[serde(default = "allow_debug")]
    pub allow_debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rejected_statuses: rejected_statuses(),
            measurements: Default::default(),
            enclave_product_id: None,
            enclave_security_version: None,
            allow_debug: allow_debug(),
        }
    }
}
