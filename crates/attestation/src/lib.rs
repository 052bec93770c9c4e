// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

#![warn(rust_2018_idioms, unused_lifetimes, unused_qualifications, clippy::all)]

pub mod crypto;
pub mod ias;

use serde::{Deserialize, Deserializer};
use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::ops::Deref;

/// Digest generic in hash size `N`
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Digest<const N: usize>(pub [u8; N]);

impl<'de, const N: usize> Deserialize<'de> for Digest<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let dig: String = Deserialize::deserialize(deserializer)?;
        dig.parse().map_err(Error::custom)
    }
}

impl<const N: usize> std::str::FromStr for Digest<N> {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dig = hex::decode(s).map_err(|e| format!("invalid hex: {e}"))?;
        let dig = dig.try_into().map_err(|v: Vec<_>| {
            format!("expected digest to have length of {N}, got {}", v.len())
        })?;
        Ok(Digest(dig))
    }
}

impl<const N: usize> AsRef<[u8; N]> for Digest<N> {
    fn as_ref(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> Borrow<[u8; N]> for Digest<N> {
    fn borrow(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> Deref for Digest<N> {
    type Target = [u8; N];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> Display for Digest<N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnvalidatedMeasurements<const N: usize> {
    #[serde(default)]
    signer: HashSet<Digest<N>>,

    #[serde(default)]
    hash: HashSet<Digest<N>>,

    #[serde(default)]
    hash_blacklist: HashSet<Digest<N>>,
}

impl<const N: usize> TryFrom<UnvalidatedMeasurements<N>> for Measurements<N> {
    type Error = String;

    fn try_from(
        UnvalidatedMeasurements {
            signer,
            hash,
            hash_blacklist,
        }: UnvalidatedMeasurements<N>,
    ) -> Result<Self, Self::Error> {
        if let Some(offending) = hash.intersection(&hash_blacklist).next() {
            Err(format!(
                "same hash `{offending}` in both `hash` and `hash_blacklist`"
            ))
        } else {
            Ok(Self {
                signer,
                hash,
                hash_blacklist,
            })
        }
    }
}

/// Enclave measurement policy.
///
/// An empty `signer` or `hash` set places no restriction on that value.
#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, try_from = "UnvalidatedMeasurements<N>")]
pub struct Measurements<const N: usize> {
    /// Allowed enclave signing key digests (MRSIGNER).
    pub signer: HashSet<Digest<N>>,

    /// Allowed enclave code digests (MRENCLAVE).
    pub hash: HashSet<Digest<N>>,

    /// Denied enclave code digests.
    pub hash_blacklist: HashSet<Digest<N>>,
}

impl<const N: usize> Measurements<N> {
    /// Checks a measured `(signer, hash)` pair against the policy.
    pub fn check(&self, signer: &Digest<N>, hash: &Digest<N>) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.signer.is_empty() || self.signer.contains(signer),
            "untrusted enclave signer {signer}"
        );
        anyhow::ensure!(
            self.hash.is_empty() || self.hash.contains(hash),
            "untrusted enclave hash {hash}"
        );
        anyhow::ensure!(
            !self.hash_blacklist.contains(hash),
            "enclave hash {hash} is blacklisted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde() {
        let signer: HashSet<_> = HashSet::from([
            Digest([0x12, 0x34, 0x56, 0x78]),
            Digest([0x00, 0x11, 0x22, 0x33]),
        ]);

        const SIGNER: &str = r#"signer = ["12345678", "00112233"]"#;
        const HASH: &str = r#"hash = ["00112233", "42ffffff"]"#;
        const BLACKLIST: &str = r#"hash_blacklist = ["00112233"]"#;

        assert!(toml::from_str::<Measurements<3>>(SIGNER).is_err());
        assert!(toml::from_str::<Measurements<4>>(&format!("{HASH}\n{BLACKLIST}\n")).is_err());

        let parsed: Measurements<4> = toml::from_str(SIGNER).unwrap();
        assert_eq!(parsed.signer, signer);
        assert!(parsed.hash.is_empty());

        assert_eq!(
            toml::from_str::<Measurements<4>>("").unwrap(),
            Measurements::default()
        );
    }

    #[test]
    fn check() {
        let measurements = Measurements {
            signer: HashSet::from([Digest([1u8; 4])]),
            hash: HashSet::new(),
            hash_blacklist: HashSet::from([Digest([9u8; 4])]),
        };

        assert!(measurements.check(&Digest([1; 4]), &Digest([2; 4])).is_ok());
        assert!(measurements.check(&Digest([3; 4]), &Digest([2; 4])).is_err());
        assert!(measurements.check(&Digest([1; 4]), &Digest([9; 4])).is_err());
        assert!(Measurements::default()
            .check(&Digest([0; 4]), &Digest([0; 4]))
            .is_ok());
    }

    #[test]
    fn display() {
        let digest: Digest<4> = "deadbeef".parse().unwrap();
        assert_eq!(digest.to_string(), "deadbeef");
        assert!("deadbe".parse::<Digest<4>>().is_err());
    }
}
