// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

//! Usage control for attested data exchange.
//!
//! A consumer signs a [`SignedDeclaration`] of how it intends to use a piece
//! of data. The provider reconciles it with its [`ProvidingPolicy`] and, on
//! success, hands out an [`IssuedToken`] recording the saved [`Terms`]. The
//! enclave later redeems the token and enforces the [`Condition`] delivered
//! with the data.

pub mod condition;
pub mod declaration;
pub mod envelope;
pub mod error;
pub mod policy;
pub mod reconcile;
pub mod terms;
pub mod token;

pub use condition::Condition;
pub use declaration::{SignedDeclaration, UsageDeclaration};
pub use error::{Mismatch, Rejection};
pub use policy::{ProcessingSpec, ProvidingPolicy};
pub use terms::Terms;
pub use token::{Claims, IssuedToken, TokenIssuer, TokenVerifier};

use std::io::BufRead;
use std::path::Path;

use anyhow::{bail, Context, Result};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use rustls_pemfile::Item;

/// Reads an RSA private key in PKCS#8 or PKCS#1 PEM form.
pub fn read_rsa_key(mut pem: impl BufRead) -> Result<RsaPrivateKey> {
    loop {
        match rustls_pemfile::read_one(&mut pem).context("malformed PEM key")? {
            Some(Item::PKCS8Key(der)) => return Ok(RsaPrivateKey::from_pkcs8_der(&der)?),
            Some(Item::RSAKey(der)) => return Ok(RsaPrivateKey::from_pkcs1_der(&der)?),
            Some(_) => continue,
            None => bail!("no RSA private key found"),
        }
    }
}

/// Loads an RSA private key from a PEM file.
pub fn load_rsa_key(path: impl AsRef<Path>) -> Result<RsaPrivateKey> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open key {}", path.display()))?;
    read_rsa_key(std::io::BufReader::new(file))
}
