// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

//! Validation of IAS-style remote attestation evidence.
//!
//! An attested certificate carries the attestation service's response in
//! two non-critical extensions: the response headers (report signature and
//! signing certificate chain) under [`Ias::HEADERS_OID`] and the report
//! body under [`Ias::REPORT_OID`]. The quote inside the report binds the
//! certificate's public key through the first 32 bytes of its report data.

pub mod config;
pub mod headers;
pub mod quote;
pub mod report;

use crate::crypto::{read_certificates, SignatureVerifier, TbsCertificateExt, TrustAnchor};
use crate::Digest;
use config::Config;
use headers::Headers;
use quote::Body;
use report::Report;

use anyhow::{anyhow, bail, ensure, Context, Result};
use const_oid::ObjectIdentifier;
use der::Decode;
use sha2::{Digest as _, Sha256};
use spki::SubjectPublicKeyInfo;
use tracing::debug;
use x509::{Certificate, TbsCertificate};

/// The attestation evidence found in a certificate.
#[derive(Clone, Debug, PartialEq)]
pub struct Evidence {
    pub headers: Headers,
    pub report: Report,
}

impl Evidence {
    /// Extracts the evidence from a certificate.
    ///
    /// Returns `None` for a certificate that carries neither extension.
    pub fn from_certificate(tbs: &TbsCertificate<'_>) -> Result<Option<Self>> {
        let headers = tbs.extension_value(Ias::HEADERS_OID);
        let report = tbs.extension_value(Ias::REPORT_OID);

        let (headers, report) = match (headers, report) {
            (None, None) => return Ok(None),
            (Some(headers), Some(report)) => (headers, report),
            _ => bail!("incomplete attestation evidence"),
        };

        let headers = std::str::from_utf8(headers).context("attestation headers not UTF-8")?;
        Ok(Some(Self {
            headers: Headers::parse(headers)?,
            report: Report::parse(report)?,
        }))
    }
}

/// The facts established by a successful attestation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attested {
    /// MRENCLAVE, the application identity (`app_ID`) of the requester.
    pub mrenclave: Digest<32>,
    pub mrsigner: Digest<32>,
    pub product_id: u16,
    pub security_version: u16,
    pub debug: bool,
    pub status: String,
}

/// Reads the enclave measurement from a certificate without validating it.
///
/// This is meant for an enclave reading its own identity certificate.
pub fn measurement(tbs: &TbsCertificate<'_>) -> Result<Digest<32>> {
    let evidence =
        Evidence::from_certificate(tbs)?.ok_or_else(|| anyhow!("certificate is not attested"))?;
    let quote = evidence.report.quote()?;
    let body: &Body = quote.as_slice().try_into()?;
    Ok(body.mrenclave())
}

/// The attestation validator.
#[derive(Clone, Debug)]
pub struct Ias {
    root: TrustAnchor,
    config: Config,
}

impl Ias {
    pub const HEADERS_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.3.4");
    pub const REPORT_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.3.5");

    pub fn new(root: TrustAnchor, config: Config) -> Self {
        Self { root, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validates the evidence carried by a peer certificate.
    ///
    /// Returns `Ok(None)` for a certificate without attestation evidence;
    /// any evidence that is present must validate completely.
    pub fn verify(&self, cert: &Certificate<'_>) -> Result<Option<Attested>> {
        let tbs = &cert.tbs_certificate;
        match Evidence::from_certificate(tbs)? {
            None => Ok(None),
            Some(evidence) => self
                .verify_evidence(&evidence, &tbs.subject_public_key_info)
                .map(Some),
        }
    }

    /// Runs the attestation checks on `evidence` presented with the key
    /// `spki`, followed by the configured measurement policy.
    pub fn verify_evidence(
        &self,
        evidence: &Evidence,
        spki: &SubjectPublicKeyInfo<'_>,
    ) -> Result<Attested> {
        // The report signing certificate must chain to the attestation root.
        let pem = evidence.headers.signing_certificate()?;
        let signer = read_certificates(pem.as_bytes())?.swap_remove(0);
        let signer = [Certificate::from_der(&signer)?];
        self.root
            .trusted(&signer)
            .context("untrusted report signing certificate")?;

        // The signature covers the canonical rendering of the report.
        let canonical = evidence.report.canonical()?;
        ensure!(
            SignatureVerifier::REPORT.verify(&canonical, &evidence.headers.signature, &signer[0])?,
            "invalid attestation report signature"
        );

        let quote = evidence.report.quote()?;
        let body: &Body = quote.as_slice().try_into()?;
        debug!(
            flags = body.flags(),
            xfrm = body.xfrm(),
            mrenclave = %body.mrenclave(),
            mrsigner = %body.mrsigner(),
            product_id = body.product_id(),
            security_version = body.security_version(),
            report_data = %hex::encode(body.report_data()),
            "attestation quote"
        );

        // The quote must be bound to the key of the presenting certificate.
        let digest = Sha256::digest(spki.subject_public_key);
        ensure!(
            body.report_data()[..32] == digest[..],
            "attestation report data does not match the certificate key"
        );

        let status = evidence.report.status();
        ensure!(
            !self.config.rejected_statuses.contains(status),
            "attestation rejected with status {status}"
        );

        self.config
            .measurements
            .check(&body.mrsigner(), &body.mrenclave())?;
        if let Some(id) = self.config.enclave_product_id {
            ensure!(body.product_id() == id, "untrusted enclave product id");
        }
        if let Some(svn) = self.config.enclave_security_version {
            ensure!(
                body.security_version() >= svn,
                "untrusted enclave security version"
            );
        }
        ensure!(
            self.config.allow_debug || !body.debug(),
            "debug enclaves are not allowed"
        );

        Ok(Attested {
            mrenclave: body.mrenclave(),
            mrsigner: body.mrsigner(),
            product_id: body.product_id(),
            security_version: body.security_version(),
            debug: body.debug(),
            status: status.to_string(),
        })
    }
}
