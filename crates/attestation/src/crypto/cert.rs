// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use super::SubjectPublicKeyInfoExt;

use std::io::BufRead;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{anyhow, bail, ensure, Context, Result};
use const_oid::db::rfc5280::{ID_CE_BASIC_CONSTRAINTS, ID_CE_KEY_USAGE};
use const_oid::ObjectIdentifier;
use der::asn1::{PrintableStringRef, Utf8StringRef};
use der::{Decode, Encode, Tag, Tagged};
use spki::AlgorithmIdentifier;
use x509::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages};
use x509::ext::Extension;
use x509::{Certificate, TbsCertificate};

const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");

pub trait TbsCertificateExt<'a> {
    /// Decodes all extensions with the specified oid.
    fn extensions<T: Decode<'a>>(&self, oid: ObjectIdentifier) -> Result<Vec<(bool, T)>>;

    /// Returns the raw value of the first extension with the specified oid.
    fn extension_value(&self, oid: ObjectIdentifier) -> Option<&'a [u8]>;

    /// Returns the first common name (CN) of the subject.
    fn common_name(&self) -> Result<String>;

    /// Verifies a raw signature with extension handling.
    ///
    /// You probably don't want this function. The other functions in
    /// this trait provide default extension handling plus additional
    /// validations.
    fn verify_ext(
        &self,
        body: &[u8],
        algo: AlgorithmIdentifier<'_>,
        signature: &[u8],
        ext: impl FnMut(&Extension<'_>) -> Result<bool>,
    ) -> Result<()>;

    /// Verifies a raw signature
    ///
    /// NOTE: this function is not for validating a certificate!
    fn verify_raw(
        &self,
        body: &[u8],
        algo: AlgorithmIdentifier<'_>,
        signature: &[u8],
    ) -> Result<()>;

    /// Verifies a certificate
    ///
    /// The signature on the specified certificate will be validated as a
    /// child of the parent certificate. This includes additional field
    /// validation as well as default extension validation.
    fn verify_crt<'r, 'c>(&self, cert: &'r Certificate<'c>) -> Result<&'r TbsCertificate<'c>>;
}

impl<'a> TbsCertificateExt<'a> for TbsCertificate<'a> {
    fn extensions<T: Decode<'a>>(&self, oid: ObjectIdentifier) -> Result<Vec<(bool, T)>> {
        self.extensions
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .filter(|e| e.extn_id == oid)
            .map(|e| Ok((e.critical, T::from_der(e.extn_value)?)))
            .collect()
    }

    fn extension_value(&self, oid: ObjectIdentifier) -> Option<&'a [u8]> {
        self.extensions
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .find(|e| e.extn_id == oid)
            .map(|e| e.extn_value)
    }

    fn common_name(&self) -> Result<String> {
        for rdn in self.subject.0.iter() {
            for atv in rdn.0.iter() {
                if atv.oid != COMMON_NAME {
                    continue;
                }

                let name = match atv.value.tag() {
                    Tag::PrintableString => atv
                        .value
                        .decode_into::<PrintableStringRef<'_>>()?
                        .as_str()
                        .to_owned(),
                    _ => atv
                        .value
                        .decode_into::<Utf8StringRef<'_>>()?
                        .as_str()
                        .to_owned(),
                };
                return Ok(name);
            }
        }

        bail!("certificate subject has no common name")
    }

    fn verify_ext(
        &self,
        body: &[u8],
        algo: AlgorithmIdentifier<'_>,
        signature: &[u8],
        mut ext: impl FnMut(&Extension<'_>) -> Result<bool>,
    ) -> Result<()> {
        // Validate the certificate time constraints.
        if self.validity.not_before.to_system_time() > SystemTime::now() {
            return Err(anyhow!("cert unborn"));
        }
        if self.validity.not_after.to_system_time() < SystemTime::now() {
            return Err(anyhow!("cert expired"));
        }

        // Validate certificate extensions.
        if let Some(extensions) = self.extensions.as_ref() {
            for extension in extensions {
                if !ext(extension)? && extension.critical {
                    return Err(anyhow!(
                        "unhandled critical extension: {}",
                        extension.extn_id
                    ));
                }
            }
        }

        self.subject_public_key_info.verify(body, algo, signature)
    }

    fn verify_raw(
        &self,
        body: &[u8],
        algo: AlgorithmIdentifier<'_>,
        signature: &[u8],
    ) -> Result<()> {
        self.verify_ext(body, algo, signature, |ext| {
            Ok(match ext.extn_id {
                ID_CE_BASIC_CONSTRAINTS => BasicConstraints::from_der(ext.extn_value).is_ok(),

                ID_CE_KEY_USAGE => {
                    let ku = KeyUsage::from_der(ext.extn_value)?;
                    if !ku.0.contains(KeyUsages::DigitalSignature) {
                        return Err(anyhow!("not allowed to sign documents"));
                    }

                    true
                }

                _ => false,
            })
        })
    }

    fn verify_crt<'r, 'c>(&self, cert: &'r Certificate<'c>) -> Result<&'r TbsCertificate<'c>> {
        // Validate that the parent cert is the issuer.
        if cert.tbs_certificate.issuer != self.subject {
            return Err(anyhow!("subject mismatch"));
        }
        if cert.tbs_certificate.issuer_unique_id != self.subject_unique_id {
            return Err(anyhow!("id mismatch"));
        }

        // Encode the certificate body for validation.
        let body = cert.tbs_certificate.to_vec()?;
        let sign = cert
            .signature
            .as_bytes()
            .ok_or_else(|| anyhow!("invalid signature"))?;

        self.verify_ext(&body, cert.signature_algorithm, sign, |ext| {
            Ok(match ext.extn_id {
                // Validate that the parent is allowed to sign certificates.
                ID_CE_KEY_USAGE => {
                    let ku = KeyUsage::from_der(ext.extn_value)?;
                    if !ku.0.contains(KeyUsages::KeyCertSign) {
                        return Err(anyhow!("not allowed to sign certificates"));
                    }

                    true
                }

                // Validate the cert is a CA with a valid maximum depth.
                ID_CE_BASIC_CONSTRAINTS => {
                    let pbc = BasicConstraints::from_der(ext.extn_value)?;
                    if !pbc.ca {
                        return Err(anyhow!("not ca enabled"));
                    }

                    // When validating a self-signed cert, we shortcut the below test.
                    let selfsigned = self.subject_public_key_info
                        == cert.tbs_certificate.subject_public_key_info;

                    // If the parent has a depth limit, the child MUST have a shorter depth limit.
                    let child_bcs = cert
                        .tbs_certificate
                        .extensions::<BasicConstraints>(ID_CE_BASIC_CONSTRAINTS)?
                        .into_iter()
                        .filter(|e| !selfsigned && e.0 && e.1.ca)
                        .map(|e| e.1);
                    for cbc in child_bcs {
                        match (pbc.path_len_constraint, cbc.path_len_constraint) {
                            (Some(p), Some(c)) if c >= p => return Err(anyhow!("path constraint")),
                            (Some(..), None) => return Err(anyhow!("missing path constraint")),
                            _ => (),
                        }
                    }

                    true
                }

                _ => false,
            })
        })?;

        Ok(&cert.tbs_certificate)
    }
}

/// Reads every PEM certificate from `pem`, in order, as DER.
pub fn read_certificates(mut pem: impl BufRead) -> Result<Vec<Vec<u8>>> {
    let certs = rustls_pemfile::certs(&mut pem).context("malformed PEM certificate")?;
    ensure!(!certs.is_empty(), "no certificate found");
    Ok(certs)
}

/// A self-signed root certificate that certificate chains must lead back to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustAnchor(Vec<u8>);

impl TrustAnchor {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("failed to open trust anchor {}", path.display()))?;
        Self::read(std::io::BufReader::new(file))
    }

    pub fn read(pem: impl BufRead) -> Result<Self> {
        let der = read_certificates(pem)?.swap_remove(0);
        Self::from_der(der)
    }

    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let root = Certificate::from_der(&der)?;
        root.tbs_certificate.verify_crt(&root)?;
        Ok(Self(der))
    }

    /// The DER encoding of the anchor certificate.
    pub fn der(&self) -> &[u8] {
        &self.0
    }

    /// Verifies that `chain` (ordered from the anchor's child down to the
    /// leaf) is issued by this anchor and returns the leaf.
    pub fn trusted<'c>(&self, chain: &'c [Certificate<'c>]) -> Result<&'c TbsCertificate<'c>> {
        let (first, rest) = chain
            .split_first()
            .ok_or_else(|| anyhow!("empty certificate chain"))?;

        let root = Certificate::from_der(&self.0)?;
        let mut signer = root.tbs_certificate.verify_crt(first)?;
        for cert in rest {
            signer = signer.verify_crt(cert)?;
        }

        Ok(signer)
    }
}
