// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use super::{Hash, Scheme, SubjectPublicKeyInfoExt};

use anyhow::Result;
use x509::Certificate;

/// Checks detached signatures against the public key of a certificate.
///
/// The verifier is pure: the same inputs always produce the same answer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SignatureVerifier(Scheme);

impl SignatureVerifier {
    /// Usage declarations: RSA PKCS#1 v1.5 over SHA-256.
    pub const DECLARATION: Self = Self(Scheme::RsaPkcs1v15(Hash::Sha256));

    /// Attestation reports: RSA PKCS#1 v1.5 over SHA-256.
    pub const REPORT: Self = Self(Scheme::RsaPkcs1v15(Hash::Sha256));

    /// Legacy certificate requests: RSA PKCS#1 v1.5 over SHA-1.
    pub const LEGACY: Self = Self(Scheme::RsaPkcs1v15(Hash::Sha1));

    pub const fn new(scheme: Scheme) -> Self {
        Self(scheme)
    }

    pub fn scheme(&self) -> Scheme {
        self.0
    }

    /// Returns whether `signature` is a valid signature of `data` by the
    /// key in `cert`.
    ///
    /// A well-formed signature that does not match yields `Ok(false)`; only
    /// an undecodable key or signature is an error.
    pub fn verify(&self, data: &[u8], signature: &[u8], cert: &Certificate<'_>) -> Result<bool> {
        cert.tbs_certificate
            .subject_public_key_info
            .verify_scheme(self.0, data, signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testdata::{certificate, rsa_key};

    use der::Decode;
    use rsa::pkcs1v15::SigningKey;
    use signature::{SignatureEncoding, Signer};

    #[test]
    fn declaration() {
        let key = rsa_key(include_str!("../../../../testdata/consumer.key"));
        let der = certificate(include_str!("../../../../testdata/consumer.crt"));
        let crt = Certificate::from_der(&der).unwrap();

        let data = b"alice";
        let sig = SigningKey::<sha2::Sha256>::new_with_prefix(key)
            .sign(data)
            .to_vec();

        assert!(SignatureVerifier::DECLARATION
            .verify(data, &sig, &crt)
            .unwrap());
        assert!(!SignatureVerifier::DECLARATION
            .verify(b"alicf", &sig, &crt)
            .unwrap());
        assert!(!SignatureVerifier::LEGACY.verify(data, &sig, &crt).unwrap());
    }
}
