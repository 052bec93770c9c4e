// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use anyhow::{anyhow, ensure, Result};
use const_oid::ObjectIdentifier;
use der::Sequence;
use rsa::pkcs1::DecodeRsaPublicKey;
use signature::Verifier;
use spki::{AlgorithmIdentifier, SubjectPublicKeyInfo};

use const_oid::db::rfc5912::{
    ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, ID_EC_PUBLIC_KEY as ECPK, ID_MGF_1, ID_RSASSA_PSS,
    ID_SHA_256 as SHA256, ID_SHA_384 as SHA384, ID_SHA_512 as SHA512, RSA_ENCRYPTION as RSA,
    SECP_256_R_1 as P256, SECP_384_R_1 as P384,
};

const RSA_SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5");
const RSA_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const RSA_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
const RSA_SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");

#[derive(Clone, Debug, PartialEq, Eq, Sequence)]
pub struct RsaSsaPssParams<'a> {
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT")]
    hash_algorithm: AlgorithmIdentifier<'a>,

    #[asn1(context_specific = "1", tag_mode = "EXPLICIT")]
    mask_algorithm: AlgorithmIdentifier<'a>,

    #[asn1(context_specific = "2", tag_mode = "EXPLICIT")]
    salt_length: u32,

    #[asn1(context_specific = "3", tag_mode = "EXPLICIT")]
    trailer_field: u32,
}

/// Message digest used by a signature scheme.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Hash {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

/// A signature scheme, independent of how it was named on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Scheme {
    Es256,
    Es384,
    RsaPkcs1v15(Hash),
    RsaPss(Hash),
}

impl TryFrom<AlgorithmIdentifier<'_>> for Scheme {
    type Error = anyhow::Error;

    fn try_from(algo: AlgorithmIdentifier<'_>) -> Result<Self> {
        // PKCS#1 v1.5 identifiers carry either absent or NULL parameters.
        let null = algo.parameters.map(|p| p.is_null()).unwrap_or(true);

        match (algo.oid, algo.parameters) {
            (ECDSA_WITH_SHA_256, None) => Ok(Self::Es256),
            (ECDSA_WITH_SHA_384, None) => Ok(Self::Es384),
            (RSA_SHA1, _) if null => Ok(Self::RsaPkcs1v15(Hash::Sha1)),
            (RSA_SHA256, _) if null => Ok(Self::RsaPkcs1v15(Hash::Sha256)),
            (RSA_SHA384, _) if null => Ok(Self::RsaPkcs1v15(Hash::Sha384)),
            (RSA_SHA512, _) if null => Ok(Self::RsaPkcs1v15(Hash::Sha512)),

            (ID_RSASSA_PSS, Some(p)) => {
                // Decompose the RSA PSS parameters.
                let RsaSsaPssParams {
                    hash_algorithm: hash,
                    mask_algorithm: mask,
                    salt_length: salt,
                    trailer_field: tfld,
                } = p.decode_into()?;

                // Validate the sanity of the mask algorithm.
                let algo = match (mask.oid, mask.parameters) {
                    (ID_MGF_1, Some(p)) => {
                        let p = p.decode_into::<AlgorithmIdentifier<'_>>()?;
                        match (p.oids()?, salt, tfld) {
                            ((SHA256, None), 32, 1) => Ok(SHA256),
                            ((SHA384, None), 48, 1) => Ok(SHA384),
                            ((SHA512, None), 64, 1) => Ok(SHA512),
                            _ => Err(anyhow!("unsupported")),
                        }
                    }
                    _ => Err(anyhow!("unsupported")),
                }?;

                match (hash.oids()?, algo) {
                    ((SHA256, None), SHA256) => Ok(Self::RsaPss(Hash::Sha256)),
                    ((SHA384, None), SHA384) => Ok(Self::RsaPss(Hash::Sha384)),
                    ((SHA512, None), SHA512) => Ok(Self::RsaPss(Hash::Sha512)),
                    _ => Err(anyhow!("unsupported")),
                }
            }

            (oid, _) => Err(anyhow!("unsupported signature algorithm {oid}")),
        }
    }
}

pub trait SubjectPublicKeyInfoExt {
    /// Verifies a signature
    ///
    /// The signature on the specified body will be validated with the
    /// specified algorithm. Note that the signature is provided in the
    /// already encoded form as it would appear in an X.509 certificate
    /// or a PKCS#10 certification request. If you have a signature in
    /// another format, you will have to reformat it to the correct format.
    fn verify(&self, body: &[u8], algo: AlgorithmIdentifier<'_>, signature: &[u8]) -> Result<()>;

    /// Checks a detached signature under an explicit scheme.
    ///
    /// Returns `Ok(false)` when the signature does not match. Errors are
    /// reserved for keys or signatures that cannot be decoded and for
    /// schemes that do not fit the key type.
    fn verify_scheme(&self, scheme: Scheme, body: &[u8], signature: &[u8]) -> Result<bool>;
}

impl SubjectPublicKeyInfoExt for SubjectPublicKeyInfo<'_> {
    fn verify(&self, body: &[u8], algo: AlgorithmIdentifier<'_>, sign: &[u8]) -> Result<()> {
        let scheme = Scheme::try_from(algo)?;
        ensure!(
            self.verify_scheme(scheme, body, sign)?,
            "signature verification failed"
        );
        Ok(())
    }

    fn verify_scheme(&self, scheme: Scheme, body: &[u8], sign: &[u8]) -> Result<bool> {
        match (self.algorithm.oids()?, scheme) {
            ((ECPK, Some(P256)), Scheme::Es256) => {
                let vkey = p256::ecdsa::VerifyingKey::from_sec1_bytes(self.subject_public_key)?;
                let sig = p256::ecdsa::Signature::from_der(sign)?;
                Ok(vkey.verify(body, &sig).is_ok())
            }

            ((ECPK, Some(P384)), Scheme::Es384) => {
                let vkey = p384::ecdsa::VerifyingKey::from_sec1_bytes(self.subject_public_key)?;
                let sig = p384::ecdsa::Signature::from_der(sign)?;
                Ok(vkey.verify(body, &sig).is_ok())
            }

            ((RSA, None), Scheme::RsaPkcs1v15(hash)) => {
                use rsa::pkcs1v15::{Signature, VerifyingKey};

                let pkey = rsa::RsaPublicKey::from_pkcs1_der(self.subject_public_key)?;
                let s = Signature::try_from(sign)?;
                let valid = match hash {
                    Hash::Sha1 => VerifyingKey::<sha1::Sha1>::new_with_prefix(pkey).verify(body, &s),
                    Hash::Sha256 => {
                        VerifyingKey::<sha2::Sha256>::new_with_prefix(pkey).verify(body, &s)
                    }
                    Hash::Sha384 => {
                        VerifyingKey::<sha2::Sha384>::new_with_prefix(pkey).verify(body, &s)
                    }
                    Hash::Sha512 => {
                        VerifyingKey::<sha2::Sha512>::new_with_prefix(pkey).verify(body, &s)
                    }
                };
                Ok(valid.is_ok())
            }

            ((RSA, None), Scheme::RsaPss(hash)) => {
                use rsa::pss::{Signature, VerifyingKey};

                let pkey = rsa::RsaPublicKey::from_pkcs1_der(self.subject_public_key)?;
                let s = Signature::try_from(sign)?;
                let valid = match hash {
                    Hash::Sha256 => VerifyingKey::<sha2::Sha256>::new(pkey).verify(body, &s),
                    Hash::Sha384 => VerifyingKey::<sha2::Sha384>::new(pkey).verify(body, &s),
                    Hash::Sha512 => VerifyingKey::<sha2::Sha512>::new(pkey).verify(body, &s),
                    Hash::Sha1 => return Err(anyhow!("unsupported")),
                };
                Ok(valid.is_ok())
            }

            _ => Err(anyhow!("unsupported")),
        }
    }
}
