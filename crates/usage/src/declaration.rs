// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use crate::error::{Mismatch, Rejection};
use crate::terms::Terms;

use std::str::FromStr;

use attestation::crypto::SignatureVerifier;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::NaiveDate;
use rsa::pkcs1v15::SigningKey;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use signature::{SignatureEncoding, Signer};
use tracing::debug;
use x509::Certificate;

/// A data usage declaration as submitted by a consumer.
///
/// Every field is a string; absent fields are empty. Unrestricted terms
/// are the empty string, and a counter of `"0"` is also unrestricted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignedDeclaration {
    pub consumer: String,
    #[serde(rename = "app_ID")]
    pub app_id: String,
    #[serde(rename = "data_ID")]
    pub data_id: String,
    pub arg_num: String,
    pub counter: String,
    pub location: String,
    pub duration: String,
    pub expiration_date: String,

    /// Base64 RSA PKCS#1 v1.5 SHA-256 signature over [`Self::message`].
    pub signature: String,
}

/// A declaration whose signature has been checked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageDeclaration {
    pub consumer: String,
    pub app_id: String,
    pub data_id: String,
    /// 1-based position of the data among the application's inputs.
    pub arg_num: u32,
    pub terms: Terms,
}

fn optional<T: FromStr>(value: &str, field: &'static str) -> Result<Option<T>, Mismatch> {
    match value.trim() {
        "" => Ok(None),
        value => value.parse().map(Some).map_err(|_| Mismatch::Malformed(field)),
    }
}

impl SignedDeclaration {
    /// The signed message: the concatenation of every field except the
    /// signature, in declaration order.
    pub fn message(&self) -> String {
        [
            &self.consumer,
            &self.app_id,
            &self.data_id,
            &self.arg_num,
            &self.counter,
            &self.location,
            &self.duration,
            &self.expiration_date,
        ]
        .into_iter()
        .map(String::as_str)
        .collect()
    }

    /// Signs the declaration with the consumer's key.
    pub fn sign(mut self, key: &RsaPrivateKey) -> Self {
        let signer = SigningKey::<sha2::Sha256>::new_with_prefix(key.clone());
        let signature = signer.sign(self.message().as_bytes());
        self.signature = STANDARD.encode(signature.to_vec());
        self
    }

    /// Checks the signature against the consumer certificate and parses
    /// the declared terms.
    pub fn verify(&self, cert: &Certificate<'_>) -> Result<UsageDeclaration, Rejection> {
        let signature = STANDARD
            .decode(self.signature.trim())
            .map_err(|e| Rejection::SignatureInvalid(format!("declaration signature: {e}")))?;

        let valid = SignatureVerifier::DECLARATION
            .verify(self.message().as_bytes(), &signature, cert)
            .map_err(|e| {
                debug!("failed to check declaration signature: {e}");
                Rejection::SignatureInvalid("malformed declaration signature".into())
            })?;
        if !valid {
            return Err(Rejection::SignatureInvalid(
                "failed to verify data usage declaration's signature".into(),
            ));
        }

        self.parse().map_err(Rejection::from)
    }

    fn parse(&self) -> Result<UsageDeclaration, Mismatch> {
        let arg_num = self
            .arg_num
            .trim()
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(Mismatch::Malformed("arg_num"))?;

        let counter = optional::<u32>(&self.counter, "counter")?;
        let location = optional::<String>(&self.location, "location")?;
        let duration = optional::<u32>(&self.duration, "duration")?;
        let expiration_date = optional::<NaiveDate>(&self.expiration_date, "expiration_date")?;

        Ok(UsageDeclaration {
            consumer: self.consumer.clone(),
            app_id: self.app_id.clone(),
            data_id: self.data_id.clone(),
            arg_num,
            terms: Terms {
                counter,
                location,
                duration,
                expiration_date,
            }
            .normalized(),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testdata;

    use der::Decode;
    use rstest::rstest;

    pub fn declaration() -> SignedDeclaration {
        SignedDeclaration {
            consumer: "alice".into(),
            app_id: "deadbeef".into(),
            data_id: "https://p/data/personal/1".into(),
            arg_num: "1".into(),
            counter: "5".into(),
            location: "JP".into(),
            duration: "30".into(),
            expiration_date: "2030-01-01".into(),
            signature: String::new(),
        }
    }

    #[test]
    fn message() {
        assert_eq!(
            declaration().message(),
            "alicedeadbeefhttps://p/data/personal/115JP302030-01-01"
        );
    }

    #[test]
    fn signed() {
        let signed = declaration().sign(&testdata::consumer_key());
        let der = testdata::certificate(testdata::CONSUMER_CRT);
        let crt = Certificate::from_der(&der).unwrap();

        let parsed = signed.verify(&crt).unwrap();
        assert_eq!(parsed.consumer, "alice");
        assert_eq!(parsed.arg_num, 1);
        assert_eq!(parsed.terms.counter, Some(5));
        assert_eq!(parsed.terms.location.as_deref(), Some("JP"));
        assert_eq!(parsed.terms.duration, Some(30));
        assert_eq!(
            parsed.terms.expiration_date,
            Some("2030-01-01".parse().unwrap())
        );

        // Signing is deterministic.
        assert_eq!(signed, declaration().sign(&testdata::consumer_key()));
    }

    #[rstest]
    #[case::consumer(|d: &mut SignedDeclaration| d.consumer.push('x'))]
    #[case::app(|d: &mut SignedDeclaration| d.app_id.push('0'))]
    #[case::counter(|d: &mut SignedDeclaration| d.counter = "50".into())]
    #[case::location(|d: &mut SignedDeclaration| d.location = "US".into())]
    #[case::signature(|d: &mut SignedDeclaration| d.signature = d.signature.chars().rev().collect())]
    #[case::garbage(|d: &mut SignedDeclaration| d.signature = "***".into())]
    fn tampered(#[case] tamper: fn(&mut SignedDeclaration)) {
        let mut signed = declaration().sign(&testdata::consumer_key());
        tamper(&mut signed);

        let der = testdata::certificate(testdata::CONSUMER_CRT);
        let crt = Certificate::from_der(&der).unwrap();
        assert!(matches!(
            signed.verify(&crt),
            Err(Rejection::SignatureInvalid(..))
        ));
    }

    #[test]
    fn other_signer() {
        let signed = declaration().sign(&testdata::consumer_key());
        let der = testdata::certificate(testdata::PROVIDER_CRT);
        let crt = Certificate::from_der(&der).unwrap();
        assert!(signed.verify(&crt).is_err());
    }

    #[rstest]
    #[case("", "", "", "")]
    #[case("0", "", "", "")]
    #[case("", "", "0", "")]
    #[case("0", "", "0", "")]
    fn unrestricted(
        #[case] counter: &str,
        #[case] location: &str,
        #[case] duration: &str,
        #[case] expiration: &str,
    ) {
        let declaration = SignedDeclaration {
            counter: counter.into(),
            location: location.into(),
            duration: duration.into(),
            expiration_date: expiration.into(),
            ..declaration()
        };
        assert_eq!(declaration.parse().unwrap().terms, Terms::default());
    }

    #[rstest]
    #[case::arg_num("0", "5", Mismatch::Malformed("arg_num"))]
    #[case::arg_num_text("one", "5", Mismatch::Malformed("arg_num"))]
    #[case::counter("1", "-1", Mismatch::Malformed("counter"))]
    fn malformed(#[case] arg_num: &str, #[case] counter: &str, #[case] expected: Mismatch) {
        let declaration = SignedDeclaration {
            arg_num: arg_num.into(),
            counter: counter.into(),
            ..declaration()
        };
        assert_eq!(declaration.parse(), Err(expected));
    }

    #[test]
    fn wire_names() {
        let value = serde_json::to_value(declaration()).unwrap();
        assert_eq!(value["app_ID"], "deadbeef");
        assert_eq!(value["data_ID"], "https://p/data/personal/1");

        let parsed: SignedDeclaration =
            serde_json::from_str(r#"{"consumer": "alice", "app_ID": "a"}"#).unwrap();
        assert_eq!(parsed.app_id, "a");
        assert!(parsed.signature.is_empty());
    }
}
