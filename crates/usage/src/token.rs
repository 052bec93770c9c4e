// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use crate::declaration::UsageDeclaration;
use crate::error::{Mismatch, Rejection};
use crate::terms::Terms;

use attestation::crypto::{read_certificates, TrustAnchor};

use anyhow::Context;
use der::Decode;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use tracing::debug;
use x509::Certificate;

/// The status claim of a granted token.
pub const COMPLETED: &str = "completed";

/// The claims of a usage token: the saved terms and who they apply to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub status: String,
    pub consumer: String,

    #[serde(rename = "app_ID")]
    pub app_id: String,

    #[serde(rename = "data_ID")]
    pub data_id: String,

    #[serde(with = "arg_num")]
    pub arg_num: u32,

    #[serde(flatten)]
    pub terms: Terms,
}

impl Claims {
    /// The claims granting `terms` to a declaration.
    pub fn granted(declaration: &UsageDeclaration, terms: Terms) -> Self {
        Self {
            status: COMPLETED.into(),
            consumer: declaration.consumer.clone(),
            app_id: declaration.app_id.clone(),
            data_id: declaration.data_id.clone(),
            arg_num: declaration.arg_num,
            terms,
        }
    }

    /// Checks that the token was issued to `consumer` for the application
    /// `app_id`.
    pub fn check_holder(&self, consumer: &str, app_id: &str) -> Result<(), Mismatch> {
        if self.consumer != consumer {
            return Err(Mismatch::TokenConsumer);
        }

        if !self.app_id.eq_ignore_ascii_case(app_id) {
            return Err(Mismatch::TokenApp);
        }

        Ok(())
    }
}

mod arg_num {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Number(u32),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        use serde::de::Error;

        match Wire::deserialize(deserializer)? {
            Wire::Number(n) => Ok(n),
            Wire::Text(s) => s.trim().parse().map_err(Error::custom),
        }
    }
}

/// A signed token together with the certificate of its issuer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub jwt: String,

    /// PEM certificate chain of the issuer, leaf first.
    pub cert: String,
}

/// Signs usage tokens with the provider's key.
pub struct TokenIssuer {
    key: EncodingKey,
    cert: String,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("cert", &self.cert)
            .finish_non_exhaustive()
    }
}

impl TokenIssuer {
    /// Creates an issuer from the provider key and its PEM certificate.
    pub fn new(key: &RsaPrivateKey, cert: impl Into<String>) -> anyhow::Result<Self> {
        let cert = cert.into();
        read_certificates(cert.as_bytes()).context("invalid issuer certificate")?;

        let der = key.to_pkcs1_der().context("failed to encode issuer key")?;
        Ok(Self {
            key: EncodingKey::from_rsa_der(der.as_bytes()),
            cert,
        })
    }

    pub fn cert(&self) -> &str {
        &self.cert
    }

    /// Signs `claims` with RS512.
    pub fn issue(&self, claims: &Claims) -> anyhow::Result<IssuedToken> {
        let jwt = jsonwebtoken::encode(&Header::new(Algorithm::RS512), claims, &self.key)
            .context("failed to sign usage token")?;

        Ok(IssuedToken {
            jwt,
            cert: self.cert.clone(),
        })
    }
}

/// Checks usage tokens against a trusted root.
#[derive(Clone, Debug)]
pub struct TokenVerifier {
    anchor: TrustAnchor,
}

impl TokenVerifier {
    pub fn new(anchor: TrustAnchor) -> Self {
        Self { anchor }
    }

    /// Verifies the issuer certificate chain and the token signature.
    ///
    /// Holder checks are left to [`Claims::check_holder`].
    pub fn verify(&self, token: &IssuedToken) -> Result<Claims, Rejection> {
        let untrusted =
            |e: anyhow::Error| Rejection::SignatureInvalid(format!("token certificate: {e:#}"));

        let ders = read_certificates(token.cert.as_bytes()).map_err(untrusted)?;
        let chain = ders
            .iter()
            .map(|der| Certificate::from_der(der))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| untrusted(e.into()))?;

        // PEM chains are leaf first; verification starts at the anchor.
        let chain: Vec<_> = chain.into_iter().rev().collect();
        let leaf = self.anchor.trusted(&chain).map_err(untrusted)?;

        let key = DecodingKey::from_rsa_der(leaf.subject_public_key_info.subject_public_key);

        let mut validation = Validation::new(Algorithm::RS512);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<Claims>(token.jwt.trim(), &key, &validation)
            .map_err(|e| Rejection::SignatureInvalid(format!("usage token: {e}")))?;

        debug!(claims = ?data.claims, "verified usage token");
        Ok(data.claims)
    }
}
