// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

//! The client certificate of a mutually authenticated connection.
//!
//! TLS is terminated in front of the services. The terminator either
//! inserts the DER client certificate into the request extensions, or
//! forwards it as a URL-encoded PEM in a header named by
//! [`ForwardedCertificate`].

use crate::Failure;

use attestation::crypto::{read_certificates, TbsCertificateExt, TrustAnchor};
use axum::async_trait;
use axum::extract::{FromRequest, RequestParts};
use axum::http::HeaderName;
use der::Decode;
use percent_encoding::percent_decode_str;
use tracing::debug;
use usage::Rejection;
use x509::Certificate;

/// The DER client certificate of the connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCertificate(pub Vec<u8>);

/// The header carrying the client certificate, if the TLS terminator
/// forwards it.
#[derive(Clone, Debug)]
pub struct ForwardedCertificate(pub HeaderName);

impl PeerCertificate {
    /// Decodes a URL-encoded PEM certificate.
    pub fn from_forwarded(value: &str) -> anyhow::Result<Self> {
        let pem = percent_decode_str(value).decode_utf8()?;
        let mut certs = read_certificates(pem.as_bytes())?;
        Ok(Self(certs.swap_remove(0)))
    }

    pub fn certificate(&self) -> Result<Certificate<'_>, Failure> {
        Certificate::from_der(&self.0).map_err(|e| {
            debug!("malformed client certificate: {e}");
            Failure::unauthorized("malformed client certificate")
        })
    }

    /// Checks that the certificate was issued by `anchor` and returns its
    /// common name.
    pub fn subject(&self, anchor: &TrustAnchor) -> Result<String, Failure> {
        let cert = [self.certificate()?];
        let tbs = anchor.trusted(&cert).map_err(|e| {
            Rejection::AttestationRejected(format!("untrusted client certificate: {e:#}"))
        })?;
        tbs.common_name()
            .map_err(|e| Failure::from(Rejection::AttestationRejected(format!("{e:#}"))))
    }
}

#[async_trait]
impl<B: Send> FromRequest<B> for PeerCertificate {
    type Rejection = Failure;

    async fn from_request(req: &mut RequestParts<B>) -> Result<Self, Self::Rejection> {
        if let Some(cert) = req.extensions().get::<PeerCertificate>() {
            return Ok(cert.clone());
        }

        let header = req
            .extensions()
            .get::<ForwardedCertificate>()
            .and_then(|ForwardedCertificate(name)| req.headers().get(name));

        let value = match header {
            Some(value) => value,
            None => return Err(Failure::unauthorized("client certificate required")),
        };

        value
            .to_str()
            .map_err(anyhow::Error::from)
            .and_then(Self::from_forwarded)
            .map_err(|e| {
                debug!("malformed forwarded certificate: {e:#}");
                Failure::unauthorized("malformed client certificate")
            })
    }
}
