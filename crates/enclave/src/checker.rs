// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, NaiveDateTime};
use reqwest::{Certificate, Client};
use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;
use usage::{Condition, Rejection};

/// The outcome of checking a usage condition.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The data may be used.
    Met,

    /// The expiration date has passed; the data must be discarded.
    Expired,

    /// The enclave is outside the permitted location.
    OutOfRegion,
}

#[derive(Deserialize)]
struct TimeResponse {
    datetime: String,
}

#[derive(Serialize)]
struct LocationRequest<'a> {
    address: &'a str,
}

#[derive(Deserialize)]
struct LocationResponse {
    #[serde(rename = "countryCode")]
    country_code: String,
}

/// Checks usage conditions against the trusted time and geolocation
/// services.
///
/// The services' trust anchor only exists on disk for the duration of a
/// call.
#[derive(Clone, Debug)]
pub struct ConditionChecker {
    time_url: String,
    location_url: String,
    anchor: String,
    address: String,
    timeout: Duration,
}

impl ConditionChecker {
    pub fn new(
        time_url: impl Into<String>,
        location_url: impl Into<String>,
        anchor: impl Into<String>,
        address: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            time_url: time_url.into(),
            location_url: location_url.into(),
            anchor: anchor.into(),
            address: address.into(),
            timeout,
        }
    }

    /// Checks the expiration date first, then the location.
    pub async fn check(&self, condition: &Condition) -> Result<Verdict, Rejection> {
        if let Some(expiration) = condition.expiration_date {
            let today = self.trusted_date().await?;
            if today > expiration {
                debug!(%today, %expiration, "usage period is over");
                return Ok(Verdict::Expired);
            }
        }

        if let Some(location) = condition.location.as_deref() {
            let country = self.country_code().await?;
            if country != location {
                debug!(country, location, "outside the permitted location");
                return Ok(Verdict::OutOfRegion);
            }
        }

        Ok(Verdict::Met)
    }

    /// Today's date according to the trusted time service.
    pub async fn trusted_date(&self) -> Result<NaiveDate, Rejection> {
        let response: TimeResponse = self
            .call(|client| client.get(&self.time_url).send())
            .await?;

        let stamp = response.datetime.get(..19).unwrap_or(&response.datetime);
        NaiveDateTime::parse_from_str(stamp, "%Y-%m-%dT%H:%M:%S")
            .map(|now| now.date())
            .map_err(|e| {
                Rejection::UpstreamUnavailable(format!("malformed trusted time {stamp:?}: {e}"))
            })
    }

    /// The enclave's country according to the trusted geolocation service.
    pub async fn country_code(&self) -> Result<String, Rejection> {
        let request = LocationRequest {
            address: &self.address,
        };

        let response: LocationResponse = self
            .call(|client| client.post(&self.location_url).json(&request).send())
            .await?;
        Ok(response.country_code)
    }

    async fn call<T, F, R>(&self, send: F) -> Result<T, Rejection>
    where
        T: for<'de> Deserialize<'de>,
        F: FnOnce(Client) -> R,
        R: Future<Output = reqwest::Result<reqwest::Response>>,
    {
        let unavailable = |e: anyhow::Error| Rejection::UpstreamUnavailable(format!("{e:#}"));

        let anchor = stage(self.anchor.clone()).await.map_err(unavailable)?;
        let pem = tokio::fs::read(&anchor)
            .await
            .context("failed to read trust anchor")
            .map_err(unavailable)?;

        let result = async {
            let client = Client::builder()
                .tls_built_in_root_certs(false)
                .add_root_certificate(Certificate::from_pem(&pem)?)
                .timeout(self.timeout)
                .build()?;

            send(client).await?.error_for_status()?.json::<T>().await
        }
        .await;

        unstage(anchor).await.map_err(unavailable)?;
        result.map_err(|e| unavailable(e.into()))
    }
}

/// Writes the trust anchor to a fresh temporary file.
async fn stage(pem: String) -> anyhow::Result<TempPath> {
    tokio::task::spawn_blocking(move || {
        let mut file = NamedTempFile::new()?;
        file.write_all(pem.as_bytes())?;
        Ok::<_, std::io::Error>(file.into_temp_path())
    })
    .await
    .context("failed to stage trust anchor")?
    .context("failed to stage trust anchor")
}

async fn unstage(path: TempPath) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || path.close())
        .await
        .context("failed to remove trust anchor")?
        .context("failed to remove trust anchor")
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ANCHOR: &str = include_str!("../../../testdata/ca.crt");

    async fn services(now: &str, country: &str) -> MockServer {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/time"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "datetime": now })))
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/location"))
            .and(body_json(json!({"address": "10.0.0.1"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "countryCode": country })),
            )
            .mount(&server)
            .await;

        server
    }

    fn checker(server: &MockServer) -> ConditionChecker {
        ConditionChecker::new(
            format!("{}/time", server.uri()),
            format!("{}/location", server.uri()),
            ANCHOR,
            "10.0.0.1",
            Duration::from_secs(5),
        )
    }

    fn condition(location: Option<&str>, expiration: Option<&str>) -> Condition {
        Condition {
            counter: None,
            location: location.map(String::from),
            expiration_date: expiration.map(|s| s.parse().unwrap()),
        }
    }

    #[rstest]
    #[case(None, None, Verdict::Met)]
    #[case(None, Some("2030-01-01"), Verdict::Met)]
    #[case(None, Some("2024-06-01"), Verdict::Met)]
    #[case(None, Some("2024-05-31"), Verdict::Expired)]
    #[case(Some("JP"), None, Verdict::Met)]
    #[case(Some("US"), None, Verdict::OutOfRegion)]
    #[case(Some("US"), Some("2024-05-31"), Verdict::Expired)]
    #[tokio::test]
    async fn verdicts(
        #[case] location: Option<&str>,
        #[case] expiration: Option<&str>,
        #[case] expected: Verdict,
    ) {
        let server = services("2024-06-01T23:59:59.123456+09:00", "JP").await;
        let verdict = checker(&server)
            .check(&condition(location, expiration))
            .await
            .unwrap();
        assert_eq!(verdict, expected);
    }

    #[tokio::test]
    async fn unrestricted_needs_no_services() {
        let server = MockServer::start().await;
        let verdict = checker(&server)
            .check(&Condition::default())
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Met);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = checker(&server)
            .check(&condition(None, Some("2030-01-01")))
            .await;
        assert!(matches!(result, Err(Rejection::UpstreamUnavailable(..))));
    }

    #[tokio::test]
    async fn malformed_time() {
        let server = services("yesterday", "JP").await;
        let result = checker(&server).trusted_date().await;
        assert!(matches!(result, Err(Rejection::UpstreamUnavailable(..))));
    }

    #[tokio::test]
    async fn anchor_only_exists_during_a_call() {
        let staged = stage(ANCHOR.into()).await.unwrap();
        let path = staged.to_path_buf();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), ANCHOR);

        unstage(staged).await.unwrap();
        assert!(!path.exists());
    }
}
