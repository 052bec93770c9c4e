// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use anyhow::Context;
use reqwest::{Certificate, Client, Identity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use usage::{Condition, Rejection};

/// Data as released by a provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Acquired {
    pub data: Value,
    pub condition: Condition,
}

/// Fetches data from providers over mutually authenticated TLS.
#[derive(Clone, Debug)]
pub struct ProviderClient {
    client: Client,
}

impl ProviderClient {
    /// Creates a client presenting `identity` (PEM certificate and key)
    /// that trusts providers certified by `roots` (PEM).
    pub fn new(identity: &[u8], roots: &[u8], timeout: Duration) -> anyhow::Result<Self> {
        let identity = Identity::from_pem(identity).context("invalid client identity")?;
        let roots = Certificate::from_pem_bundle(roots).context("invalid provider roots")?;

        let client = roots
            .into_iter()
            .fold(Client::builder(), |builder, root| builder.add_root_certificate(root))
            .tls_built_in_root_certs(false)
            .identity(identity)
            .timeout(timeout)
            .build()
            .context("failed to create provider client")?;

        Ok(Self { client })
    }

    /// Fetches the data item `data_id`, which is the URL of the item.
    pub async fn acquire(&self, data_id: &str) -> Result<Acquired, Rejection> {
        let unavailable = |e: reqwest::Error| {
            Rejection::UpstreamUnavailable(format!("failed to receive {data_id}: {e}"))
        };

        let response = self
            .client
            .get(data_id)
            .query(&[("data_id", data_id)])
            .send()
            .await
            .map_err(unavailable)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Rejection::UpstreamUnavailable(format!(
                "failed to receive {data_id}: {status} {text}"
            )));
        }

        let acquired: Acquired = response.json().await.map_err(unavailable)?;
        debug!(data_id, condition = ?acquired.condition, "received data");
        Ok(acquired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ROOTS: &str = include_str!("../../../testdata/ca.crt");
    const CRT: &str = include_str!("../../../testdata/enclave.crt");
    const KEY: &str = include_str!("../../../testdata/enclave.key");

    fn client() -> ProviderClient {
        let identity = format!("{CRT}{KEY}");
        ProviderClient::new(identity.as_bytes(), ROOTS.as_bytes(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn acquire() {
        let server = MockServer::start().await;
        let data_id = format!("{}/data/personal/1", server.uri());

        Mock::given(method("GET"))
            .and(path("/data/personal/1"))
            .and(query_param("data_id", data_id.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {"age": 30},
                "condition": {"counter": 5, "location": "", "expirationDate": "2030-01-01"},
            })))
            .mount(&server)
            .await;

        let acquired = client().acquire(&data_id).await.unwrap();
        assert_eq!(acquired.data, json!({"age": 30}));
        assert_eq!(acquired.condition.counter, Some(5));
        assert_eq!(acquired.condition.location, None);
    }

    #[tokio::test]
    async fn refused() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string("no saved policy"))
            .mount(&server)
            .await;

        let data_id = format!("{}/data/personal/1", server.uri());
        match client().acquire(&data_id).await {
            Err(Rejection::UpstreamUnavailable(reason)) => assert!(reason.contains("no saved policy")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let data_id = format!("{}/data/personal/1", server.uri());
        assert!(client().acquire(&data_id).await.is_err());
    }

    #[test]
    fn invalid_identity() {
        assert!(ProviderClient::new(b"", ROOTS.as_bytes(), Duration::from_secs(5)).is_err());
    }
}
