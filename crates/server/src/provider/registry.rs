// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

//! Lookup of registered processing programs.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};
use usage::{ProcessingSpec, Rejection};

/// Where the inputs and outputs of a processing program are registered.
#[async_trait]
pub trait Registry: Send + Sync + std::fmt::Debug {
    async fn processing_spec(&self, app_id: &str) -> Result<ProcessingSpec, Rejection>;
}

#[derive(Deserialize)]
struct Registration {
    #[serde(rename = "Input")]
    input: Option<String>,

    #[serde(rename = "Output")]
    output: Option<String>,
}

fn split(list: Option<String>) -> Vec<String> {
    list.map(|l| {
        l.split(", ")
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    })
    .unwrap_or_default()
}

/// A set of registry replicas queried over HTTP, which must all agree.
#[derive(Clone, Debug)]
pub struct HttpRegistry {
    urls: Vec<String>,
    client: Client,
}

impl HttpRegistry {
    pub fn new(urls: Vec<String>, timeout: Duration) -> anyhow::Result<Self> {
        anyhow::ensure!(!urls.is_empty(), "no registry configured");
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { urls, client })
    }

    async fn query(&self, url: &str, app_id: &str) -> Result<ProcessingSpec, Rejection> {
        let unavailable = |e: reqwest::Error| {
            Rejection::UpstreamUnavailable(format!("registry {url}: {e}"))
        };

        let registration: Registration = self
            .client
            .get(url)
            .query(&[("MRENCLAVE", app_id)])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(unavailable)?
            .json()
            .await
            .map_err(unavailable)?;

        Ok(ProcessingSpec {
            app_id: app_id.into(),
            input: split(registration.input),
            output: split(registration.output),
        })
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn processing_spec(&self, app_id: &str) -> Result<ProcessingSpec, Rejection> {
        let start = Instant::now();

        let mut answers = Vec::with_capacity(self.urls.len());
        for url in &self.urls {
            let answer = self.query(url, app_id).await?;
            debug!(url, input = ?answer.input, output = ?answer.output, "registry answered");
            answers.push(answer);
        }

        info!(
            app_id,
            registries = self.urls.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "looked up processing spec"
        );

        let (spec, others) = answers
            .split_first()
            .ok_or_else(|| Rejection::UpstreamUnavailable("no registry configured".into()))?;
        if others.iter().any(|other| other != spec) {
            return Err(Rejection::UpstreamUnavailable(format!(
                "registry disagreement on {app_id}"
            )));
        }
        Ok(spec.clone())
    }
}
