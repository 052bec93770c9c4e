// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

//! The data provider service.
//!
//! Consumers apply for data with a signed usage declaration and receive a
//! usage token. Attested enclaves then fetch the data under the saved terms.

mod apply;
mod data;
pub mod registry;
pub mod store;

pub use registry::{HttpRegistry, Registry};
pub use store::{Grant, Store};

use crate::{health, traced, Failure, ForwardedCertificate, PeerCertificate};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use attestation::crypto::TrustAnchor;
use attestation::ias::{Attested, Ias};
use axum::extract::Extension;
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use tracing::debug;
use usage::{ProvidingPolicy, Rejection, TokenIssuer};

fn timeout() -> u64 {
    10
}

/// Remote attestation settings, the `[ias]` section of the config file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AttestationConfig {
    /// Root certificate of the attestation report signers (PEM).
    pub root: PathBuf,

    #[serde(default, flatten)]
    pub policy: attestation::ias::config::Config,
}

/// Provider configuration, the `[provider]` section of the config file.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The host name data IDs are minted under.
    pub host: String,

    /// The provider certificate embedded in issued tokens (PEM).
    pub crt: PathBuf,

    /// The key tokens are signed with (PEM).
    pub key: PathBuf,

    /// Root certificate for client certificates (PEM).
    pub roots: PathBuf,

    /// SQLite database of providing policies and saved terms.
    pub database: PathBuf,

    /// Directory holding `<type>/<id>.json` data files.
    pub data_dir: PathBuf,

    /// Registry replicas of processing programs.
    pub registries: Vec<String>,

    /// Providing policies loaded at startup (JSON array).
    pub policies: Option<PathBuf>,

    /// Per-call timeout for registries, in seconds.
    #[serde(default = "timeout")]
    pub timeout: u64,
}

#[derive(Debug)]
pub struct State {
    host: String,
    roots: TrustAnchor,
    ias: Ias,
    issuer: TokenIssuer,
    store: Store,
    registry: Arc<dyn Registry>,
    data_dir: PathBuf,
}

impl State {
    pub fn load(config: &Config, attestation: &AttestationConfig) -> anyhow::Result<Self> {
        let crt = std::fs::read_to_string(&config.crt)
            .with_context(|| format!("failed to read {}", config.crt.display()))?;
        let key = usage::load_rsa_key(&config.key)?;

        let ias_root = TrustAnchor::load(&attestation.root).context("invalid attestation root")?;
        let registry = HttpRegistry::new(
            config.registries.clone(),
            Duration::from_secs(config.timeout),
        )?;

        let state = Self::new(
            &config.host,
            TrustAnchor::load(&config.roots).context("invalid client root")?,
            Ias::new(ias_root, attestation.policy.clone()),
            TokenIssuer::new(&key, crt)?,
            Store::open(&config.database).context("failed to open database")?,
            Arc::new(registry),
            &config.data_dir,
        );

        if let Some(path) = &config.policies {
            let policies = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let policies: Vec<ProvidingPolicy> =
                serde_json::from_slice(&policies).context("failed to parse policies")?;
            state.store.replace_policies(&policies)?;
            debug!(count = policies.len(), "loaded providing policies");
        }

        Ok(state)
    }

    pub fn new(
        host: impl Into<String>,
        roots: TrustAnchor,
        ias: Ias,
        issuer: TokenIssuer,
        store: Store,
        registry: Arc<dyn Registry>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            roots,
            ias,
            issuer,
            store,
            registry,
            data_dir: data_dir.into(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Authenticates a client and validates any attestation evidence in
    /// its certificate.
    ///
    /// Returns the client's common name.
    fn attest(&self, peer: &PeerCertificate) -> Result<(String, Option<Attested>), Failure> {
        let subject = peer.subject(&self.roots)?;
        let attested = self.ias.verify(&peer.certificate()?).map_err(|e| {
            Rejection::AttestationRejected(format!("{e:#}"))
        })?;

        debug!(subject, attested = attested.is_some(), "client authenticated");
        Ok((subject, attested))
    }
}

pub fn app(state: State, forwarded: Option<HeaderName>) -> Router {
    let router = Router::new()
        .route("/", get(health))
        .route("/apply", post(apply::apply))
        .route("/data/:type/:id", get(data::data))
        .layer(Extension(Arc::new(state)));

    let router = match forwarded {
        Some(name) => router.layer(Extension(ForwardedCertificate(name))),
        None => router,
    };

    traced(router)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::tests::testdata::*;

    use async_trait::async_trait;
    use attestation::crypto::read_certificates;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Mutex;
    use usage::{ProcessingSpec, Terms};

    pub const DATA_ID: &str = "https://provider.example/data/personal/1";

    /// Answers every lookup with a fixed processing spec.
    #[derive(Debug, Default)]
    pub struct StaticRegistry {
        pub spec: ProcessingSpec,
        pub lookups: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Registry for StaticRegistry {
        async fn processing_spec(&self, app_id: &str) -> Result<ProcessingSpec, Rejection> {
            self.lookups.lock().unwrap().push(app_id.into());
            Ok(ProcessingSpec {
                app_id: app_id.into(),
                ..self.spec.clone()
            })
        }
    }

    pub fn policy(counter: Option<u32>) -> ProvidingPolicy {
        ProvidingPolicy {
            provider: "provider.example".into(),
            data_type: "personal".into(),
            data_id: DATA_ID.into(),
            consumers: vec![],
            app_ids: vec![],
            disclosing: vec!["personal.age".into()],
            terms: Terms {
                counter,
                ..Default::default()
            },
        }
    }

    pub fn state(registry: Arc<dyn Registry>, data_dir: &std::path::Path) -> State {
        let key = usage::read_rsa_key(PROVIDER_KEY.as_bytes()).unwrap();
        State::new(
            "provider.example",
            TrustAnchor::read(CA_CRT.as_bytes()).unwrap(),
            Ias::new(
                TrustAnchor::read(IAS_ROOT_CRT.as_bytes()).unwrap(),
                Default::default(),
            ),
            TokenIssuer::new(&key, PROVIDER_CRT).unwrap(),
            Store::memory().unwrap(),
            registry,
            data_dir,
        )
    }

    pub fn registry() -> Arc<StaticRegistry> {
        Arc::new(StaticRegistry {
            spec: ProcessingSpec {
                app_id: String::new(),
                input: vec!["personal_1".into()],
                output: vec!["personal_1.age".into()],
            },
            ..Default::default()
        })
    }

    pub fn peer(pem: &str) -> PeerCertificate {
        PeerCertificate(read_certificates(pem.as_bytes()).unwrap().swap_remove(0))
    }

    #[test]
    fn config() {
        let config: Config = toml::from_str(
            r#"
            host = "provider.example"
            crt = "provider.crt"
            key = "provider.key"
            roots = "ca.crt"
            database = "provider.db"
            data_dir = "data"
            registries = ["https://registry.example/app"]
            "#,
        )
        .unwrap();
        assert_eq!(config.timeout, 10);
        assert_eq!(config.policies, None);

        let ias: AttestationConfig = toml::from_str(
            r#"
            root = "ias_root.crt"
            allow_debug = false
            "#,
        )
        .unwrap();
        assert!(!ias.policy.allow_debug);
        assert_eq!(ias.policy.rejected_statuses.len(), 5);
    }

    #[test]
    fn attest() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(registry(), dir.path());

        let (subject, attested) = state.attest(&peer(CONSUMER_CRT)).unwrap();
        assert_eq!(subject, "alice");
        assert_eq!(attested, None);

        let (subject, attested) = state.attest(&peer(ENCLAVE_CRT)).unwrap();
        assert_eq!(subject, "alice");
        assert_eq!(attested.unwrap().mrenclave.to_string(), MRENCLAVE);

        let failure = state.attest(&peer(ENCLAVE_REVOKED_CRT)).unwrap_err();
        assert!(failure.description().starts_with("attestation rejected"));
    }

    #[tokio::test]
    async fn health() {
        use tower::ServiceExt;

        crate::tests::TRACING.call_once(crate::init_tracing);
        let dir = tempfile::tempdir().unwrap();
        let app = app(state(registry(), dir.path()), None);

        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
