// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

//! Redemption of usage tokens.
//!
//! A session runs in phases. Every token is verified on its own and a bad
//! token only drops its own input. The data of the remaining tokens is read
//! from the cache or acquired from its provider, and its usage condition is
//! checked. If any condition is not met, the processing function is not run
//! for the whole session. Finally every record is either persisted with its
//! updated counter or evicted.

use crate::cache::{CacheStore, CachedRecord};
use crate::checker::{ConditionChecker, Verdict};
use crate::fetch::ProviderClient;
use crate::{Config, Processor};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use attestation::crypto::{read_certificates, TbsCertificateExt, TrustAnchor};
use chrono::{DateTime, Utc};
use der::Decode;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use usage::envelope;
use usage::{Claims, IssuedToken, Mismatch, Rejection, TokenVerifier};
use x509::Certificate;

/// The outcome of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub elapsed_ms: i64,

    /// Whether the processing function ran.
    pub processed: bool,

    /// Whether any input came from the cache.
    pub cached: bool,

    /// The output of the processing function.
    pub output: Option<String>,

    /// Why inputs were dropped, one entry per dropped input.
    pub failures: Vec<String>,
}

/// Per-session state.
struct Session<'a> {
    client_cn: &'a str,
    dn_checked: bool,
    failures: Vec<String>,
    conditions_met: bool,
    cached: bool,
}

impl<'a> Session<'a> {
    fn new(client_cn: &'a str) -> Self {
        Self {
            client_cn,
            dn_checked: false,
            failures: Vec::new(),
            conditions_met: true,
            cached: false,
        }
    }

    fn fail(&mut self, data_id: Option<&str>, rejection: Rejection) {
        match &rejection {
            Rejection::SignatureInvalid(..) | Rejection::AttestationRejected(..) => {
                warn!(data_id, %rejection, "input rejected")
            }
            Rejection::Storage(..) => error!(data_id, %rejection, "input dropped"),
            _ => info!(data_id, %rejection, "input dropped"),
        }
        self.failures.push(rejection.to_string());
    }

    /// Data is only released to the consumer the enclave was provisioned
    /// for; checked once per session.
    fn check_client(&mut self, consumer: &str) -> Result<(), Rejection> {
        if !self.dn_checked {
            if self.client_cn != consumer {
                return Err(Rejection::AttestationRejected(format!(
                    "client {} is not the enclave consumer",
                    self.client_cn
                )));
            }
            self.dn_checked = true;
        }
        Ok(())
    }
}

/// A verified token and the state of its data.
struct Input {
    claims: Claims,
    jwt: String,
    record: CachedRecord,
    usable: bool,
    consumed: bool,
}

/// Redeems usage tokens inside the enclave.
pub struct SessionProcessor {
    tokens: TokenVerifier,
    consumer: String,
    app_id: String,
    provider: ProviderClient,
    checker: ConditionChecker,
    cache: CacheStore,
    processor: Arc<dyn Processor>,
}

impl std::fmt::Debug for SessionProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProcessor")
            .field("consumer", &self.consumer)
            .field("app_id", &self.app_id)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl SessionProcessor {
    /// Loads the enclave identity and trust anchors named in `config`.
    pub fn new(config: &Config, processor: Arc<dyn Processor>) -> anyhow::Result<Self> {
        let read = |path: &PathBuf| {
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
        };

        let crt = read(&config.crt)?;
        let key = read(&config.key)?;
        let roots = read(&config.roots)?;
        let api_ca = String::from_utf8(read(&config.api_ca)?).context("invalid API anchor")?;

        // The enclave's own identity: its consumer and its measurement.
        let der = read_certificates(crt.as_slice())?.swap_remove(0);
        let cert = Certificate::from_der(&der).context("invalid identity certificate")?;
        let consumer = cert.tbs_certificate.common_name()?;
        let app_id = attestation::ias::measurement(&cert.tbs_certificate)
            .context("identity certificate is not attested")?
            .to_string();

        let identity = [crt.as_slice(), b"\n", key.as_slice()].concat();
        let provider = ProviderClient::new(&identity, &roots, config.timeout())?;
        let checker = ConditionChecker::new(
            &config.time_url,
            &config.location_url,
            api_ca,
            &config.address,
            config.timeout(),
        );

        Ok(Self {
            tokens: TokenVerifier::new(TrustAnchor::read(roots.as_slice())?),
            consumer,
            app_id,
            provider,
            checker,
            cache: CacheStore::new(&config.cache_dir)?,
            processor,
        })
    }

    /// The measurement tokens must have been issued for.
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// The consumer the enclave serves.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Runs a session for the client `client_cn` over the token blob
    /// `tokens`.
    ///
    /// Only a failure of the processing function fails the session as a
    /// whole; dropped inputs are listed in the report.
    pub async fn request(&self, client_cn: &str, tokens: &str) -> Result<SessionReport, Rejection> {
        let start = Utc::now();
        let mut session = Session::new(client_cn);

        let mut granted = Vec::new();
        for token in envelope::decode(tokens) {
            match token.and_then(|token| self.verify(&token, client_cn).map(|c| (c, token))) {
                Ok(grant) => granted.push(grant),
                Err(rejection) => session.fail(None, rejection),
            }
        }

        let paths: Vec<_> = granted
            .iter()
            .map(|(claims, _)| self.cache.path(&claims.data_id))
            .collect();
        let _guards = self.cache.lock_all(&paths).await;

        let mut inputs = Vec::new();
        for ((claims, token), path) in granted.into_iter().zip(paths) {
            if let Some(input) = self.gather(&mut session, claims, token.jwt, path).await {
                inputs.push(input);
            }
        }

        let args = Self::arguments(&mut session, &mut inputs);

        let mut output = None;
        let mut processing = Ok(());
        if session.conditions_met && !args.is_empty() {
            match self.processor.process(&args) {
                Ok(out) => {
                    for input in inputs.iter_mut().filter(|i| i.consumed) {
                        input.record.condition.consume();
                    }
                    output = Some(out);
                }
                Err(e) => processing = Err(Rejection::Processing(format!("{e:#}"))),
            }
        }

        let mut spent = false;
        for input in &inputs {
            match self.persist(input).await {
                Ok(evicted) => spent |= evicted && input.record.condition.exhausted(),
                Err(rejection) => session.fail(Some(&input.claims.data_id), rejection),
            }
        }

        if spent {
            self.prune_spent().await;
        }

        processing?;

        let end = Utc::now();
        let report = SessionReport {
            start,
            end,
            elapsed_ms: (end - start).num_milliseconds(),
            processed: output.is_some(),
            cached: session.cached,
            output,
            failures: session.failures,
        };

        info!(
            start = %report.start.format("%Y-%m-%d %H:%M:%S"),
            end = %report.end.format("%Y-%m-%d %H:%M:%S"),
            elapsed_ms = report.elapsed_ms,
            processed = report.processed,
            cached = report.cached,
            "session finished"
        );
        Ok(report)
    }

    fn verify(&self, token: &IssuedToken, client_cn: &str) -> Result<Claims, Rejection> {
        let claims = self.tokens.verify(token)?;
        claims.check_holder(client_cn, &self.app_id)?;
        Ok(claims)
    }

    /// Reads or acquires the data of a token and checks its condition.
    async fn gather(
        &self,
        session: &mut Session<'_>,
        claims: Claims,
        jwt: String,
        path: PathBuf,
    ) -> Option<Input> {
        let data_id = claims.data_id.clone();

        let record = match self.cache.read(&path).await {
            Ok(Some(record)) => {
                if record.client_cn != session.client_cn {
                    warn!(
                        data_id = %data_id,
                        cached_for = %record.client_cn,
                        "cached data belongs to another client"
                    );
                }
                session.cached = true;
                record
            }

            Ok(None) => {
                // Used up by an earlier session; the provider would hand
                // it out again.
                if self.cache.is_spent(&jwt).await {
                    session.conditions_met = false;
                    session.fail(Some(&data_id), Mismatch::Exhausted.into());
                    return None;
                }

                // An unreachable provider only drops its own input; a
                // client that is not the enclave consumer gets nothing.
                match self.acquire(session, &data_id, path).await {
                    Ok(record) => record,
                    Err(rejection) => {
                        if matches!(rejection, Rejection::AttestationRejected(..)) {
                            session.conditions_met = false;
                        }
                        session.fail(Some(&data_id), rejection);
                        return None;
                    }
                }
            }

            Err(e) => {
                session.fail(Some(&data_id), Rejection::Storage(format!("{e:#}")));
                return None;
            }
        };

        let mut input = Input {
            claims,
            jwt,
            record,
            usable: false,
            consumed: false,
        };

        if input.record.condition.exhausted() {
            session.conditions_met = false;
            session.fail(Some(&data_id), Mismatch::Exhausted.into());
            return Some(input);
        }

        match self.checker.check(&input.record.condition).await {
            Ok(Verdict::Met) => input.usable = true,
            Ok(verdict) => {
                input.record.expired = verdict == Verdict::Expired;
                session.conditions_met = false;
                session.fail(Some(&data_id), Mismatch::Condition.into());
            }
            Err(rejection) => {
                session.conditions_met = false;
                session.fail(Some(&data_id), rejection);
            }
        }

        Some(input)
    }

    async fn acquire(
        &self,
        session: &mut Session<'_>,
        data_id: &str,
        path: PathBuf,
    ) -> Result<CachedRecord, Rejection> {
        session.check_client(&self.consumer)?;

        let acquired = self.provider.acquire(data_id).await?;
        let record = CachedRecord {
            data: acquired.data,
            condition: acquired.condition,
            path,
            client_cn: session.client_cn.into(),
            expired: false,
        };

        self.cache
            .write(&record)
            .await
            .map_err(|e| Rejection::Storage(format!("{e:#}")))?;
        Ok(record)
    }

    /// Lays out the usable inputs by `arg_num`, which must count up from 1.
    fn arguments(session: &mut Session<'_>, inputs: &mut [Input]) -> Vec<Value> {
        let mut usable: Vec<&mut Input> = inputs.iter_mut().filter(|i| i.usable).collect();
        usable.sort_by_key(|i| i.claims.arg_num);

        let mut args = Vec::new();
        for input in usable {
            if input.claims.arg_num as usize == args.len() + 1 {
                args.push(input.record.data.clone());
                input.consumed = true;
            } else {
                session.fail(Some(&input.claims.data_id), Mismatch::ArgumentNumber.into());
            }
        }

        args
    }

    /// Writes back or evicts the record of an input.
    ///
    /// Returns whether the record was evicted.
    async fn persist(&self, input: &Input) -> Result<bool, Rejection> {
        let storage = |e: anyhow::Error| Rejection::Storage(format!("{e:#}"));

        if !input.record.evictable() {
            self.cache.write(&input.record).await.map_err(storage)?;
            return Ok(false);
        }

        self.cache.remove(&input.record.path).await.map_err(storage)?;
        if input.record.condition.exhausted() {
            let expires = input.claims.terms.expiration_date;
            self.cache
                .mark_spent(&input.jwt, expires)
                .await
                .map_err(storage)?;
        }

        info!(
            data_id = %input.claims.data_id,
            expired = input.record.expired,
            "evicted cached data"
        );
        Ok(true)
    }

    /// Forgets spent tokens that are past their expiration date by the
    /// trusted clock.
    async fn prune_spent(&self) {
        let pruned = match self.checker.trusted_date().await {
            Ok(today) => self.cache.prune_spent(today).await,
            Err(rejection) => {
                debug!(%rejection, "spent tokens not pruned");
                return;
            }
        };

        match pruned {
            Ok(0) => {}
            Ok(count) => info!(count, "forgot expired spent tokens"),
            Err(e) => warn!("failed to prune spent tokens: {e:#}"),
        }
    }
}
