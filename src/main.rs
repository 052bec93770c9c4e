// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

#![warn(rust_2018_idioms, unused_lifetimes, unused_qualifications, clippy::all)]

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::http::HeaderName;
use clap::{Parser, Subcommand};
use confargs::{prefix_char_filter, Toml};
use serde::Deserialize;
use vddpi_enclave::Echo;
use vddpi_server::provider::AttestationConfig;
use vddpi_server::{enclave, init_tracing, provider};

/// Sections of the configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    ias: Option<AttestationConfig>,
    provider: Option<provider::Config>,
    enclave: Option<vddpi_enclave::Config>,
}

impl Config {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let config = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&config).context("failed to parse config")
    }
}

#[derive(Clone, Debug, Subcommand)]
enum Service {
    /// Issue usage tokens and release data to attested enclaves.
    Provider,

    /// Redeem usage tokens and run the processing function.
    Enclave,
}

/// Attested, policy-gated data exchange.
///
/// Any command-line options can be provided by a TOML file given as an
/// argument prefixed with '@'.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Configuration file with `[ias]`, `[provider]` and `[enclave]` sections.
    #[arg(short, long, env = "VDDPI_CONFIG")]
    config: PathBuf,

    #[arg(long, env = "VDDPI_ADDRESS", default_value = "::")]
    addr: IpAddr,

    #[arg(long, env = "VDDPI_PORT", default_value = "3000")]
    port: u16,

    /// Request header carrying the URL-encoded client certificate, set by
    /// the TLS terminator.
    #[arg(long, env = "VDDPI_CLIENT_CERT_HEADER")]
    client_cert_header: Option<HeaderName>,

    #[command(subcommand)]
    service: Service,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = confargs::args::<Toml>(prefix_char_filter::<'@'>)
        .context("Failed to parse config")
        .map(Args::parse_from)?;
    let config = Config::load(&args.config)?;

    let app = match args.service {
        Service::Provider => {
            let ias = config
                .ias
                .as_ref()
                .ok_or_else(|| anyhow!("missing [ias] section"))?;
            let provider = config
                .provider
                .as_ref()
                .ok_or_else(|| anyhow!("missing [provider] section"))?;
            let state = provider::State::load(provider, ias)?;
            provider::app(state, args.client_cert_header)
        }

        Service::Enclave => {
            let enclave = config
                .enclave
                .as_ref()
                .ok_or_else(|| anyhow!("missing [enclave] section"))?;
            let state = enclave::State::load(enclave, Arc::new(Echo))?;
            enclave::app(state, args.client_cert_header)
        }
    };

    let addr = SocketAddr::from((args.addr, args.port));
    tracing::debug!("listening on {}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
