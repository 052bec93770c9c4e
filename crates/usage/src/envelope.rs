// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

//! Transport of issued tokens from the consumer to the enclave.
//!
//! Two encodings are understood. The line encoding has one `jwt,cert`
//! line per token, with the newlines of the PEM certificate escaped as
//! `\n`. The JSON encoding is an array of `{"jwt": .., "cert": ..}`
//! objects.

use crate::error::Rejection;
use crate::token::IssuedToken;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

const ESCAPED_NEWLINE: &str = "\\n";

/// Splits a token blob into its tokens.
///
/// Each element stands for one requested input, so a malformed line only
/// fails its own element.
pub fn decode(blob: &str) -> Vec<Result<IssuedToken, Rejection>> {
    let trimmed = blob.trim();
    if trimmed.starts_with('[') {
        return match serde_json::from_str::<Vec<IssuedToken>>(trimmed) {
            Ok(tokens) => tokens.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(malformed(format!("token array: {e}")))],
        };
    }

    blob.lines()
        .filter(|line| !line.trim().is_empty())
        .map(decode_line)
        .collect()
}

fn malformed(reason: String) -> Rejection {
    Rejection::SignatureInvalid(format!("malformed {reason}"))
}

fn decode_line(line: &str) -> Result<IssuedToken, Rejection> {
    let (jwt, cert) = line
        .trim()
        .split_once(',')
        .ok_or_else(|| malformed("token line".into()))?;

    let mut cert = cert.replace(ESCAPED_NEWLINE, "\n");
    if !cert.ends_with('\n') {
        cert.push('\n');
    }

    Ok(IssuedToken {
        jwt: jwt.trim().into(),
        cert,
    })
}

/// Encodes one token as a line.
pub fn encode_line(token: &IssuedToken) -> String {
    let cert = token.cert.trim_end().replace('\n', ESCAPED_NEWLINE);
    format!("{},{}\n", token.jwt, cert)
}

/// Encodes tokens in the line encoding.
pub fn encode_lines(tokens: &[IssuedToken]) -> String {
    tokens.iter().map(encode_line).collect()
}

/// Encodes tokens in the JSON encoding.
pub fn encode_json(tokens: &[IssuedToken]) -> Result<String> {
    serde_json::to_string(tokens).context("failed to encode tokens")
}

/// Appends a token to a token file in the line encoding.
pub fn append(path: impl AsRef<Path>, token: &IssuedToken) -> Result<()> {
    let path = path.as_ref();
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open token file {}", path.display()))?;

    file.write_all(encode_line(token).as_bytes())
        .with_context(|| format!("failed to write token file {}", path.display()))
}
