// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::iter::Peekable;
use std::str::Chars;

use anyhow::{anyhow, bail, ensure, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use percent_encoding::percent_decode_str;

const SIGNATURE: &str = "x-iasreport-signature";
const CERTIFICATE: &str = "x-iasreport-signing-certificate";
const END_CERTIFICATE: &str = "-----END CERTIFICATE-----";

/// Response headers of the attestation service that travel with a report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Headers {
    /// The decoded report signature.
    pub signature: Vec<u8>,

    /// The decoded signing certificate chain in PEM form, leaf first.
    pub certificates: String,
}

impl Headers {
    /// Parses the header mapping as carried in a certificate extension.
    ///
    /// The mapping may be a JSON object or a Python-style dictionary
    /// literal with single-quoted strings. Header names are matched
    /// case-insensitively.
    pub fn parse(text: &str) -> Result<Self> {
        let map = match serde_json::from_str::<BTreeMap<String, String>>(text) {
            Ok(map) => map,
            Err(..) => parse_literal(text)?,
        };
        let map: BTreeMap<String, String> = map
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();

        let signature = map
            .get(SIGNATURE)
            .ok_or_else(|| anyhow!("missing {SIGNATURE} header"))?;
        let signature = STANDARD
            .decode(signature.trim())
            .context("report signature is not base64")?;

        let certificates = map
            .get(CERTIFICATE)
            .ok_or_else(|| anyhow!("missing {CERTIFICATE} header"))?;
        let certificates = percent_decode_str(certificates)
            .decode_utf8()
            .context("signing certificate is not UTF-8")?
            .into_owned();

        Ok(Self {
            signature,
            certificates,
        })
    }

    /// The PEM text of the signing certificate: everything up to the
    /// first certificate terminator.
    pub fn signing_certificate(&self) -> Result<&str> {
        let end = self
            .certificates
            .find(END_CERTIFICATE)
            .ok_or_else(|| anyhow!("no signing certificate"))?;
        Ok(&self.certificates[..end + END_CERTIFICATE.len()])
    }
}

/// Parses a flat dictionary literal of string keys and string values.
fn parse_literal(text: &str) -> Result<BTreeMap<String, String>> {
    let mut chars = text.trim().chars().peekable();
    let mut map = BTreeMap::new();

    ensure!(chars.next() == Some('{'), "expected a dictionary literal");
    loop {
        skip_whitespace(&mut chars);
        if chars.peek() == Some(&'}') {
            chars.next();
            break;
        }

        let key = parse_string(&mut chars)?;
        skip_whitespace(&mut chars);
        ensure!(chars.next() == Some(':'), "expected `:` after {key:?}");
        skip_whitespace(&mut chars);
        let value = parse_string(&mut chars)?;
        map.insert(key, value);

        skip_whitespace(&mut chars);
        match chars.next() {
            Some(',') => continue,
            Some('}') => break,
            other => bail!("unexpected {other:?} in dictionary literal"),
        }
    }

    ensure!(
        chars.all(char::is_whitespace),
        "trailing characters after dictionary literal"
    );
    Ok(map)
}

fn skip_whitespace(chars: &mut Peekable<Chars<'_>>) {
    while chars.next_if(|c| c.is_whitespace()).is_some() {}
}

fn parse_string(chars: &mut Peekable<Chars<'_>>) -> Result<String> {
    let quote = match chars.next() {
        Some(q @ ('\'' | '"')) => q,
        other => bail!("expected a quoted string, found {other:?}"),
    };

    let mut out = String::new();
    loop {
        match chars.next() {
            None => bail!("unterminated string"),
            Some(c) if c == quote => return Ok(out),
            Some('\\') => match chars.next() {
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some('t') => out.push('\t'),
                Some(c @ ('\\' | '\'' | '"')) => out.push(c),
                Some('x') => {
                    let hex: String = chars.by_ref().take(2).collect();
                    let code = u32::from_str_radix(&hex, 16)?;
                    out.push(char::from_u32(code).ok_or_else(|| anyhow!("invalid escape"))?);
                }
                other => bail!("unsupported escape {other:?}"),
            },
            Some(c) => out.push(c),
        }
    }
}
