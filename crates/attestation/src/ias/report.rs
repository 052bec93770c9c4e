// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use std::io;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use serde_json::Value;

/// The typed fields of an attestation verification report.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fields {
    pub id: String,
    pub timestamp: String,
    pub version: u32,
    pub isv_enclave_quote_status: String,
    pub isv_enclave_quote_body: String,

    #[serde(default, rename = "advisoryIDs")]
    pub advisory_ids: Vec<String>,

    #[serde(default, rename = "advisoryURL")]
    pub advisory_url: Option<String>,
}

/// An attestation verification report.
///
/// The report is kept as the parsed JSON document, in its original key
/// order, because the report signature covers its canonical rendering
/// rather than the bytes that happened to be transported.
#[derive(Clone, Debug, PartialEq)]
pub struct Report {
    document: Value,
    fields: Fields,
}

impl Report {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let document: Value =
            serde_json::from_slice(bytes).context("attestation report is not JSON")?;
        let fields = Fields::deserialize(&document).context("malformed attestation report")?;
        Ok(Self { document, fields })
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn status(&self) -> &str {
        &self.fields.isv_enclave_quote_status
    }

    /// The decoded `isvEnclaveQuoteBody`.
    pub fn quote(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.fields.isv_enclave_quote_body)
            .context("quote body is not base64")
    }

    /// The bytes the report signature is computed over.
    ///
    /// This is the document re-serialized in the signer's canonical form:
    /// keys in document order, `", "` and `": "` separators, and every
    /// non-ASCII character escaped as `\uXXXX`.
    pub fn canonical(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut ser = serde_json::Serializer::with_formatter(&mut out, Canonical);
        self.document.serialize(&mut ser)?;
        Ok(out)
    }
}

struct Canonical;

impl Formatter for Canonical {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, w: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            w.write_all(b", ")
        }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, w: &mut W, first: bool) -> io::Result<()> {
        if first {
            Ok(())
        } else {
            w.write_all(b", ")
        }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, w: &mut W) -> io::Result<()> {
        w.write_all(b": ")
    }

    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        w: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        if fragment.is_ascii() {
            return w.write_all(fragment.as_bytes());
        }

        let mut units = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() {
                w.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut units) {
                    write!(w, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}
