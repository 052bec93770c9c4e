// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use crate::error::Mismatch;
use crate::terms::Terms;

use serde::{Deserialize, Serialize};

const ANY: &str = "*";

/// The provider's access control record for one data item.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidingPolicy {
    pub provider: String,

    /// Data type tag, matched against the prefix of processing inputs.
    #[serde(rename = "type")]
    pub data_type: String,

    #[serde(rename = "data_ID")]
    pub data_id: String,

    /// Consumers the data may be provided to. Empty allows anyone.
    #[serde(default, rename = "consumer")]
    pub consumers: Vec<String>,

    /// Applications the data may be provided to. Empty allows any.
    #[serde(default, rename = "app_ID")]
    pub app_ids: Vec<String>,

    /// Output fields that may be disclosed, as `name.field`.
    #[serde(default)]
    pub disclosing: Vec<String>,

    /// Ceilings on the usage terms.
    #[serde(default, flatten)]
    pub terms: Terms,
}

fn permits(list: &[String], value: &str) -> bool {
    list.is_empty() || list.iter().any(|v| v == ANY || v == value)
}

impl ProvidingPolicy {
    pub fn permits_consumer(&self, consumer: &str) -> bool {
        permits(&self.consumers, consumer)
    }

    pub fn permits_app(&self, app_id: &str) -> bool {
        permits(&self.app_ids, app_id)
    }

    /// Checks that every output of a program may be disclosed when the
    /// data is its `arg_num`th argument.
    ///
    /// A disclosure `name.field` allows the output `name_<arg_num>.field`.
    pub fn check_disclosure(&self, outputs: &[String], arg_num: u32) -> Result<(), Mismatch> {
        let mut outputs = outputs.iter().filter(|o| !o.is_empty()).peekable();
        if outputs.peek().is_none() {
            return Ok(());
        }

        let allowed = self.disclosures(arg_num)?;
        match outputs.all(|output| allowed.contains(output)) {
            true => Ok(()),
            false => Err(Mismatch::Disclosure),
        }
    }

    fn disclosures(&self, arg_num: u32) -> Result<Vec<String>, Mismatch> {
        self.disclosing
            .iter()
            .map(|disclosure| {
                let mut parts = disclosure.split('.');
                let name = parts.next().unwrap_or_default();
                let field = parts.next().ok_or(Mismatch::DisclosureIndex)?;
                Ok(format!("{name}_{arg_num}.{field}"))
            })
            .collect()
    }
}

/// What a registered program consumes and produces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingSpec {
    #[serde(rename = "app_ID")]
    pub app_id: String,

    /// Input data types, as `type_suffix`.
    pub input: Vec<String>,

    /// Output field paths, as `name_N.field`.
    pub output: Vec<String>,
}

impl ProcessingSpec {
    /// The inputs whose data type is `data_type`.
    pub fn inputs_of<'a>(&'a self, data_type: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.input
            .iter()
            .map(String::as_str)
            .filter(move |input| input.split('_').next() == Some(data_type))
    }
}
