// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

use crate::Digest;

use std::mem::{size_of, transmute};
use std::slice::from_raw_parts;

use anyhow::{anyhow, Result};

/// The attestation quote body as embedded in an IAS report
/// (`isvEnclaveQuoteBody`): the quote header followed by the enclave's
/// report body. All multi-byte integers are little endian.
#[repr(C)]
pub struct Body {
    version: [u8; 2],
    sign_type: [u8; 2],
    epid_group_id: [u8; 4],
    qe_svn: [u8; 2],
    pce_svn: [u8; 2],
    xeid: [u8; 4],
    basename: [u8; 32],
    cpu_svn: [u8; 16],
    misc_select: [u8; 4],
    reserved0: [u8; 28],
    flags: [u8; 8],
    xfrm: [u8; 8],
    mrenclave: [u8; 32],
    reserved1: [u8; 32],
    mrsigner: [u8; 32],
    reserved2: [u8; 96],
    isv_prod_id: [u8; 2],
    isv_svn: [u8; 2],
    reserved3: [u8; 60],
    report_data: [u8; 64],
}

impl Body {
    /// Enclave attribute bit for a debug enclave.
    pub const FLAG_DEBUG: u64 = 1 << 1;

    /// Version of the quote structure
    pub fn version(&self) -> u16 {
        u16::from_le_bytes(self.version)
    }

    pub fn flags(&self) -> u64 {
        u64::from_le_bytes(self.flags)
    }

    pub fn xfrm(&self) -> u64 {
        u64::from_le_bytes(self.xfrm)
    }

    pub fn debug(&self) -> bool {
        self.flags() & Self::FLAG_DEBUG != 0
    }

    /// Hash of the enclave code and initial data (MRENCLAVE)
    pub fn mrenclave(&self) -> Digest<32> {
        Digest(self.mrenclave)
    }

    /// Hash of the enclave signing key (MRSIGNER)
    pub fn mrsigner(&self) -> Digest<32> {
        Digest(self.mrsigner)
    }

    pub fn product_id(&self) -> u16 {
        u16::from_le_bytes(self.isv_prod_id)
    }

    pub fn security_version(&self) -> u16 {
        u16::from_le_bytes(self.isv_svn)
    }

    pub fn report_data(&self) -> &[u8; 64] {
        &self.report_data
    }
}

impl AsRef<[u8]> for Body {
    fn as_ref(&self) -> &[u8] {
        // SAFETY: `Body` is `repr(C)` and built only from byte arrays.
        unsafe { from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }
}

impl<'a> TryFrom<&'a [u8]> for &'a Body {
    type Error = anyhow::Error;

    /// Views the leading bytes of a quote as a `Body`. Trailing bytes
    /// (such as a quote signature) are ignored.
    fn try_from(bytes: &'a [u8]) -> Result<Self> {
        let body: &[u8; size_of::<Body>()] = bytes
            .get(..size_of::<Body>())
            .ok_or_else(|| anyhow!("quote body too short: {} bytes", bytes.len()))?
            .try_into()?;

        // SAFETY: `Body` has alignment 1 and the same size as the array.
        Ok(unsafe { transmute(body) })
    }
}
