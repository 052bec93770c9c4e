// SPDX-FileCopyrightText: 2022 Profian Inc. <opensource@profian.com>
// SPDX-License-Identifier: Apache-2.0

mod cert;
mod spki;
mod verifier;

pub use self::cert::{read_certificates, TbsCertificateExt, TrustAnchor};
pub use self::spki::{Hash, Scheme, SubjectPublicKeyInfoExt};
pub use self::verifier::SignatureVerifier;
