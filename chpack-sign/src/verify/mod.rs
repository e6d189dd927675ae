// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Signature verification is a collaborator of channel writing: after a
//! channel has been written, the package must still verify under every scheme
//! it verified under before.

use std::{fmt, path::Path, str::FromStr};

use chpack_common::Result;

mod apksigner;
pub mod digest;
mod scheme;

pub use apksigner::ApksignerVerifier;
pub use scheme::SchemeVerifier;

/// APK signature scheme generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    /// Signed JAR files (META-INF)
    V1,
    V2,
    V3
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::V1 => write!(f, "v1"),
            Scheme::V2 => write!(f, "v2"),
            Scheme::V3 => write!(f, "v3")
        }
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Scheme, String> {
        match value.to_ascii_lowercase().as_str() {
            "v1" => Ok(Scheme::V1),
            "v2" => Ok(Scheme::V2),
            "v3" => Ok(Scheme::V3),
            _ => Err(format!("unknown signature scheme {value:?}, expected v1, v2 or v3"))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchemeResult {
    pub scheme: Scheme,
    pub verified: bool
}

/// Outcome of verifying one package.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VerificationReport {
    pub schemes: Vec<SchemeResult>,
    pub errors: Vec<String>
}

impl VerificationReport {
    /// Verified overall: at least one scheme verified and nothing went wrong.
    pub fn verified(&self) -> bool {
        self.errors.is_empty() && self.schemes.iter().any(|result| result.verified)
    }

    pub fn verified_using(&self, scheme: Scheme) -> bool {
        self.schemes
            .iter()
            .any(|result| result.scheme == scheme && result.verified)
    }

    /// Verified overall and under every one of `required`.
    pub fn verified_with(&self, required: &[Scheme]) -> bool {
        self.verified() && required.iter().all(|scheme| self.verified_using(*scheme))
    }

    pub fn verified_schemes(&self) -> Vec<Scheme> {
        self.schemes
            .iter()
            .filter(|result| result.verified)
            .map(|result| result.scheme)
            .collect()
    }
}

/// Anything that can tell whether a package's signatures are intact.
pub trait Verifier {
    fn verify(&self, path: &Path) -> Result<VerificationReport>;
}
