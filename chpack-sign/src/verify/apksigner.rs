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

use std::{
    path::{Path, PathBuf},
    process::Command
};

use chpack_common::*;
use tracing::debug;

use super::{Scheme, SchemeResult, VerificationReport, Verifier};

/// Delegates verification to the Android SDK's `apksigner verify -v`.
///
/// This is the only verifier that covers v1 (JAR) signatures.
#[derive(Debug, Clone)]
pub struct ApksignerVerifier {
    pub program: PathBuf
}

impl Default for ApksignerVerifier {
    fn default() -> Self {
        ApksignerVerifier {
            program: PathBuf::from("apksigner")
        }
    }
}

impl ApksignerVerifier {
    pub fn new(program: impl Into<PathBuf>) -> ApksignerVerifier {
        ApksignerVerifier {
            program: program.into()
        }
    }
}

impl Verifier for ApksignerVerifier {
    fn verify(&self, path: &Path) -> Result<VerificationReport> {
        let output = Command::new(&self.program)
            .arg("verify")
            .arg("-v")
            .arg(path)
            .output()
            .map_err(|err| {
                ChpackError::VerificationFailure(format!(
                    "could not run {}: {err}",
                    self.program.display()
                ))
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(status = %output.status, "apksigner finished");

        let mut report = parse_report(&stdout, &stderr);
        if !output.status.success() && report.errors.is_empty() {
            report
                .errors
                .push(format!("apksigner exited with {}", output.status));
        }
        Ok(report)
    }
}

// Lines look like "Verified using v2 scheme (APK Signature Scheme v2): true".
// Schemes other than v1, v2 and v3 (such as v3.1 or v4) are ignored.
fn parse_report(stdout: &str, stderr: &str) -> VerificationReport {
    let mut report = VerificationReport::default();
    for line in stdout.lines().chain(stderr.lines()) {
        let line = line.trim();
        if line.starts_with("ERROR") {
            report.errors.push(line.to_string());
            continue;
        }
        let Some(rest) = line.strip_prefix("Verified using ") else {
            continue;
        };
        let Some((name, verdict)) = rest.rsplit_once(':') else {
            continue;
        };
        let scheme = match name.split_whitespace().next() {
            Some("v1") => Scheme::V1,
            Some("v2") => Scheme::V2,
            Some("v3") => Scheme::V3,
            _ => continue
        };
        report.schemes.push(SchemeResult {
            scheme,
            verified: verdict.trim() == "true"
        });
    }
    report
}
