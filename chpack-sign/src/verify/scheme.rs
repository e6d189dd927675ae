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

// APK Signature Scheme v2 based on https://source.android.com/docs/security/features/apksigning/v2
// APK Signature Scheme v3 based on https://source.android.com/docs/security/features/apksigning/v3

use std::{fs::File, path::Path};

use chpack_common::*;
use rsa::{pkcs8::DecodePublicKey, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};
use tracing::debug;

use super::{
    digest::{compute_content_digest, ContentLayout},
    Scheme, SchemeResult, VerificationReport, Verifier
};
use crate::{
    signing_block::{
        locate_signing_block, APK_SIGNATURE_SCHEME_V2_BLOCK_ID, APK_SIGNATURE_SCHEME_V3_BLOCK_ID
    },
    signing_types::SignatureAlgorithmId
};

/// Verifies the v2 and v3 blocks of a package without any external tools.
///
/// Only RSASSA-PKCS1-v1_5 signatures are understood. Signers using other
/// algorithms (ECDSA, DSA, RSA-PSS) are reported as not verified, as are
/// packages without an APK Signing Block. Certificates are not inspected: the
/// signature is checked against the public key stored next to it.
#[derive(Debug, Default, Clone)]
pub struct SchemeVerifier;

impl Verifier for SchemeVerifier {
    fn verify(&self, path: &Path) -> Result<VerificationReport> {
        let mut file = File::open(path)?;
        let mut report = VerificationReport::default();
        let (eocd, block) = match locate_signing_block(&mut file) {
            Ok(located) => located,
            Err(err) if err.is_format_error() => {
                report.errors.push(err.to_string());
                return Ok(report);
            }
            Err(err) => return Err(err)
        };
        let Some(block) = block else {
            report.errors.push("No APK Signing Block".into());
            return Ok(report);
        };

        let mut digests = ContentDigests {
            file: &mut file,
            layout: ContentLayout {
                signing_block_start: block.start,
                cd_start: eocd.cd_offset(),
                eocd_start: eocd.offset,
                file_len: eocd.file_len
            },
            computed: vec![]
        };
        for (scheme, id) in [
            (Scheme::V2, APK_SIGNATURE_SCHEME_V2_BLOCK_ID),
            (Scheme::V3, APK_SIGNATURE_SCHEME_V3_BLOCK_ID)
        ] {
            let Some(scheme_block) = block.pairs.get(id) else {
                continue;
            };
            let verified = match verify_scheme_block(scheme, scheme_block, &mut digests)? {
                Outcome::Verified => true,
                Outcome::Rejected(reason) => {
                    report.errors.push(format!("{scheme}: {reason}"));
                    false
                }
            };
            debug!(%scheme, verified, "checked signature scheme block");
            report.schemes.push(SchemeResult { scheme, verified });
        }
        if report.schemes.is_empty() {
            report
                .errors
                .push("APK Signing Block has no v2 or v3 signatures".into());
        }
        Ok(report)
    }
}

enum Outcome {
    Verified,
    Rejected(String)
}

impl SignatureAlgorithmId {
    fn verify(&self, key: &RsaPublicKey, signed_data: &[u8], signature: &[u8]) -> bool {
        let result = match self {
            SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_256 => key.verify(
                Pkcs1v15Sign::new::<Sha256>(),
                &Sha256::digest(signed_data),
                signature
            ),
            SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_512 => key.verify(
                Pkcs1v15Sign::new::<Sha512>(),
                &Sha512::digest(signed_data),
                signature
            )
        };
        result.is_ok()
    }
}

// Content digests are expensive so each algorithm's is only computed once per file
struct ContentDigests<'f> {
    file: &'f mut File,
    layout: ContentLayout,
    computed: Vec<(SignatureAlgorithmId, Vec<u8>)>
}

impl ContentDigests<'_> {
    fn get(&mut self, algorithm: SignatureAlgorithmId) -> Result<Vec<u8>> {
        if let Some((_, digest)) = self.computed.iter().find(|(alg, _)| *alg == algorithm) {
            return Ok(digest.clone());
        }
        let digest = match algorithm {
            SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_256 => {
                compute_content_digest::<Sha256, _>(self.file, &self.layout)?
            }
            SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_512 => {
                compute_content_digest::<Sha512, _>(self.file, &self.layout)?
            }
        };
        self.computed.push((algorithm, digest.clone()));
        Ok(digest)
    }
}

/// Reads the u32 length-prefixed structures used inside scheme blocks.
struct Fields<'a> {
    buf: &'a [u8]
}

impl<'a> Fields<'a> {
    fn new(buf: &'a [u8]) -> Fields<'a> {
        Fields { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn u32(&mut self) -> Option<u32> {
        let (head, rest) = self.buf.split_first_chunk::<4>()?;
        self.buf = rest;
        Some(u32::from_le_bytes(*head))
    }

    fn prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.u32()? as usize;
        if len > self.buf.len() {
            return None;
        }
        let (value, rest) = self.buf.split_at(len);
        self.buf = rest;
        Some(value)
    }

    /// A length-prefixed run of length-prefixed items.
    fn sequence(&mut self) -> Option<Vec<&'a [u8]>> {
        let mut items = Fields::new(self.prefixed()?);
        let mut out = vec![];
        while !items.is_empty() {
            out.push(items.prefixed()?);
        }
        Some(out)
    }
}

struct SignedData<'a> {
    digests: Vec<(u32, &'a [u8])>,
    sdk_range: Option<(u32, u32)>
}

struct Signer<'a> {
    signed_data_bytes: &'a [u8],
    signed_data: SignedData<'a>,
    sdk_range: Option<(u32, u32)>,
    signatures: Vec<(u32, &'a [u8])>,
    public_key: &'a [u8]
}

fn parse_algorithm_pairs(items: Vec<&[u8]>) -> Option<Vec<(u32, &[u8])>> {
    items
        .into_iter()
        .map(|item| {
            let mut fields = Fields::new(item);
            Some((fields.u32()?, fields.prefixed()?))
        })
        .collect()
}

fn parse_signer(scheme: Scheme, bytes: &[u8]) -> Option<Signer<'_>> {
    let mut fields = Fields::new(bytes);
    let signed_data_bytes = fields.prefixed()?;
    let sdk_range = match scheme {
        Scheme::V3 => Some((fields.u32()?, fields.u32()?)),
        _ => None
    };
    let signatures = parse_algorithm_pairs(fields.sequence()?)?;
    let public_key = fields.prefixed()?;

    let mut data = Fields::new(signed_data_bytes);
    let digests = parse_algorithm_pairs(data.sequence()?)?;
    let _certificates = data.sequence()?;
    let signed_sdk_range = match scheme {
        Scheme::V3 => Some((data.u32()?, data.u32()?)),
        _ => None
    };
    let _additional_attributes = data.prefixed()?;

    Some(Signer {
        signed_data_bytes,
        signed_data: SignedData {
            digests,
            sdk_range: signed_sdk_range
        },
        sdk_range,
        signatures,
        public_key
    })
}

fn verify_scheme_block(
    scheme: Scheme,
    block: &[u8],
    digests: &mut ContentDigests
) -> Result<Outcome> {
    let Some(signers) = Fields::new(block).sequence() else {
        return Ok(Outcome::Rejected("malformed signer list".into()));
    };
    if signers.is_empty() {
        return Ok(Outcome::Rejected("no signers".into()));
    }
    for (index, signer_bytes) in signers.into_iter().enumerate() {
        let Some(signer) = parse_signer(scheme, signer_bytes) else {
            return Ok(Outcome::Rejected(format!("malformed signer #{index}")));
        };
        if let Outcome::Rejected(reason) = verify_signer(&signer, digests)? {
            return Ok(Outcome::Rejected(format!("signer #{index}: {reason}")));
        }
    }
    Ok(Outcome::Verified)
}

fn verify_signer(signer: &Signer, digests: &mut ContentDigests) -> Result<Outcome> {
    let Some((algorithm, signature)) = signer
        .signatures
        .iter()
        .find_map(|(id, sig)| SignatureAlgorithmId::from_id(*id).map(|alg| (alg, *sig)))
    else {
        let ids: Vec<String> = signer
            .signatures
            .iter()
            .map(|(id, _)| format!("{id:#06x}"))
            .collect();
        return Ok(Outcome::Rejected(format!(
            "no supported signature algorithm in [{}]",
            ids.join(", ")
        )));
    };

    let Ok(key) = RsaPublicKey::from_public_key_der(signer.public_key) else {
        return Ok(Outcome::Rejected("public key is not an RSA key".into()));
    };
    if !algorithm.verify(&key, signer.signed_data_bytes, signature) {
        return Ok(Outcome::Rejected("signature did not verify".into()));
    }

    // Signed data must list a digest for exactly the algorithms that were signed with
    let signature_ids: Vec<u32> = signer.signatures.iter().map(|(id, _)| *id).collect();
    let digest_ids: Vec<u32> = signer.signed_data.digests.iter().map(|(id, _)| *id).collect();
    if signature_ids != digest_ids {
        return Ok(Outcome::Rejected(
            "signature and digest algorithm lists differ".into()
        ));
    }
    if signer.sdk_range != signer.signed_data.sdk_range {
        return Ok(Outcome::Rejected(
            "SDK range differs from the signed SDK range".into()
        ));
    }

    let Some((_, expected)) = signer
        .signed_data
        .digests
        .iter()
        .find(|(id, _)| *id == algorithm.id())
    else {
        return Ok(Outcome::Rejected("no digest for the signature algorithm".into()));
    };
    if digests.get(algorithm)? != *expected {
        return Ok(Outcome::Rejected("content digest mismatch".into()));
    }
    Ok(Outcome::Verified)
}
