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

//! Small signed packages for tests.
//!
//! The packages are v2 and v3 signed with a randomly generated RSA key and
//! carry no certificates, which is enough for [SchemeVerifier](crate::SchemeVerifier)
//! but NOT for `apksigner` or a device.

use std::{
    io::{Cursor, Write},
    sync::OnceLock
};

use chpack_common::*;
use chpack_zip::{find_eocd, patch_cd_offset};
use deku::DekuContainerWrite;
use rand::thread_rng;
use rsa::{pkcs8::EncodePublicKey, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::{
    id_values::{SigningBlockIdValuePair, SigningBlockPairs},
    signing_block::{
        SigningBlock, APK_SIGNATURE_SCHEME_V2_BLOCK_ID, APK_SIGNATURE_SCHEME_V3_BLOCK_ID
    },
    signing_types::{
        self, len_pfx_list, len_pfx_u32, raw_bytes, Signature, SignatureAlgorithmId,
        SignatureSchemeV2Block, SignatureSchemeV3Block, SignedData, Signer, U32LengthPrefixed,
        V3SignedData, V3Signer
    },
    verify::digest::{compute_content_digest, ContentLayout}
};

// Small keys keep test runs fast
const FIXTURE_KEY_BITS: usize = 1024;
pub const FIXTURE_MIN_SDK: u32 = 24;
pub const FIXTURE_MAX_SDK: u32 = 0x7FFFFFFF;

pub const FIXTURE_ENTRIES: &[(&str, &[u8])] = &[
    ("AndroidManifest.xml", b"<manifest package=\"com.example.fixture\"/>"),
    ("classes.dex", b"dex\n035\0fixture bytecode"),
    ("res/raw/notes.txt", b"fixture resource")
];

pub struct FixtureKeys {
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey
}

impl FixtureKeys {
    pub fn generate() -> Result<FixtureKeys> {
        let private_key = RsaPrivateKey::new(&mut thread_rng(), FIXTURE_KEY_BITS)
            .map_err(|err| ChpackError::FixtureSigningFailed(err.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(FixtureKeys {
            private_key,
            public_key
        })
    }

    pub fn pub_key_as_der(&self) -> Result<Vec<u8>> {
        let der = self
            .public_key
            .to_public_key_der()
            .map_err(|err| ChpackError::FixtureSigningFailed(err.to_string()))?;
        Ok(der.as_ref().to_vec())
    }

    fn sign(&self, signed_data: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(signed_data);
        let padding = Pkcs1v15Sign::new::<Sha256>();
        self.private_key
            .sign(padding, &digest)
            .map_err(|err| ChpackError::FixtureSigningFailed(err.to_string()))
    }
}

static KEYS: OnceLock<FixtureKeys> = OnceLock::new();

/// Keys shared by every fixture in the process. Generating them is slow.
pub fn fixture_keys() -> Result<&'static FixtureKeys> {
    if let Some(keys) = KEYS.get() {
        return Ok(keys);
    }
    let keys = FixtureKeys::generate()?;
    Ok(KEYS.get_or_init(|| keys))
}

/// A ZIP archive of stored (uncompressed) entries.
pub fn unsigned_zip(entries: &[(&str, &[u8])]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(vec![]));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, data) in entries {
        writer.start_file(*name, options)?;
        writer.write_all(data)?;
    }
    Ok(writer.finish()?.into_inner())
}

/// Inserts an APK Signing Block with v2 and v3 signatures before the Central
/// Directory of `zip`.
pub fn sign_zip(zip: &[u8], keys: &FixtureKeys) -> Result<Vec<u8>> {
    let eocd = find_eocd(&mut Cursor::new(zip))?;
    let cd_start = eocd.cd_offset();
    // The block will start where the Central Directory does now, so hashing the
    // unsigned ZIP gives the same digest as hashing the signed one
    let layout = ContentLayout {
        signing_block_start: cd_start,
        cd_start,
        eocd_start: eocd.offset,
        file_len: eocd.file_len
    };
    let digest = compute_content_digest::<Sha256, _>(&mut Cursor::new(zip), &layout)?;
    let public_key = keys.pub_key_as_der()?;

    let v2_block = v2_block(&digest, &public_key, keys)?;
    let v3_block = v3_block(&digest, &public_key, keys)?;
    let block = SigningBlock::new(
        cd_start,
        SigningBlockPairs {
            pairs: vec![
                SigningBlockIdValuePair {
                    id: APK_SIGNATURE_SCHEME_V2_BLOCK_ID,
                    value: v2_block
                },
                SigningBlockIdValuePair {
                    id: APK_SIGNATURE_SCHEME_V3_BLOCK_ID,
                    value: v3_block
                }
            ]
        }
    );

    let split = cd_start as usize;
    let mut signed = zip[..split].to_vec();
    signed.extend(block.to_bytes()?);
    signed.extend(&zip[split..]);
    let mut cursor = Cursor::new(&mut signed);
    patch_cd_offset(&mut cursor, eocd.offset + block.total_len(), block.end())?;
    Ok(signed)
}

/// [FIXTURE_ENTRIES] zipped and signed with [fixture_keys].
pub fn signed_apk() -> Result<Vec<u8>> {
    sign_zip(&unsigned_zip(FIXTURE_ENTRIES)?, fixture_keys()?)
}

type Digests = U32LengthPrefixed<Vec<U32LengthPrefixed<signing_types::Digest>>>;

fn digests(digest: &[u8]) -> Result<Digests> {
    len_pfx_list(vec![signing_types::Digest {
        signature_algorithm_id: SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_256,
        digest: len_pfx_u32(digest.to_vec())?
    }])
}

fn signatures(
    keys: &FixtureKeys,
    signed_data: &[u8]
) -> Result<U32LengthPrefixed<Vec<U32LengthPrefixed<Signature>>>> {
    len_pfx_list(vec![Signature {
        signature_algorithm_id: SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_256,
        signature: len_pfx_u32(keys.sign(signed_data)?)?
    }])
}

fn v2_block(digest: &[u8], public_key: &[u8], keys: &FixtureKeys) -> Result<Vec<u8>> {
    let signed_data = SignedData {
        digests: digests(digest)?,
        certificates: len_pfx_list(vec![])?,
        additional_attributes: 0
    };
    let signer = Signer {
        signatures: signatures(keys, &raw_bytes(&signed_data)?)?,
        signed_data: len_pfx_u32(signed_data)?,
        public_key: len_pfx_u32(public_key.to_vec())?
    };
    Ok(SignatureSchemeV2Block {
        signers: len_pfx_list(vec![signer])?
    }
    .to_bytes()?)
}

fn v3_block(digest: &[u8], public_key: &[u8], keys: &FixtureKeys) -> Result<Vec<u8>> {
    let signed_data = V3SignedData {
        digests: digests(digest)?,
        certificates: len_pfx_list(vec![])?,
        min_sdk: FIXTURE_MIN_SDK,
        max_sdk: FIXTURE_MAX_SDK,
        additional_attributes: 0
    };
    let signer = V3Signer {
        signatures: signatures(keys, &raw_bytes(&signed_data)?)?,
        signed_data: len_pfx_u32(signed_data)?,
        min_sdk: FIXTURE_MIN_SDK,
        max_sdk: FIXTURE_MAX_SDK,
        public_key: len_pfx_u32(public_key.to_vec())?
    };
    Ok(SignatureSchemeV3Block {
        signers: len_pfx_list(vec![signer])?
    }
    .to_bytes()?)
}
