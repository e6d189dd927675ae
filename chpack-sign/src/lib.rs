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

// APK Signing Block layout based on https://source.android.com/docs/security/features/apksigning/v2#apk-signing-block

pub mod block_writer;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod id_values;
pub mod signing_block;
pub mod signing_types;
pub mod verify;

pub use block_writer::{read_entry, read_pairs, update_entry, write_entry};
pub use id_values::{SigningBlockIdValuePair, SigningBlockPairs};
pub use signing_block::{
    find_signing_block, locate_signing_block, SigningBlock, APK_SIGNATURE_SCHEME_V2_BLOCK_ID,
    APK_SIGNATURE_SCHEME_V31_BLOCK_ID, APK_SIGNATURE_SCHEME_V3_BLOCK_ID, RESERVED_BLOCK_IDS
};
pub use verify::{
    ApksignerVerifier, Scheme, SchemeResult, SchemeVerifier, VerificationReport, Verifier
};
