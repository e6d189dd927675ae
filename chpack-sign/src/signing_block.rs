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

use std::io::{Cursor, Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt};
use chpack_common::*;
use chpack_zip::{find_eocd, EocdLocation};
use deku::DekuContainerWrite;
use tracing::debug;

use crate::{id_values::SigningBlockPairs, signing_types::ApkSigningBlock};

// Named according to the APK Signature Scheme v2 doc
pub const APK_SIGNING_BLOCK_MAGIC: &[u8; 16] = b"APK Sig Block 42";
pub const APK_SIGNING_BLOCK_MIN_SIZE: u64 = 32;
pub const APK_SIGNATURE_SCHEME_V2_BLOCK_ID: u32 = 0x7109871a;
pub const APK_SIGNATURE_SCHEME_V3_BLOCK_ID: u32 = 0xf05368c0;
pub const APK_SIGNATURE_SCHEME_V31_BLOCK_ID: u32 = 0x1b93ad61;
/// IDs holding signature data. Writing to these would break verification.
pub const RESERVED_BLOCK_IDS: &[u32] = &[
    APK_SIGNATURE_SCHEME_V2_BLOCK_ID,
    APK_SIGNATURE_SCHEME_V3_BLOCK_ID,
    APK_SIGNATURE_SCHEME_V31_BLOCK_ID
];

const SIZE_FIELD_LEN: u64 = 8;
// Trailing size field + magic
const FOOTER_LEN: u64 = SIZE_FIELD_LEN + 16;

/// An APK Signing Block and where it starts in the file.
///
/// ```text
/// u64 size || pairs || u64 size || "APK Sig Block 42"
/// ```
///
/// The size field is the size of the whole structure MINUS one size field.
/// The field appears twice and the 'minus' is only for one of them, so a
/// 128 byte block records 120, NOT 112.
#[derive(Debug, PartialEq, Clone)]
pub struct SigningBlock {
    // From start of file
    pub start: u64,
    pub size_of_self_not_counted: u64,
    pub pairs: SigningBlockPairs
}

impl SigningBlock {
    pub fn new(start: u64, pairs: SigningBlockPairs) -> SigningBlock {
        SigningBlock {
            start,
            size_of_self_not_counted: pairs.encoded_len() as u64 + FOOTER_LEN,
            pairs
        }
    }

    pub fn total_len(&self) -> u64 {
        self.size_of_self_not_counted + SIZE_FIELD_LEN
    }

    /// Offset just past the block, which is where the Central Directory starts.
    pub fn end(&self) -> u64 {
        self.start + self.total_len()
    }

    pub fn to_apk_signing_block(&self) -> Result<ApkSigningBlock> {
        Ok(ApkSigningBlock {
            size_of_self_not_counted: self.size_of_self_not_counted,
            pairs: self.pairs.to_prefixed()?,
            size_of_self_counted: self.size_of_self_not_counted,
            magic: *APK_SIGNING_BLOCK_MAGIC
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.to_apk_signing_block()?.to_bytes()?)
    }
}

/// Finds the APK Signing Block that ends at `cd_offset`.
///
/// Returns `None` when there's no block magic right before the Central
/// Directory. A block whose magic is present but whose sizes don't add up is
/// an error.
pub fn find_signing_block<R: Read + Seek>(
    reader: &mut R,
    cd_offset: u64
) -> Result<Option<SigningBlock>> {
    if cd_offset < APK_SIGNING_BLOCK_MIN_SIZE {
        return Ok(None);
    }

    reader.seek(SeekFrom::Start(cd_offset - FOOTER_LEN))?;
    let size_in_footer = reader.read_u64::<LittleEndian>()?;
    let mut magic = [0; 16];
    reader.read_exact(&mut magic)?;
    if &magic != APK_SIGNING_BLOCK_MAGIC {
        return Ok(None);
    }

    let total_len = size_in_footer.saturating_add(SIZE_FIELD_LEN);
    if total_len < APK_SIGNING_BLOCK_MIN_SIZE || total_len > cd_offset {
        return Err(ChpackError::SigningBlockTooSmall {
            cd_offset,
            size: size_in_footer
        });
    }
    let start = cd_offset - total_len;

    let mut block = vec![0; total_len as usize];
    reader.seek(SeekFrom::Start(start))?;
    reader.read_exact(&mut block)?;
    let size_in_header = Cursor::new(&block[..]).read_u64::<LittleEndian>()?;
    if size_in_header != size_in_footer {
        return Err(ChpackError::SigningBlockSizeMismatch {
            block_start: start,
            leading: size_in_header,
            trailing: size_in_footer
        });
    }

    let pairs_end = block.len() - FOOTER_LEN as usize;
    let pairs = SigningBlockPairs::decode(&block[(SIZE_FIELD_LEN as usize)..pairs_end])?;
    debug!(start, size = size_in_footer, pairs = pairs.len(), "found APK Signing Block");
    Ok(Some(SigningBlock {
        start,
        size_of_self_not_counted: size_in_footer,
        pairs
    }))
}

/// Locates both the EOCD and, if there is one, the APK Signing Block.
pub fn locate_signing_block<R: Read + Seek>(
    reader: &mut R
) -> Result<(EocdLocation, Option<SigningBlock>)> {
    let eocd = find_eocd(reader)?;
    let block = find_signing_block(reader, eocd.cd_offset())?;
    Ok((eocd, block))
}
