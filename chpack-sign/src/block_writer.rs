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

//! Reads and rewrites ID/value entries of the APK Signing Block in place.
//!
//! The APK Signing Block is the one part of a v2/v3-signed APK that isn't
//! covered by the signature, so entries can be added without re-signing. Only
//! the Central Directory offset in the EOCD has to follow the block's new size,
//! and the EOCD is hashed with that offset pointing at the block's start anyway.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path
};

use chpack_common::*;
use chpack_zip::{find_eocd, patch_cd_offset};
use tracing::debug;

use crate::{
    id_values::SigningBlockPairs,
    signing_block::{
        find_signing_block, locate_signing_block, SigningBlock, APK_SIGNATURE_SCHEME_V2_BLOCK_ID,
        RESERVED_BLOCK_IDS
    }
};

/// All ID/value entries of the file's APK Signing Block.
pub fn read_pairs(path: &Path) -> Result<SigningBlockPairs> {
    let mut file = File::open(path)?;
    let (_eocd, block) = locate_signing_block(&mut file)?;
    Ok(block.ok_or(ChpackError::BlockNotFound)?.pairs)
}

pub fn read_entry(path: &Path, id: u32) -> Result<Option<Vec<u8>>> {
    Ok(read_pairs(path)?.get(id).map(<[u8]>::to_vec))
}

/// Sets the value stored under `id`, replacing any previous value.
pub fn write_entry(path: &Path, id: u32, value: &[u8]) -> Result<()> {
    update_entry(path, id, |_old| Ok(value.to_vec()))
}

/// Read-modify-write of the entry stored under `id`.
///
/// `update` receives the current value, if any, and returns the new one. The
/// file is then rewritten in place:
///
///  1. The Central Directory, EOCD and comment are held in memory
///  2. The new block is written where the old one started
///  3. The held bytes follow it and the file is truncated to fit
///  4. The EOCD's Central Directory offset is moved by the change in block size
pub fn update_entry<F>(path: &Path, id: u32, update: F) -> Result<()>
where
    F: FnOnce(Option<&[u8]>) -> Result<Vec<u8>>
{
    if RESERVED_BLOCK_IDS.contains(&id) {
        return Err(ChpackError::ReservedId(id));
    }

    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let (eocd, block) = locate_signing_block(&mut file)?;
    let block = block.ok_or(ChpackError::BlockNotFound)?;
    // Only rewrite blocks that are known to hold a v2 signature
    if !block.pairs.contains(APK_SIGNATURE_SCHEME_V2_BLOCK_ID) {
        return Err(ChpackError::NoSignatureSchemeBlock);
    }

    let value = update(block.pairs.get(id))?;
    let mut pairs = block.pairs.clone();
    pairs.upsert(id, value);
    let new_block = SigningBlock::new(block.start, pairs);
    let new_block_bytes = new_block.to_bytes()?;

    // Central Directory + EOCD + comment are copied verbatim
    let cd_offset = eocd.cd_offset();
    let mut held = vec![0; (eocd.file_len - cd_offset) as usize];
    file.seek(SeekFrom::Start(cd_offset))?;
    file.read_exact(&mut held)?;

    file.seek(SeekFrom::Start(block.start))?;
    file.write_all(&new_block_bytes)?;
    file.write_all(&held)?;
    let new_cd_offset = new_block.end();
    file.set_len(new_cd_offset + held.len() as u64)?;

    let new_eocd_offset = new_cd_offset + (eocd.offset - cd_offset);
    patch_cd_offset(&mut file, new_eocd_offset, new_cd_offset)?;
    file.flush()?;
    debug!(
        id,
        old_size = block.total_len(),
        new_size = new_block.total_len(),
        cd = new_cd_offset,
        "rewrote APK Signing Block"
    );

    check_rewrite(&mut file, &new_block)
}

// Reading back what was just written must find the same block in the same place
fn check_rewrite(file: &mut File, expected: &SigningBlock) -> Result<()> {
    let eocd = find_eocd(file)?;
    if eocd.cd_offset() != expected.end() {
        return Err(ChpackError::BlockSizeMismatch {
            expected: expected.end(),
            actual: eocd.cd_offset()
        });
    }
    let actual = find_signing_block(file, eocd.cd_offset())?;
    match actual {
        Some(actual) if actual == *expected => Ok(()),
        Some(actual) => Err(ChpackError::BlockSizeMismatch {
            expected: expected.total_len(),
            actual: actual.total_len()
        }),
        None => Err(ChpackError::BlockSizeMismatch {
            expected: expected.total_len(),
            actual: 0
        })
    }
}
