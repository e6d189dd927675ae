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

use std::io::{Read, Seek, SeekFrom};

use chpack_common::*;
use chpack_zip::eocd::CD_OFFSET_FIELD;
use sha2::Digest;

pub const BYTES_IN_1MB: u64 = 1024 * 1024;
pub const FIRST_LEVEL_CHUNK_MAGIC: &[u8] = &[0xa5];
pub const SECOND_LEVEL_CHUNK_MAGIC: &[u8] = &[0x5a];

/// The three sections of a package covered by the v2/v3 content digest.
#[derive(Debug, Clone)]
pub struct ContentLayout {
    /// Where the APK Signing Block starts (or would start, for unsigned ZIPs)
    pub signing_block_start: u64,
    pub cd_start: u64,
    pub eocd_start: u64,
    pub file_len: u64
}

/// Computes the top-level chunked digest over everything except the APK
/// Signing Block.
pub fn compute_content_digest<D: Digest, R: Read + Seek>(
    reader: &mut R,
    layout: &ContentLayout
) -> Result<Vec<u8>> {
    // The Android Developer documentation calls these chunks 1, 3 and 4 because the
    //   APK Signing Block is chunk 2.
    let mut first_level_hashes = vec![];

    // Chunk 1: APK contents before the APK Signing Block
    reader.seek(SeekFrom::Start(0))?;
    hash_section::<D, _>(reader, layout.signing_block_start, &mut first_level_hashes)?;

    // Chunk 3: Central directories
    reader.seek(SeekFrom::Start(layout.cd_start))?;
    hash_section::<D, _>(
        reader,
        layout.eocd_start - layout.cd_start,
        &mut first_level_hashes
    )?;

    // Chunk 4: the EOCD is hashed as though the Central Directory started where
    //   the APK Signing Block does
    let mut eocd = vec![0; (layout.file_len - layout.eocd_start) as usize];
    reader.seek(SeekFrom::Start(layout.eocd_start))?;
    reader.read_exact(&mut eocd)?;
    let field = CD_OFFSET_FIELD as usize;
    eocd[field..(field + 4)].copy_from_slice(&(layout.signing_block_start as u32).to_le_bytes());
    hash_section::<D, _>(&mut &eocd[..], eocd.len() as u64, &mut first_level_hashes)?;

    let mut hasher = D::new();
    hasher.update(SECOND_LEVEL_CHUNK_MAGIC);
    hasher.update((first_level_hashes.len() as u32).to_le_bytes());
    for hash in &first_level_hashes {
        hasher.update(hash);
    }
    Ok(hasher.finalize().to_vec())
}

// Each chunk is 1MB OR whatever's left in the section
fn hash_section<D: Digest, R: Read>(
    reader: &mut R,
    len: u64,
    hashes: &mut Vec<Vec<u8>>
) -> Result<()> {
    let mut buf = vec![0; BYTES_IN_1MB.min(len) as usize];
    let mut remaining = len;
    while remaining > 0 {
        let chunk_size = BYTES_IN_1MB.min(remaining) as usize;
        let chunk = &mut buf[..chunk_size];
        reader.read_exact(chunk)?;
        let mut hasher = D::new();
        hasher.update(FIRST_LEVEL_CHUNK_MAGIC);
        hasher.update((chunk_size as u32).to_le_bytes());
        hasher.update(&chunk[..]);
        hashes.push(hasher.finalize().to_vec());
        remaining -= chunk_size as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Sha256;
    use std::io::Cursor;

    fn chunk_hash(bytes: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update([0xa5]);
        hasher.update((bytes.len() as u32).to_le_bytes());
        hasher.update(bytes);
        hasher.finalize().to_vec()
    }

    #[test]
    fn digest_matches_hand_computed_chunks() {
        let mut eocd = b"PK\x05\x06".to_vec();
        eocd.extend([0; 12]);
        eocd.extend(99u32.to_le_bytes());
        eocd.extend([0; 2]);
        let mut file = b"entries".to_vec();
        file.extend(b"BLOCK");
        file.extend(b"cd");
        file.extend(&eocd);
        let layout = ContentLayout {
            signing_block_start: 7,
            cd_start: 12,
            eocd_start: 14,
            file_len: file.len() as u64
        };

        let mut expected_eocd = eocd.clone();
        expected_eocd[16..20].copy_from_slice(&7u32.to_le_bytes());
        let mut hasher = Sha256::new();
        hasher.update([0x5a]);
        hasher.update(3u32.to_le_bytes());
        hasher.update(chunk_hash(b"entries"));
        hasher.update(chunk_hash(b"cd"));
        hasher.update(chunk_hash(&expected_eocd));

        let digest = compute_content_digest::<Sha256, _>(&mut Cursor::new(&file), &layout).unwrap();
        assert_eq!(digest, hasher.finalize().to_vec());
    }

    #[test]
    fn large_sections_are_split_into_1mb_chunks() {
        let mut hashes = vec![];
        let data = vec![1; BYTES_IN_1MB as usize + 10];
        hash_section::<Sha256, _>(&mut &data[..], data.len() as u64, &mut hashes).unwrap();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[1], chunk_hash(&[1; 10]));
    }
}
