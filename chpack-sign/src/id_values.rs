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

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use chpack_common::*;
use deku::prelude::*;

use crate::signing_types::{len_pfx_u64, raw_bytes, U64LengthPrefixed};

// Length (u64) + ID (u32)
const PAIR_HEADER_SIZE: usize = 12;

/// One entry of the APK Signing Block.
///
/// On disk: `u64 length || u32 id || value`, where length counts the ID and
/// the value but not itself.
#[derive(Debug, PartialEq, Eq, DekuWrite, Clone)]
pub struct SigningBlockIdValuePair {
    pub id: u32,
    pub value: Vec<u8>
}

/// The entries of an APK Signing Block, in file order.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct SigningBlockPairs {
    pub pairs: Vec<SigningBlockIdValuePair>
}

impl SigningBlockPairs {
    /// Walks `region` (the bytes between the two size fields) entry by entry.
    pub fn decode(region: &[u8]) -> Result<SigningBlockPairs> {
        let mut pairs = vec![];
        let mut pos = 0;
        while pos < region.len() {
            let remaining = region.len() - pos;
            if remaining < 8 {
                return Err(ChpackError::IdValueEntryInvalid {
                    offset: pos,
                    declared: 0,
                    remaining
                });
            }
            let mut cursor = Cursor::new(&region[pos..]);
            let length = cursor.read_u64::<LittleEndian>()?;
            let after_length = remaining - 8;
            // The length must at least cover the ID and must not run past the region
            if length < 4 || length > after_length as u64 {
                return Err(ChpackError::IdValueEntryInvalid {
                    offset: pos,
                    declared: length,
                    remaining: after_length
                });
            }
            let id = cursor.read_u32::<LittleEndian>()?;
            let value_start = pos + PAIR_HEADER_SIZE;
            let value_end = pos + 8 + length as usize;
            pairs.push(SigningBlockIdValuePair {
                id,
                value: region[value_start..value_end].to_vec()
            });
            pos = value_end;
        }
        Ok(SigningBlockPairs { pairs })
    }

    /// The entries as they are written, each prefixed with its length.
    pub fn to_prefixed(&self) -> Result<Vec<U64LengthPrefixed<SigningBlockIdValuePair>>> {
        self.pairs.iter().cloned().map(len_pfx_u64).collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        raw_bytes(&self.to_prefixed()?)
    }

    pub fn encoded_len(&self) -> usize {
        self.pairs
            .iter()
            .map(|pair| PAIR_HEADER_SIZE + pair.value.len())
            .sum()
    }

    pub fn get(&self, id: u32) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|pair| pair.id == id)
            .map(|pair| &pair.value[..])
    }

    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    /// Replaces the value of an existing entry where it stands, otherwise
    /// appends a new entry.
    pub fn upsert(&mut self, id: u32, value: Vec<u8>) {
        match self.pairs.iter_mut().find(|pair| pair.id == id) {
            Some(pair) => pair.value = value,
            None => self.pairs.push(SigningBlockIdValuePair { id, value })
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.pairs.iter().map(|pair| pair.id)
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(entries: &[(u32, &[u8])]) -> SigningBlockPairs {
        SigningBlockPairs {
            pairs: entries
                .iter()
                .map(|(id, value)| SigningBlockIdValuePair {
                    id: *id,
                    value: value.to_vec()
                })
                .collect()
        }
    }

    #[test]
    fn encodes_length_id_value() {
        let encoded = pairs(&[(0x7109871a, b"sig")]).encode().unwrap();
        assert_eq!(
            encoded,
            [
                7, 0, 0, 0, 0, 0, 0, 0, // length = id + value
                0x1a, 0x87, 0x09, 0x71, // id
                b's', b'i', b'g'
            ]
        );
    }

    #[test]
    fn decodes_in_file_order() {
        let original = pairs(&[(0x2000, b"B"), (0x1000, b"A"), (0x3000, b"")]);
        let decoded = SigningBlockPairs::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded.ids().collect::<Vec<_>>(), [0x2000, 0x1000, 0x3000]);
        assert_eq!(decoded.get(0x1000), Some(&b"A"[..]));
        assert_eq!(decoded.get(0x3000), Some(&b""[..]));
        assert_eq!(decoded.encoded_len(), original.encode().unwrap().len());
    }

    #[test]
    fn upsert_keeps_position() {
        let mut block = pairs(&[(1, b"one"), (2, b"two")]);
        block.upsert(1, b"uno".to_vec());
        block.upsert(3, b"three".to_vec());
        assert_eq!(block.ids().collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(block.get(1), Some(&b"uno"[..]));
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn rejects_length_past_region_end() {
        let mut encoded = pairs(&[(1, b"abcd")]).encode().unwrap();
        encoded[0] = 200;
        let err = SigningBlockPairs::decode(&encoded).unwrap_err();
        assert!(matches!(
            err,
            ChpackError::IdValueEntryInvalid {
                offset: 0,
                declared: 200,
                remaining: 8
            }
        ));
        assert!(err.is_format_error());
    }

    #[test]
    fn rejects_length_shorter_than_id() {
        let mut encoded = pairs(&[(1, b"")]).encode().unwrap();
        encoded[0] = 3;
        assert!(SigningBlockPairs::decode(&encoded).is_err());
    }

    #[test]
    fn rejects_trailing_garbage() {
        let mut encoded = pairs(&[(1, b"x")]).encode().unwrap();
        encoded.extend([0, 0, 0]);
        let err = SigningBlockPairs::decode(&encoded).unwrap_err();
        assert!(matches!(
            err,
            ChpackError::IdValueEntryInvalid {
                offset: 13,
                remaining: 3,
                ..
            }
        ));
    }

    #[test]
    fn empty_region_has_no_pairs() {
        assert!(SigningBlockPairs::decode(&[]).unwrap().is_empty());
    }
}
