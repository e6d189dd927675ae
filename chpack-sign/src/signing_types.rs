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

// Types involved in the APK Signature Scheme v2 and v3, as they are written.
// Reading goes through the validating parsers in `id_values`, `signing_block`
// and `verify::scheme` instead, which report where a structure is broken.
use chpack_common::*;
use deku::prelude::*;

use crate::id_values::SigningBlockIdValuePair;

// Named according to the APK Signature Scheme v2 doc

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct ApkSigningBlock {
    // Size of this structure MINUS this field!
    // This field appears twice, the 'minus' is only for one of them.
    // So if the structure is 128 bytes, this reads 120, NOT 112.
    pub size_of_self_not_counted: u64,
    pub pairs: Vec<U64LengthPrefixed<SigningBlockIdValuePair>>,
    pub size_of_self_counted: u64,
    pub magic: [u8; 16]
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct SignatureSchemeV2Block {
    pub signers: U32LengthPrefixed<Vec<U32LengthPrefixed<Signer>>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct SignatureSchemeV3Block {
    pub signers: U32LengthPrefixed<Vec<U32LengthPrefixed<V3Signer>>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct Signer {
    pub signed_data: U32LengthPrefixed<SignedData>,
    pub signatures: U32LengthPrefixed<Vec<U32LengthPrefixed<Signature>>>,
    // SubjectPublicKeyInfo, ASN.1 DER form
    pub public_key: U32LengthPrefixed<Vec<u8>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct V3Signer {
    pub signed_data: U32LengthPrefixed<V3SignedData>,

    pub min_sdk: u32,
    pub max_sdk: u32,

    pub signatures: U32LengthPrefixed<Vec<U32LengthPrefixed<Signature>>>,
    // SubjectPublicKeyInfo, ASN.1 DER form
    pub public_key: U32LengthPrefixed<Vec<u8>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct Signature {
    pub signature_algorithm_id: SignatureAlgorithmId,
    pub signature: U32LengthPrefixed<Vec<u8>>
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct SignedData {
    pub digests: U32LengthPrefixed<Vec<U32LengthPrefixed<Digest>>>,
    // Array of X.509 Certificates (ASN.1 DER form) as bytes
    pub certificates: U32LengthPrefixed<Vec<U32LengthPrefixed<Vec<u8>>>>,
    // Length-prefixed list of attributes, none are written
    pub additional_attributes: u32
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct V3SignedData {
    pub digests: U32LengthPrefixed<Vec<U32LengthPrefixed<Digest>>>,
    // Array of X.509 Certificates (ASN.1 DER form) as bytes
    pub certificates: U32LengthPrefixed<Vec<U32LengthPrefixed<Vec<u8>>>>,
    pub min_sdk: u32,
    pub max_sdk: u32,
    pub additional_attributes: u32
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct Digest {
    pub signature_algorithm_id: SignatureAlgorithmId,
    pub digest: U32LengthPrefixed<Vec<u8>>
}

#[derive(Debug, PartialEq, Eq, DekuWrite, Clone, Copy)]
#[deku(id_type = "u32")]
pub enum SignatureAlgorithmId {
    #[deku(id = 0x0103)]
    RsaSsaPkcs1v1_5WithSha2_256,
    #[deku(id = 0x0104)]
    RsaSsaPkcs1v1_5WithSha2_512
}

impl SignatureAlgorithmId {
    pub fn from_id(id: u32) -> Option<SignatureAlgorithmId> {
        match id {
            0x0103 => Some(SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_256),
            0x0104 => Some(SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_512),
            _ => None
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_256 => 0x0103,
            SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_512 => 0x0104
        }
    }
}

// Helper structures

// Outer APK Signing Block structures use u64 lengths
#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct U64LengthPrefixed<T: DekuWriter> {
    pub length: u64,
    pub value: T
}
// The "Integrity-protected contents" block uses u32 lengths
#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct U32LengthPrefixed<T: DekuWriter> {
    pub length: u32,
    pub value: T
}

#[derive(Debug, PartialEq, DekuWrite, Clone)]
pub struct RawWrapper<T: DekuWriter> {
    pub value: T
}

/// Serialises anything deku can write, without a length prefix.
pub fn raw_bytes<T: DekuWriter + Clone>(thing: &T) -> Result<Vec<u8>> {
    let wrap = RawWrapper {
        value: thing.clone()
    };
    Ok(wrap.to_bytes()?)
}

// Constructs length-prefixed things
pub fn len_pfx_u32<T: DekuWriter + Clone>(thing: T) -> Result<U32LengthPrefixed<T>> {
    Ok(U32LengthPrefixed {
        length: raw_bytes(&thing)?.len() as u32,
        value: thing
    })
}

pub fn len_pfx_u64<T: DekuWriter + Clone>(thing: T) -> Result<U64LengthPrefixed<T>> {
    Ok(U64LengthPrefixed {
        length: raw_bytes(&thing)?.len() as u64,
        value: thing
    })
}

/// Length-prefixes every item, then the list as a whole.
pub fn len_pfx_list<T: DekuWriter + Clone>(
    items: Vec<T>
) -> Result<U32LengthPrefixed<Vec<U32LengthPrefixed<T>>>> {
    let items = items
        .into_iter()
        .map(len_pfx_u32)
        .collect::<Result<Vec<_>>>()?;
    len_pfx_u32(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_count_the_value_only() {
        let prefixed = len_pfx_u32(vec![1u8, 2, 3]).unwrap();
        assert_eq!(prefixed.length, 3);
        assert_eq!(raw_bytes(&prefixed).unwrap(), [3, 0, 0, 0, 1, 2, 3]);

        let pair = SigningBlockIdValuePair {
            id: 0x7a786b21,
            value: b"zxk".to_vec()
        };
        let prefixed = len_pfx_u64(pair).unwrap();
        assert_eq!(prefixed.length, 7);
        assert_eq!(
            raw_bytes(&prefixed).unwrap(),
            [7, 0, 0, 0, 0, 0, 0, 0, 0x21, 0x6b, 0x78, 0x7a, b'z', b'x', b'k']
        );
    }

    #[test]
    fn lists_are_prefixed_twice() {
        let list = len_pfx_list(vec![vec![0xAAu8], vec![]]).unwrap();
        assert_eq!(
            raw_bytes(&list).unwrap(),
            [9, 0, 0, 0, 1, 0, 0, 0, 0xAA, 0, 0, 0, 0]
        );
        assert_eq!(raw_bytes(&len_pfx_list::<Vec<u8>>(vec![]).unwrap()).unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn algorithm_ids() {
        let sha512 = SignatureAlgorithmId::RsaSsaPkcs1v1_5WithSha2_512;
        assert_eq!(raw_bytes(&sha512).unwrap(), [0x04, 0x01, 0, 0]);
        assert_eq!(SignatureAlgorithmId::from_id(sha512.id()), Some(sha512));
        assert_eq!(SignatureAlgorithmId::from_id(0x0201), None);
    }
}
