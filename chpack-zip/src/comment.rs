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

//! Channel tags stored in the ZIP comment, for packages signed only with
//! APK Signature Scheme v1 where there is no APK Signing Block to write into.
//!
//! The comment is laid out so that it can be found from the end of the file
//! without parsing the EOCD:
//!
//! ```text
//! [EOCD .. comment length][text][u16 text length][magic "!ZXK!"]
//! ```

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chpack_common::*;
use tracing::debug;

use crate::eocd::{find_eocd, MAX_COMMENT_SIZE};

pub const TAG_MAGIC: &[u8; 5] = b"!ZXK!";
pub const MARKET_PREFIX: &str = "MARKET=";
const LENGTH_FIELD_SIZE: u64 = 2;

/// Checks whether the file ends with the tag magic.
pub fn has_tag(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    tag_present(&mut file)
}

/// Appends `text` as a tagged ZIP comment.
///
/// The comment length field is written exactly once, so this refuses files that
/// already carry any comment, tagged or not.
pub fn write_tag(path: &Path, text: &str) -> Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    write_tag_to(&mut file, text)
}

/// Reads the text of a tagged ZIP comment, if the file has one.
pub fn read_tag(path: &Path) -> Result<Option<String>> {
    let mut file = File::open(path)?;
    read_tag_from(&mut file)
}

/// Tags the file with `MARKET=<market>`. Empty markets are not written.
pub fn write_market(path: &Path, market: &str) -> Result<bool> {
    if market.is_empty() {
        return Ok(false);
    }
    write_tag(path, &format!("{MARKET_PREFIX}{market}"))?;
    Ok(true)
}

pub fn read_market(path: &Path) -> Result<Option<String>> {
    Ok(read_tag(path)?.map(|comment| match comment.strip_prefix(MARKET_PREFIX) {
        Some(market) => market.to_string(),
        None => comment
    }))
}

fn tag_present<R: Read + Seek>(reader: &mut R) -> Result<bool> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    if file_len < TAG_MAGIC.len() as u64 {
        return Ok(false);
    }
    let mut magic = [0; 5];
    reader.seek(SeekFrom::End(-(TAG_MAGIC.len() as i64)))?;
    reader.read_exact(&mut magic)?;
    Ok(&magic == TAG_MAGIC)
}

pub(crate) fn write_tag_to<F: Read + Write + Seek>(file: &mut F, text: &str) -> Result<()> {
    if tag_present(file)? {
        return Err(ChpackError::AlreadyTagged);
    }
    let eocd = find_eocd(file)?;
    if eocd.comment_len() != 0 {
        return Err(ChpackError::CommentPresent(eocd.comment_len()));
    }

    let data = text.as_bytes();
    // Content + content length field + magic
    let comment_len = data.len() + LENGTH_FIELD_SIZE as usize + TAG_MAGIC.len();
    if comment_len as u64 > MAX_COMMENT_SIZE {
        return Err(ChpackError::PayloadTooLarge {
            size: comment_len,
            limit: MAX_COMMENT_SIZE as usize
        });
    }

    let mut comment = Vec::with_capacity(comment_len + LENGTH_FIELD_SIZE as usize);
    comment.write_u16::<LittleEndian>(comment_len as u16)?;
    comment.extend_from_slice(data);
    comment.write_u16::<LittleEndian>(data.len() as u16)?;
    comment.extend_from_slice(TAG_MAGIC);

    // With no comment the length field is the last two bytes of the file
    file.seek(SeekFrom::Start(eocd.comment_len_field_position()))?;
    file.write_all(&comment)?;
    file.flush()?;
    debug!(bytes = comment_len, "appended tagged ZIP comment");
    Ok(())
}

pub(crate) fn read_tag_from<R: Read + Seek>(reader: &mut R) -> Result<Option<String>> {
    if !tag_present(reader)? {
        return Ok(None);
    }
    let file_len = reader.seek(SeekFrom::End(0))?;
    let trailer_len = TAG_MAGIC.len() as u64 + LENGTH_FIELD_SIZE;
    if file_len < trailer_len {
        return Ok(None);
    }
    reader.seek(SeekFrom::Start(file_len - trailer_len))?;
    let length = reader.read_u16::<LittleEndian>()? as u64;
    // The length is untrusted, it must fit in what precedes it
    if length == 0 || length > file_len - trailer_len {
        return Ok(None);
    }
    reader.seek(SeekFrom::Start(file_len - trailer_len - length))?;
    let mut text = vec![0; length as usize];
    reader.read_exact(&mut text)?;
    Ok(Some(String::from_utf8(text)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eocd::tests::tiny_zip;
    use std::io::Cursor;

    #[test]
    fn writes_and_reads_tag() {
        let mut zip = Cursor::new(tiny_zip(b"cd", b""));
        write_tag_to(&mut zip, "beta").unwrap();
        assert_eq!(read_tag_from(&mut zip).unwrap().as_deref(), Some("beta"));

        let bytes = zip.into_inner();
        assert_eq!(&bytes[bytes.len() - 5..], TAG_MAGIC);
        // Comment length covers text, length field and magic
        let location = find_eocd(&mut Cursor::new(&bytes)).unwrap();
        assert_eq!(location.comment_len(), 4 + 2 + 5);
        assert_eq!(location.offset + 22 + 11, bytes.len() as u64);
    }

    #[test]
    fn refuses_second_tag() {
        let mut zip = Cursor::new(tiny_zip(b"cd", b""));
        write_tag_to(&mut zip, "first").unwrap();
        let err = write_tag_to(&mut zip, "second").unwrap_err();
        assert!(matches!(err, ChpackError::AlreadyTagged));
        assert_eq!(read_tag_from(&mut zip).unwrap().as_deref(), Some("first"));
    }

    #[test]
    fn refuses_existing_comment() {
        let mut zip = Cursor::new(tiny_zip(b"cd", b"built by hand"));
        let err = write_tag_to(&mut zip, "beta").unwrap_err();
        assert!(matches!(err, ChpackError::CommentPresent(13)));
    }

    #[test]
    fn untagged_file_reads_none() {
        let mut zip = Cursor::new(tiny_zip(b"cd", b""));
        assert_eq!(read_tag_from(&mut zip).unwrap(), None);
        assert!(!tag_present(&mut zip).unwrap());
    }

    #[test]
    fn oversized_length_reads_none() {
        let mut bytes = vec![0xFF, 0xFF];
        bytes.extend(TAG_MAGIC);
        assert_eq!(read_tag_from(&mut Cursor::new(bytes)).unwrap(), None);
    }

    #[test]
    fn market_prefix_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.apk");
        std::fs::write(&path, tiny_zip(b"cd", b"")).unwrap();

        assert!(!write_market(&path, "").unwrap());
        assert!(write_market(&path, "huawei").unwrap());
        assert!(has_tag(&path).unwrap());
        assert_eq!(read_tag(&path).unwrap().as_deref(), Some("MARKET=huawei"));
        assert_eq!(read_market(&path).unwrap().as_deref(), Some("huawei"));
    }
}
