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

use std::io::{Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use chpack_common::*;
use deku::prelude::*;
use tracing::debug;

pub const EOCD_MAGIC: &[u8; 4] = &[0x50, 0x4B, 0x05, 0x06];
pub const ZIP64_LOCATOR_MAGIC: &[u8; 4] = &[0x50, 0x4B, 0x06, 0x07];
/// Size of the End Of Central Directory record without its comment
pub const EOCD_SIZE: u64 = 22;
pub const ZIP64_LOCATOR_SIZE: u64 = 20;
pub const MAX_COMMENT_SIZE: u64 = 0xFFFF;
/// Offsets of fields within the record
pub const CD_OFFSET_FIELD: u64 = 16;
pub const COMMENT_LEN_FIELD: u64 = 20;

// Offset  Bytes  Description
// 0       4      End of central directory signature = 0x06054b50
// 4       2      Number of this disk
// 6       2      Disk where central directory starts
// 8       2      Number of central directory records on this disk
// 10      2      Total number of central directory records
// 12      4      Size of central directory (bytes)
// 16      4      Offset of start of central directory, relative to start of archive
// 20      2      Comment length (n)
// 22      n      Comment
#[derive(Debug, PartialEq, DekuRead, DekuWrite, Clone)]
#[deku(endian = "little", magic = b"PK\x05\x06")]
pub struct EocdRecord {
    pub disk_number: u16,
    pub cd_disk: u16,
    pub cd_records_on_disk: u16,
    pub cd_records_total: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16
}

/// Where the End Of Central Directory record sits in a file, plus its contents.
#[derive(Debug, Clone)]
pub struct EocdLocation {
    // From start of file
    pub offset: u64,
    pub file_len: u64,
    pub record: EocdRecord
}

impl EocdLocation {
    /// Start of the Central Directory, as recorded in the EOCD.
    pub fn cd_offset(&self) -> u64 {
        self.record.cd_offset as u64
    }

    pub fn comment_len(&self) -> u16 {
        self.record.comment_len
    }

    pub fn cd_offset_field_position(&self) -> u64 {
        self.offset + CD_OFFSET_FIELD
    }

    pub fn comment_len_field_position(&self) -> u64 {
        self.offset + COMMENT_LEN_FIELD
    }
}

/// Finds the End Of Central Directory record by scanning backwards from the end
/// of the file.
///
/// The comment can hold arbitrary bytes, so a signature match only counts if the
/// comment length recorded right after it accounts for exactly the rest of the
/// file. The candidate closest to the end of the file wins.
pub fn find_eocd<R: Read + Seek>(reader: &mut R) -> Result<EocdLocation> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    if file_len < EOCD_SIZE {
        return Err(ChpackError::EocdNotFound);
    }

    let search_len = (MAX_COMMENT_SIZE + EOCD_SIZE).min(file_len);
    let search_start = file_len - search_len;
    let mut buf = vec![0; search_len as usize];
    reader.seek(SeekFrom::Start(search_start))?;
    reader.read_exact(&mut buf)?;

    let last_candidate = buf.len() - EOCD_SIZE as usize;
    for i in (0..=last_candidate).rev() {
        if &buf[i..(i + 4)] != EOCD_MAGIC {
            continue;
        }
        let comment_len = u16::from_le_bytes([buf[i + 20], buf[i + 21]]) as usize;
        if i + EOCD_SIZE as usize + comment_len != buf.len() {
            continue;
        }
        let (_rest, record) = EocdRecord::from_bytes((&buf[i..(i + EOCD_SIZE as usize)], 0))?;
        let offset = search_start + i as u64;
        // A Central Directory starting after its own EOCD means this was a stray match
        if record.cd_offset as u64 > offset {
            continue;
        }
        if record.cd_offset == u32::MAX || zip64_locator_present(reader, &buf, i, offset)? {
            return Err(ChpackError::Zip64Unsupported);
        }
        debug!(
            eocd = offset,
            cd = record.cd_offset,
            comment = record.comment_len,
            "found EOCD"
        );
        return Ok(EocdLocation {
            offset,
            file_len,
            record
        });
    }

    Err(ChpackError::EocdNotFound)
}

fn zip64_locator_present<R: Read + Seek>(
    reader: &mut R,
    buf: &[u8],
    index_in_buf: usize,
    eocd_offset: u64
) -> Result<bool> {
    if eocd_offset < ZIP64_LOCATOR_SIZE {
        return Ok(false);
    }
    let locator_len = ZIP64_LOCATOR_SIZE as usize;
    if index_in_buf >= locator_len {
        let start = index_in_buf - locator_len;
        return Ok(&buf[start..(start + 4)] == ZIP64_LOCATOR_MAGIC);
    }
    // The locator straddles the search window, read it directly
    let mut magic = [0; 4];
    reader.seek(SeekFrom::Start(eocd_offset - ZIP64_LOCATOR_SIZE))?;
    reader.read_exact(&mut magic)?;
    Ok(&magic == ZIP64_LOCATOR_MAGIC)
}

/// Overwrites the Central Directory offset stored in the EOCD at `eocd_offset`.
pub fn patch_cd_offset<W: Write + Seek>(
    writer: &mut W,
    eocd_offset: u64,
    new_cd_offset: u64
) -> Result<()> {
    let new_cd_offset = u32::try_from(new_cd_offset).map_err(|_| ChpackError::Zip64Unsupported)?;
    writer.seek(SeekFrom::Start(eocd_offset + CD_OFFSET_FIELD))?;
    writer.write_u32::<LittleEndian>(new_cd_offset)?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// A ZIP archive with no entries: `prefix` bytes of filler as the "Central
    /// Directory" then an EOCD pointing at it.
    pub(crate) fn tiny_zip(prefix: &[u8], comment: &[u8]) -> Vec<u8> {
        let record = EocdRecord {
            disk_number: 0,
            cd_disk: 0,
            cd_records_on_disk: 0,
            cd_records_total: 0,
            cd_size: prefix.len() as u32,
            cd_offset: 0,
            comment_len: comment.len() as u16
        };
        let mut zip = prefix.to_vec();
        zip.extend(record.to_bytes().unwrap());
        zip.extend(comment);
        zip
    }

    #[test]
    fn finds_eocd_without_comment() {
        let zip = tiny_zip(b"central directory", b"");
        let location = find_eocd(&mut Cursor::new(&zip)).unwrap();
        assert_eq!(location.offset, 17);
        assert_eq!(location.file_len, zip.len() as u64);
        assert_eq!(location.comment_len(), 0);
        assert_eq!(location.cd_offset(), 0);
        assert_eq!(location.record.cd_size, 17);
    }

    #[test]
    fn finds_eocd_with_comment() {
        let zip = tiny_zip(b"cd", b"hello world");
        let location = find_eocd(&mut Cursor::new(&zip)).unwrap();
        assert_eq!(location.offset, 2);
        assert_eq!(location.comment_len(), 11);
        assert_eq!(location.comment_len_field_position(), 22);
    }

    #[test]
    fn ignores_signature_inside_comment() {
        // The comment contains something that looks like an EOCD but whose
        // comment length doesn't reach the end of the file.
        let mut comment = EOCD_MAGIC.to_vec();
        comment.extend([0xAA; 30]);
        let zip = tiny_zip(b"cd", &comment);
        let location = find_eocd(&mut Cursor::new(&zip)).unwrap();
        assert_eq!(location.offset, 2);
        assert_eq!(location.comment_len() as usize, comment.len());
    }

    #[test]
    fn rejects_truncated_file() {
        let zip = tiny_zip(b"cd", b"");
        let err = find_eocd(&mut Cursor::new(&zip[..zip.len() - 1])).unwrap_err();
        assert!(matches!(err, ChpackError::EocdNotFound));
        let err = find_eocd(&mut Cursor::new(b"PK\x05\x06")).unwrap_err();
        assert!(matches!(err, ChpackError::EocdNotFound));
    }

    #[test]
    fn rejects_zip64() {
        let mut prefix = vec![0; 8];
        prefix.extend(ZIP64_LOCATOR_MAGIC);
        prefix.extend([0; 16]);
        let zip = tiny_zip(&prefix, b"");
        let err = find_eocd(&mut Cursor::new(&zip)).unwrap_err();
        assert!(matches!(err, ChpackError::Zip64Unsupported));
    }

    #[test]
    fn patches_cd_offset() {
        let zip = tiny_zip(b"cd", b"comment");
        let mut cursor = Cursor::new(zip);
        let location = find_eocd(&mut cursor).unwrap();
        patch_cd_offset(&mut cursor, location.offset, 1).unwrap();
        let patched = find_eocd(&mut cursor).unwrap();
        assert_eq!(patched.cd_offset(), 1);
        assert_eq!(patched.comment_len(), 7);
    }
}
