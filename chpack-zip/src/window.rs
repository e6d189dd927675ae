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

//! Fast lookups near the end of a package.
//!
//! Reading a channel at app start-up shouldn't need to parse the whole ZIP
//! structure. Instead the last part of the file is memory-mapped and searched
//! for a magic marker with a Knuth-Morris-Pratt matcher.

use std::{
    fs::File,
    io::{self, Cursor, Read},
    path::Path
};

use byteorder::{LittleEndian, ReadBytesExt};
use chpack_common::*;
use memmap2::{Mmap, MmapOptions};
use tracing::debug;

/// Default size of the trailing window that gets searched.
pub const DEFAULT_WINDOW_SIZE: u64 = 0x100000;
/// Payloads declaring more bytes than this are never read.
pub const MAX_PAYLOAD_SIZE: usize = 0x100000;

/// Substring matcher built from the pattern's prefix function.
///
/// The matcher itself holds no search state so it can be reused for any number
/// of searches.
#[derive(Debug, Clone)]
pub struct KmpMatcher {
    pattern: Vec<u8>,
    failure: Vec<usize>
}

impl KmpMatcher {
    pub fn new(pattern: &[u8]) -> Self {
        let mut failure = vec![0; pattern.len()];
        let mut j = 0;
        for i in 1..pattern.len() {
            while j > 0 && pattern[j] != pattern[i] {
                j = failure[j - 1];
            }
            if pattern[j] == pattern[i] {
                j += 1;
            }
            failure[i] = j;
        }
        KmpMatcher {
            pattern: pattern.to_vec(),
            failure
        }
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    // Advances the automaton by one byte, returning the number of pattern bytes matched
    fn step(&self, mut matched: usize, byte: u8) -> usize {
        while matched > 0 && self.pattern[matched] != byte {
            matched = self.failure[matched - 1];
        }
        if self.pattern[matched] == byte {
            matched += 1;
        }
        matched
    }

    /// Offset of the first occurrence of the pattern in `haystack`.
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        if self.pattern.is_empty() || haystack.len() < self.pattern.len() {
            return None;
        }
        let mut matched = 0;
        for (i, &byte) in haystack.iter().enumerate() {
            matched = self.step(matched, byte);
            if matched == self.pattern.len() {
                return Some(i + 1 - self.pattern.len());
            }
        }
        None
    }

    /// Streaming variant of [find](KmpMatcher::find) for sources that can't be
    /// mapped. Returns the offset from the reader's starting position.
    pub fn find_in_reader<R: Read>(&self, mut reader: R) -> io::Result<Option<u64>> {
        if self.pattern.is_empty() {
            return Ok(None);
        }
        let mut buf = [0; 8192];
        let mut consumed = 0u64;
        let mut matched = 0;
        loop {
            let read = match reader.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err)
            };
            for (i, &byte) in buf[..read].iter().enumerate() {
                matched = self.step(matched, byte);
                if matched == self.pattern.len() {
                    return Ok(Some(consumed + i as u64 + 1 - self.pattern.len() as u64));
                }
            }
            consumed += read as u64;
        }
    }
}

/// The last `window_size` bytes of a file, memory-mapped.
pub struct TailWindow {
    map: Option<Mmap>,
    offset: u64
}

impl TailWindow {
    pub fn open(path: &Path, window_size: u64) -> Result<TailWindow> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let len = window_size.min(file_len);
        let offset = file_len - len;
        if len == 0 {
            return Ok(TailWindow { map: None, offset });
        }
        // SAFETY: Read-only mapping. Packages are not modified while a channel is being read.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(len as usize)
                .map(&file)?
        };
        Ok(TailWindow {
            map: Some(map),
            offset
        })
    }

    pub fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    /// Absolute file offset of the first byte in the window.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Offset within the window of the first match.
    pub fn find(&self, matcher: &KmpMatcher) -> Option<usize> {
        matcher.find(self.bytes())
    }
}

/// Absolute offset of the first occurrence of `pattern` in the last
/// `window_size` bytes of the file.
pub fn find_tail(path: &Path, pattern: &[u8], window_size: u64) -> Result<Option<u64>> {
    let window = TailWindow::open(path, window_size)?;
    let matcher = KmpMatcher::new(pattern);
    Ok(window
        .find(&matcher)
        .map(|index| window.offset() + index as u64))
}

/// Finds a payload framed as `[magic][u32 length][payload][u32 length]` in the
/// last `window_size` bytes of the file.
///
/// The length that follows the magic is untrusted. Anything that would read
/// past the window, exceed `max_payload`, or whose trailing length disagrees is
/// treated as not found.
pub fn read_framed_payload(
    path: &Path,
    magic: &[u8],
    window_size: u64,
    max_payload: usize
) -> Result<Option<Vec<u8>>> {
    let window = TailWindow::open(path, window_size)?;
    let matcher = KmpMatcher::new(magic);
    let Some(index) = window.find(&matcher) else {
        debug!(window = window.bytes().len(), "payload magic not in window");
        return Ok(None);
    };
    Ok(unframe(&window.bytes()[(index + magic.len())..], max_payload).map(<[u8]>::to_vec))
}

/// Like [read_framed_payload], but only accepts a frame that makes up the
/// whole value of an APK Signing Block entry with ID `entry_id`, i.e. one
/// preceded by `[u64 length][u32 entry_id]`. Frames of other entries are
/// skipped.
pub fn read_framed_entry(
    path: &Path,
    entry_id: u32,
    magic: &[u8],
    window_size: u64,
    max_payload: usize
) -> Result<Option<Vec<u8>>> {
    let window = TailWindow::open(path, window_size)?;
    let matcher = KmpMatcher::new(magic);
    let bytes = window.bytes();
    let mut from = 0;
    while let Some(found) = matcher.find(&bytes[from..]) {
        let index = from + found;
        from = index + 1;
        let Some(payload) = unframe(&bytes[(index + magic.len())..], max_payload) else {
            continue;
        };
        // The entry length counts the ID, the magic and both payload lengths
        let entry_len = (4 + magic.len() + 8 + payload.len()) as u64;
        match entry_header(bytes, index) {
            Some((length, id)) if id == entry_id && length == entry_len => {
                return Ok(Some(payload.to_vec()));
            }
            header => debug!(index, ?header, entry_id, "skipping frame of another entry")
        }
    }
    Ok(None)
}

// `[u64 length][u32 id]` ending at `index`
fn entry_header(bytes: &[u8], index: usize) -> Option<(u64, u32)> {
    let start = index.checked_sub(12)?;
    let mut cursor = Cursor::new(&bytes[start..index]);
    let length = cursor.read_u64::<LittleEndian>().ok()?;
    let id = cursor.read_u32::<LittleEndian>().ok()?;
    Some((length, id))
}

// `framed` starts right after the magic
fn unframe(framed: &[u8], max_payload: usize) -> Option<&[u8]> {
    let mut cursor = Cursor::new(framed);
    let length = cursor.read_u32::<LittleEndian>().ok()? as usize;
    let remaining = framed.len() - 4;
    if length == 0 || length > max_payload || length.checked_add(4)? > remaining {
        debug!(length, remaining, "rejecting framed payload length");
        return None;
    }
    let payload = &framed[4..(4 + length)];
    let mut trailer = Cursor::new(&framed[(4 + length)..]);
    match trailer.read_u32::<LittleEndian>() {
        Ok(trailing) if trailing as usize == length => Some(payload),
        _ => None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(magic: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut out = magic.to_vec();
        out.extend((payload.len() as u32).to_le_bytes());
        out.extend(payload);
        out.extend((payload.len() as u32).to_le_bytes());
        out
    }

    fn entry(id: u32, value: &[u8]) -> Vec<u8> {
        let mut out = (value.len() as u64 + 4).to_le_bytes().to_vec();
        out.extend(id.to_le_bytes());
        out.extend(value);
        out
    }

    #[test]
    fn finds_first_occurrence() {
        let matcher = KmpMatcher::new(b"abab");
        assert_eq!(matcher.find(b"xxabaabababab"), Some(5));
        assert_eq!(matcher.find(b"aba"), None);
        assert_eq!(matcher.find(b""), None);
        // Reusing the matcher starts from scratch
        assert_eq!(matcher.find(b"abab"), Some(0));
    }

    #[test]
    fn empty_pattern_never_matches() {
        let matcher = KmpMatcher::new(b"");
        assert_eq!(matcher.find(b"anything"), None);
        assert_eq!(matcher.find_in_reader(&b"anything"[..]).unwrap(), None);
    }

    #[test]
    fn streaming_matches_across_reads() {
        let mut haystack = vec![b'a'; 8190];
        haystack.extend(b"Packer Ng Sig V2");
        let matcher = KmpMatcher::new(b"Packer Ng Sig V2");
        assert_eq!(matcher.find_in_reader(&haystack[..]).unwrap(), Some(8190));
        assert_eq!(matcher.find(&haystack), Some(8190));
    }

    #[test]
    fn window_only_covers_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        let mut contents = b"MAGIC".to_vec();
        contents.extend([0; 100]);
        contents.extend(b"MAGIC");
        std::fs::write(&path, &contents).unwrap();

        assert_eq!(find_tail(&path, b"MAGIC", 10).unwrap(), Some(105));
        assert_eq!(find_tail(&path, b"MAGIC", 4096).unwrap(), Some(0));
        assert_eq!(find_tail(&path, b"MAGIC", 4).unwrap(), None);

        let window = TailWindow::open(&path, 10).unwrap();
        assert_eq!(window.offset(), 100);
        assert_eq!(window.bytes().len(), 10);
    }

    #[test]
    fn empty_file_has_empty_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();
        let window = TailWindow::open(&path, 1024).unwrap();
        assert!(window.bytes().is_empty());
        assert_eq!(find_tail(&path, b"MAGIC", 1024).unwrap(), None);
    }

    #[test]
    fn reads_framed_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("framed.bin");
        let mut contents = vec![7; 64];
        contents.extend(frame(b"MAGIC", b"payload"));
        contents.extend([9; 16]);
        std::fs::write(&path, &contents).unwrap();

        let payload = read_framed_payload(&path, b"MAGIC", 4096, MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(payload.as_deref(), Some(&b"payload"[..]));
        // The ceiling applies before anything is read
        assert_eq!(read_framed_payload(&path, b"MAGIC", 4096, 3).unwrap(), None);
    }

    #[test]
    fn rejects_truncated_frame() {
        let mut framed = frame(b"", b"payload");
        // Declared length runs past the end of the window
        assert_eq!(unframe(&framed[..8], MAX_PAYLOAD_SIZE), None);
        // Trailing length disagrees
        let last = framed.len() - 4;
        framed[last] = 1;
        assert_eq!(unframe(&framed, MAX_PAYLOAD_SIZE), None);
        // Declared length is huge
        assert_eq!(unframe(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0], MAX_PAYLOAD_SIZE), None);
        assert_eq!(unframe(&[1, 0], MAX_PAYLOAD_SIZE), None);
    }

    #[test]
    fn framed_entries_must_match_the_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entries.bin");
        let mut contents = frame(b"MAGIC", b"bare");
        contents.extend(entry(0x1000, &frame(b"MAGIC", &[0xFF, 0xFE, 0x00, 0x01])));
        contents.extend(entry(0x2000, &frame(b"MAGIC", b"mine")));
        // A frame that doesn't fill its entry
        let mut padded = frame(b"MAGIC", b"padded");
        padded.push(0);
        contents.extend(entry(0x3000, &padded));
        std::fs::write(&path, &contents).unwrap();

        let read = |id| read_framed_entry(&path, id, b"MAGIC", 4096, MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(read(0x2000).as_deref(), Some(&b"mine"[..]));
        assert_eq!(read(0x1000).as_deref(), Some(&[0xFF, 0xFE, 0x00, 0x01][..]));
        assert_eq!(read(0x3000), None);
        assert_eq!(read(0x4000), None);
        // Without an ID, the first frame wins
        assert_eq!(
            read_framed_payload(&path, b"MAGIC", 4096, MAX_PAYLOAD_SIZE).unwrap().as_deref(),
            Some(&b"bare"[..])
        );
    }
}
