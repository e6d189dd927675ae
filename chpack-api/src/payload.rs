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

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use tracing::warn;

/// Separates a key from its value.
pub const SEP_KV: char = '\u{2218}';
/// Terminates each key/value line.
pub const SEP_LINE: char = '\u{2219}';

/// Marks the start of a framed payload so the fast path can find it without
/// parsing the APK Signing Block.
pub const FRAME_MAGIC: &[u8; 16] = b"Packer Ng Sig V2";
const FRAME_LENGTH_LEN: usize = 4;

/// Key/value pairs stored under the channel block id, in insertion order.
///
/// Inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelValues {
    entries: Vec<(String, String)>
}

impl ChannelValues {
    pub fn new() -> ChannelValues {
        ChannelValues::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value))
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Inserts every entry of `other`, which wins on conflicts.
    pub fn merge(&mut self, other: &ChannelValues) {
        for (key, value) in other.iter() {
            self.insert(key, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ChannelValues {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut values = ChannelValues::new();
        for (key, value) in iter {
            values.insert(key, value);
        }
        values
    }
}

/// Encodes as `key SEP_KV value SEP_LINE` for every entry.
///
/// An empty map has no encoding at all, so that "nothing written" can't be
/// confused with an empty payload. Separators inside keys or values are NOT
/// escaped and will not survive [decode_values].
pub fn encode_values(values: &ChannelValues) -> Option<String> {
    if values.is_empty() {
        return None;
    }
    let mut out = String::new();
    for (key, value) in values.iter() {
        out.push_str(key);
        out.push(SEP_KV);
        out.push_str(value);
        out.push(SEP_LINE);
    }
    Some(out)
}

/// Lenient inverse of [encode_values]. Lines that don't split into exactly a
/// key and a value are skipped.
pub fn decode_values(payload: &str) -> ChannelValues {
    let mut values = ChannelValues::new();
    for line in payload.split(SEP_LINE).filter(|line| !line.is_empty()) {
        let parts: Vec<&str> = line.split(SEP_KV).collect();
        if let &[key, value] = parts.as_slice() {
            values.insert(key, value);
        } else {
            warn!(line, "dropping malformed key/value entry");
        }
    }
    values
}

/// `[FRAME_MAGIC][u32 length][payload][u32 length]`
pub fn wrap_payload(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_MAGIC.len() + payload.len() + FRAME_LENGTH_LEN * 2);
    out.extend_from_slice(FRAME_MAGIC);
    // Writing into a Vec can't fail
    let _ = out.write_u32::<LittleEndian>(payload.len() as u32);
    out.extend_from_slice(payload);
    let _ = out.write_u32::<LittleEndian>(payload.len() as u32);
    out
}

/// The payload inside a frame written by [wrap_payload]. `None` if the magic is
/// missing, the frame is cut short, the payload is empty or the two lengths
/// disagree.
pub fn unwrap_payload(frame: &[u8]) -> Option<&[u8]> {
    let framed = frame.strip_prefix(&FRAME_MAGIC[..])?;
    let length = Cursor::new(framed).read_u32::<LittleEndian>().ok()? as usize;
    let end = FRAME_LENGTH_LEN.checked_add(length)?;
    if length == 0 || end.checked_add(FRAME_LENGTH_LEN)? > framed.len() {
        return None;
    }
    let trailing = Cursor::new(&framed[end..]).read_u32::<LittleEndian>().ok()? as usize;
    (trailing == length).then(|| &framed[FRAME_LENGTH_LEN..end])
}
