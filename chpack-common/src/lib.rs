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

use std::{fmt, io, num::ParseIntError, rc::Rc, string::FromUtf8Error};

use deku::prelude::*;
use zip::result::ZipError;

/// Common error type making it easier to share `Result`s between chpack crates.
///
/// In general designed to avoid needing utilities like `map_err`.
#[derive(Debug, Clone)]
pub enum ChpackError {
    /// chpack-cli encountered an error while processing something specific to
    /// the command line implementation. For example, a channel list was empty.
    Cli(String),
    /// No End Of Central Directory record whose comment length accounts for the
    /// rest of the file could be found in the last 64 KiB of the file.
    EocdNotFound,
    /// The archive is a ZIP64 archive. Channel blocks are only written into
    /// plain ZIP archives since APKs never use ZIP64.
    Zip64Unsupported,
    /// The bytes before the Central Directory end in the `APK Sig Block 42`
    /// magic but the block's size fields are unusable: the block would start
    /// before the file does, or the size is below the 32 byte minimum.
    SigningBlockTooSmall { cd_offset: u64, size: u64 },
    /// The two copies of the APK Signing Block's size field disagree.
    SigningBlockSizeMismatch {
        block_start: u64,
        leading: u64,
        trailing: u64
    },
    /// An ID/value entry inside the APK Signing Block declared a length that
    /// doesn't fit in what remains of the block. `offset` is relative to the
    /// first entry.
    IdValueEntryInvalid {
        offset: usize,
        declared: u64,
        remaining: usize
    },
    /// The APK Signing Block has no APK Signature Scheme v2 entry, so it is not
    /// a block this crate knows how to rewrite safely.
    NoSignatureSchemeBlock,
    /// The file has no APK Signing Block at all. Callers may fall back to the
    /// legacy ZIP comment.
    BlockNotFound,
    /// Attempted to write to an ID that holds actual signature data.
    ReservedId(u32),
    /// Neither a channel block nor a legacy comment tag is present.
    NotFound,
    /// A legacy comment tag is already present at the end of the file.
    AlreadyTagged,
    /// The package has an APK Signing Block. Its v2/v3 signatures cover the
    /// ZIP comment, so tagging the comment would break them.
    SigningBlockPresent,
    /// The archive already has a ZIP comment of this many bytes which isn't a
    /// legacy tag. Appending would require rewriting the comment length.
    CommentPresent(u16),
    /// A payload was larger than the configured ceiling.
    PayloadTooLarge { size: usize, limit: usize },
    /// Reading, seeking or writing the package failed.
    FileIoError(Rc<io::Error>),
    /// A ZIP record or signing block structure couldn't be (de)serialised. See
    /// [DekuError].
    ByteSerialisationFailed(DekuError),
    /// A numeric argument, such as a block ID, could not be parsed.
    IntegerParsingFailed(ParseIntError),
    /// A stored tag wasn't valid UTF-8.
    Utf8DecodingFailed(FromUtf8Error),
    /// Building a fixture archive with the `zip` crate failed.
    ZipWritingFailed(Rc<ZipError>),
    /// Signing a fixture archive failed.
    FixtureSigningFailed(String),
    /// After a rewrite the APK Signing Block was not where, or not as long as,
    /// it was written.
    ///
    /// **If you experience this, it is considered an internal bug in chpack.
    /// Please report it.**
    BlockSizeMismatch { expected: u64, actual: u64 },
    /// The verifier rejected the package, or the channel read back from it
    /// isn't the one that was written.
    VerificationFailure(String)
}

impl ChpackError {
    /// True for errors caused by a malformed package rather than I/O or usage.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            ChpackError::EocdNotFound
                | ChpackError::Zip64Unsupported
                | ChpackError::SigningBlockTooSmall { .. }
                | ChpackError::SigningBlockSizeMismatch { .. }
                | ChpackError::IdValueEntryInvalid { .. }
                | ChpackError::NoSignatureSchemeBlock
        )
    }
}

/// Result type where the error is always [ChpackError].
pub type Result<T> = std::result::Result<T, ChpackError>;

impl fmt::Display for ChpackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChpackError::Cli(message) => write!(f, "{message}"),
            ChpackError::EocdNotFound => write!(f, "ZIP End Of Central Directory not found"),
            ChpackError::Zip64Unsupported => write!(f, "ZIP64 archives are not supported"),
            ChpackError::SigningBlockTooSmall { cd_offset, size } => write!(
                f,
                "APK Signing Block size {size} is invalid for central directory at {cd_offset}"
            ),
            ChpackError::SigningBlockSizeMismatch {
                block_start,
                leading,
                trailing
            } => write!(
                f,
                "APK Signing Block at {block_start} has size {leading} but footer says {trailing}"
            ),
            ChpackError::IdValueEntryInvalid {
                offset,
                declared,
                remaining
            } => write!(
                f,
                "ID/value entry at {offset} declares {declared} bytes, {remaining} remain"
            ),
            ChpackError::NoSignatureSchemeBlock => {
                write!(f, "No APK Signature Scheme v2 block in APK Signing Block")
            }
            ChpackError::BlockNotFound => write!(f, "No APK Signing Block found"),
            ChpackError::ReservedId(id) => write!(f, "ID {id:#010x} is reserved for signatures"),
            ChpackError::NotFound => write!(f, "No channel found"),
            ChpackError::AlreadyTagged => write!(f, "File already carries a channel comment"),
            ChpackError::SigningBlockPresent => write!(
                f,
                "File has an APK Signing Block, tagging its ZIP comment would break the signatures"
            ),
            ChpackError::CommentPresent(len) => {
                write!(f, "File already has a {len} byte ZIP comment")
            }
            ChpackError::PayloadTooLarge { size, limit } => {
                write!(f, "Payload of {size} bytes exceeds the {limit} byte limit")
            }
            ChpackError::FileIoError(err) => write!(f, "I/O error: {err}"),
            ChpackError::ByteSerialisationFailed(err) => write!(f, "{err}"),
            ChpackError::IntegerParsingFailed(err) => write!(f, "{err}"),
            ChpackError::Utf8DecodingFailed(err) => write!(f, "{err}"),
            ChpackError::ZipWritingFailed(err) => write!(f, "{err}"),
            ChpackError::FixtureSigningFailed(message) => write!(f, "{message}"),
            ChpackError::BlockSizeMismatch { expected, actual } => write!(
                f,
                "Rewritten APK Signing Block is {actual} bytes, expected {expected}"
            ),
            ChpackError::VerificationFailure(message) => {
                write!(f, "Verification failed: {message}")
            }
        }
    }
}

impl std::error::Error for ChpackError {}

// Automatic conversion from other types of error to ChpackError makes the rest of the code cleaner
impl From<io::Error> for ChpackError {
    fn from(value: io::Error) -> Self {
        ChpackError::FileIoError(value.into())
    }
}

impl From<DekuError> for ChpackError {
    fn from(value: DekuError) -> Self {
        ChpackError::ByteSerialisationFailed(value)
    }
}

impl From<ParseIntError> for ChpackError {
    fn from(value: ParseIntError) -> Self {
        ChpackError::IntegerParsingFailed(value)
    }
}

impl From<FromUtf8Error> for ChpackError {
    fn from(value: FromUtf8Error) -> Self {
        ChpackError::Utf8DecodingFailed(value)
    }
}

impl From<ZipError> for ChpackError {
    fn from(value: ZipError) -> Self {
        ChpackError::ZipWritingFailed(value.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_errors_are_classified() {
        assert!(ChpackError::EocdNotFound.is_format_error());
        assert!(ChpackError::IdValueEntryInvalid {
            offset: 0,
            declared: 64,
            remaining: 12
        }
        .is_format_error());
        assert!(!ChpackError::AlreadyTagged.is_format_error());
        assert!(!ChpackError::from(io::Error::other("disk")).is_format_error());
    }

    #[test]
    fn display_carries_offsets() {
        let err = ChpackError::SigningBlockSizeMismatch {
            block_start: 4096,
            leading: 120,
            trailing: 128
        };
        let message = err.to_string();
        assert!(message.contains("4096"));
        assert!(message.contains("120"));
        assert!(message.contains("128"));
    }
}
