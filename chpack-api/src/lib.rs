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

//! # chpack API
//!
//! Tags Android packages with a distribution channel without re-signing them.
//!
//! Packages signed with APK Signature Scheme v2 or later get the channel as an
//! extra entry in their APK Signing Block, which the signatures don't cover.
//! Packages signed only with v1 can instead be tagged through the ZIP comment.
//!
//! ## Tagging a package
//!
//! ```ignore
//! let packer = ChannelPacker::default();
//! packer.write(Path::new("app-release.apk"), "GooglePlay")?;
//! assert_eq!(packer.read(Path::new("app-release.apk"))?, Some("GooglePlay".into()));
//! ```
//!
//! ## One package per channel
//!
//! ```ignore
//! let channels = read_channels("@channels.txt")?;
//! let report = generate(
//!     Path::new("app-release.apk"),
//!     &channels,
//!     Path::new("out"),
//!     &ChannelPacker::default(),
//!     &ApksignerVerifier::default()
//! )?;
//! ```

pub mod batch;
pub mod cache;
pub mod channel;
pub mod payload;

pub use batch::{generate, parse_channels, read_channel_file, read_channels, BatchReport};
pub use cache::ChannelCache;
pub use channel::{
    ChannelConfig, ChannelPacker, CHANNEL_BLOCK_ID, CHANNEL_KEY, MIN_VERIFIED_SCHEMES
};
pub use chpack_common::{ChpackError, Result};
pub use chpack_sign::{ApksignerVerifier, Scheme, SchemeVerifier, VerificationReport, Verifier};
pub use payload::{decode_values, encode_values, ChannelValues};
