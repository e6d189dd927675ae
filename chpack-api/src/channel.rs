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

use std::{fs::File, path::Path, sync::Arc};

use chpack_common::*;
use chpack_sign::{
    locate_signing_block, read_entry, update_entry, Scheme, VerificationReport, Verifier
};
use chpack_zip::{
    comment::{read_market, write_market},
    read_framed_entry,
    window::{DEFAULT_WINDOW_SIZE, MAX_PAYLOAD_SIZE}
};
use tracing::{debug, warn};

use crate::{
    cache::ChannelCache,
    payload::{
        decode_values, encode_values, unwrap_payload, wrap_payload, ChannelValues, FRAME_MAGIC
    }
};

/// ID of the APK Signing Block entry holding channel values ("zxk!").
pub const CHANNEL_BLOCK_ID: u32 = 0x7a786b21;
pub const CHANNEL_KEY: &str = "CHANNEL";
/// Fewest independent signature schemes a package must verify with.
pub const MIN_VERIFIED_SCHEMES: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// APK Signing Block entry the values are stored under
    pub block_id: u32,
    /// Key of the channel among the stored values
    pub channel_key: String,
    /// How much of the end of the file the fast path searches
    pub window_size: u64,
    /// Largest payload that will be read or written
    pub max_payload: usize,
    /// Fewest schemes a package must verify with before and after being written
    pub min_schemes: usize,
    /// Schemes a package must verify with on top of that, e.g. `[V1]` for
    /// packages that still have to install on Android 6.0 and older
    pub required_schemes: Vec<Scheme>
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            block_id: CHANNEL_BLOCK_ID,
            channel_key: CHANNEL_KEY.into(),
            window_size: DEFAULT_WINDOW_SIZE,
            max_payload: MAX_PAYLOAD_SIZE,
            min_schemes: MIN_VERIFIED_SCHEMES,
            required_schemes: vec![]
        }
    }
}

/// Reads and writes channels in a package.
///
/// Channels live in the APK Signing Block where there is one. Packages signed
/// only with v1 carry them in the ZIP comment instead, which [ChannelPacker::read]
/// falls back to but [ChannelPacker::write] never touches.
#[derive(Debug, Clone)]
pub struct ChannelPacker {
    config: ChannelConfig,
    cache: Arc<ChannelCache>
}

impl Default for ChannelPacker {
    fn default() -> Self {
        ChannelPacker::new(ChannelConfig::default())
    }
}

impl ChannelPacker {
    pub fn new(config: ChannelConfig) -> ChannelPacker {
        ChannelPacker::with_cache(config, Arc::new(ChannelCache::new()))
    }

    /// Shares `cache` between packers, see [ChannelPacker::cached_channel].
    pub fn with_cache(config: ChannelConfig, cache: Arc<ChannelCache>) -> ChannelPacker {
        ChannelPacker { config, cache }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn cache(&self) -> &ChannelCache {
        &self.cache
    }

    /// The package's channel, or `None` if it was never given one.
    pub fn read(&self, path: &Path) -> Result<Option<String>> {
        Ok(self
            .read_values(path)?
            .get(&self.config.channel_key)
            .map(str::to_string))
    }

    /// Like [ChannelPacker::read] but first looks for the payload frame of the
    /// channel entry in the tail of the file, without parsing the ZIP structure.
    /// Anything unexpected there falls back to [ChannelPacker::read].
    pub fn read_fast(&self, path: &Path) -> Result<Option<String>> {
        let payload = read_framed_entry(
            path,
            self.config.block_id,
            FRAME_MAGIC,
            self.config.window_size,
            self.config.max_payload
        )?;
        match payload.map(String::from_utf8) {
            Some(Ok(text)) => {
                if let Some(channel) = decode_values(&text).get(&self.config.channel_key) {
                    return Ok(Some(channel.to_string()));
                }
            }
            Some(Err(err)) => debug!(%err, "channel entry in file tail is not UTF-8"),
            None => {}
        }
        debug!(path = %path.display(), "no channel in file tail, parsing APK Signing Block");
        self.read(path)
    }

    /// The channel of `path` as first read by this packer or any packer sharing
    /// its cache. Later calls don't read the file.
    pub fn cached_channel(&self, path: &Path) -> Result<Option<String>> {
        self.cache.get_or_load(|| self.read_fast(path))
    }

    /// Every stored value. Empty if the package has neither a channel entry nor
    /// a tagged ZIP comment.
    pub fn read_values(&self, path: &Path) -> Result<ChannelValues> {
        match self.read_block_values(path) {
            Ok(Some(values)) => return Ok(values),
            Ok(None) => {}
            Err(err) if err.is_format_error() => {
                warn!(%err, "unreadable APK Signing Block, falling back to ZIP comment");
            }
            Err(err) => return Err(err)
        }
        let mut values = ChannelValues::new();
        if let Some(market) = read_market(path)? {
            values.insert(self.config.channel_key.as_str(), market);
        }
        Ok(values)
    }

    /// Merges `values` into those already stored in the APK Signing Block.
    /// Writing nothing is a no-op.
    pub fn write_values(&self, path: &Path, values: &ChannelValues) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        update_entry(path, self.config.block_id, |old| {
            let mut merged = match old {
                Some(frame) => self.values_from_frame(frame)?,
                None => ChannelValues::new()
            };
            merged.merge(values);
            let payload = encode_values(&merged).unwrap_or_default();
            if payload.len() > self.config.max_payload {
                return Err(ChpackError::PayloadTooLarge {
                    size: payload.len(),
                    limit: self.config.max_payload
                });
            }
            Ok(wrap_payload(payload.as_bytes()))
        })?;
        debug!(path = %path.display(), entries = values.len(), "wrote channel values");
        Ok(())
    }

    /// Stores `channel` in the APK Signing Block, keeping any other values.
    pub fn write(&self, path: &Path, channel: &str) -> Result<()> {
        let mut values = ChannelValues::new();
        values.insert(self.config.channel_key.as_str(), channel);
        self.write_values(path, &values)
    }

    /// Tags a package that has no APK Signing Block through its ZIP comment.
    /// Packages with one are refused, their v2/v3 signatures cover the comment.
    pub fn write_legacy(&self, path: &Path, market: &str) -> Result<bool> {
        let (_, block) = locate_signing_block(&mut File::open(path)?)?;
        if block.is_some() {
            return Err(ChpackError::SigningBlockPresent);
        }
        write_market(path, market)
    }

    pub fn read_legacy(&self, path: &Path) -> Result<Option<String>> {
        read_market(path)
    }

    /// Verifies `path` and returns the schemes it verifies with. Fails unless
    /// there are at least `min_schemes` of them and they include every
    /// required scheme.
    pub fn signature_schemes(&self, path: &Path, verifier: &dyn Verifier) -> Result<Vec<Scheme>> {
        let report = verifier.verify(path)?;
        let verified = report.verified_schemes();
        if verified.len() >= self.config.min_schemes
            && report.verified_with(&self.config.required_schemes)
        {
            return Ok(verified);
        }
        let reason = format!(
            "{} verifies with [{}], needs at least {} schemes including [{}]",
            path.display(),
            scheme_list(&verified),
            self.config.min_schemes,
            scheme_list(&self.config.required_schemes)
        );
        Err(ChpackError::VerificationFailure(with_errors(reason, &report)))
    }

    /// Fails unless `path` passes [ChannelPacker::signature_schemes] AND reads
    /// back as `channel`.
    pub fn verify(&self, path: &Path, channel: &str, verifier: &dyn Verifier) -> Result<()> {
        self.signature_schemes(path, verifier)?;
        self.check_channel(path, channel)
    }

    /// Fails unless `verifier` accepts `path` under every one of `schemes`,
    /// typically those the package verified with before it was written, AND
    /// the package reads back as `channel`.
    pub fn verify_with(
        &self,
        path: &Path,
        channel: &str,
        verifier: &dyn Verifier,
        schemes: &[Scheme]
    ) -> Result<()> {
        let report = verifier.verify(path)?;
        if !report.verified_with(schemes) {
            let reason = format!(
                "{} verifies with [{}], expected [{}]",
                path.display(),
                scheme_list(&report.verified_schemes()),
                scheme_list(schemes)
            );
            return Err(ChpackError::VerificationFailure(with_errors(reason, &report)));
        }
        self.check_channel(path, channel)
    }

    fn check_channel(&self, path: &Path, channel: &str) -> Result<()> {
        match self.read(path)? {
            Some(actual) if actual == channel => Ok(()),
            actual => Err(ChpackError::VerificationFailure(format!(
                "expected channel {channel:?}, read {actual:?}"
            )))
        }
    }

    // `None` when there's no APK Signing Block or no entry for the channel block id
    fn read_block_values(&self, path: &Path) -> Result<Option<ChannelValues>> {
        let frame = match read_entry(path, self.config.block_id) {
            Ok(frame) => frame,
            Err(ChpackError::BlockNotFound) => return Ok(None),
            Err(err) => return Err(err)
        };
        match frame {
            Some(frame) => Ok(Some(self.values_from_frame(&frame)?)),
            None => Ok(None)
        }
    }

    fn values_from_frame(&self, frame: &[u8]) -> Result<ChannelValues> {
        let Some(payload) = unwrap_payload(frame) else {
            warn!(len = frame.len(), "channel entry is not a framed payload, ignoring it");
            return Ok(ChannelValues::new());
        };
        if payload.len() > self.config.max_payload {
            return Err(ChpackError::PayloadTooLarge {
                size: payload.len(),
                limit: self.config.max_payload
            });
        }
        Ok(decode_values(&String::from_utf8(payload.to_vec())?))
    }
}

fn scheme_list(schemes: &[Scheme]) -> String {
    schemes
        .iter()
        .map(Scheme::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn with_errors(reason: String, report: &VerificationReport) -> String {
    if report.errors.is_empty() {
        reason
    } else {
        format!("{reason}: {}", report.errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chpack_sign::{fixtures::signed_apk, write_entry, SchemeVerifier};
    use std::fs;

    fn signed_copy(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("app.apk");
        fs::write(&path, signed_apk().unwrap()).unwrap();
        path
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_copy(&dir);
        let packer = ChannelPacker::default();

        assert_eq!(packer.read(&path).unwrap(), None);
        packer.write(&path, "GooglePlay").unwrap();
        assert_eq!(packer.read(&path).unwrap().as_deref(), Some("GooglePlay"));
        assert_eq!(packer.read_fast(&path).unwrap().as_deref(), Some("GooglePlay"));
        packer.verify(&path, "GooglePlay", &SchemeVerifier).unwrap();
    }

    #[test]
    fn writes_merge_with_stored_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_copy(&dir);
        let packer = ChannelPacker::default();

        let extra: ChannelValues = [("build", "1234"), (CHANNEL_KEY, "first")]
            .into_iter()
            .collect();
        packer.write_values(&path, &extra).unwrap();
        packer.write(&path, "second").unwrap();

        let values = packer.read_values(&path).unwrap();
        assert_eq!(values.get("build"), Some("1234"));
        assert_eq!(values.get(CHANNEL_KEY), Some("second"));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn verify_rejects_the_wrong_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_copy(&dir);
        let packer = ChannelPacker::default();
        packer.write(&path, "huawei").unwrap();

        let err = packer.verify(&path, "xiaomi", &SchemeVerifier).unwrap_err();
        assert!(matches!(err, ChpackError::VerificationFailure(_)));
    }

    #[test]
    fn oversized_payloads_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_copy(&dir);
        let before = fs::read(&path).unwrap();
        let packer = ChannelPacker::new(ChannelConfig {
            max_payload: 16,
            ..ChannelConfig::default()
        });

        let err = packer.write(&path, "a channel name that is far too long").unwrap_err();
        assert!(matches!(err, ChpackError::PayloadTooLarge { limit: 16, .. }));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn custom_block_id_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_copy(&dir);
        let custom = ChannelPacker::new(ChannelConfig {
            block_id: 0x12345678,
            channel_key: "market".into(),
            ..ChannelConfig::default()
        });
        custom.write(&path, "oppo").unwrap();

        assert_eq!(custom.read(&path).unwrap().as_deref(), Some("oppo"));
        assert_eq!(ChannelPacker::default().read(&path).unwrap(), None);
        assert_eq!(
            read_entry(&path, 0x12345678).unwrap().map(|f| f.len()),
            Some(16 + 4 + 16 + 4)
        );
    }

    #[test]
    fn cache_is_shared_and_resettable() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_copy(&dir);
        let cache = Arc::new(ChannelCache::new());
        let packer = ChannelPacker::with_cache(ChannelConfig::default(), cache.clone());
        packer.write(&path, "first").unwrap();

        assert_eq!(packer.cached_channel(&path).unwrap().as_deref(), Some("first"));
        packer.write(&path, "second").unwrap();
        let other = ChannelPacker::with_cache(ChannelConfig::default(), cache.clone());
        assert_eq!(other.cached_channel(&path).unwrap().as_deref(), Some("first"));

        cache.reset();
        assert_eq!(other.cached_channel(&path).unwrap().as_deref(), Some("second"));
    }

    #[test]
    fn fast_read_skips_frames_of_other_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_copy(&dir);
        let packer = ChannelPacker::default();
        // Framed like a channel entry but stored under other IDs
        write_entry(&path, 0x1000, &wrap_payload(&[0xFF, 0xFE, 0x00, 0x01])).unwrap();
        let foreign: ChannelValues = [(CHANNEL_KEY, "foreign")].into_iter().collect();
        let foreign = encode_values(&foreign).unwrap();
        write_entry(&path, 0x2000, &wrap_payload(foreign.as_bytes())).unwrap();
        packer.write(&path, "vivo").unwrap();

        assert_eq!(packer.read(&path).unwrap().as_deref(), Some("vivo"));
        assert_eq!(packer.read_fast(&path).unwrap().as_deref(), Some("vivo"));
        assert_eq!(packer.cached_channel(&path).unwrap().as_deref(), Some("vivo"));
    }

    #[test]
    fn fast_read_of_untagged_package_with_foreign_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_copy(&dir);
        write_entry(&path, 0x1000, &wrap_payload(&[0xFF, 0xFE, 0x00, 0x01])).unwrap();

        assert_eq!(ChannelPacker::default().read_fast(&path).unwrap(), None);
    }

    #[test]
    fn legacy_tags_are_refused_on_signed_packages() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_copy(&dir);
        let before = fs::read(&path).unwrap();

        let err = ChannelPacker::default()
            .write_legacy(&path, "wandoujia")
            .unwrap_err();
        assert!(matches!(err, ChpackError::SigningBlockPresent));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn verify_with_names_the_missing_schemes() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_copy(&dir);
        let packer = ChannelPacker::default();
        packer.write(&path, "huawei").unwrap();

        packer
            .verify_with(&path, "huawei", &SchemeVerifier, &[Scheme::V2, Scheme::V3])
            .unwrap();
        let err = packer
            .verify_with(&path, "huawei", &SchemeVerifier, &[Scheme::V1, Scheme::V2])
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("verifies with [v2, v3]"), "{message}");
        assert!(message.contains("expected [v1, v2]"), "{message}");
    }

    #[test]
    fn required_schemes_come_on_top_of_the_minimum() {
        let dir = tempfile::tempdir().unwrap();
        let path = signed_copy(&dir);

        let schemes = ChannelPacker::default()
            .signature_schemes(&path, &SchemeVerifier)
            .unwrap();
        assert_eq!(schemes, [Scheme::V2, Scheme::V3]);

        let needs_v1 = ChannelPacker::new(ChannelConfig {
            required_schemes: vec![Scheme::V1],
            ..ChannelConfig::default()
        });
        let message = needs_v1
            .signature_schemes(&path, &SchemeVerifier)
            .unwrap_err()
            .to_string();
        assert!(message.contains("at least 2 schemes including [v1]"), "{message}");

        let needs_three = ChannelPacker::new(ChannelConfig {
            min_schemes: 3,
            ..ChannelConfig::default()
        });
        assert!(needs_three.signature_schemes(&path, &SchemeVerifier).is_err());
    }
}
