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

//! One tagged copy of a base package per channel.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::{Path, PathBuf}
};

use chpack_common::*;
use chpack_sign::{Scheme, Verifier};
use tracing::{debug, info, warn};

use crate::channel::ChannelPacker;

// Characters that can't appear in file names on at least one platform
const INVALID_FILE_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '\'', '<', '>', '|'];

/// Channel names from a comma separated list.
pub fn parse_channels(text: &str) -> Vec<String> {
    clean_channels(text.split(','))
}

/// Channel names from a file with one channel per line. Anything after a `#` is
/// a comment.
pub fn read_channel_file(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(clean_channels(
        text.lines()
            .map(|line| line.split('#').next().unwrap_or_default())
    ))
}

/// `@path` reads channels from a file, anything else is a comma separated list.
pub fn read_channels(arg: &str) -> Result<Vec<String>> {
    match arg.strip_prefix('@') {
        Some(path) => read_channel_file(Path::new(path)),
        None => Ok(parse_channels(arg))
    }
}

/// Replaces characters that aren't allowed in file names with `_`.
pub fn sanitise_channel(channel: &str) -> String {
    channel.replace(INVALID_FILE_NAME_CHARS, "_")
}

// Trimmed, sanitised, without blanks and without duplicates, in input order
fn clean_channels<'a>(raw: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut channels: Vec<String> = vec![];
    for channel in raw.map(str::trim).filter(|c| !c.is_empty()) {
        let channel = sanitise_channel(channel);
        if !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    channels
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Packages that were written and verified
    pub generated: Vec<PathBuf>,
    /// Channels that failed and why. Nothing is left behind for them.
    pub failed: Vec<(String, ChpackError)>
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// `{stem}-{channel}.{extension}`, like `app-release-huawei.apk`.
pub fn output_file_name(base: &Path, channel: &str) -> String {
    let stem = base
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    match base.extension() {
        Some(ext) => format!("{stem}-{channel}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{channel}")
    }
}

/// Writes one copy of `base` per channel into `out_dir`.
///
/// `base` must pass [ChannelPacker::signature_schemes], otherwise nothing is
/// generated. After that, each copy is built in a temporary file next to its
/// destination and only moved into place once it verifies with every scheme
/// `base` verified with and reads back as its channel. A failing channel
/// doesn't stop the others.
pub fn generate(
    base: &Path,
    channels: &[String],
    out_dir: &Path,
    packer: &ChannelPacker,
    verifier: &dyn Verifier
) -> Result<BatchReport> {
    let schemes = packer.signature_schemes(base, verifier)?;
    debug!(base = %base.display(), ?schemes, "base package verified");
    fs::create_dir_all(out_dir)?;

    let mut batch = BatchReport::default();
    for channel in channels {
        let dest = out_dir.join(output_file_name(base, channel));
        match generate_one(base, channel, &dest, packer, verifier, &schemes) {
            Ok(()) => {
                info!(channel, path = %dest.display(), "generated");
                batch.generated.push(dest);
            }
            Err(err) => {
                warn!(channel, %err, "failed to generate");
                batch.failed.push((channel.clone(), err));
            }
        }
    }
    Ok(batch)
}

fn generate_one(
    base: &Path,
    channel: &str,
    dest: &Path,
    packer: &ChannelPacker,
    verifier: &dyn Verifier,
    schemes: &[Scheme]
) -> Result<()> {
    let dir = dest.parent().unwrap_or(Path::new("."));
    // Dropping the temporary file before it's persisted deletes it
    let mut temp = tempfile::Builder::new()
        .prefix(".chpack-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    io::copy(&mut File::open(base)?, temp.as_file_mut())?;
    temp.as_file_mut().flush()?;

    packer.write(temp.path(), channel)?;
    packer.verify_with(temp.path(), channel, verifier, schemes)?;
    temp.persist(dest).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lists() {
        assert_eq!(parse_channels(" a, b ,,c,a"), ["a", "b", "c"]);
        assert!(parse_channels(" , ").is_empty());
    }

    #[test]
    fn sanitises_for_file_names() {
        assert_eq!(sanitise_channel("a/b:c*d?e\"f'g<h>i|j\\k"), "a_b_c_d_e_f_g_h_i_j_k");
        // Different names can collide once sanitised
        assert_eq!(parse_channels("x/y,x:y"), ["x_y"]);
    }

    #[test]
    fn reads_channel_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.txt");
        let contents = "# markets\nhuawei\n  xiaomi # phones\n\n#vivo\noppo\r\nhuawei\n";
        fs::write(&path, contents).unwrap();

        assert_eq!(read_channel_file(&path).unwrap(), ["huawei", "xiaomi", "oppo"]);
        let arg = format!("@{}", path.display());
        assert_eq!(read_channels(&arg).unwrap(), ["huawei", "xiaomi", "oppo"]);
        assert_eq!(read_channels("huawei,vivo").unwrap(), ["huawei", "vivo"]);
    }

    #[test]
    fn missing_channel_file_is_an_error() {
        assert!(matches!(
            read_channels("@/nonexistent/channels.txt").unwrap_err(),
            ChpackError::FileIoError(_)
        ));
    }

    #[test]
    fn output_names() {
        assert_eq!(
            output_file_name(Path::new("out/app-release.apk"), "huawei"),
            "app-release-huawei.apk"
        );
        assert_eq!(output_file_name(Path::new("app"), "vivo"), "app-vivo");
    }
}
