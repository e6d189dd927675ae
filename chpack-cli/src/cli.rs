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

use std::{num::ParseIntError, path::PathBuf};

use chpack_api::{
    ApksignerVerifier, ChannelConfig, Scheme, SchemeVerifier, Verifier, CHANNEL_KEY,
    MIN_VERIFIED_SCHEMES
};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "chpack")]
#[command(version)]
#[command(
    about = "Writes distribution channels into signed APKs without re-signing them",
    long_about = None
)]
#[command(after_help = "Examples:\n  \
  chpack generate -c huawei,xiaomi -o out app-release.apk\n  \
  chpack generate -c @channels.txt app-release.apk\n  \
  chpack read out/app-release-huawei.apk")]
pub struct Cli {
    /// APK Signing Block entry ID holding the channel (decimal or 0x hex)
    #[arg(
        long,
        global = true,
        value_name = "ID",
        default_value = "0x7a786b21",
        value_parser = parse_block_id
    )]
    pub block_id: u32,

    /// Key the channel is stored under
    #[arg(long, global = true, value_name = "KEY", default_value = CHANNEL_KEY)]
    pub key: String,

    /// Verify with this apksigner instead of the built-in v2/v3 verifier
    #[arg(long, global = true, value_name = "PATH")]
    pub apksigner: Option<PathBuf>,

    /// Fewest signature schemes an APK must verify with
    #[arg(long, global = true, value_name = "N", default_value_t = MIN_VERIFIED_SCHEMES)]
    pub min_schemes: usize,

    /// Schemes an APK must verify with, e.g. v1,v2
    #[arg(long, global = true, value_name = "SCHEMES", value_delimiter = ',')]
    pub require: Vec<Scheme>,

    #[command(subcommand)]
    pub command: Commands
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write one copy of the APK per channel
    Generate {
        /// Comma separated channels, or @file with one channel per line
        #[arg(short, long, value_name = "LIST|@FILE")]
        channels: String,

        /// Output directory
        #[arg(short, long, value_name = "DIR", default_value = "output")]
        output: PathBuf,

        apk: PathBuf
    },
    /// Check the APK's signatures and print its channel
    Verify {
        apk: PathBuf,

        /// Also require the APK to carry this channel
        #[arg(long)]
        channel: Option<String>
    },
    /// Print the APK's channel
    Read {
        apk: PathBuf,

        /// Search the end of the file for the channel before parsing the ZIP
        #[arg(long)]
        fast: bool
    },
    /// Write a channel into the APK Signing Block, in place
    Write { apk: PathBuf, channel: String },
    /// Tag an APK without an APK Signing Block through its ZIP comment
    LegacyWrite { apk: PathBuf, market: String },
    /// Print the ZIP comment tag
    LegacyRead { apk: PathBuf }
}

impl Cli {
    pub fn config(&self) -> ChannelConfig {
        ChannelConfig {
            block_id: self.block_id,
            channel_key: self.key.clone(),
            min_schemes: self.min_schemes,
            required_schemes: self.require.clone(),
            ..ChannelConfig::default()
        }
    }

    pub fn verifier(&self) -> Box<dyn Verifier> {
        match &self.apksigner {
            Some(program) => Box::new(ApksignerVerifier::new(program)),
            None => Box::new(SchemeVerifier)
        }
    }
}

pub fn parse_block_id(value: &str) -> Result<u32, ParseIntError> {
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn block_ids() {
        assert_eq!(parse_block_id("0x7a786b21").unwrap(), 0x7a786b21);
        assert_eq!(parse_block_id("0XFF").unwrap(), 255);
        assert_eq!(parse_block_id("4096").unwrap(), 4096);
        assert!(parse_block_id("0xZZ").is_err());
        assert!(parse_block_id("-1").is_err());
    }

    #[test]
    fn global_options_map_onto_config() {
        let cli = Cli::parse_from([
            "chpack",
            "read",
            "app.apk",
            "--block-id",
            "0x1000",
            "--key",
            "market",
            "--require",
            "v1,v2"
        ]);
        let config = cli.config();
        assert_eq!(config.block_id, 0x1000);
        assert_eq!(config.channel_key, "market");
        assert_eq!(config.required_schemes, [Scheme::V1, Scheme::V2]);
        assert_eq!(config.min_schemes, MIN_VERIFIED_SCHEMES);
        assert!(matches!(cli.command, Commands::Read { fast: false, .. }));

        let defaults = Cli::parse_from(["chpack", "generate", "-c", "a,b", "app.apk"]);
        assert_eq!(defaults.config(), ChannelConfig::default());
        match defaults.command {
            Commands::Generate { channels, output, .. } => {
                assert_eq!(channels, "a,b");
                assert_eq!(output, PathBuf::from("output"));
            }
            other => panic!("parsed {other:?}")
        }
    }
}
