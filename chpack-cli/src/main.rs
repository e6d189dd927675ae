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

use std::{path::Path, process::ExitCode};

use chpack_api::{generate, read_channels, ChannelPacker, ChpackError, Result, Verifier};
use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

mod cli;

/// Tags signed APKs with distribution channels.
///
/// ```text
/// $ chpack generate -c huawei,xiaomi -o out app-release.apk
/// $ ls out
/// app-release-huawei.apk app-release-xiaomi.apk
/// $ chpack read out/app-release-huawei.apk
/// huawei
/// ```
///
/// Logging is controlled with `RUST_LOG`, e.g. `RUST_LOG=chpack_sign=debug`.
fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let packer = ChannelPacker::new(cli.config());
    let verifier = cli.verifier();
    match &cli.command {
        Commands::Generate {
            channels,
            output,
            apk
        } => generate_channels(apk, channels, output, &packer, verifier.as_ref()),
        Commands::Verify { apk, channel } => {
            verify(apk, channel.as_deref(), &packer, verifier.as_ref())
        }
        Commands::Read { apk, fast } => {
            let channel = if *fast {
                packer.read_fast(apk)?
            } else {
                packer.read(apk)?
            };
            println!("{}", channel.ok_or(ChpackError::NotFound)?);
            Ok(())
        }
        Commands::Write { apk, channel } => {
            packer.write(apk, channel)?;
            println!("Wrote channel {channel:?} to {}", apk.display());
            Ok(())
        }
        Commands::LegacyWrite { apk, market } => {
            if !packer.write_legacy(apk, market)? {
                return Err(ChpackError::Cli("Market must not be empty".into()));
            }
            println!("Tagged {} with {market:?}", apk.display());
            Ok(())
        }
        Commands::LegacyRead { apk } => {
            println!("{}", packer.read_legacy(apk)?.ok_or(ChpackError::NotFound)?);
            Ok(())
        }
    }
}

fn generate_channels(
    apk: &Path,
    channels: &str,
    output: &Path,
    packer: &ChannelPacker,
    verifier: &dyn Verifier
) -> Result<()> {
    if !apk.is_file() {
        return Err(ChpackError::Cli(format!("Invalid input APK: {}", apk.display())));
    }
    let channels = read_channels(channels)?;
    if channels.is_empty() {
        return Err(ChpackError::Cli("No channels given".into()));
    }
    println!("Input: {}", apk.display());
    println!("Output: {}", output.display());
    println!("Channels: {}", channels.join(", "));

    let report = generate(apk, &channels, output, packer, verifier)?;
    for path in &report.generated {
        println!("Generated {}", path.display());
    }
    for (channel, err) in &report.failed {
        eprintln!("Failed {channel}: {err}");
    }
    if !report.is_success() {
        return Err(ChpackError::Cli(format!(
            "{} of {} channels failed",
            report.failed.len(),
            channels.len()
        )));
    }
    println!("Generated {} APKs", report.generated.len());
    Ok(())
}

fn verify(
    apk: &Path,
    channel: Option<&str>,
    packer: &ChannelPacker,
    verifier: &dyn Verifier
) -> Result<()> {
    let report = verifier.verify(apk)?;
    let schemes: Vec<String> = report
        .verified_schemes()
        .iter()
        .map(ToString::to_string)
        .collect();
    println!("File: {}", apk.display());
    println!("Signed: {}", report.verified());
    println!("Schemes: {}", schemes.join(", "));
    println!("Channel: {}", packer.read(apk)?.unwrap_or_default());
    for err in &report.errors {
        println!("  {err}");
    }
    match channel {
        Some(channel) => packer.verify(apk, channel, verifier),
        None => packer.signature_schemes(apk, verifier).map(|_| ())
    }
}
