//! Command-line arguments for the `warden` binary.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use clap::Parser;
use std::path::PathBuf;

/// An on-device filtering SOCKS5 proxy. Binds a loopback port, prints it to
/// stdout, and serves until interrupted.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct WardenCli {
    /// Telemetry artifact path, rewritten once per second
    #[arg(long, default_value = "warden-telemetry.json", value_name = "PATH")]
    pub telemetry: PathBuf,
    /// Policy rule: -1 = no limit, 0 = block, N = download budget in bytes.
    /// May be repeated.
    #[arg(
        long = "rule",
        value_name = "DOMAIN=THRESHOLD",
        value_parser = parse_rule
    )]
    pub rules: Vec<(String, i64)>,
    /// Disable the policy filter entirely (relay only)
    #[arg(long)]
    pub no_filter: bool,
    /// Level of verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Level of quietness (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub quiet: u8,
}

fn parse_rule(arg: &str) -> Result<(String, i64), String> {
    let (domain, threshold) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected DOMAIN=THRESHOLD, got {arg:?}"))?;
    if domain.is_empty() {
        return Err(format!("empty domain in {arg:?}"));
    }
    let threshold = threshold
        .parse()
        .map_err(|e| format!("bad threshold in {arg:?}: {e}"))?;
    Ok((domain.to_owned(), threshold))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_parse() {
        assert_eq!(
            parse_rule("evil.test=0").unwrap(),
            ("evil.test".to_owned(), 0)
        );
        assert_eq!(
            parse_rule("streamy.test=1048576").unwrap(),
            ("streamy.test".to_owned(), 1_048_576)
        );
        assert_eq!(
            parse_rule("bulk.test=-1").unwrap(),
            ("bulk.test".to_owned(), -1)
        );
        assert!(parse_rule("no-equals").is_err());
        assert!(parse_rule("=5").is_err());
        assert!(parse_rule("evil.test=lots").is_err());
    }

    #[test]
    fn cli_parses_repeated_rules() {
        let cli = WardenCli::parse_from([
            "warden",
            "--rule",
            "evil.test=0",
            "--rule",
            "streamy.test=1024",
            "--no-filter",
            "-vv",
        ]);
        assert_eq!(cli.rules.len(), 2);
        assert!(cli.no_filter);
        assert_eq!(cli.verbose, 2);
    }
}
