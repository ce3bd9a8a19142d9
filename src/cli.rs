//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Outbound Guard - rate limiting, circuit breaking and retry for platform API calls
#[derive(Parser, Debug)]
#[command(name = "outbound-guard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OUTBOUND_GUARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "OUTBOUND_GUARD_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OUTBOUND_GUARD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate the configuration
    Validate,

    /// Print effective platform profiles
    Profiles {
        /// Only this platform
        #[arg(short, long)]
        platform: Option<String>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Yaml)]
        format: OutputFormat,
    },

    /// Perform one resilient call and print the response
    Call {
        /// Platform name (selects the profile)
        #[arg(short, long)]
        platform: String,

        /// Logical endpoint name
        #[arg(short, long)]
        endpoint: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request URL
        #[arg(short, long)]
        url: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,

        /// Extra header, `Name=Value` (repeatable)
        #[arg(short = 'H', long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Track state per user
        #[arg(long)]
        user: Option<String>,

        /// Budget units the call consumes
        #[arg(short, long, default_value_t = 1)]
        weight: u32,
    },
}

/// Output format for structured listings
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// YAML
    Yaml,
    /// Pretty JSON
    Json,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let split = raw
        .find(['=', ':'])
        .ok_or_else(|| format!("expected Name=Value, got '{raw}'"))?;
    let (name, value) = (&raw[..split], &raw[split + 1..]);
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_call() {
        let cli = Cli::try_parse_from([
            "outbound-guard",
            "call",
            "--platform",
            "linkedin",
            "--endpoint",
            "share",
            "-X",
            "POST",
            "--url",
            "https://api.linkedin.com/v2/ugcPosts",
            "-H",
            "Authorization=Bearer abc",
            "-H",
            "X-Trace: 1",
        ])
        .unwrap();

        let Command::Call {
            method, headers, weight, ..
        } = cli.command
        else {
            panic!("expected call");
        };
        assert_eq!(method, "POST");
        assert_eq!(weight, 1);
        assert_eq!(
            headers,
            vec![
                ("Authorization".to_string(), "Bearer abc".to_string()),
                ("X-Trace".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_header_rejects_garbage() {
        assert!(parse_header("no-separator").is_err());
        assert!(parse_header("=value").is_err());
        assert_eq!(
            parse_header("Authorization: Basic dXNlcg==").unwrap().1,
            "Basic dXNlcg=="
        );
    }

    #[test]
    fn test_profiles_format() {
        let cli = Cli::try_parse_from(["outbound-guard", "profiles", "--format", "json"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Profiles {
                format: OutputFormat::Json,
                platform: None
            }
        ));
    }
}
