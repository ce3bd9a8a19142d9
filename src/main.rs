//! Outbound Guard - resilient outbound calls to platform APIs

use std::collections::BTreeMap;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use outbound_guard::{
    CallRequest, Failsafe,
    cli::{Cli, Command, OutputFormat},
    config::{Config, PlatformProfile},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Validate => run_validate(&config),
        Command::Profiles { platform, format } => run_profiles(&config, platform.as_deref(), format),
        Command::Call {
            platform,
            endpoint,
            method,
            url,
            data,
            headers,
            user,
            weight,
        } => {
            let mut request = CallRequest::new(platform, endpoint, method, url).weight(weight);
            for (name, value) in headers {
                request = request.header(name, value);
            }
            if let Some(user) = user {
                request = request.user(user);
            }
            run_call(&config, request, data.as_deref()).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_validate(config: &Config) -> anyhow::Result<ExitCode> {
    let failsafe = Failsafe::from_config(config)?;
    let platforms = failsafe.platforms();
    println!("✅ Configuration valid");
    println!("   Configured platforms: {}", config.platforms.len());
    println!("   Known platforms: {}", platforms.join(", "));
    Ok(ExitCode::SUCCESS)
}

fn run_profiles(
    config: &Config,
    platform: Option<&str>,
    format: OutputFormat,
) -> anyhow::Result<ExitCode> {
    let failsafe = Failsafe::from_config(config)?;
    let profiles: BTreeMap<String, PlatformProfile> = match platform {
        Some(name) => BTreeMap::from([(name.to_string(), (*failsafe.profile(name)).clone())]),
        None => failsafe
            .platforms()
            .into_iter()
            .map(|name| {
                let profile = (*failsafe.profile(&name)).clone();
                (name, profile)
            })
            .collect(),
    };

    let rendered = match format {
        OutputFormat::Yaml => serde_yaml::to_string(&profiles)?,
        OutputFormat::Json => serde_json::to_string_pretty(&profiles)?,
    };
    println!("{rendered}");
    Ok(ExitCode::SUCCESS)
}

async fn run_call(
    config: &Config,
    mut request: CallRequest,
    data: Option<&str>,
) -> anyhow::Result<ExitCode> {
    if let Some(raw) = data {
        let payload = serde_json::from_str(raw).context("--data is not valid JSON")?;
        request = request.payload(payload);
    }

    let failsafe = Failsafe::from_config(config)?;
    let key = request.key();
    info!(key = %key, url = %request.url, "Calling");

    let outcome = failsafe.call(request).await;
    let stats = failsafe.stats(&key)?;
    let code = match outcome {
        Ok(response) => {
            println!("{} {}", response.status, response.body);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {e}");
            ExitCode::FAILURE
        }
    };

    eprintln!("{}", failsafe.status_message(&key)?);
    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(code)
}
