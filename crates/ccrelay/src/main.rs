//! ccrelay - launch an assistant behind a local multi-endpoint proxy

use anyhow::{Context, Result};
use ccrelay_config::CcrelayConfig;
use ccrelay_proxy::{
    EndpointRegistry, Launch, ProxyStatus, SingletonCoordinator, StopSignal, StopSignals,
    TransformerRegistry,
};
use clap::Parser;
use colored::Colorize;
use std::io::Write;
use std::process::ExitStatus;

mod commands;
mod telemetry;

use commands::{Cli, Commands};
use telemetry::{init_subscriber, TelemetryConfig};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_subscriber(&TelemetryConfig::from_verbosity(cli.verbose, cli.log_json));

    let result = match &cli.command {
        Commands::Run { command, args } => run_assistant(&cli, command, args).await,
        Commands::Serve => run_serve(&cli).await.map(|()| 0),
        Commands::Status { json } => run_status(&cli, *json).await.map(|()| 0),
        Commands::Transformers => run_transformers(&cli).map(|()| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            std::process::exit(1);
        }
    }
}

/// File, then environment, then command-line flags.
fn load_config(cli: &Cli) -> Result<CcrelayConfig> {
    let mut config = ccrelay_config::load_config(cli.config.as_deref())?;
    ccrelay_config::apply_env_overrides(&mut config)?;
    if let Some(strategy) = cli.strategy {
        config.settings.strategy = strategy;
    }
    if let Some(port) = cli.port {
        config.settings.proxy.port = port;
    }
    Ok(config)
}

async fn start(cli: &Cli) -> Result<Launch> {
    let config = load_config(cli)?;
    let launch = ccrelay_proxy::start_or_reuse(&config, &ccrelay_config::state_dir())
        .await
        .context("failed to start proxy")?;
    report_launch(&launch, cli.verbose > 0).await;
    Ok(launch)
}

async fn report_launch(launch: &Launch, verbose: bool) {
    let action = if launch.is_reused() {
        "Reusing proxy".yellow().bold()
    } else {
        "Started proxy".green().bold()
    };

    match launch.status().await {
        Ok(status) => {
            eprintln!(
                "{} {} ({})",
                action,
                launch.url().cyan(),
                status.summary().dimmed()
            );
            if verbose {
                print_endpoint_table(&status, &mut std::io::stderr());
            }
        }
        Err(e) => {
            eprintln!("{} {}", action, launch.url().cyan());
            tracing::warn!(error = %e, "could not read proxy status");
        }
    }
}

async fn run_assistant(cli: &Cli, command: &str, args: &[String]) -> Result<i32> {
    let mut signals = StopSignals::install().context("failed to install signal handlers")?;
    let launch = start(cli).await?;

    let spawned = tokio::process::Command::new(command)
        .args(args)
        .env("ANTHROPIC_BASE_URL", launch.url())
        .env("ANTHROPIC_API_KEY", launch.api_key())
        .env_remove("ANTHROPIC_AUTH_TOKEN")
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            launch.shutdown().await;
            return Err(e).with_context(|| format!("failed to launch '{}'", command));
        }
    };

    // Ctrl-C belongs to the assistant; keep the proxy alive until it exits.
    // Terminate and hangup end the session.
    let status: std::io::Result<ExitStatus> = loop {
        tokio::select! {
            status = child.wait() => break status,
            signal = signals.recv() => match signal {
                StopSignal::Interrupt => tracing::debug!("interrupt left to assistant"),
                other => {
                    tracing::info!(signal = other.name(), "stopping assistant");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to stop assistant");
                    }
                    launch.shutdown().await;
                    return Ok(other.exit_code());
                }
            },
        }
    };

    let sharing = launch.active_leases();
    if sharing > 0 {
        eprintln!(
            "{}",
            format!("Waiting for {} other ccrelay session(s) to finish...", sharing).dimmed()
        );
        tokio::select! {
            _ = launch.wait_for_leases() => {}
            signal = signals.recv() => {
                tracing::info!(signal = signal.name(), "stopped waiting for shared sessions");
            }
        }
    }
    launch.shutdown().await;

    let status = status.with_context(|| format!("failed to wait for '{}'", command))?;
    Ok(status.code().unwrap_or(1))
}

async fn run_serve(cli: &Cli) -> Result<()> {
    let mut signals = StopSignals::install().context("failed to install signal handlers")?;
    let launch = start(cli).await?;
    match &launch {
        Launch::Reused(shared) => {
            println!(
                "{} already serving at {} (pid {})",
                "ccrelay".bold(),
                shared.url().cyan(),
                shared.pid()
            );
        }
        Launch::Started(instance) => {
            println!("{}: {}", "URL".cyan(), instance.url());
            println!("{}: {}", "API key".cyan(), instance.api_key());
            println!("{}", "Press Ctrl-C to stop.".dimmed());

            let signal = signals.recv().await;
            tracing::debug!(signal = signal.name(), "stop requested");
            eprintln!("{}", "Shutting down...".dimmed());
        }
    }
    launch.shutdown().await;
    Ok(())
}

async fn run_status(cli: &Cli, json: bool) -> Result<()> {
    let proxy = load_config(cli)
        .map(|config| config.settings.proxy)
        .unwrap_or_default();
    let port = cli.port.unwrap_or(proxy.port);
    let coordinator = SingletonCoordinator::new(ccrelay_config::state_dir(), proxy.host, port);

    let Some(shared) = coordinator.running()? else {
        println!("{}", "No ccrelay proxy is running.".dimmed());
        return Ok(());
    };

    let status = shared
        .fetch_status()
        .await
        .with_context(|| format!("proxy at {} did not answer", shared.url()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "{} {} (pid {})",
        "Proxy".cyan().bold(),
        shared.url(),
        shared.pid()
    );
    println!("{}", status.summary());
    print_endpoint_table(&status, &mut std::io::stdout());
    Ok(())
}

fn run_transformers(cli: &Cli) -> Result<()> {
    let transformers = TransformerRegistry::with_builtins();

    println!("{}", "Transformers:".cyan().bold());
    println!("  {} {}", "passthrough".yellow(), "(Anthropic-native)".dimmed());
    for info in transformers.list() {
        let domains = if info.domains.is_empty() {
            "explicit only".to_string()
        } else {
            info.domains.join(", ")
        };
        println!("  {} {}", info.name.yellow(), domains.dimmed());
    }

    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            println!();
            println!("{} {:#}", "No endpoints loaded:".dimmed(), e);
            return Ok(());
        }
    };
    let registry = EndpointRegistry::from_profiles(&config.profiles)?;

    println!();
    println!("{}", "Endpoints:".cyan().bold());
    for endpoint in registry.endpoints() {
        let binding = transformers.resolve(endpoint)?;
        println!(
            "  {:<20} {:<10} {}",
            endpoint.name,
            binding.name().yellow(),
            endpoint.base_url.dimmed()
        );
    }
    Ok(())
}

fn print_endpoint_table(status: &ProxyStatus, out: &mut dyn Write) {
    let _ = writeln!(out, "{}", "─".repeat(72).dimmed());
    for endpoint in &status.per_endpoint {
        let marker = if endpoint.is_healthy {
            "✓".green()
        } else {
            "✗".red()
        };
        let latency = endpoint
            .average_response_time_ms
            .map(|ms| format!("{:.0}ms", ms))
            .unwrap_or_else(|| "-".to_string());
        let ban = endpoint
            .banned_for_secs
            .map(|secs| format!("banned {}s", secs))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  {} {:<20} {:<12} {:>8} {:>6} req  {}",
            marker,
            endpoint.name,
            endpoint.transformer,
            latency,
            endpoint.total_requests,
            ban.red()
        );
    }
    let _ = writeln!(out, "{}", "─".repeat(72).dimmed());
}
