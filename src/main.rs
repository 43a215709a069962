// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! mcp-bridge main entry point - CLI for inspecting and driving MCP servers.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;

use mcp_bridge::config::{self, BridgeConfig};
use mcp_bridge::protocol::Content;
use mcp_bridge::telemetry::{init_telemetry, TelemetryConfig};
use mcp_bridge::{Bridge, Event, ServerStatus};

/// mcp-bridge version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// mcp-bridge - talk to Model Context Protocol servers.
#[derive(Parser)]
#[command(name = "mcp-bridge")]
#[command(author, version, about = "Connect to and drive MCP servers", long_about = None)]
struct Cli {
    /// Configuration file (default: search the working directory, then ~/.mcp-bridge)
    #[arg(short, long, env = "MCP_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short = 'f', long, value_enum, default_value = "text", global = true)]
    format: OutputFormat,

    /// Log connection lifecycle
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log all protocol traffic
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Subcommands for mcp-bridge.
#[derive(Subcommand)]
enum Commands {
    /// Connect every enabled server and report its status
    Status,

    /// List a server's tools
    Tools { server: String },

    /// List a server's resources
    Resources { server: String },

    /// List a server's prompts
    Prompts { server: String },

    /// Invoke a tool
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Read a resource
    Read { server: String, uri: String },

    /// Render a prompt
    Prompt {
        server: String,
        name: String,
        /// Prompt arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// Connect every enabled server and stream bridge events until Ctrl-C
    Watch,

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Initialize a new configuration file
    Init,

    /// Show version information
    Version,
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = if cli.debug {
        TelemetryConfig::debug()
    } else if cli.verbose {
        TelemetryConfig::verbose()
    } else {
        TelemetryConfig::default()
    };
    init_telemetry(&telemetry)?;

    let workspace_root = std::env::current_dir()?;
    let load = || -> anyhow::Result<BridgeConfig> {
        config::load_config(&workspace_root, cli.config.as_deref())
            .context("Failed to load configuration")
    };

    match cli.command {
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) | None => {
                println!("{}", serde_json::to_string_pretty(&load()?)?);
            }
        },
        Commands::Init => {
            let path = config::init_config(&workspace_root)?;
            println!("Created config file: {}", path.display());
        }
        Commands::Version => {
            println!("mcp-bridge {}", VERSION);
            println!("MCP protocol {}", mcp_bridge::PROTOCOL_VERSION);
        }
        Commands::Status => handle_status(&load()?, cli.format).await?,
        Commands::Watch => handle_watch(&load()?, cli.format).await?,
        command => handle_server_command(&load()?, command, cli.format).await?,
    }
    Ok(())
}

/// Connect only `server`.
async fn connect_one(config: &BridgeConfig, server: &str) -> anyhow::Result<Bridge> {
    let Some(server_config) = config.servers.get(server) else {
        bail!("Unknown server '{}'", server);
    };

    let bridge = Bridge::new(config);
    bridge
        .connect(server_config.clone())
        .await
        .with_context(|| format!("Failed to connect to '{}'", server))?;
    Ok(bridge)
}

fn parse_args(args: &str) -> anyhow::Result<Value> {
    serde_json::from_str(args).with_context(|| format!("--args is not valid JSON: {}", args))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_server_command(
    config: &BridgeConfig,
    command: Commands,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let server = match &command {
        Commands::Tools { server }
        | Commands::Resources { server }
        | Commands::Prompts { server }
        | Commands::Call { server, .. }
        | Commands::Read { server, .. }
        | Commands::Prompt { server, .. } => server.clone(),
        _ => return Ok(()),
    };

    let bridge = connect_one(config, &server).await?;
    let outcome = match command {
        Commands::Tools { .. } => list_tools(&bridge, &server, format).await,
        Commands::Resources { .. } => list_resources(&bridge, &server, format).await,
        Commands::Prompts { .. } => list_prompts(&bridge, &server, format).await,
        Commands::Call { tool, args, .. } => call_tool(&bridge, &server, &tool, &args, format).await,
        Commands::Read { uri, .. } => read_resource(&bridge, &server, &uri, format).await,
        Commands::Prompt { name, args, .. } => {
            render_prompt(&bridge, &server, &name, &args, format).await
        }
        _ => Ok(()),
    };
    bridge.shutdown().await;

    outcome.with_context(|| format!("Request to '{}' failed", server))
}

async fn list_tools(bridge: &Bridge, server: &str, format: OutputFormat) -> anyhow::Result<()> {
    let tools = bridge.list_tools(server).await?;
    if format == OutputFormat::Json {
        return print_json(&tools);
    }

    println!("{}", format!("Tools on {}", server).bright_blue().bold());
    for tool in tools {
        let marker = if tool.is_destructive() {
            "!".red()
        } else if tool.is_read_only() {
            "r".green()
        } else {
            " ".normal()
        };
        println!(
            " {} {} {}",
            marker,
            tool.qualified_name().bright_white(),
            tool.description.as_deref().unwrap_or("").dimmed()
        );
    }
    Ok(())
}

async fn list_resources(bridge: &Bridge, server: &str, format: OutputFormat) -> anyhow::Result<()> {
    let resources = bridge.list_resources(server).await?;
    if format == OutputFormat::Json {
        return print_json(&resources);
    }

    println!("{}", format!("Resources on {}", server).bright_blue().bold());
    for resource in resources {
        let name = if resource.name.is_empty() { &resource.uri } else { &resource.name };
        println!("  {} {}", name.bright_white(), resource.uri.dimmed());
    }
    Ok(())
}

async fn list_prompts(bridge: &Bridge, server: &str, format: OutputFormat) -> anyhow::Result<()> {
    let prompts = bridge.list_prompts(server).await?;
    if format == OutputFormat::Json {
        return print_json(&prompts);
    }

    println!("{}", format!("Prompts on {}", server).bright_blue().bold());
    for prompt in prompts {
        println!(
            "  {} {}",
            prompt.name.bright_white(),
            prompt.description.as_deref().unwrap_or("").dimmed()
        );
    }
    Ok(())
}

async fn call_tool(
    bridge: &Bridge,
    server: &str,
    tool: &str,
    args: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let result = bridge.call_tool(server, tool, parse_args(args)?).await?;
    if format == OutputFormat::Json {
        return print_json(&result);
    }

    if result.is_error {
        eprintln!("{}", result.as_text().red());
    } else {
        println!("{}", result.as_text());
    }
    Ok(())
}

async fn read_resource(
    bridge: &Bridge,
    server: &str,
    uri: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let result = bridge.read_resource(server, uri).await?;
    if format == OutputFormat::Json {
        return print_json(&result);
    }
    println!("{}", result.as_text());
    Ok(())
}

async fn render_prompt(
    bridge: &Bridge,
    server: &str,
    name: &str,
    args: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let result = bridge.get_prompt(server, name, parse_args(args)?).await?;
    if format == OutputFormat::Json {
        return print_json(&result);
    }

    if let Some(description) = &result.description {
        println!("{}", description.dimmed());
    }
    for message in &result.messages {
        let text = match &message.content {
            Content::Text { text } => text.clone(),
            other => serde_json::to_string(other)?,
        };
        println!("{}: {}", message.role.bright_cyan(), text);
    }
    Ok(())
}

async fn handle_status(config: &BridgeConfig, format: OutputFormat) -> anyhow::Result<()> {
    let bridge = Bridge::new(config);
    bridge.connect_configured().await;
    let summaries = bridge.summaries();

    if format == OutputFormat::Json {
        print_json(&summaries)?;
    } else {
        println!("{}", "MCP Servers".bright_blue().bold());
        if summaries.is_empty() {
            println!("{}", "No servers configured. Run 'mcp-bridge init' to create one.".dimmed());
        }
        for summary in &summaries {
            let status = match summary.status {
                ServerStatus::Connected => summary.status.to_string().green(),
                ServerStatus::Connecting => summary.status.to_string().yellow(),
                ServerStatus::Disconnected => summary.status.to_string().dimmed(),
                ServerStatus::Error => summary.status.to_string().red(),
            };
            let remote = summary
                .server_info
                .as_ref()
                .map(|info| format!("{} {}", info.name, info.version))
                .unwrap_or_default();
            println!("  {} [{}] {}", summary.name.bright_white(), status, remote.dimmed());

            if summary.status == ServerStatus::Connected {
                let caps = summary.capabilities;
                let flags: Vec<&str> = [
                    ("tools", caps.tools),
                    ("resources", caps.resources),
                    ("prompts", caps.prompts),
                    ("sampling", caps.sampling),
                ]
                .iter()
                .filter(|(_, on)| *on)
                .map(|(name, _)| *name)
                .collect();
                println!("    capabilities: {}", flags.join(", "));
            }
            if let Some(error) = &summary.last_error {
                println!("    {}", error.red());
            }
        }
    }

    bridge.shutdown().await;
    Ok(())
}

fn print_event(event: &Event, format: OutputFormat) {
    if format == OutputFormat::Json {
        if let Ok(line) = serde_json::to_string(event) {
            println!("{}", line);
        }
        return;
    }

    let time = event.timestamp.format("%H:%M:%S%.3f").to_string();
    let name = if event.payload.is_error() {
        event.name.red()
    } else {
        event.name.bright_cyan()
    };
    println!("{} {} {}", time.dimmed(), name, event.payload.server());
}

async fn handle_watch(config: &BridgeConfig, format: OutputFormat) -> anyhow::Result<()> {
    let bridge = Bridge::new(config);
    bridge.events().subscribe(move |event| print_event(event, format));

    let results = bridge.connect_configured().await;
    let connected = results.iter().filter(|(_, r)| r.is_ok()).count();
    if format == OutputFormat::Text {
        println!(
            "{}",
            format!("Watching {} of {} servers (Ctrl-C to stop)", connected, results.len()).dimmed()
        );
    }

    tokio::signal::ctrl_c().await?;
    bridge.shutdown().await;

    #[cfg(feature = "telemetry")]
    if format == OutputFormat::Text {
        println!("{}", mcp_bridge::telemetry::GLOBAL_METRICS.snapshot().format_report());
    }
    Ok(())
}
