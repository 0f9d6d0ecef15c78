//! # mcplink-cli
//!
//! Command-line client for MCP tool servers. Spawns a server, negotiates
//! the session, and exposes its tools either as a one-shot call or an
//! interactive prompt.

use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mcplink_client::{Connection, ServerConfig, ToolDescriptor};

/// mcplink - talk to an MCP tool server from your terminal
#[derive(Parser)]
#[command(name = "mcplink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server executable or script (.py and .js scripts get a launcher)
    #[arg(value_name = "SERVER")]
    server: String,

    /// Arguments passed to the server
    #[arg(value_name = "SERVER_ARGS", trailing_var_arg = true)]
    server_args: Vec<String>,

    /// Call a single tool and exit
    #[arg(short, long, value_name = "TOOL")]
    call: Option<String>,

    /// Tool arguments as a JSON object (used with --call)
    #[arg(short, long, value_name = "JSON")]
    args: Option<String>,

    /// Per-request timeout in seconds
    #[arg(short, long, default_value = "30")]
    timeout: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Resolve a server path into a spawnable command plus leading arguments.
///
/// Script files need an interpreter in front of them; anything else is
/// assumed to be directly executable.
fn resolve_launcher(server: &str) -> (String, Vec<String>) {
    if server.ends_with(".py") {
        ("python3".to_string(), vec![server.to_string()])
    } else if server.ends_with(".js") {
        ("node".to_string(), vec![server.to_string()])
    } else {
        (server.to_string(), Vec::new())
    }
}

fn print_tools(tools: &[ToolDescriptor]) {
    if tools.is_empty() {
        println!("(server exposes no tools)");
        return;
    }
    println!("Available tools:");
    for tool in tools {
        match &tool.description {
            Some(description) => println!("  {} - {}", tool.name, description),
            None => println!("  {}", tool.name),
        }
    }
}

/// Run one tool call and print the outcome. Returns whether the
/// connection is still usable afterwards.
async fn run_call(connection: &Connection, name: &str, arguments: Option<Value>) -> bool {
    match connection.call_tool(name, arguments).await {
        Ok(result) => {
            println!("{}", result.text());
            true
        }
        Err(err) => {
            eprintln!("error: {err}");
            !err.is_connection_fatal()
        }
    }
}

fn parse_args_json(raw: Option<&str>) -> anyhow::Result<Option<Value>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("tool arguments are not valid JSON")?;
    if !value.is_object() {
        bail!("tool arguments must be a JSON object");
    }
    Ok(Some(value))
}

async fn interactive(connection: &Connection) -> anyhow::Result<()> {
    let tools = connection.list_tools().await?;
    print_tools(&tools);
    println!("Commands: tools | call <name> [json] | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "quit" | "exit" => break,
            "tools" => {
                let tools = connection.refresh_tools().await?;
                print_tools(&tools);
            }
            "call" => {
                let (name, raw_args) = match rest.split_once(char::is_whitespace) {
                    Some((name, raw)) => (name, Some(raw.trim())),
                    None if !rest.is_empty() => (rest, None),
                    None => {
                        eprintln!("usage: call <name> [json]");
                        continue;
                    }
                };
                let arguments = match parse_args_json(raw_args) {
                    Ok(arguments) => arguments,
                    Err(err) => {
                        eprintln!("error: {err:#}");
                        continue;
                    }
                };
                if !run_call(connection, name, arguments).await {
                    bail!("connection to {} lost", connection.name());
                }
            }
            other => {
                eprintln!("unknown command: {other}");
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let (command, mut args) = resolve_launcher(&cli.server);
    args.extend(cli.server_args.iter().cloned());

    let config = ServerConfig::new(&cli.server, command)
        .with_args(args)
        .with_request_timeout(Duration::from_secs(cli.timeout));

    let connection = Connection::spawn(config)
        .await
        .with_context(|| format!("failed to connect to {}", cli.server))?;

    let capabilities = connection.capabilities().await?;
    eprintln!(
        "Connected to {} (protocol {})",
        capabilities.server_info.name, capabilities.protocol_version
    );

    let outcome = match &cli.call {
        Some(tool) => {
            let arguments = parse_args_json(cli.args.as_deref())?;
            match connection.call_tool(tool, arguments).await {
                Ok(result) => {
                    println!("{}", result.text());
                    Ok(())
                }
                Err(err) => Err(anyhow::Error::from(err)),
            }
        }
        None => interactive(&connection).await,
    };

    if let Err(err) = connection.close().await {
        // The session result matters more than teardown noise.
        tracing::debug!("close failed: {err}");
    }
    outcome
}
