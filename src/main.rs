//! tabnode - a Node environment for a browser tab, driven from the terminal
//!
//! The binary exposes the pieces that make sense without a browser:
//! - `shell`: an interactive shell over a session's virtual filesystem
//! - `resolve`: package resolution against a host directory copied into the VFS
//! - `accept-key` / `decode-frame`: WebSocket handshake and frame inspection

use clap::{Parser, Subcommand};
use colored::Colorize;
use miette::{IntoDiagnostic, Result, miette};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tabnode::cli::{Shell, import_host_tree};
use tabnode::fs::path as vfs_path;
use tabnode::resolver::ResolverProfile;
use tabnode::runtime::frame::{self, OpCode};
use tabnode::runtime::handshake::{self, WEBSOCKET_GUID};
use tabnode::runtime::{HostPrimitives, Runtime, RuntimeConfig};

#[derive(Parser)]
#[command(name = "tabnode")]
#[command(author, version, about = "Node filesystem, resolution and socket plumbing for a browser tab")]
struct Cli {
    /// Session config (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless TABNODE_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive shell over the virtual filesystem
    Shell {
        /// Host directory to copy into the session
        #[arg(long)]
        mount: Option<PathBuf>,
        /// Where the mounted directory lands (defaults to the project root)
        #[arg(long)]
        at: Option<String>,
    },
    /// Resolve a module specifier against a host project
    Resolve {
        specifier: String,
        /// Host project directory
        #[arg(long)]
        root: PathBuf,
        /// Use the CommonJS-first condition order
        #[arg(long)]
        cjs: bool,
        /// Directory to resolve from, relative to the project root
        #[arg(long)]
        from: Option<String>,
    },
    /// Compute sec-websocket-accept for a client nonce (a fresh one when omitted)
    AcceptKey {
        nonce: Option<String>,
        #[arg(long, default_value = WEBSOCKET_GUID)]
        guid: String,
    },
    /// Decode a hex-encoded WebSocket frame
    DecodeFrame { hex: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    set_up_logging(cli.verbose);

    let config = match &cli.config {
        Some(file) => RuntimeConfig::from_file(file).into_diagnostic()?,
        None => RuntimeConfig::default(),
    };

    match cli.command {
        Commands::Shell { mount, at } => run_shell(config, mount.as_deref(), at)?,
        Commands::Resolve {
            specifier,
            root,
            cjs,
            from,
        } => resolve(config, &specifier, &root, cjs, from.as_deref())?,
        Commands::AcceptKey { nonce, guid } => match nonce {
            Some(nonce) => println!("{}", handshake::accept_key(&nonce, &guid)),
            None => {
                let nonce = handshake::generate_nonce();
                println!("{} {}", nonce, handshake::accept_key(&nonce, &guid));
            }
        },
        Commands::DecodeFrame { hex } => decode_frame(&hex)?,
    }

    Ok(())
}

/// Logs go to stderr, filtered by `$TABNODE_LOG`
fn set_up_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter_layer = EnvFilter::try_from_env("TABNODE_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

fn run_shell(config: RuntimeConfig, mount: Option<&Path>, at: Option<String>) -> Result<()> {
    let runtime = Runtime::with_config(config, HostPrimitives::default()).into_diagnostic()?;

    if let Some(host_dir) = mount {
        let target = at.unwrap_or_else(|| runtime.config().project_root.clone());
        let copied = import_host_tree(runtime.fs(), host_dir, &target).into_diagnostic()?;
        println!(
            "{}: mounted {} files from {} at {}",
            "Info".cyan(),
            copied,
            host_dir.display(),
            target
        );
    }

    let mut shell = Shell::new(runtime);
    shell.run().into_diagnostic()?;
    Ok(())
}

fn resolve(
    config: RuntimeConfig,
    specifier: &str,
    root: &Path,
    cjs: bool,
    from: Option<&str>,
) -> Result<()> {
    let runtime = Runtime::with_config(config, HostPrimitives::default()).into_diagnostic()?;
    let project_root = runtime.config().project_root.clone();
    import_host_tree(runtime.fs(), root, &project_root).into_diagnostic()?;

    let from_dir = vfs_path::resolve(&project_root, from.unwrap_or("."));
    let profile = if cjs {
        ResolverProfile::dynamic()
    } else {
        ResolverProfile::declarative()
    };

    match runtime.resolver(profile).resolve(specifier, &from_dir) {
        Some(resolved) => {
            let relative = vfs_path::strip_ancestor(&resolved, &project_root);
            println!("{}", root.join(relative.trim_start_matches('/')).display());
            Ok(())
        }
        None => Err(miette!("Cannot find module '{}' from '{}'", specifier, from_dir)),
    }
}

fn decode_frame(hex_input: &str) -> Result<()> {
    let compact: String = hex_input.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&compact).into_diagnostic()?;

    let Some((decoded, consumed)) = frame::decode(&bytes).into_diagnostic()? else {
        return Err(miette!("Incomplete frame: {} bytes is not enough", bytes.len()));
    };

    println!("{} {}", "opcode:".cyan(), decoded.opcode);
    println!("{} {}", "fin:".cyan(), decoded.fin);
    println!("{} {}", "length:".cyan(), decoded.payload.len());
    match decoded.opcode {
        OpCode::Text => println!("{} {}", "payload:".cyan(), String::from_utf8_lossy(&decoded.payload)),
        OpCode::Close => {
            let (code, reason) = frame::parse_close_payload(&decoded.payload);
            let code = code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string());
            println!("{} {} {}", "close:".cyan(), code, reason);
        }
        _ => println!("{} {}", "payload:".cyan(), hex::encode(&decoded.payload)),
    }
    if consumed < bytes.len() {
        println!("{} {} trailing bytes", "Warning".yellow(), bytes.len() - consumed);
    }
    Ok(())
}
