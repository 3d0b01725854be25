//! Burrow - port-forwarding tunnel

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use burrow::app::{Medium, Runtime, RuntimeConfig};
use burrow::error::Result;

fn main() -> Result<()> {
    let args = match Args::parse() {
        Some(args) => args,
        None => {
            print_help();
            std::process::exit(1);
        }
    };

    if args.version {
        print_version();
        return Ok(());
    }

    // Initialize logging
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");

    info!("Burrow v{} starting...", env!("CARGO_PKG_VERSION"));

    let Some(config) = args.config else {
        print_help();
        std::process::exit(1);
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::from_config(config)?;
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

/// Command line arguments
struct Args {
    config: Option<RuntimeConfig>,
    version: bool,
}

impl Args {
    fn parse() -> Option<Self> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let mut positional = Vec::new();
        let mut medium = Medium::Tcp;
        let mut user = None;
        let mut version = false;

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--mux" => medium = Medium::Mux,
                "--user" => {
                    let (name, password) = args.get(i + 1)?.split_once(':')?;
                    user = Some((name.to_string(), password.to_string()));
                    i += 1;
                }
                "-v" | "--version" => version = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                arg if !arg.starts_with('-') => positional.push(arg.to_string()),
                _ => return None,
            }
            i += 1;
        }

        if version {
            return Some(Self {
                config: None,
                version,
            });
        }

        let config = match positional.as_slice() {
            [mode, listen] if mode == "server" => RuntimeConfig::server(listen.clone(), medium),
            [mode, listen, server, target] if mode == "client" => {
                RuntimeConfig::client(listen.clone(), server.clone(), target.clone(), medium)
            }
            _ => return None,
        };
        let config = match user {
            Some((name, password)) => config.with_user(name, password),
            None => config,
        };

        Some(Self {
            config: Some(config),
            version,
        })
    }
}

fn print_help() {
    println!(r#"Burrow - port-forwarding tunnel

USAGE:
    burrow server <LISTEN> [--mux] [--user NAME:PASSWORD]
    burrow client <LISTEN> <SERVER> <TARGET> [--mux] [--user NAME:PASSWORD]

OPTIONS:
    --mux                   Multiplex all tunnels over one connection
    --user <NAME:PASSWORD>  Server: accepted user. Client: credentials to present
    -v, --version           Print version information
    -h, --help              Print help information

EXAMPLES:
    burrow server 0.0.0.0:4433 --mux
    burrow client 127.0.0.1:2222 proxy.example:4433 10.0.0.5:22 --mux
"#);
}

fn print_version() {
    println!("Burrow v{}", env!("CARGO_PKG_VERSION"));
}
