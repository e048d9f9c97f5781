//! burrow binary.
//!
//! Usage: burrow --config <FILE>
//!
//! The config file selects the actor (server/client), the topology
//! (forward/reverse) and the routes; see the crate documentation.

use std::env;

use burrow::config::{Actor, ProxyMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=burrow=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();
    let config_path = match args.get(1).map(String::as_str) {
        Some("-c") | Some("--config") => match args.get(2) {
            Some(path) => path.clone(),
            None => {
                eprintln!("error: --config requires a file path");
                print_usage();
                std::process::exit(2);
            }
        },
        Some("-h") | Some("--help") | None => {
            print_usage();
            return Ok(());
        }
        Some(other) => {
            eprintln!("error: unknown option {other}");
            print_usage();
            std::process::exit(2);
        }
    };

    let config = burrow::config::load(&config_path)?;

    let actor = match config.actor {
        Actor::Server => "server",
        Actor::Client => "client",
    };
    let mode = match config.mode {
        ProxyMode::Forward => "forward",
        ProxyMode::Reverse => "reverse",
    };
    tracing::info!("starting {} in {} mode, peer {}", actor, mode, config.proxy_server);
    for route in &config.router {
        tracing::info!("route {} -> {}", route.ingress, route.egress);
    }

    burrow::proxy::run(config).await?;
    Ok(())
}

fn print_usage() {
    println!(
        r#"burrow - tunneling proxy over encrypted reliable UDP

USAGE:
    burrow --config <FILE>

OPTIONS:
    -c, --config <FILE>  Path to the TOML configuration file
    -h, --help           Print help information

EXAMPLE CONFIG:
    actor = "client"
    proxy_server = "203.0.113.7:8080"
    proxy_mode = 1  # 1 = forward, 0 = reverse
    proxy_router = [{{ in = "127.0.0.1:7000", out = "127.0.0.1:9000" }}]

    [socks5]
    username = "hi"
    password = "zerpro"

    [kcp]
    key = "wdnmd"
    salt = "hahahahahahaha"
    crypt = "aes-128"
    mode = "fast3"
"#
    );
}
