// CLI entry point for the standalone Rookery session server.
//
// Runs either role: a forwarding relay for peer-hosted sessions (the
// default) or a bare authoritative server, which accepts clients but
// dispatches RPCs to no-one — useful for soak-testing connectivity.
// See `buffer.rs` for the engine and `runner.rs` for the cycle thread.
//
// Usage:
//   rookery-relay [OPTIONS]
//     --mode <relay|authority>  Session role (default: relay)
//     --tcp-port <PORT>         Reliable listen port (default: 7878)
//     --udp-port <PORT>         Unreliable listen port (default: 7879)
//     --app-id <ID>             Required application id (default: 0)
//     --max-clients <N>         Max connected clients (default: 16)
//     --migratable              Keep the session alive when the host leaves
//     --host <ADDR>             Designated host address (relay mode)
//     --config <FILE>           Load a JSON SessionConfig (flags override it)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use rookery_protocol::RpcRegistry;
use rookery_session::config::SessionConfig;
use rookery_session::runner::{SessionRole, start_session};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let (role, config) = parse_args();

    let (handle, tcp_addr, udp_addr) = match start_session(role, config, RpcRegistry::new()) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start session: {e}");
            std::process::exit(1);
        }
    };

    println!("Session listening on tcp {tcp_addr} / udp {udp_addr}");
    println!("Press Ctrl+C to stop.");

    // The process exits on SIGINT/SIGTERM by default, which closes the
    // sockets with it; no signal handler crate needed for a relay.
    let running = Arc::new(AtomicBool::new(true));
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    handle.stop();
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching —
/// no clap dependency.
fn parse_args() -> (SessionRole, SessionConfig) {
    let mut role = SessionRole::Relay;
    let mut config = SessionConfig::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--mode" => {
                i += 1;
                role = match args.get(i).map(String::as_str) {
                    Some("relay") => SessionRole::Relay,
                    Some("authority") => SessionRole::Authoritative,
                    _ => {
                        eprintln!("--mode requires 'relay' or 'authority'");
                        std::process::exit(1);
                    }
                };
            }
            "--tcp-port" => {
                i += 1;
                config.tcp_port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--tcp-port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--udp-port" => {
                i += 1;
                config.udp_port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--udp-port requires a valid port number");
                    std::process::exit(1);
                });
            }
            "--app-id" => {
                i += 1;
                config.app_id = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--app-id requires a valid number");
                    std::process::exit(1);
                });
            }
            "--max-clients" => {
                i += 1;
                config.max_clients =
                    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--max-clients requires a valid number");
                        std::process::exit(1);
                    });
            }
            "--migratable" => {
                config.migratable = true;
            }
            "--host" => {
                i += 1;
                config.host_addr =
                    Some(args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                        eprintln!("--host requires a valid IP address");
                        std::process::exit(1);
                    }));
            }
            "--config" => {
                i += 1;
                let path = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--config requires a file path");
                    std::process::exit(1);
                });
                config = load_config(&path);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    (role, config)
}

/// Load a `SessionConfig` from a JSON file. Missing fields take defaults.
fn load_config(path: &str) -> SessionConfig {
    let contents = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {path}: {e}");
        std::process::exit(1);
    });
    serde_json::from_str(&contents).unwrap_or_else(|e| {
        eprintln!("Failed to parse {path}: {e}");
        std::process::exit(1);
    })
}

fn print_usage() {
    println!("Usage: rookery-relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --mode <relay|authority>  Session role (default: relay)");
    println!("  --tcp-port <PORT>         Reliable listen port (default: 7878)");
    println!("  --udp-port <PORT>         Unreliable listen port (default: 7879)");
    println!("  --app-id <ID>             Required application id (default: 0)");
    println!("  --max-clients <N>         Max connected clients (default: 16)");
    println!("  --migratable              Keep the session alive when the host leaves");
    println!("  --host <ADDR>             Designated host address (relay mode)");
    println!("  --config <FILE>           Load a JSON SessionConfig (flags override it)");
    println!("  --help, -h                Show this help");
}
