// CLI entry point for the standalone relay.
//
// Starts a relay with the in-memory backend. Plays named with `--play` are
// started at boot, and an active and a passive token are printed for each
// so clients can authenticate. Logging goes through `env_logger`; set
// `RUST_LOG` to change the level (default: info).
//
// Usage:
//   relay [OPTIONS]
//     --host <HOST>           Listen address (default: 127.0.0.1)
//     --port <PORT>           Listen port (default: 7878)
//     --play <ID>             Start a play at boot (repeatable)
//     --outbox-depth <N>      Per-connection push queue (default: 1024)

use std::process;

use playsync_protocol::types::{PermissionKind, PlayId};
use playsync_relay::server::{RelayConfig, start_relay};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (config, plays) = parse_args();

    let (handle, addr) = match start_relay(config) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Failed to start relay: {e}");
            process::exit(1);
        }
    };

    println!("Relay listening on {addr}");

    for play_id in plays {
        if let Err(e) = handle.start_play(play_id.clone()) {
            eprintln!("Failed to start play {play_id}: {e}");
            process::exit(1);
        }
        for kind in [PermissionKind::Active, PermissionKind::Passive] {
            match handle.create_play_token(play_id.clone(), kind) {
                Ok(token) => println!("play {play_id} {} token: {token}", kind.label()),
                Err(e) => {
                    eprintln!("Failed to create token for play {play_id}: {e}");
                    process::exit(1);
                }
            }
        }
    }

    // The relay runs until the process is killed.
    handle.wait();
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching,
/// no clap dependency.
fn parse_args() -> (RelayConfig, Vec<PlayId>) {
    let mut config = RelayConfig::default();
    let mut plays = Vec::new();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                config.host = args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--host requires a value");
                    process::exit(1);
                });
            }
            "--port" => {
                i += 1;
                config.port = args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
                    eprintln!("--port requires a valid port number");
                    process::exit(1);
                });
            }
            "--play" => {
                i += 1;
                let play_id = args.get(i).and_then(|s| PlayId::new(s.as_str()).ok());
                plays.push(play_id.unwrap_or_else(|| {
                    eprintln!("--play requires an id of letters, digits, '-' or '_'");
                    process::exit(1);
                }));
            }
            "--outbox-depth" => {
                i += 1;
                config.outbox_depth = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .filter(|depth| *depth > 0)
                    .unwrap_or_else(|| {
                        eprintln!("--outbox-depth requires a positive number");
                        process::exit(1);
                    });
            }
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    (config, plays)
}

fn print_usage() {
    println!("Usage: relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --host <HOST>           Listen address (default: 127.0.0.1)");
    println!("  --port <PORT>           Listen port (default: 7878)");
    println!("  --play <ID>             Start a play at boot and print its tokens (repeatable)");
    println!("  --outbox-depth <N>      Per-connection push queue (default: 1024)");
    println!("  --help, -h              Show this help");
}
