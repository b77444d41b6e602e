//! chainlogs CLI — inspect poller defaults and build info.
//!
//! Usage:
//! ```bash
//! chainlogs info
//! chainlogs version
//! ```

use std::env;
use std::process;

use chainlogs_core::config::PollerConfig;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "info" => cmd_info(),
        "version" | "--version" | "-V" => {
            println!("chainlogs {}", env!("CARGO_PKG_VERSION"));
        }
        "help" | "--help" | "-h" => print_usage(),
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    }
}

fn print_usage() {
    println!("chainlogs {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-aware EVM event log indexer\n");
    println!("USAGE:");
    println!("    chainlogs <COMMAND>\n");
    println!("COMMANDS:");
    println!("    info     Show default poller configuration");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info() {
    let cfg = PollerConfig::default();
    println!("ChainLogs v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default poll interval: {} ms", cfg.poll_interval_ms);
    println!("  Default finality depth: {} blocks", cfg.finality_depth);
    println!("  Default max reorg depth: {} blocks", cfg.max_reorg_depth);
    println!("  Default max blocks per cycle: {}", cfg.max_blocks_per_cycle);
    println!("  Reorg overflow policy: {:?}", cfg.reorg_overflow);
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
    println!("  Chains: EVM (Ethereum, Arbitrum, Base, Polygon, Optimism, ...)");
}
