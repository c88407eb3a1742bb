//! grantindex CLI — inspect engine defaults.
//!
//! Usage:
//! ```bash
//! grantindex info
//! grantindex version
//! ```

use std::env;
use std::process;

use grantindex_core::coordinator::CoordinatorConfig;
use grantindex_core::pool::PoolConfig;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    match args[1].as_str() {
        "info" => cmd_info(),
        "version" | "--version" | "-V" => {
            println!("grantindex {}", env!("CARGO_PKG_VERSION"));
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
    println!("grantindex {}", env!("CARGO_PKG_VERSION"));
    println!("Reorg-safe reconciliation engine for on-chain delegation events\n");
    println!("USAGE:");
    println!("    grantindex <COMMAND>\n");
    println!("COMMANDS:");
    println!("    info     Show engine defaults");
    println!("    version  Print version");
    println!("    help     Print this help");
}

fn cmd_info() {
    let coordinator = CoordinatorConfig::default();
    let pool = PoolConfig::default();
    println!("GrantIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default finality depth: {} blocks", coordinator.finality.finality_depth);
    println!("  Default canonical-hash window: {} blocks", coordinator.finality.hash_window);
    println!(
        "  Default pending buffer: {} events/tuple, TTL {}s",
        coordinator.sequencer.max_pending_per_tuple, coordinator.sequencer.pending_ttl_secs
    );
    println!("  Default retry budget: {} attempts", coordinator.retry.max_retries);
    println!("  Default pool: {} workers", pool.workers);
    println!("  Storage backends: memory, SQLite (feature: sqlite)");
}
