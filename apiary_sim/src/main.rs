//! Apiary scenario CLI
//!
//! Run deterministic kernel scenarios and report pass/fail.

use apiary_sim::{ScenarioId, ScenarioResult, ScenarioRunner};
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Apiary deterministic scenario runner
#[derive(Parser, Debug)]
#[command(name = "apiary-sim")]
#[command(about = "Run deterministic scenarios against the apiary kernel", long_about = None)]
struct Args {
    /// Scenario to run (ping_pong, broadcast, alarms, auction, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Rally limit for the ping-pong players
    #[arg(long, default_value = "5")]
    rally_limit: u32,

    /// Number of auction bidders
    #[arg(long, default_value = "3")]
    bidders: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    // Parse scenarios
    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args.scenario.parse().unwrap_or_else(|e| {
            eprintln!("Error: {}", e);
            eprintln!("Available scenarios: ping_pong, broadcast, alarms, auction, all");
            std::process::exit(1);
        })]
    };

    let runner = ScenarioRunner::new()
        .with_rally_limit(args.rally_limit)
        .with_bidders(args.bidders);

    let mut results: Vec<ScenarioResult> = Vec::new();
    let mut failed_count = 0;

    for scenario in &scenarios {
        let result = runner.run(*scenario);

        if !args.json {
            if result.passed {
                info!(
                    "✓ {} passed ({} cycles, t={:.2}s)",
                    result.scenario, result.cycles, result.final_time_secs
                );
            } else {
                error!(
                    "✗ {} FAILED: {}",
                    result.scenario,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }

        if !result.passed {
            failed_count += 1;
        }
        results.push(result);
    }

    let total = results.len();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": results,
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(json) => println!("{}", json),
            Err(err) => {
                error!("failed to serialise summary: {}", err);
                std::process::exit(1);
            }
        }
    } else if failed_count == 0 {
        info!("All {} scenario runs passed", total);
    } else {
        error!("{}/{} scenario runs failed", failed_count, total);
    }

    // Exit with proper code for CI
    if failed_count > 0 {
        std::process::exit(1);
    }
}
