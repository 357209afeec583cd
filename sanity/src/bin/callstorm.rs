use clap::Parser;
use log::info;
use sanity::*;

/// Drives random trees of intercepted calls through return thunks,
/// one thunk factory per thread, and checks every exit.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Threads to storm on, each with its own factory
    #[arg(short, long, env = "CALLSTORM_THREADS", default_value_t = 4)]
    threads:            usize,

    /// Trees per thread
    #[arg(short, long, env = "CALLSTORM_ROUNDS", default_value_t = 100)]
    rounds:             usize,

    /// Deepest a call may nest
    #[arg(short = 'd', long, env = "CALLSTORM_MAX_DEPTH", default_value_t = 300)]
    max_depth:          u64,

    /// Most extra children per call
    #[arg(short = 'f', long, env = "CALLSTORM_MAX_FANOUT", default_value_t = 3)]
    max_fanout:         u32,

    /// Rough number of calls per tree
    #[arg(short, long, env = "CALLSTORM_CALLS", default_value_t = 2000)]
    calls_per_round:    usize,

    #[arg(short, long, env = "CALLSTORM_SEED", default_value_t = 0x5eed)]
    seed:               u64,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Args::parse();
    let cfg = StormConfig {
        rounds:             cli.rounds,
        max_depth:          cli.max_depth,
        max_fanout:         cli.max_fanout,
        calls_per_round:    cli.calls_per_round,
        seed:               cli.seed,
    };
    info!("storming {} threads with {:?}", cli.threads, cfg);

    let reports = run_storms(&cfg, cli.threads)?;
    for (t, report) in reports.iter().enumerate() {
        println!(
            "thread {}:\t{} calls\tdeepest {}\t{} thunks\t{} pages\t{} raw",
            t, report.calls, report.deepest, report.distinct, report.pages, report.raw_span
        );
    }
    let total: usize = reports.iter().map(|r| r.calls).sum();
    println!("{} intercepted calls, all accounted for.", total);

    Ok(())
}
