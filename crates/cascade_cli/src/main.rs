use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use cascade::fixtures::{self, Fixture};
use cascade::{BridgeConfig, CaptureHost, ForeignBridge, Host, Listing, MethodTable, StdoutHost};
use cascade_interp::{ExecutionError, InteropErrorPolicy, Interpreter, InterpreterOptions, Outcome};
use clap::{Parser, Subcommand, ValueEnum};
use rayon::prelude::*;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Deep managed recursion maps onto native recursion in the interpreter.
const WORKER_STACK_SIZE: usize = 64 * 1024 * 1024;

#[derive(Parser)]
#[command(name = "cascade", about = "Run bundled programs on the cascade bytecode engine")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the bundled programs
    List,
    /// Run one or more bundled programs
    Run(RunArgs),
    /// Print the methods, instructions and protected regions of a bundled program
    Dump {
        /// Program to print
        name: String,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Programs to run
    #[arg(required_unless_present = "all")]
    names: Vec<String>,

    /// Run every bundled program
    #[arg(long, conflicts_with = "names")]
    all: bool,

    /// Directory searched for native libraries (repeatable)
    #[arg(long = "lib-path", value_name = "DIR")]
    lib_paths: Vec<PathBuf>,

    /// Maximum nested method activations
    #[arg(long, default_value_t = InterpreterOptions::default().max_call_depth)]
    max_depth: usize,

    /// What a failed foreign call does
    #[arg(long, value_enum, default_value_t = InteropMode::Throw)]
    interop_errors: InteropMode,

    /// Worker threads; one worker without --check streams output as it is written
    #[arg(long, short, default_value_t = 1)]
    jobs: usize,

    /// Compare each program's output with its expected output
    #[arg(long)]
    check: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum InteropMode {
    /// Raise a managed exception at the call site
    Throw,
    /// Stop the program with an error
    Fatal,
}

impl From<InteropMode> for InteropErrorPolicy {
    fn from(mode: InteropMode) -> Self {
        match mode {
            InteropMode::Throw => InteropErrorPolicy::Throw,
            InteropMode::Fatal => InteropErrorPolicy::Fatal,
        }
    }
}

/// One finished program.
struct Report {
    fixture: &'static Fixture,
    lines: Vec<String>,
    result: Result<Outcome, ExecutionError>,
    elapsed: Duration,
}

impl Report {
    fn passed(&self, check: bool) -> bool {
        succeeded(&self.result) && (!check || self.lines == self.fixture.expected_output())
    }
}

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}

fn run() -> Result<bool> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::List => {
            for fixture in fixtures::all() {
                println!("{:<14} {:<28} {}", fixture.name, fixture.entry, fixture.summary);
            }
            Ok(true)
        }
        Command::Run(args) => run_programs(args),
        Command::Dump { name } => {
            let table = build(find(&name)?)?;
            print!("{}", Listing(table.as_ref()));
            Ok(true)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn find(name: &str) -> Result<&'static Fixture> {
    match fixtures::find(name) {
        Some(fixture) => Ok(fixture),
        None => bail!("unknown program '{}' (try `cascade list`)", name),
    }
}

fn select(args: &RunArgs) -> Result<Vec<&'static Fixture>> {
    if args.all {
        return Ok(fixtures::all().iter().collect());
    }
    args.names.iter().map(|name| find(name)).collect()
}

fn build(fixture: &Fixture) -> Result<Arc<MethodTable>> {
    let table = fixture
        .build()
        .with_context(|| format!("building program '{}'", fixture.name))?;
    debug!(program = fixture.name, methods = table.len(), "program built");
    Ok(Arc::new(table))
}

fn succeeded(result: &Result<Outcome, ExecutionError>) -> bool {
    result.as_ref().map_or(false, Outcome::is_success)
}

fn run_programs(args: RunArgs) -> Result<bool> {
    let selected = select(&args)?;
    let config = args
        .lib_paths
        .iter()
        .fold(BridgeConfig::default(), |config, path| config.with_search_path(path.clone()));
    let bridge = Arc::new(ForeignBridge::new(config));
    let options = InterpreterOptions {
        max_call_depth: args.max_depth,
        interop_errors: args.interop_errors.into(),
    };
    let jobs = args.jobs.clamp(1, selected.len().max(1));
    info!(programs = selected.len(), jobs, "running");

    let pool = worker_pool(jobs)?;

    let (total, failed) = if jobs == 1 && !args.check {
        let failed = pool.install(|| stream(&selected, &bridge, &options))?;
        (selected.len(), failed)
    } else {
        let reports = run_parallel(&pool, &selected, &bridge, &options)?;
        let mut failed = 0;
        for report in &reports {
            print_report(report, args.check);
            if !report.passed(args.check) {
                failed += 1;
            }
        }
        (reports.len(), failed)
    };

    let stats = bridge.stats();
    info!(
        resolutions = stats.resolutions,
        cache_hits = stats.cache_hits,
        internal_invocations = stats.internal_invocations,
        native_invocations = stats.native_invocations,
        "bridge statistics"
    );
    println!("{} passed, {} failed", total - failed, failed);
    Ok(failed == 0)
}

fn worker_pool(jobs: usize) -> Result<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .stack_size(WORKER_STACK_SIZE)
        .thread_name(|i| format!("cascade-worker-{}", i))
        .build()
        .context("failed to build worker pool")
}

/// Reports come back in selection order whatever order workers finish in.
fn run_parallel(
    pool: &rayon::ThreadPool,
    selected: &[&'static Fixture],
    bridge: &Arc<ForeignBridge>,
    options: &InterpreterOptions,
) -> Result<Vec<Report>> {
    pool.install(|| {
        selected
            .par_iter()
            .map(|&fixture| execute(fixture, bridge, options))
            .collect()
    })
}

/// Run each program in turn, writing its output straight to stdout.
fn stream(selected: &[&'static Fixture], bridge: &Arc<ForeignBridge>, options: &InterpreterOptions) -> Result<usize> {
    let mut failed = 0;
    for &fixture in selected {
        println!("== {} ({})", fixture.name, fixture.entry);
        let (result, _) = run_one(fixture, bridge, options, StdoutHost)?;
        print_outcome(&result);
        if !succeeded(&result) {
            failed += 1;
        }
    }
    Ok(failed)
}

fn execute(fixture: &'static Fixture, bridge: &Arc<ForeignBridge>, options: &InterpreterOptions) -> Result<Report> {
    let started = Instant::now();
    let (result, host) = run_one(fixture, bridge, options, CaptureHost::new())?;
    Ok(Report {
        fixture,
        lines: host.into_lines(),
        result,
        elapsed: started.elapsed(),
    })
}

fn run_one<H: Host>(
    fixture: &Fixture,
    bridge: &Arc<ForeignBridge>,
    options: &InterpreterOptions,
    host: H,
) -> Result<(Result<Outcome, ExecutionError>, H)> {
    let mut interp = Interpreter::new(build(fixture)?, Arc::clone(bridge), host, options.clone());
    let result = interp.run_by_name(fixture.entry, Vec::new());
    Ok((result, interp.into_host()))
}

fn print_report(report: &Report, check: bool) {
    println!("== {} ({})", report.fixture.name, report.fixture.entry);
    for line in &report.lines {
        println!("{}", line);
    }
    print_outcome(&report.result);
    if check && report.lines != report.fixture.expected_output() {
        println!("-- output differs from the expected output:");
        for line in report.fixture.expected_output() {
            println!("   {}", line);
        }
    }
    debug!(program = report.fixture.name, elapsed_ms = report.elapsed.as_millis() as u64, "finished");
}

fn print_outcome(result: &Result<Outcome, ExecutionError>) {
    match result {
        Ok(Outcome::Returned(None)) => println!("-- returned"),
        Ok(Outcome::Returned(Some(value))) => println!("-- returned {:?}", value),
        Ok(Outcome::Unhandled(e)) => println!("-- {}", e),
        Err(e) => println!("-- error: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_run_keeps_selection_order() -> Result<()> {
        let selected: Vec<&'static Fixture> = fixtures::all().iter().rev().collect();
        let bridge = Arc::new(ForeignBridge::default());
        let pool = worker_pool(4)?;

        let reports = run_parallel(&pool, &selected, &bridge, &InterpreterOptions::default())?;

        let names: Vec<_> = reports.iter().map(|r| r.fixture.name).collect();
        let expected: Vec<_> = selected.iter().map(|f| f.name).collect();
        assert_eq!(names, expected);
        for report in &reports {
            assert!(report.passed(true), "{} failed: {:?}", report.fixture.name, report.result);
        }
        Ok(())
    }

    #[test]
    fn test_cli_parses_dump() -> Result<()> {
        let cli = Cli::try_parse_from(["cascade", "dump", "exceptions"])?;
        match cli.command {
            Command::Dump { name } => assert_eq!(name, "exceptions"),
            _ => anyhow::bail!("expected the dump command"),
        }
        Ok(())
    }
}
