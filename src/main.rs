//! picvm - CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use picvm::cache::{CacheState, CacheStats, StoreRegistry};
use picvm::jit::JitVerdict;
use picvm::util::config::{load_config, PicvmConfig};
use picvm::util::logger::{self, LogLevel};
use picvm::vm::{LineDebugger, ProgramCounter};
use picvm::{engine_for, load_image, NAME, VERSION};

/// Register bytecode VM with polymorphic inline caches
#[derive(Parser, Debug)]
#[command(name = "picvm")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "picvm.toml")]
    config: PathBuf,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a program image
    Run {
        /// Image file (.ron or .json)
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Break before the instruction at `chunk:offset` (repeatable)
        #[arg(short = 'b', long = "break", value_name = "PC")]
        breakpoints: Vec<ProgramCounter>,

        /// Stop before the first instruction
        #[arg(short, long)]
        step: bool,
    },

    /// Run a program, then report the JIT verdict of every call site
    Jit {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the loaded segment and its call sites
    Dump {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Serialize)]
struct SiteReport {
    site: u32,
    pc: String,
    selector: String,
    state: CacheState,
    stats: CacheStats,
    verdict: JitVerdict,
}

fn main() -> Result<()> {
    let args = Args::parse();
    logger::init_with_level(LogLevel::from_verbosity(args.verbose));

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config: {}", args.config.display()))?;

    match args.command {
        Commands::Run {
            file,
            breakpoints,
            step,
        } => {
            let code = run(&file, &config, breakpoints, step)
                .with_context(|| format!("Failed to run: {}", file.display()))?;
            std::process::exit(code);
        }
        Commands::Jit { file, json } => {
            jit_report(&file, &config, json)?;
        }
        Commands::Dump { file } => {
            dump(&file)?;
        }
    }

    Ok(())
}

fn run(
    file: &Path,
    config: &PicvmConfig,
    breakpoints: Vec<ProgramCounter>,
    step: bool,
) -> Result<i32> {
    let loaded = load_image(file)?;
    let mut stores = StoreRegistry::new(config.cache.policy(), config.cache.arena_regions_per_site);
    let mut engine = engine_for(&loaded, config, &mut stores);
    if step || !breakpoints.is_empty() {
        engine.attach_debugger(Box::new(LineDebugger::new(
            breakpoints,
            step,
            BufReader::new(io::stdin()),
            io::stderr(),
        )));
    }
    Ok(engine.dispatch_run(loaded.entry, &[])?)
}

fn jit_report(
    file: &Path,
    config: &PicvmConfig,
    json: bool,
) -> Result<()> {
    let loaded = load_image(file)?;
    let mut stores = StoreRegistry::new(config.cache.policy(), config.cache.arena_regions_per_site);
    let mut engine = engine_for(&loaded, config, &mut stores);
    let code = engine.dispatch_run(loaded.entry, &[])?;

    let reports: Vec<SiteReport> = loaded
        .segment
        .sites()
        .iter()
        .filter_map(|site| {
            let cache = engine.store().snapshot(site.index)?;
            Some(SiteReport {
                site: site.index.0,
                pc: site.pc.to_string(),
                selector: site.kind.selector().to_string(),
                state: cache.state(),
                stats: cache.stats(),
                verdict: engine.jit_query(site.index),
            })
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    println!("exit code {}", code);
    for r in &reports {
        println!(
            "site#{:<3} {:>6}  {:<16} {:<12} hits={} promotions={} misses={} evictions={}",
            r.site,
            r.pc,
            r.selector,
            format!("{:?}", r.state),
            r.stats.hits,
            r.stats.promotions,
            r.stats.misses,
            r.stats.evictions
        );
        if r.verdict.safe {
            println!("          jit: safe [{}]", r.verdict.flags);
        } else {
            for reason in &r.verdict.reasons {
                println!("          jit: unsafe, {}", reason);
            }
        }
    }
    Ok(())
}

fn dump(file: &Path) -> Result<()> {
    let loaded = load_image(file)?;
    let segment = &loaded.segment;

    println!("=== Segment {} ({}) ===\n", segment.id().0, file.display());

    println!("--- Constants ({} entries) ---", segment.constants().len());
    for (i, c) in segment.constants().iter().enumerate() {
        println!("  [{}] {:?}", i, c);
    }
    println!();

    for (ci, chunk) in segment.chunks().iter().enumerate() {
        println!("--- Chunk {} '{}' ({} instructions) ---", ci, chunk.name, chunk.code.len());
        for (offset, instr) in chunk.code.iter().enumerate() {
            let pc = ProgramCounter::new(ci as u32, offset as u32);
            match segment.site_at(pc) {
                Some(site) => println!("  [{:3}] {}    ; {} {}", offset, instr, site.index, site.kind.selector()),
                None => println!("  [{:3}] {}", offset, instr),
            }
        }
    }
    println!();

    println!("--- Subroutines ({} entries) ---", segment.subs().len());
    for (i, sub) in segment.subs().iter().enumerate() {
        println!("  [{}] {} chunk={} params={:?} result={}", i, sub.name, sub.chunk.0, sub.params, sub.result);
    }
    println!("\nentry {}", loaded.entry);
    Ok(())
}
