use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing_subscriber::EnvFilter;
use witgen::{
    builder::BuilderSettings,
    config::GeneratorConfig,
    dataset,
    driver::{Driver, DriverSettings, RunError, RunSummary},
    record::RecordSink,
    runner::ProcessRunner,
    sampler::{SamplerSettings, SeenSet},
    toolcheck,
};

/// Exit status after Ctrl-C, as a shell reports SIGINT.
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "witgen", about = "Verified witness training-example generator", version)]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Generate verified examples into a JSONL file
    Generate {
        /// Number of verified records to write
        #[arg(long)]
        target: usize,

        /// Output JSONL file
        #[arg(long)]
        output: PathBuf,

        /// Concurrent workers
        #[arg(long, default_value_t = 4)]
        parallelism: usize,

        /// Generator config JSON (catalog, tools, limits)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Sampler seed (overrides the config)
        #[arg(long)]
        seed: Option<u64>,

        /// Append to an existing output, skipping specifications it already holds.
        /// A cut-off final line left by an interrupted write is dropped.
        #[arg(long)]
        resume: bool,
    },

    /// Print catalog dimensions and configuration-space size
    Catalog {
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a JSONL file or every *.jsonl under a directory
    Validate { path: PathBuf },

    /// Shuffle a dataset into train.jsonl and valid.jsonl
    Split {
        input: PathBuf,

        #[arg(long)]
        out_dir: PathBuf,

        #[arg(long, default_value_t = 0.1)]
        valid_ratio: f64,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Check that the external tools can be launched
    Toolcheck {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.cmd {
        Cmd::Generate {
            target,
            output,
            parallelism,
            config,
            seed,
            resume,
        } => generate(target, &output, parallelism, config.as_deref(), seed, resume),
        Cmd::Catalog { config } => show_catalog(config.as_deref()),
        Cmd::Validate { path } => validate(&path),
        Cmd::Split {
            input,
            out_dir,
            valid_ratio,
            seed,
        } => split(&input, &out_dir, valid_ratio, seed),
        Cmd::Toolcheck { config } => check_tools(config.as_deref()),
    }
}

fn generate(
    target: usize,
    output: &Path,
    parallelism: usize,
    config_path: Option<&Path>,
    seed: Option<u64>,
    resume: bool,
) -> Result<()> {
    let mut config = GeneratorConfig::load(config_path)?;
    if let Some(seed) = seed {
        config.seed = seed;
    }

    let seen = SeenSet::new();
    if resume {
        let stats = seen.seed_from_dataset(output, &config.catalog, config.max_attestors)?;
        println!(
            "Resuming: {} specification(s) already in {}",
            stats.marked,
            output.display()
        );
        if let Some(line) = stats.truncated_line {
            eprintln!(
                "⚠ {}:{line} is a cut-off record; it will be removed before appending",
                output.display()
            );
        }
        if stats.foreign > 0 {
            eprintln!(
                "⚠ {} record(s) in {} do not match the current catalog",
                stats.foreign,
                output.display()
            );
        }
    } else if output.metadata().is_ok_and(|m| m.len() > 0) {
        return Err(anyhow!(
            "{} already exists and is not empty; pass --resume to append to it",
            output.display()
        ));
    }

    let builder_settings = BuilderSettings::from_config(&config)?;
    let sink = RecordSink::open(output)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let handler_flag = cancel.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")?;

    println!("witgen v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "Generating {target} verified example(s) with {parallelism} worker(s) -> {}",
        output.display()
    );
    println!(
        "Reachable configurations: {}",
        config.catalog.reachable_space_size(config.max_attestors)
    );

    let runner = ProcessRunner;
    let driver = Driver::new(
        &config.catalog,
        &builder_settings,
        &runner,
        &sink,
        seen,
        DriverSettings {
            target,
            parallelism,
            report_every: config.report_every,
            sampler: SamplerSettings {
                max_attestors: config.max_attestors,
                max_consecutive_duplicates: config.max_consecutive_duplicates,
                seed: config.seed,
            },
        },
    );

    match driver.run(&cancel) {
        Ok(summary) => {
            print_summary(&summary);
            println!("✓ Wrote {} verified example(s) to {}", summary.produced, output.display());
            Ok(())
        }
        Err(RunError::Cancelled { summary }) => {
            print_summary(&summary);
            eprintln!("✗ Cancelled; {} record(s) kept in {}", summary.produced, output.display());
            std::process::exit(EXIT_CANCELLED);
        }
        Err(e) => {
            if let Some(summary) = e.summary() {
                print_summary(summary);
            }
            Err(e.into())
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Attempts:   {}", summary.attempts);
    println!("Verified:   {}", summary.produced);
    println!("Rejected:   {} ({} timed out)", summary.failed, summary.timed_out);
    if summary.discarded > 0 {
        println!("Discarded:  {} (target already met)", summary.discarded);
    }
    println!("Success rate: {:.1}%", summary.success_rate());
}

fn show_catalog(config_path: Option<&Path>) -> Result<()> {
    let config = GeneratorConfig::load(config_path)?;
    let catalog = &config.catalog;
    println!("Attestors: {}", catalog.attestors.len());
    println!("Steps:     {}", catalog.steps.len());
    println!("Commands:  {}", catalog.commands.len());
    println!("Questions: {}", catalog.questions.len());
    println!("Policies:  {}", catalog.policies.len());
    println!("Languages: {}", catalog.languages.len());
    println!(
        "Max attestors per example: {}",
        catalog.effective_max_attestors(config.max_attestors)
    );
    println!(
        "Theoretical space: {}",
        catalog.theoretical_space_size(config.max_attestors)
    );
    println!(
        "Reachable space:   {}",
        catalog.reachable_space_size(config.max_attestors)
    );
    Ok(())
}

fn validate(path: &Path) -> Result<()> {
    let report = dataset::validate_path(path)?;
    for file in &report.files {
        println!("Validated {}", file.display());
    }
    println!("Total examples: {}", report.examples);
    println!("Unique prompts: {}", report.unique_prompts);

    for w in &report.warnings {
        eprintln!("⚠ {w}");
    }
    for e in &report.errors {
        eprintln!("✗ {e}");
    }

    if !report.is_ok() {
        return Err(anyhow!(
            "validation failed with {} error(s), {} warning(s)",
            report.errors.len(),
            report.warnings.len()
        ));
    }
    println!("✓ Validation passed ({} warning(s))", report.warnings.len());
    Ok(())
}

fn split(input: &Path, out_dir: &Path, valid_ratio: f64, seed: u64) -> Result<()> {
    let summary = dataset::split_dataset(input, out_dir, valid_ratio, seed)?;
    println!("✓ Splits created:");
    println!("  Train: {} example(s) -> {}", summary.train, summary.train_path.display());
    println!("  Valid: {} example(s) -> {}", summary.valid, summary.valid_path.display());
    Ok(())
}

fn check_tools(config_path: Option<&Path>) -> Result<()> {
    let config = GeneratorConfig::load(config_path)?;
    let found = toolcheck::detect_tools(&config.tools);
    let mark = |ok: bool| if ok { "✓" } else { "✗" };
    println!("{} witness", mark(found.witness));
    println!("{} openssl", mark(found.openssl));
    println!("{} git", mark(found.git));
    println!("{} opa", mark(found.opa));
    println!("{} bash", mark(found.bash));
    println!("{} syft (optional)", mark(found.syft));
    for hint in found.missing_tools_report() {
        eprintln!("  {hint}");
    }
    if !found.required_available() {
        return Err(anyhow!("required external tools are missing"));
    }
    Ok(())
}
