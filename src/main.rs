//! pairgen CLI - Resumable instruction-response corpus generation.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pairgen::ledger::{Ledger, tally};
use pairgen::pipeline::{DispatchOptions, Dispatcher, ProviderPool};
use pairgen::provider::{OutputSchema, TemplateRenderer};
use pairgen::sampling::{ReservoirSampler, sample_corpus, select_split, write_splits};
use pairgen::{ChunkSource, Config, PairgenError, RunSummary, SampledSet, read_pairs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "pairgen")]
#[command(version)]
#[command(about = "Resumable instruction-response corpus generation from sampled text chunks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample every source and write the split files
    Sample {
        /// Directory for `<label>_<split>.txt` files
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Sample every source and generate pairs into the ledger
    Generate {
        /// Only dispatch this split of each sample
        #[arg(short, long)]
        split: Option<String>,

        /// Dispatch at most this many chunks that still have work
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Re-ask every pair in the `[reask]` input file
    Reask {
        /// Dispatch at most this many pairs that still have work
        #[arg(short = 'n', long)]
        limit: Option<usize>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,

    /// Count ledger records per provider and source
    Summary {
        /// Ledger file (defaults to the configured one)
        #[arg(short, long)]
        ledger: Option<PathBuf>,
    },
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_config() {
    let example = r#"# pairgen configuration file

seed = 42

[sampling]
sample_size_per_source = 160
max_chars = 1000
splits = [
    { name = "seed", size = 80 },
    { name = "heldout", size = 80 },
]

[sources]
dir = "corpora"
pattern = "*.txt"
labels = { wiki = "Wiki", oireachtas = "Oireachtas" }
# default_label = "Wiki"   # unmatched files are dropped when unset

[generation]
prompt_template = "prompts/pair.txt"   # must contain {TEXT}
variants_per_job = 1
reask_attempts = 1
fields = ["instruction", "response"]

[[providers]]
id = "gpt-5-mini"
base_url = "https://api.openai.com/v1"
model = "gpt-5-mini"
api_key_env = "OPENAI_API_KEY"
concurrency = 8
max_retries = 2
retry_delay_ms = 2000
timeout_secs = 120

[[providers]]
id = "claude"
kind = "anthropic_messages"   # structured output via a forced tool call
base_url = "https://api.anthropic.com/v1"
model = "claude-sonnet-4-5"
api_key_env = "ANTHROPIC_API_KEY"
concurrency = 4

[[providers]]
id = "local-qwen"
base_url = "http://localhost:8000/v1"
model = "Qwen/Qwen2.5-7B-Instruct"
concurrency = 2
structured = false   # free text, parsed from JSON or <field> tags

[ledger]
path = "outputs/pairs.jsonl"
fsync = true

# Optional: re-ask existing pairs (`pairgen reask`)
[reask]
input = "data/lima.jsonl"   # {"conversations": [...]} or {"instruction", "response"}
label = "LIMA"
prompt_template = "prompts/reask.txt"   # {INSTRUCTION} / {RESPONSE} / {TEXT}
fields = ["instruction", "response", "response_variant_2"]
ledger = "outputs/reask.jsonl"   # defaults to [ledger].path
# limit = 100
"#;
    println!("{example}");
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn sample(config: &Config) -> Result<SampledSet> {
    let source = ChunkSource::new(config.sources.clone(), config.sampling.max_chars);
    let sampler = ReservoirSampler::new(config.sampling.sample_size_per_source, config.seed);
    let sampled = sample_corpus(&source, &sampler).context("Failed to sample sources")?;
    if sampled.is_empty() {
        warn!(dir = %config.sources.dir.display(), "No chunks sampled");
    }
    Ok(sampled)
}

fn provider_pools(config: &Config) -> Result<Vec<Arc<ProviderPool>>> {
    config
        .providers
        .iter()
        .map(|p| ProviderPool::from_config(p).map(Arc::new))
        .collect::<pairgen::Result<Vec<_>>>()
        .context("Failed to set up providers")
}

/// Cancellation token that fires on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, abandoning in-flight jobs");
            on_signal.cancel();
        }
    });
    cancel
}

fn print_summary(summary: &RunSummary, ledger: &Path) {
    println!("\n=== Generation Complete ===");
    println!(
        "{:<20} {:<16} {:>8} {:>8} {:>8} {:>8} {:>9}",
        "provider", "source", "sampled", "done", "ok", "failed", "cancelled"
    );
    for (provider, sources) in &summary.by_provider {
        for (source, c) in sources {
            println!(
                "{provider:<20} {source:<16} {:>8} {:>8} {:>8} {:>8} {:>9}",
                c.sampled, c.skipped_done, c.succeeded, c.failed_terminal, c.cancelled
            );
        }
    }
    let totals = summary.totals();
    println!("Succeeded:   {}", totals.succeeded);
    println!("Failed:      {}", totals.failed_terminal);
    println!("Dup content: {}", summary.duplicate_content);
    println!("Throughput:  {:.0}/hr", summary.throughput_per_hour);
    println!("Runtime:     {:.1}s", summary.runtime_secs);
    println!("Ledger:      {ledger:?}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;

            for provider in &config.providers {
                provider
                    .resolve_api_key()
                    .with_context(|| format!("Failed to resolve API key for '{}'", provider.id))?;
            }
            TemplateRenderer::from_file(&config.generation.prompt_template)
                .context("Failed to load prompt template")?;
            if let Some(reask) = &config.reask {
                TemplateRenderer::from_file(&reask.prompt_template)
                    .context("Failed to load re-ask prompt template")?;
            }

            info!("Configuration is valid");
            info!(
                "  Sampling: {} per source, seed {}",
                config.sampling.sample_size_per_source, config.seed
            );
            for provider in &config.providers {
                info!(
                    "  Provider {}: {} (concurrency {}, retries {})",
                    provider.id, provider.model, provider.concurrency, provider.max_retries
                );
            }
        }

        Commands::Sample { out } => {
            let config = load_config(&cli.config)?;
            let sampled = sample(&config)?;
            let written = write_splits(&out, &sampled, &config.sampling.splits)
                .context("Failed to write split files")?;

            println!("\n=== Sampling Complete ===");
            for (label, chunks) in sampled.iter() {
                println!("{label:<20} {:>6} chunks", chunks.len());
            }
            println!("Files:       {}", written.len());
            println!("Output:      {out:?}");
        }

        Commands::Generate {
            split,
            limit,
            no_progress,
        } => {
            let config = load_config(&cli.config)?;

            let mut sampled = sample(&config)?;
            if let Some(name) = split {
                if !config.sampling.splits.iter().any(|s| s.name == name) {
                    bail!("Unknown split '{name}'");
                }
                sampled = select_split(&sampled, &config.sampling.splits, &name);
            }

            let renderer = TemplateRenderer::from_file(&config.generation.prompt_template)
                .context("Failed to load prompt template")?;
            let pools = provider_pools(&config)?;
            let ledger = Arc::new(
                Ledger::open(&config.ledger.path, config.ledger.fsync)
                    .context("Failed to open ledger")?,
            );

            let cancel = interrupt_token();
            let dispatcher = Dispatcher::new(
                pools,
                Arc::new(renderer),
                OutputSchema::new(config.generation.fields.iter().cloned()),
                Arc::clone(&ledger),
                DispatchOptions {
                    variants_per_job: config.generation.variants_per_job,
                    reask_attempts: config.generation.reask_attempts,
                    show_progress: !no_progress,
                    limit,
                },
            )
            .with_cancellation(cancel.clone());

            let summary = dispatcher.run(&sampled).await?;
            print_summary(&summary, ledger.path());
            if cancel.is_cancelled() {
                return Err(PairgenError::Cancelled.into());
            }
        }

        Commands::Reask { limit, no_progress } => {
            let config = load_config(&cli.config)?;
            let Some(reask) = config.reask.as_ref() else {
                bail!("No [reask] section in {:?}", cli.config);
            };

            let pairs = read_pairs(&reask.input, &reask.label)
                .with_context(|| format!("Failed to read pairs from {:?}", reask.input))?;
            let renderer = TemplateRenderer::from_file(&reask.prompt_template)
                .context("Failed to load re-ask prompt template")?;
            let pools = provider_pools(&config)?;
            let ledger_path = reask.ledger.as_ref().unwrap_or(&config.ledger.path);
            let ledger = Arc::new(
                Ledger::open(ledger_path, config.ledger.fsync).context("Failed to open ledger")?,
            );

            let cancel = interrupt_token();
            let dispatcher = Dispatcher::new(
                pools,
                Arc::new(renderer),
                OutputSchema::new(reask.fields.iter().cloned()),
                Arc::clone(&ledger),
                DispatchOptions {
                    variants_per_job: config.generation.variants_per_job,
                    reask_attempts: config.generation.reask_attempts,
                    show_progress: !no_progress,
                    limit: limit.or(reask.limit),
                },
            )
            .with_cancellation(cancel.clone());

            let summary = dispatcher.run_pairs(&pairs).await?;
            print_summary(&summary, ledger.path());
            if cancel.is_cancelled() {
                return Err(PairgenError::Cancelled.into());
            }
        }

        Commands::Summary { ledger } => {
            let path = match ledger {
                Some(path) => path,
                None => load_config(&cli.config)?.ledger.path,
            };
            let counts = tally(&path).with_context(|| format!("Failed to read ledger {path:?}"))?;

            println!("{:<20} {:<16} {:>8}", "provider", "source", "records");
            let mut total = 0usize;
            for (provider, sources) in &counts {
                for (source, n) in sources {
                    println!("{provider:<20} {source:<16} {n:>8}");
                    total += n;
                }
            }
            println!("Total:       {total}");
        }
    }

    Ok(())
}
