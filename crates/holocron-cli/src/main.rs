use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use holocron_core::{
    config_file, load_config, Holocron, LoopError, LoopOutcome, LoopResult, ReasoningLoop,
    SessionObserver, TracingObserver, TranscriptLog,
};
use holocron_memory::Roster;

const MODEL_UNAVAILABLE: &str =
    "The tactical droid could not reach its model right now. Please try again later.";

#[derive(Parser)]
#[command(
    name = "holocron",
    version,
    about = "Star Wars: Galaxy of Heroes character assistant"
)]
struct Cli {
    #[arg(
        long,
        default_value = "~/.holocron",
        help = "Config root directory (contains config/main.yaml)"
    )]
    config_root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build the semantic index if it does not exist yet")]
    BuildIndex {
        #[arg(long, help = "Embed raw ability descriptions instead of model summaries")]
        no_summarize: bool,
    },
    #[command(about = "Answer one question")]
    Ask {
        #[arg(help = "The question")]
        question: String,
        #[arg(long, help = "Write the final conversation state as JSON to this file")]
        transcript: Option<PathBuf>,
    },
    #[command(about = "Interactive session; every line is a new question")]
    Chat,
    #[command(about = "List every character with its tags")]
    List,
    #[command(about = "Find a character by (partial) name")]
    Find {
        #[arg(help = "Name or part of a name")]
        name: String,
    },
    #[command(about = "Validate config, character data and index")]
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    // Expand ~ to home directory
    if cli.config_root.starts_with("~") {
        if let Some(home) = std::env::var_os("HOME") {
            cli.config_root = PathBuf::from(home).join(
                cli.config_root
                    .strip_prefix("~")
                    .unwrap_or(&cli.config_root),
            );
        }
    }

    let log_dir = cli.config_root.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(&log_dir, "holocron.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Commands::BuildIndex { no_summarize } => {
            let holocron = bootstrap(&cli.config_root)?;
            let report = holocron.build_index(!no_summarize).await?;
            if report.skipped {
                println!(
                    "Index already present at {}. Delete it to rebuild.",
                    report.index_path.display()
                );
            } else {
                println!("Index written to {}", report.index_path.display());
                println!("  characters:        {}", report.units);
                println!("  embeddings:        {}", report.embedded);
                println!("  cache hits:        {}", report.cache_hits);
                println!("  summaries:         {}", report.summarized);
                println!("  summary cache:     {}", report.summary_cache_hits);
                println!("  summary fallbacks: {}", report.summary_fallbacks);
            }
        }
        Commands::Ask {
            question,
            transcript,
        } => {
            let holocron = bootstrap(&cli.config_root)?;
            let reasoning = reasoning_loop(&holocron, &cli.config_root).await?;
            let result = reasoning.run(&question).await.map_err(|e| model_failure(&e))?;
            print_answer(&result);
            if let Some(path) = transcript {
                write_transcript(&path, &result)?;
                println!("Conversation saved to {}", path.display());
            }
        }
        Commands::Chat => {
            let holocron = bootstrap(&cli.config_root)?;
            let reasoning = reasoning_loop(&holocron, &cli.config_root).await?;
            run_repl(&reasoning).await?;
        }
        Commands::List => {
            let roster = load_roster(&cli.config_root)?;
            println!("{:<40} TAGS", "NAME");
            println!("{}", "-".repeat(80));
            for unit in roster.summaries() {
                println!("{:<40} {}", unit.name, unit.tags.join(", "));
            }
        }
        Commands::Find { name } => {
            let roster = load_roster(&cli.config_root)?;
            match roster.find_by_name(&name) {
                Some(unit) => println!("{}: {}", unit.name, unit.identifier),
                None => println!("Character '{name}' not found."),
            }
        }
        Commands::Validate => {
            let holocron = bootstrap(&cli.config_root)?;
            println!(
                "Config valid ({}). {} characters loaded.",
                config_file(&cli.config_root).display(),
                holocron.roster().len()
            );
            validate_index(&holocron).await?;
        }
    }

    Ok(())
}

fn bootstrap(root: &Path) -> Result<Holocron> {
    let config = load_config(root)?;
    Holocron::from_config(config)
}

fn load_roster(root: &Path) -> Result<Roster> {
    let config = load_config(root)?;
    Roster::load(&config.data.units_path, &config.data.details_path)
        .context("failed to load character data")
}

async fn reasoning_loop(holocron: &Holocron, root: &Path) -> Result<ReasoningLoop> {
    let transcript = TranscriptLog::open(&root.join("logs").join("reasoning.log"))?;
    let observers: Vec<Arc<dyn SessionObserver>> =
        vec![Arc::new(TracingObserver), Arc::new(transcript)];
    holocron.prepare_reasoning_loop(observers).await
}

fn model_failure(err: &LoopError) -> anyhow::Error {
    tracing::error!("{err}");
    anyhow!(MODEL_UNAVAILABLE)
}

fn print_answer(result: &LoopResult) {
    println!("{}", result.answer);
    if result.outcome == LoopOutcome::CycleLimitReached {
        eprintln!(
            "(stopped after {} model calls without a complete answer)",
            result.model_calls
        );
    }
}

fn write_transcript(path: &Path, result: &LoopResult) -> Result<()> {
    let json = serde_json::to_string_pretty(&result.conversation)?;
    std::fs::write(path, json)
        .with_context(|| format!("failed to write transcript {}", path.display()))
}

async fn validate_index(holocron: &Holocron) -> Result<()> {
    let path = holocron.index_path();
    if !path.exists() {
        println!(
            "No index at {} yet; run `holocron build-index`.",
            path.display()
        );
        return Ok(());
    }
    let index = holocron.open_index()?;
    let orphans = index.verify_against(holocron.roster()).await?;
    if !orphans.is_empty() {
        return Err(anyhow!(
            "index {} references {} unknown character(s): {}",
            path.display(),
            orphans.len(),
            orphans.join(", ")
        ));
    }
    println!(
        "Index valid ({} documents, model {}).",
        index.len().await?,
        index.model_id()
    );
    Ok(())
}

async fn run_repl(reasoning: &ReasoningLoop) -> Result<()> {
    println!("holocron REPL. Type /quit to exit.");
    println!("---");

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input == "/quit" {
            break;
        }
        if input.is_empty() {
            continue;
        }

        match reasoning.run(input).await {
            Ok(result) => print_answer(&result),
            Err(err) => {
                tracing::error!("{err}");
                eprintln!("{MODEL_UNAVAILABLE}");
            }
        }
    }

    Ok(())
}
