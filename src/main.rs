use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use stepwise_core::{OutputFormat, StepwiseConfig};
use stepwise_guidance::ModelClient;
use stepwise_pipeline::{collect_view, parse_pr_reference, render, GitHubHost, MemoryStore, Pipeline};
use stepwise_queue::{Dispatcher, QueueOptions};

#[derive(Parser)]
#[command(
    name = "stepwise",
    version,
    about = "Turn a pull-request diff into an ordered, AI-annotated review walkthrough",
    long_about = "Stepwise splits a pull request into small, logically cohesive review steps,\n\
                   attaches cross-repository context to each step, and asks an AI model for a\n\
                   risk rating and reviewer checklist per step.\n\n\
                   Examples:\n  \
                     stepwise run --pr octocat/hello-world#42   Build a walkthrough for a PR\n  \
                     stepwise run --pr acme/api#7 --format md   Emit the walkthrough as Markdown\n  \
                     stepwise init                              Write a starter .stepwise.toml"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .stepwise.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for command results.\n\n\
                       Formats:\n  \
                         text      Human-readable walkthrough (default)\n  \
                         json      Machine-readable JSON with camelCase keys\n  \
                         markdown  GitHub-flavored Markdown"
    )]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest a pull request and print the review walkthrough
    #[command(long_about = "Ingest a pull request and print the review walkthrough.\n\n\
        Fetches the PR diff, clusters it into ordered review steps, builds a\n\
        cross-repository context pack per step, and generates AI risk ratings and\n\
        checklists. Requires a GitHub token and a model API key.\n\n\
        Examples:\n  stepwise run --pr octocat/hello-world#42\n  stepwise run --pr acme/api#7 --user mona --format json")]
    Run {
        /// Pull request reference as owner/repo#number
        #[arg(long)]
        pr: String,

        /// User the session is created for (controls regeneration rights)
        #[arg(long, default_value = "local")]
        user: String,
    },
    /// Write a starter configuration file
    #[command(long_about = "Write a starter .stepwise.toml to the current directory.\n\n\
        The template documents every section with its defaults commented out.")]
    Init,
}

const DEFAULT_CONFIG: &str = r#"# Stepwise configuration
# All values shown are the defaults.

[model]
# provider = "openai"
# model = "gpt-4o"
# api_key = "sk-..."            # or set OPENAI_API_KEY via your shell
# base_url = "https://api.openai.com"
# timeout_secs = 120

[host]
# token = "ghp_..."             # or set GITHUB_TOKEN
# base_url = "https://api.github.com"
# timeout_secs = 30

[cluster]
# proximity_lines = 10          # merge hunks this close in one file
# max_step_lines = 400          # split steps above this many changed lines

[context]
# max_symbols = 50              # symbols per context pack
# max_indexed_files = 2000      # repository index file cap

[queue]
# max_attempts = 5
# backoff_base_ms = 200
# backoff_cap_ms = 30000
# workers = 4
"#;

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .expect("miette handler");
    human_panic::setup_panic!();

    let cli = Cli::parse();

    let default_directive = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => StepwiseConfig::from_file(path).into_diagnostic()?,
        None => {
            let default_path = std::path::Path::new(".stepwise.toml");
            if default_path.exists() {
                StepwiseConfig::from_file(default_path).into_diagnostic()?
            } else {
                StepwiseConfig::default()
            }
        }
    };

    match cli.command {
        Command::Init => {
            let path = std::path::Path::new(".stepwise.toml");
            if path.exists() {
                miette::bail!(".stepwise.toml already exists; remove it first");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            eprintln!("wrote .stepwise.toml");
        }
        Command::Run { ref pr, ref user } => {
            let (repo, number) = parse_pr_reference(pr).into_diagnostic()?;

            let host = GitHubHost::new(&config.host).into_diagnostic()?;
            let model = ModelClient::new(&config.model).into_diagnostic()?;
            let pipeline = Pipeline::new(MemoryStore::new(), host, model, &config);
            let dispatcher = Dispatcher::new(pipeline, QueueOptions::from(&config.queue));

            let (session, payload) = dispatcher
                .runner()
                .start_session(&repo, number, user)
                .into_diagnostic()?;
            dispatcher.enqueue(payload).into_diagnostic()?;

            let spinner = indicatif::ProgressBar::new_spinner();
            spinner.set_message(format!("reviewing {repo}#{number}"));
            spinner.enable_steady_tick(Duration::from_millis(120));
            dispatcher.run_until_idle().await;
            spinner.finish_and_clear();

            let view = collect_view(dispatcher.runner().store(), session.id).into_diagnostic()?;
            print!("{}", render(&view, cli.format).into_diagnostic()?);

            if view.session.status == stepwise_core::SessionStatus::Error {
                miette::bail!(
                    "review session failed: {}",
                    view.session.error_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    Ok(())
}
