mod commands;
mod ui;

use clap::{CommandFactory, Parser, Subcommand};
use colored::Colorize;
use kegsmith::{Layout, RetryPolicy, Settings, cellar, error::EXIT_CANCELLED};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "kegs")]
#[command(author, version, about = "Resolve, build, validate and record formula installs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Installation prefix [default: $KEGS_PREFIX or /usr/local/kegsmith]
    #[arg(long, global = true, value_name = "DIR")]
    prefix: Option<PathBuf>,

    /// Directory of formula JSON files [default: $KEGS_FORMULA_DIR or <prefix>/Formula]
    #[arg(long, global = true, value_name = "DIR")]
    formula_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Install formulae and their dependencies
    Install {
        /// Formula names
        #[arg(required = true)]
        formulae: Vec<String>,

        /// Enable a formula option (repeatable)
        #[arg(short = 'o', long = "option", value_name = "OPTION")]
        options: Vec<String>,

        /// Formulae building or validating at once
        #[arg(short, long, value_name = "N")]
        jobs: Option<usize>,

        /// Fetch attempts per source
        #[arg(long, default_value_t = 3, value_name = "N")]
        retries: u32,

        /// Seconds before a validation probe is killed
        #[arg(long, default_value_t = 60, value_name = "SECS")]
        validation_timeout: u64,

        /// Roll back instead of keeping a keg whose validation fails
        #[arg(long)]
        rollback_on_validation_failure: bool,
    },

    /// Uninstall formulae
    Uninstall {
        /// Formula names
        #[arg(required = true)]
        formulae: Vec<String>,

        /// Uninstall even if other installed formulae depend on it
        #[arg(long)]
        force: bool,
    },

    /// Show the installation receipt of a formula
    Status {
        /// Formula name
        formula: String,
    },

    /// List installed formulae
    List {
        /// Output receipts as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the install plan of a formula
    Deps {
        /// Formula name
        formula: String,

        /// Show as tree
        #[arg(long)]
        tree: bool,
    },

    /// Download and verify sources without installing
    Fetch {
        /// Formula names
        #[arg(required = true)]
        formulae: Vec<String>,

        /// Fetch attempts per source
        #[arg(long, default_value_t = 3, value_name = "N")]
        retries: u32,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell type
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    ui::init_colors();

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            ExitCode::from(commands::exit_code(&e))
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<u8> {
    let layout = Layout::new(
        cli.prefix.unwrap_or_else(cellar::detect_prefix),
        cellar::cache_dir(),
    );
    let formula_dir = cli
        .formula_dir
        .unwrap_or_else(|| commands::default_formula_dir(&layout));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} Interrupted, rolling back uncommitted work...", "⚠".yellow());
            on_signal.cancel();
        }
    });

    let with_retries = |retries: u32| Settings {
        retry: RetryPolicy {
            attempts: retries.max(1),
            ..RetryPolicy::default()
        },
        ..Settings::default()
    };

    let code = match cli.command {
        Commands::Install {
            formulae,
            options,
            jobs,
            retries,
            validation_timeout,
            rollback_on_validation_failure,
        } => {
            let mut settings = with_retries(retries);
            if let Some(jobs) = jobs {
                settings.jobs = jobs;
            }
            settings.validation_timeout = Duration::from_secs(validation_timeout);
            let ctx = commands::Context::new(layout, &formula_dir, settings)?;
            commands::install(&ctx, &formulae, &options, rollback_on_validation_failure, &cancel)
                .await?
        }
        Commands::Uninstall { formulae, force } => {
            let ctx = commands::Context::new(layout, &formula_dir, Settings::default())?;
            commands::uninstall(&ctx, &formulae, force).await?
        }
        Commands::Status { formula } => {
            let ctx = commands::Context::new(layout, &formula_dir, Settings::default())?;
            commands::status(&ctx, &formula).await?
        }
        Commands::List { json } => {
            let ctx = commands::Context::new(layout, &formula_dir, Settings::default())?;
            commands::list(&ctx, json).await?
        }
        Commands::Deps { formula, tree } => {
            let ctx = commands::Context::new(layout, &formula_dir, Settings::default())?;
            commands::deps(&ctx, &formula, tree).await?
        }
        Commands::Fetch { formulae, retries } => {
            let ctx = commands::Context::new(layout, &formula_dir, with_retries(retries))?;
            commands::fetch(&ctx, &formulae, &cancel).await?
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "kegs", &mut std::io::stdout());
            0
        }
    };

    if cancel.is_cancelled() {
        return Ok(EXIT_CANCELLED);
    }
    Ok(code)
}
