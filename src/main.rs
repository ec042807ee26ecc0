use clap::{Parser, Subcommand, builder::styling};
use eyre::Result;
use owo_colors::OwoColorize;
use rolling_export::cli::{self, ExtractOptions, ResetScope};
use rolling_export::config::Settings;
use rolling_export::etl::{ExportFormat, IterationOrder, Period};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// CLI Styling
const STYLES: styling::Styles = styling::Styles::styled()
    .header(styling::AnsiColor::BrightWhite.on_default())
    .usage(styling::AnsiColor::BrightWhite.on_default())
    .literal(styling::AnsiColor::Green.on_default())
    .placeholder(styling::AnsiColor::Cyan.on_default());

/// Rolling Export: --{rollex}-> pulls a rolling window of monthly periods out of a Power BI dataset, one month at a time
#[derive(Parser)]
#[command(name = "rollex", version, styles = STYLES)]
struct Cli {
    /// The dotenv file to source credentials and settings from
    #[arg(short, long, global = true, default_value = ".env")]
    env: String,

    /// A YAML settings file, overridden by environment variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More verbose logging
    #[arg(long, global = true)]
    debug: bool,

    /// Command to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract every period of the window that has not succeeded yet
    Extract {
        /// Last month of the window as YYYY-MM (defaults to the current month)
        #[arg(long)]
        end: Option<Period>,

        /// Number of months in the window
        #[arg(short, long)]
        window: Option<usize>,

        /// Re-extract periods that already succeeded
        #[arg(short, long)]
        force: bool,

        /// Comma-separated export formats
        #[arg(long, value_delimiter = ',', value_enum)]
        format: Option<Vec<ExportFormat>>,

        /// Order in which periods are processed
        #[arg(long, value_enum)]
        order: Option<IterationOrder>,
    },

    /// Show the recorded state of every period
    Status,

    /// Forget recorded periods so they are extracted again
    Reset {
        /// Remove every record, not just failed ones
        #[arg(long, conflicts_with = "period")]
        all: bool,

        /// Remove a single period given as YYYY-MM
        #[arg(long)]
        period: Option<Period>,
    },

    /// Test authorization to the Power BI dataset
    Auth,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let env_loaded = dotenvy::from_filename(&cli.env);

    let log_level = match cli.debug {
        true => "debug",
        false => "info",
    };
    let env = env_logger::Env::default().filter_or("LOG_LEVEL", log_level);
    env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .init();

    match env_loaded {
        Ok(path) => log::debug!("Loaded environment from {}", path.display()),
        Err(e) if e.not_found() => log::debug!("No dotenv file at {}", cli.env),
        Err(e) => return Err(e.into()),
    }

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Extract {
            end,
            window,
            force,
            format,
            order,
        } => {
            let cancel = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&cancel);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!(
                        "{}",
                        "Interrupted, finishing the current period before stopping".yellow()
                    );
                    flag.store(true, Ordering::SeqCst);
                }
            });

            let options = ExtractOptions {
                end,
                window,
                force,
                formats: format,
                order,
            };
            let summary = cli::run_extract(settings, &options, cancel).await?;
            if !summary.is_complete() {
                std::process::exit(1);
            }
        }
        Commands::Status => {
            cli::show_status(&settings)?;
        }
        Commands::Reset { all, period } => {
            let scope = match (all, period) {
                (true, _) => ResetScope::All,
                (false, Some(period)) => ResetScope::Period(period),
                (false, None) => ResetScope::Failed,
            };
            cli::reset_state(&settings, scope)?;
        }
        Commands::Auth => {
            cli::test_auth(&settings).await?;
        }
    }

    Ok(())
}
