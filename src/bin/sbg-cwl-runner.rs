use anyhow::{Context, Result};
use clap::Parser;
use sbg_cwl_runner::{
    RunnerError,
    canonical::output_text,
    clock::TokioSleeper,
    pipeline::{DEFAULT_PROJECT, PreparedRun, RunConfig, Verbosity},
    platform::{config::ApiProfile, http::SbgClient, retry::RetryingPlatform},
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "sbg-cwl-runner",
    version,
    about = "Run a CWL workflow on a Seven Bridges platform and download its outputs"
)]
struct Cli {
    /// Output directory for downloaded files.
    #[arg(long, default_value = "./")]
    outdir: PathBuf,
    /// Only log errors.
    #[arg(long)]
    quiet: bool,
    /// Credentials profile from ~/.sevenbridges/credentials.
    #[arg(long = "api-profile", default_value = "default")]
    api_profile: String,
    /// Project name, owned by the authenticated user.
    #[arg(long, default_value = DEFAULT_PROJECT)]
    project: String,
    /// Minutes between task status checks; fractions allowed.
    #[arg(long = "poll-interval", default_value = "1", value_parser = parse_minutes)]
    poll_interval: Duration,
    /// Give up waiting after this many minutes. The remote task keeps running.
    #[arg(long = "max-wait", value_parser = parse_minutes)]
    max_wait: Option<Duration>,
    /// Workflow or tool document (CWL, YAML or JSON).
    workflow: PathBuf,
    /// Job document (.json, .yaml or .yml).
    job: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> RunConfig {
        RunConfig {
            workflow: self.workflow,
            job: self.job,
            outdir: self.outdir,
            project: self.project,
            poll_interval: self.poll_interval,
            max_wait: self.max_wait,
            verbosity: if self.quiet {
                Verbosity::Quiet
            } else {
                Verbosity::Verbose
            },
        }
    }
}

fn parse_minutes(raw: &str) -> std::result::Result<Duration, String> {
    let value: f64 = raw
        .parse()
        .map_err(|_| format!("'{raw}' is not a number of minutes"))?;
    if !(value.is_finite() && value > 0.0) {
        return Err(format!("'{raw}' must be a positive number of minutes"));
    }
    Duration::try_from_secs_f64(value * 60.0)
        .map_err(|_| format!("'{raw}' is too large a number of minutes"))
}

/// Errors that are logged and end the process with a dedicated exit code.
fn exit_code(err: &RunnerError) -> Option<i32> {
    match err {
        RunnerError::ProjectNotFound { .. } => Some(1),
        _ => None,
    }
}

fn init_tracing(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(verbosity.filter_directive()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let api_profile = cli.api_profile.clone();
    let config = cli.into_config();
    init_tracing(config.verbosity);

    let prepared = PreparedRun::prepare(&config)?;

    let profile =
        ApiProfile::load(&api_profile).context("failed to resolve API credentials")?;
    let client = SbgClient::new(&profile)?;
    let platform = RetryingPlatform::with_default_handlers(client, Arc::new(TokioSleeper));

    match prepared.execute(&platform, &TokioSleeper, &config).await {
        Ok(outputs) => {
            println!("{}", output_text(&outputs)?);
            Ok(())
        }
        Err(err) => match exit_code(&err) {
            Some(code) => {
                error!("{err}");
                std::process::exit(code);
            }
            None => Err(err.into()),
        },
    }
}
