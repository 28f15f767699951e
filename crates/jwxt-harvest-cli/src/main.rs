//! JWXT Harvest command-line entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use jwxt_harvest::config::{self, interval_from_secs};
use jwxt_harvest::{
    download_cloud_snapshot, resolve_credentials, session, CloudMode, HarvestConfig, HarvestError,
    HarvestOptions, Harvester, SessionPaths,
};

#[derive(Parser)]
#[command(
    name = "jwxt-harvest",
    about = "Harvest the JWXT course catalog into terms/<termId>.json and current.json",
    version
)]
struct Cli {
    #[command(flatten)]
    harvest: HarvestArgs,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in (or reuse the stored session) and harvest (default).
    Harvest,

    /// Download the published snapshot mirror without logging in.
    Cloud,

    /// Delete the stored session bundle and its key.
    ClearSession,

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

#[derive(Args)]
struct HarvestArgs {
    /// Student id. Falls back to JWXT_USERNAME, then the secrets file.
    #[arg(short, long, global = true)]
    username: Option<String>,

    /// Password. Falls back to JWXT_PASSWORD, then the secrets file.
    #[arg(short, long, global = true)]
    password: Option<String>,

    /// Output directory for current.json and terms/.
    #[arg(short, long, global = true, default_value = "data")]
    output_dir: PathBuf,

    /// `Cookie:` header exported from a logged-in browser.
    #[arg(long, global = true)]
    cookie_header: Option<String>,

    /// JSON file with {"username": ..., "password": ...}.
    #[arg(long, global = true)]
    secrets_file: Option<PathBuf>,

    /// Only fetch details for the first N courses (debugging).
    #[arg(long, global = true)]
    limit: Option<usize>,

    /// Round to harvest, by xkkz_id.
    #[arg(long, global = true)]
    xkkz_id: Option<String>,

    /// Round to harvest, by ordinal (xklc).
    #[arg(long, global = true)]
    xklc: Option<String>,

    /// all, current, or a campus id / label fragment.
    #[arg(long, global = true, default_value = "all")]
    campus_scope: String,

    /// Seconds between any two requests.
    #[arg(long, global = true)]
    request_interval: Option<f64>,

    /// Concurrent detail workers.
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Snapshot mirror root (contains current.json and terms/).
    #[arg(long, global = true, env = "JWXT_CLOUD_BASE_URL")]
    cloud_base_url: Option<String>,

    /// Mirror policy: auto (fallback), always (mirror only), never.
    #[arg(long, global = true, default_value = "auto")]
    cloud_download: CloudMode,

    /// Download every term listed by the mirror instead of the latest.
    #[arg(long, global = true)]
    cloud_all_terms: bool,

    /// Encrypted session bundle.
    #[arg(long, global = true)]
    cookie_store: Option<PathBuf>,

    /// Private key for the session bundle.
    #[arg(long, global = true)]
    cookie_key: Option<PathBuf>,

    /// Never read or write the session bundle.
    #[arg(long, global = true)]
    no_cookie_store: bool,

    /// Skip TLS certificate verification.
    #[arg(long, global = true)]
    insecure: bool,
}

impl HarvestArgs {
    fn config(&self) -> HarvestConfig {
        let mut config = HarvestConfig::from_env();
        if let Some(secs) = self.request_interval {
            config.request_interval = interval_from_secs(secs);
        }
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if self.insecure {
            config.accept_invalid_certs = true;
        }
        config
    }

    fn session_paths(&self) -> SessionPaths {
        SessionPaths {
            bundle: self
                .cookie_store
                .clone()
                .unwrap_or_else(config::default_bundle_path),
            key: self
                .cookie_key
                .clone()
                .unwrap_or_else(config::default_key_path),
        }
    }

    fn cloud_base_url(&self) -> Option<String> {
        self.cloud_base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(config::cloud_base_url_from_env)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let args = cli.harvest;
    match cli.command.unwrap_or(Commands::Harvest) {
        Commands::Harvest => harvest(&args).await,
        Commands::Cloud => {
            let base = args
                .cloud_base_url()
                .context("cloud download needs --cloud-base-url or JWXT_CLOUD_BASE_URL")?;
            cloud(&args, &base).await
        }
        Commands::ClearSession => {
            let paths = args.session_paths();
            session::clear(&paths.bundle, &paths.key).context("clearing session store")?;
            println!("Removed {} and {}", paths.bundle.display(), paths.key.display());
            Ok(())
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "jwxt-harvest", &mut std::io::stdout());
            Ok(())
        }
    }
}

async fn cloud(args: &HarvestArgs, base: &str) -> anyhow::Result<()> {
    let terms = download_cloud_snapshot(base, &args.output_dir, args.cloud_all_terms, &args.config())
        .await
        .with_context(|| format!("downloading snapshot from {base}"))?;
    println!(
        "Downloaded {} term(s) into {}",
        terms.len(),
        args.output_dir.display()
    );
    Ok(())
}

async fn harvest(args: &HarvestArgs) -> anyhow::Result<()> {
    let cloud_base = args.cloud_base_url();
    if args.cloud_download == CloudMode::Always {
        let base = cloud_base.context("--cloud-download=always needs --cloud-base-url or JWXT_CLOUD_BASE_URL")?;
        return cloud(args, &base).await;
    }

    let secrets_path = args
        .secrets_file
        .clone()
        .unwrap_or_else(config::default_secrets_path);
    let credentials = resolve_credentials(
        args.username.as_deref(),
        args.password.as_deref(),
        &secrets_path,
    );
    let session_store = (!args.no_cookie_store).then(|| args.session_paths());
    let has_bundle = session_store
        .as_ref()
        .is_some_and(|p| p.bundle.exists() && p.key.exists());
    let has_cookie_header = args.cookie_header.as_deref().is_some_and(|h| !h.trim().is_empty());

    if args.cloud_download == CloudMode::Auto && credentials.is_none() && !has_bundle && !has_cookie_header {
        if let Some(base) = &cloud_base {
            tracing::info!("no session or credentials available, using the snapshot mirror");
            return cloud(args, base).await;
        }
    }

    let options = HarvestOptions {
        credentials,
        cookie_header: args.cookie_header.clone(),
        session_store,
        owner_hint: None,
        round_id: args.xkkz_id.clone(),
        round_ordinal: args.xklc.clone(),
        campus_scope: args.campus_scope.clone(),
        max_courses: args.limit,
    };

    let harvester = Harvester::new(args.config()).context("building HTTP client")?;
    let report = match harvester.run_to_dir(&options, &args.output_dir).await {
        Ok(report) => report,
        Err(HarvestError::CredentialsRequired) if args.cloud_download == CloudMode::Auto => {
            let Some(base) = &cloud_base else {
                return Err(HarvestError::CredentialsRequired.into());
            };
            tracing::info!("stored session expired and no credentials given, using the snapshot mirror");
            return cloud(args, base).await;
        }
        Err(e) => return Err(anyhow::Error::new(e).context("harvest failed")),
    };

    for warning in &report.warnings {
        eprintln!("Warning: {warning}");
    }
    println!(
        "{}: {} teaching classes ({}) written to {}",
        report.snapshot.term_name,
        report.snapshot.courses.len(),
        report.snapshot.term_id,
        args.output_dir.display()
    );
    Ok(())
}
