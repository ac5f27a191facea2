use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use cape_dispatch::backend::{Backend, CapeBackend};
use cape_dispatch::config::{BackendConfig, DispatchConfig};
use cape_dispatch::dispatcher::Dispatcher;
use cape_dispatch::error::DispatchError;
use cape_dispatch::{dashboard, discovery, logging, shutdown, status};

#[derive(Parser, Debug)]
#[command(name = "cape-dispatch")]
#[command(version)]
#[command(about = "Feeds malware sample folders through a CAPE sandbox, one VM per task")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Process every matching batch folder under the base directory
    Run(RunArgs),

    /// List the batch folders and sample counts that `run` would process
    Batches(SourceArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SourceArgs {
    /// Directory containing `<Prefix>_<N>` batch folders
    #[arg(long, default_value = "/home/cape/Documents")]
    base_dir: PathBuf,

    /// Batch folder prefixes (comma-separated). Defaults to the built-in list.
    #[arg(long, value_delimiter = ',')]
    prefixes: Vec<String>,

    /// Sample file extensions (comma-separated, without the dot)
    #[arg(long, value_delimiter = ',', default_value = "exe")]
    extensions: Vec<String>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also append logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Analysis VMs, filled in this order (comma-separated)
    #[arg(long, value_delimiter = ',', default_value = "HEY,HEY_2,HEY_3")]
    slots: Vec<String>,

    /// CAPE REST API base URL
    #[arg(long, default_value = "http://127.0.0.1:8000/apiv2")]
    api_url: String,

    /// CAPE checkout the submission script runs in
    #[arg(long, default_value = "/opt/CAPEv2")]
    cape_dir: PathBuf,

    /// CAPE analysis storage directory
    #[arg(long, default_value = "/opt/CAPEv2/storage/analyses")]
    storage_dir: PathBuf,

    /// Network route passed to the submission script (empty to omit)
    #[arg(long, default_value = "inetsim")]
    route: String,

    /// Seconds between reconciliation cycles
    #[arg(long, default_value = "10")]
    cycle_interval: u64,

    /// Seconds between status reports
    #[arg(long, default_value = "60")]
    status_interval: u64,

    /// Submission command timeout in seconds
    #[arg(long, default_value = "30")]
    submit_timeout: u64,

    /// Keep a VM reserved until its task is reported or failed, instead of
    /// freeing it when analysis completes
    #[arg(long)]
    strict_slot_coupling: bool,

    /// Port for the read-only status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

impl RunArgs {
    fn to_config(&self) -> DispatchConfig {
        let defaults = DispatchConfig::default();
        DispatchConfig {
            base_dir: self.source.base_dir.clone(),
            folder_prefixes: prefixes_or_default(&self.source.prefixes, &defaults),
            extensions: self.source.extensions.clone(),
            slots: self
                .slots
                .iter()
                .filter(|s| !s.is_empty())
                .cloned()
                .collect(),
            cycle_interval_ms: self.cycle_interval * 1000,
            status_interval_ms: self.status_interval * 1000,
            release_slot_on_completed: !self.strict_slot_coupling,
            backend: BackendConfig {
                api_url: self.api_url.clone(),
                cape_dir: self.cape_dir.clone(),
                storage_dir: self.storage_dir.clone(),
                route: (!self.route.is_empty()).then(|| self.route.clone()),
                submit_timeout_secs: self.submit_timeout,
                ..BackendConfig::default()
            },
        }
    }
}

fn prefixes_or_default(prefixes: &[String], defaults: &DispatchConfig) -> Vec<String> {
    if prefixes.is_empty() {
        defaults.folder_prefixes.clone()
    } else {
        prefixes.to_vec()
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.to_config();
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    logging::init_logging(&args.source.log_level, args.source.log_file.as_deref())?;

    if !config.base_dir.is_dir() {
        return Err(DispatchError::BaseDirMissing(config.base_dir.clone()).into());
    }
    if config.slots.is_empty() {
        return Err(DispatchError::NoSlots.into());
    }

    let backend = CapeBackend::new(config.backend.clone())?;
    let busy = backend
        .slot_usage()
        .await
        .map_err(DispatchError::BackendUnreachable)?;
    tracing::info!(
        api_url = %config.backend.api_url,
        busy = ?busy,
        "CAPE API reachable"
    );

    let batches = discovery::discover_batches(&config.base_dir, &config.folder_prefixes)?;
    if batches.is_empty() {
        tracing::warn!(base_dir = %config.base_dir.display(), "No matching batch folders found");
        return Ok(());
    }

    tracing::info!(
        base_dir = %config.base_dir.display(),
        slots = ?config.slots,
        batches = batches.len(),
        release_slot_on_completed = config.release_slot_on_completed,
        "Starting CAPE dispatch"
    );

    let cancel = shutdown::install_shutdown_handler();
    let status_interval = config.status_interval();
    let dispatcher = Dispatcher::new(config, Arc::new(backend), cancel.clone());

    // Side tasks stop when the run ends, whether or not a signal arrived.
    let side_cancel = cancel.child_token();
    let reporter = tokio::spawn(status::run_reporter(
        dispatcher.state(),
        status_interval,
        side_cancel.clone(),
    ));
    let dashboard = match args.dashboard_port {
        Some(port) => {
            let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
            Some(tokio::spawn(dashboard::run_dashboard(
                addr,
                dispatcher.state(),
                side_cancel.clone(),
            )))
        }
        None => None,
    };

    let result = dispatcher.run_all(&batches).await;

    side_cancel.cancel();
    let _ = reporter.await;
    if let Some(handle) = dashboard {
        let _ = handle.await;
    }

    let summaries = result?;
    let completed: usize = summaries.iter().map(|s| s.completed).sum();
    let failed: usize = summaries.iter().map(|s| s.failed).sum();
    if cancel.is_cancelled() {
        tracing::warn!(completed, failed, "Stopped by signal");
    } else {
        tracing::info!(batches = summaries.len(), completed, failed, "All folders processed");
    }
    Ok(())
}

fn list_batches(args: SourceArgs) -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging(&args.log_level, args.log_file.as_deref())?;

    if !args.base_dir.is_dir() {
        return Err(DispatchError::BaseDirMissing(args.base_dir.clone()).into());
    }
    let prefixes = prefixes_or_default(&args.prefixes, &DispatchConfig::default());
    let batches = discovery::discover_batches(&args.base_dir, &prefixes)?;

    println!("{:<30} {:>8}", "FOLDER", "SAMPLES");
    println!("{}", "-".repeat(39));
    for batch in &batches {
        let count = discovery::samples(&batch.path, &args.extensions)?.len();
        println!("{:<30} {:>8}", batch.name, count);
    }
    if batches.is_empty() {
        println!("No matching batch folders.");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run(run_args).await?,
        Commands::Batches(source) => list_batches(source)?,
    }

    Ok(())
}
