//! Homeport: local control-plane host.
//!
//! This is the application entry point. It loads configuration, initializes
//! tracing, settles single-instance ownership (forwarding to the running
//! instance if there is one), then runs the orchestrator on a tokio runtime
//! while the main thread becomes the UI thread. Forwarding uses the default
//! instance settings when the config file cannot be loaded.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use homeport::config::{
    default_config_path, AppConfig, InstanceConfig, DEFAULT_LOG_FILTER, DEFAULT_LOG_FORMAT,
};
use homeport::http::shutdown_signal;
use homeport::instance::SingleInstanceGuard;
use homeport::orchestrator::Orchestrator;
use homeport::ui::{self, LogSurface, UiEvent};

/// Homeport: local HTTP(S) host for a desktop UI
#[derive(Parser, Debug)]
#[command(name = "homeport", version, about)]
struct Args {
    /// Path to configuration file (defaults to the per-user data directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level filter (e.g., "homeport=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,

    /// Expose the API to other devices over TLS, overriding server.export
    #[arg(long)]
    export: bool,

    /// Arguments handed to the running instance if there is one
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    activation_args: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let loaded = AppConfig::load_or_default(&config_path);
    let log_format = match &loaded {
        Ok(config) => config.logging.format.as_str(),
        Err(_) => DEFAULT_LOG_FORMAT,
    };
    init_tracing(args.log_level, log_format);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    // A broken config must not keep this launch from reaching a running instance
    let guard = SingleInstanceGuard::from_config(&InstanceConfig::from_loaded(&loaded));
    let owner = match runtime.block_on(guard.acquire_or_forward(args.activation_args)) {
        Ok(Some(owner)) => owner,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Could not start or reach the running instance");
            return ExitCode::FAILURE;
        }
    };

    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %config_path.display(), error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    if args.export {
        config.server.export = true;
    }
    tracing::info!(
        path = %config_path.display(),
        export = config.server.export,
        exit_on_stop = config.server.exit_process_on_server_stop,
        "Loaded configuration"
    );

    let (ui_handle, ui_events) = ui::channel();

    let _runtime_guard = runtime.enter();

    // Forwarded launches arrive on a runtime worker and are applied on the UI thread
    let activation_ui = ui_handle.clone();
    let activations = owner.serve(move |activation| {
        activation_ui.post(UiEvent::Activate {
            args: activation.args,
        })
    });

    let orchestrator = Orchestrator::new(config, ui_handle.clone());
    let exit_ui = ui_handle;
    let host = runtime.spawn(async move {
        let result = tokio::spawn(orchestrator.run(shutdown_signal())).await;
        // Close the UI even if the orchestrator panicked
        exit_ui.post(UiEvent::Exit);
        result
    });

    ui::run_event_loop(LogSurface::default(), ui_events);

    let result = runtime.block_on(async {
        let result = host.await;
        activations.shutdown().await;
        result
    });

    match result {
        Ok(Ok(Ok(()))) => {
            tracing::info!("Host exited");
            ExitCode::SUCCESS
        }
        Ok(Ok(Err(e))) => {
            tracing::error!(error = %e, "Host stopped after an unrecoverable server error");
            ExitCode::FAILURE
        }
        Ok(Err(e)) | Err(e) => {
            tracing::error!(error = %e, "Host task failed");
            ExitCode::FAILURE
        }
    }
}

/// Initialize tracing with priority: CLI > env > default
fn init_tracing(cli_filter: Option<String>, format: &str) {
    let log_filter = cli_filter
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));

    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
