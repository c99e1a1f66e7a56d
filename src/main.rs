use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use proxy_audit::controller::{ControllerOptions, RunController, StatusView};
use proxy_audit::scheduler::{DEFAULT_BATCH_SIZE, DEFAULT_COLLECT_TIMEOUT};
use proxy_audit::server::{self, AppState};
use proxy_audit::tabular;
use proxy_audit::transport::{CurlOptions, CurlTransport};
use proxy_audit::types::{DEFAULT_CONCURRENCY, PROXY_HOST, PROXY_PORT};

use anyhow::Result;
use clap::Parser;
use dialoguer::Input;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// proxy-audit: checks SOCKS5 proxy credentials in bulk and writes an xlsx report.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "proxy-audit",
    version,
    about = "Checks SOCKS5 proxy credentials in bulk and writes an xlsx report.",
    long_about = None
)]
struct Cli {
    /// Spreadsheet with accounts in column D and passwords in column E.
    /// If omitted, pick one interactively.
    file: Option<PathBuf>,

    /// Probes in flight at once (1-500).
    #[arg(long, env = "PROXY_AUDIT_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Credentials per window; a snapshot is written after each window.
    #[arg(
        long = "batch-size",
        env = "PROXY_AUDIT_BATCH_SIZE",
        default_value_t = DEFAULT_BATCH_SIZE
    )]
    batch_size: usize,

    /// curl binary used for probes.
    #[arg(long, env = "PROXY_AUDIT_CURL", default_value = "curl")]
    curl: PathBuf,

    /// Directory for reports. Defaults to the directory of the input file.
    #[arg(long = "results-dir", env = "PROXY_AUDIT_RESULTS_DIR")]
    results_dir: Option<PathBuf>,

    /// Start the HTTP control API instead of running a single file.
    #[arg(long = "serve-ui", default_value_t = false)]
    serve_ui: bool,

    /// Address the control API listens on.
    #[arg(long, env = "PROXY_AUDIT_BIND", default_value = "0.0.0.0:5000")]
    bind: String,

    /// Where uploaded spreadsheets are stored.
    #[arg(long = "upload-dir", env = "PROXY_AUDIT_UPLOAD_DIR", default_value = "uploads")]
    upload_dir: PathBuf,

    /// Static files served next to the API.
    #[arg(long = "static-dir", env = "PROXY_AUDIT_STATIC_DIR", default_value = "static")]
    static_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    println!("proxy-audit configuration:");
    println!("  upstream     : socks5://{PROXY_HOST}:{PROXY_PORT}");
    println!(
        "  file         : {}",
        cli.file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<choose interactively>".to_string())
    );
    println!("  concurrency  : {}", cli.concurrency);
    println!("  batch_size   : {}", cli.batch_size);
    println!("  curl         : {}", cli.curl.display());
    println!(
        "  results_dir  : {}",
        cli.results_dir
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<next to input>".to_string())
    );
    println!("  serve_ui     : {}", cli.serve_ui);

    RunController::validate_concurrency(cli.concurrency)?;

    let transport = Arc::new(CurlTransport::new(CurlOptions {
        program: cli.curl.clone(),
        ..CurlOptions::default()
    }));
    let controller = RunController::new(
        transport,
        ControllerOptions {
            results_dir: cli.results_dir.clone(),
            batch_size: cli.batch_size.max(1),
            collect_timeout: DEFAULT_COLLECT_TIMEOUT,
        },
    );

    if cli.serve_ui {
        return serve(&cli, controller).await;
    }

    let path = match cli.file.clone() {
        Some(p) => p,
        None => match choose_input_file()? {
            Some(p) => p,
            None => return Ok(()),
        },
    };
    if !path.exists() {
        eprintln!("File does not exist: {}", path.display());
        std::process::exit(1);
    }

    controller.start_file(&path, cli.concurrency).await?;
    let progress = tokio::spawn(report_progress(controller.clone()));

    tokio::select! {
        _ = controller.wait() => {}
        _ = shutdown_signal() => {
            println!("\nInterrupted, saving results...");
            match controller.shutdown().await {
                Some(saved) => println!("Results saved to {}", saved.display()),
                None => println!("Nothing to save."),
            }
            progress.abort();
            std::process::exit(0);
        }
    }
    progress.abort();

    print_summary(&controller.status().await, controller.latest_result_file().await.as_deref());
    Ok(())
}

async fn serve(cli: &Cli, controller: RunController) -> Result<()> {
    for dir in [&cli.upload_dir, &cli.static_dir] {
        std::fs::create_dir_all(dir)?;
    }
    let state = AppState {
        controller: controller.clone(),
        upload_dir: cli.upload_dir.clone(),
    };
    let bind = cli.bind.clone();
    let static_dir = cli.static_dir.clone();
    tokio::spawn(async move {
        if let Err(e) = server::spawn_server(&bind, state, &static_dir).await {
            eprintln!("HTTP server error: {e}");
        }
    });
    println!("Control API starting at http://{} (Ctrl+C to stop)", cli.bind);

    shutdown_signal().await;
    if let Some(saved) = controller.shutdown().await {
        println!("Results saved to {}", saved.display());
    }
    Ok(())
}

/// List candidate spreadsheets in the working directory and ask which one to run.
fn choose_input_file() -> Result<Option<PathBuf>> {
    let files = tabular::find_input_files(Path::new("."))?;
    if files.is_empty() {
        println!("No spreadsheet files found in the current directory");
        return Ok(None);
    }
    println!("Found these spreadsheet files:");
    for (i, f) in files.iter().enumerate() {
        println!("{}. {}", i + 1, f.display());
    }
    let choice: String = Input::new()
        .with_prompt("Select a file number (q to quit)")
        .interact_text()?;
    let choice = choice.trim();
    if choice.eq_ignore_ascii_case("q") {
        return Ok(None);
    }
    match choice.parse::<usize>() {
        Ok(n) if (1..=files.len()).contains(&n) => Ok(Some(files[n - 1].clone())),
        Ok(_) => {
            println!("Invalid selection");
            Ok(None)
        }
        Err(_) => {
            println!("Invalid input");
            Ok(None)
        }
    }
}

async fn report_progress(controller: RunController) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let s = controller.status().await;
        if !s.is_running {
            break;
        }
        info!(
            progress = s.progress,
            done = s.current,
            total = s.total,
            success = s.success_count,
            failure = s.failure_count,
            "progress"
        );
    }
}

fn print_summary(status: &StatusView, report: Option<&Path>) {
    println!("\nTest finished ({:?})", status.phase);
    if let Some(p) = report {
        println!("  result file  : {}", p.display());
    }
    println!("  tested       : {} / {}", status.current, status.total);
    println!("  success      : {}", status.success_count);
    println!("  failure      : {}", status.failure_count);
    if let Some(err) = &status.last_error {
        println!("  error        : {err}");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
