// Author Host
// Bridges the presentation layer to the agent runtime over stdio
//
// Run with: cargo run --bin author-host
//
// Commands arrive as JSON lines on stdin. Responses and forwarded events
// leave as JSON lines on stdout. Logs go to stderr.

mod host;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

use author_lib::repositories::ThreadRepository;
use author_lib::services::{AgentClient, BackendSupervisor, EventForwarder, ThreadManager};
use author_lib::utils::database::open_database;
use author_lib::utils::AuthorConfig;
use author_lib::{AuthorError, AuthorResult, ForwardedEvent};

use host::{parse_request, Flow, Host, HostOutput, HostResponse};

fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(r#"Author Host v{}

USAGE:
    author-host [OPTIONS]

OPTIONS:
    --help, -h          Print this help information
    --version, -v       Print version information
    --config <PATH>     Read settings from a TOML file (default: $AUTHOR_CONFIG)

DESCRIPTION:
    Starts the agent runtime, connects to it, and serves thread and prompt
    commands as JSON lines on stdin. Responses and agent events are written
    as JSON lines on stdout.

ENVIRONMENT:
    BACKEND_HOST, BACKEND_PORT      Agent runtime address
    AUTHOR_BACKEND_COMMAND          Command that starts the agent runtime
    AUTHOR_BACKEND_DIR              Working directory for that command
    AUTHOR_SPAWN_BACKEND            "false" to attach to a running runtime
    AUTHOR_DB_PATH                  Thread database location
    AUTHOR_MODE                     fiction | non-fiction | academic
    RUST_LOG                        Log filter (default: info)

COMMANDS:
    create_thread, list_threads, get_thread, rename_thread, delete_thread,
    get_thread_messages, open_project, send_message, cancel, change_mode,
    get_mode, status, shutdown
"#, version);
}

fn print_version() {
    println!("author-host {}", env!("CARGO_PKG_VERSION"));
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                return;
            }
            "--version" | "-v" => {
                print_version();
                return;
            }
            "--config" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => {
                    eprintln!("--config requires a path");
                    std::process::exit(1);
                }
            },
            _ => {
                eprintln!("Unknown option: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    log::info!("[Author Host] Starting (PID: {})", std::process::id());

    if let Err(e) = run(config_path).await {
        log::error!("[Author Host] {}", e);
        std::process::exit(1);
    }

    log::info!("[Author Host] Shutdown complete");
}

async fn run(config_path: Option<PathBuf>) -> AuthorResult<()> {
    let config = AuthorConfig::load(config_path.as_deref())?;

    let db_path = config.storage.resolve_database_path()?;
    let db = open_database(&db_path).map_err(AuthorError::Storage)?;
    log::info!("[Author Host] Thread store at {}", db_path.display());

    let supervisor = Arc::new(BackendSupervisor::new(config.backend.clone())?);
    let endpoint = supervisor.start().await?;

    let url = endpoint.agent_url(&config.transport.agent_path)?;
    let client = AgentClient::new(url, config.transport.clone());
    if let Err(e) = client.connect().await {
        let _ = supervisor.stop().await;
        return Err(e);
    }

    let (forwarder, events) = EventForwarder::channel();
    let manager = ThreadManager::new(
        ThreadRepository::new(db),
        client.clone(),
        forwarder,
        config.agent.default_mode,
    );
    let relay = manager.start();

    let (out_tx, out_rx) = mpsc::unbounded_channel::<HostOutput>();
    let pump = tokio::spawn(pump_events(events, out_tx.clone()));
    let writer = tokio::spawn(write_output(out_rx));

    let host = Host::new(manager, Arc::clone(&supervisor));
    serve(&host, &out_tx).await;

    client.close();
    relay.abort();
    pump.abort();
    drop(host);
    drop(out_tx);
    let _ = writer.await;

    supervisor.stop().await
}

/// Read commands until EOF, `shutdown`, or a termination signal
async fn serve(host: &Host, out: &mpsc::UnboundedSender<HostOutput>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        let line = tokio::select! {
            _ = &mut signal => break,
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                log::info!("[Author Host] stdin closed");
                break;
            }
            Err(e) => {
                log::error!("[Author Host] Failed to read stdin: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let (response, flow) = match parse_request(&line) {
            Ok(request) => host.dispatch(request).await,
            Err(response) => (response, Flow::Continue),
        };
        respond(out, response);

        if flow == Flow::Shutdown {
            log::info!("[Author Host] Shutdown requested");
            break;
        }
    }
}

fn respond(out: &mpsc::UnboundedSender<HostOutput>, response: HostResponse) {
    if out.send(HostOutput::Response(response)).is_err() {
        log::warn!("[Author Host] Output closed, response dropped");
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<ForwardedEvent>,
    out: mpsc::UnboundedSender<HostOutput>,
) {
    while let Some(event) = events.recv().await {
        if out.send(HostOutput::Event(event)).is_err() {
            break;
        }
    }
}

/// Single stdout writer so lines never interleave
async fn write_output(mut out: mpsc::UnboundedReceiver<HostOutput>) {
    let mut stdout = tokio::io::stdout();
    while let Some(output) = out.recv().await {
        let mut line = match output.to_line() {
            Ok(line) => line,
            Err(e) => {
                log::error!("[Author Host] Failed to serialize output: {}", e);
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            log::error!("[Author Host] Failed to write stdout: {}", e);
            break;
        }
        let _ = stdout.flush().await;
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    let (mut sigterm, mut sigint, mut sighup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
        _ => {
            log::warn!("[Author Host] Signal handlers unavailable");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => log::info!("[Author Host] Received SIGTERM, shutting down..."),
        _ = sigint.recv() => log::info!("[Author Host] Received SIGINT, shutting down..."),
        _ = sighup.recv() => log::info!("[Author Host] Received SIGHUP (parent process died), shutting down..."),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
