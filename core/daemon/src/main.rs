//! GeoWake daemon entrypoint.
//!
//! A small, single-writer service that supervises tracking reliability: a
//! socket listener with strict request validation, a SQLite-backed session
//! store and timer queue, and a dispatcher thread that delivers due timers.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use geowake_daemon_protocol::{
    BootReason, Command, ErrorInfo, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod actions;
mod alarms;
mod boot;
mod config;
mod db;
mod fallback;
mod handshake;
mod host;
mod notifications;
mod platform;
mod progress_wake;
mod reliability;
mod session_store;
mod supervisor;
mod surfaces;
#[cfg(test)]
mod test_support;

use alarms::SqliteAlarmService;
use config::{default_config_path, load_config, DaemonConfig, CONFIG_ENV};
use db::Db;
use platform::{SystemClock, ThreadDeferred};
use supervisor::{Platform, Supervisor};
use surfaces::{CommandLauncher, TracingFeedback, TracingNotifier};

const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let base_dir = match geowake_dir() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve GeoWake directory");
            std::process::exit(1);
        }
    };

    let config = load_daemon_config(&base_dir);

    let socket_path = base_dir.join(SOCKET_NAME);
    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "GeoWake daemon started");

    let db = match Db::new(base_dir.join("daemon").join("state.db")) {
        Ok(db) => Arc::new(db),
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    match db.list_timers() {
        Ok(timers) => info!(armed = timers.len(), "Timer queue loaded"),
        Err(err) => warn!(error = %err, "Failed to read timer queue"),
    }

    let platform = Platform {
        clock: Arc::new(SystemClock),
        alarms: Arc::new(SqliteAlarmService::new(
            Arc::clone(&db),
            config.platform.exact_alarms_permitted,
        )),
        notifier: Arc::new(TracingNotifier),
        feedback: Arc::new(TracingFeedback::default()),
        launcher: Arc::new(CommandLauncher::new(config.launcher.command.clone())),
        deferred: Arc::new(ThreadDeferred),
    };
    let supervisor = Arc::new(Supervisor::new(db, &config, platform));

    // The daemon coming up is itself a restart signal.
    let recovery = supervisor.recover(BootReason::DaemonStart);
    info!(
        tracking_active = recovery.tracking_active,
        progress_wake_rearmed = recovery.progress_wake_rearmed,
        errors = recovery.errors.len(),
        "Startup recovery finished"
    );

    spawn_timer_dispatcher(
        Arc::clone(&supervisor),
        Duration::from_millis(config.timers.poll_interval_ms),
    );

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let supervisor = Arc::clone(&supervisor);
                thread::spawn(|| handle_connection(stream, supervisor));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn spawn_timer_dispatcher(supervisor: Arc<Supervisor>, interval: Duration) {
    thread::spawn(move || loop {
        match supervisor.dispatch_due_timers() {
            Ok(0) => {}
            Ok(fired) => debug!(fired, "Delivered due timers"),
            Err(err) => warn!(error = %err, "Timer dispatch failed"),
        }
        thread::sleep(interval);
    });
}

fn init_logging() {
    let debug_enabled = env::var("GEOWAKE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn geowake_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".geowake"))
}

fn load_daemon_config(base_dir: &Path) -> DaemonConfig {
    let path = env::var_os(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| default_config_path(base_dir));
    match load_config(&path) {
        Ok(config) => {
            info!(
                path = %path.display(),
                exact_alarms_permitted = config.platform.exact_alarms_permitted,
                launcher_configured = !config.launcher.command.is_empty(),
                mirror_dirs = config.session.mirror_dirs.len(),
                "Daemon config loaded"
            );
            config
        }
        Err(err) => {
            warn!(error = %err, "Failed to load daemon config; using defaults");
            DaemonConfig::default()
        }
    }
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, supervisor: Arc<Supervisor>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    debug!(method = request.method.as_str(), id = ?request.id, "Daemon request received");
    let response = handle_request(request, &supervisor);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, supervisor: &Supervisor) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let command = match Command::from_request(request.method, request.params) {
        Ok(command) => command,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Rejected command");
            return Response::error_with_info(request.id, err);
        }
    };

    match supervisor.execute(command) {
        Ok(data) => Response::ok(request.id, data),
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Command failed");
            Response::error_with_info(request.id, err)
        }
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
