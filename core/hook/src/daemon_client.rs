//! Client helper for sending one command to the GeoWake daemon.
//!
//! The daemon owns all state. A transport failure is retried once with the
//! same request id; an error reported by the daemon is returned as-is.

use chrono::Utc;
use geowake_daemon_protocol::{Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION};
use rand::RngCore;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const SOCKET_ENV: &str = "GEOWAKE_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 2_000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0}")]
    Transport(String),
    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

/// Sends `method` and returns the response data on success.
pub fn call(method: Method, params: Option<Value>) -> Result<Value, ClientError> {
    let request = Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id: Some(make_request_id(method)),
        params,
    };

    let response = send_with_retry(&request)?;
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }

    let (code, message) = response
        .error
        .map(|err| (err.code, err.message))
        .unwrap_or_else(|| ("unknown".to_string(), "Unknown daemon error".to_string()));
    Err(ClientError::Daemon { code, message })
}

fn send_with_retry(request: &Request) -> Result<Response, ClientError> {
    match send_request(request) {
        Ok(response) => Ok(response),
        Err(err) => {
            tracing::warn!(
                error = %err,
                method = request.method.as_str(),
                "Failed to reach daemon; retrying"
            );
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_request(request).map_err(|retry_err| {
                tracing::warn!(
                    error = %retry_err,
                    method = request.method.as_str(),
                    "Retry failed"
                );
                ClientError::Transport(retry_err)
            })
        }
    }
}

fn socket_path() -> Result<PathBuf, String> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".geowake").join(SOCKET_NAME))
}

fn send_request(request: &Request) -> Result<Response, String> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
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
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn make_request_id(method: Method) -> String {
    let rand = rand::thread_rng().next_u64();
    format!(
        "{}-{}-{:x}",
        method.as_str(),
        Utc::now().timestamp_millis(),
        rand
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::os::unix::net::UnixListener;
    use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
    use std::time::Instant;

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    struct EnvGuard {
        key: &'static str,
        prior: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prior = std::env::var(key).ok();
            std::env::set_var(key, value);
            Self { key, prior }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.prior {
                std::env::set_var(self.key, value);
            } else {
                std::env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn test_socket(label: &str) -> PathBuf {
        let dir = tempfile::Builder::new()
            .prefix(label)
            .tempdir_in("/tmp")
            .unwrap()
            .into_path();
        dir.join("daemon.sock")
    }

    fn read_request(stream: &mut UnixStream) -> Option<Request> {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend_from_slice(&chunk[..n]);
                    if buffer.contains(&b'\n') {
                        break;
                    }
                }
                Err(_) => return None,
            }
        }
        let end = buffer.iter().position(|b| *b == b'\n').unwrap_or(buffer.len());
        serde_json::from_slice(&buffer[..end]).ok()
    }

    fn reply(stream: &mut UnixStream, response: &Response) {
        let mut payload = serde_json::to_vec(response).unwrap();
        payload.push(b'\n');
        let _ = stream.write_all(&payload);
    }

    #[test]
    fn call_returns_response_data() {
        let _guard = env_lock();
        let socket = test_socket("gw-hook-ok");
        let listener = UnixListener::bind(&socket).unwrap();

        let captured = Arc::new(Mutex::new(None::<Request>));
        let captured_clone = Arc::clone(&captured);
        let server = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let request = read_request(&mut stream);
                *captured_clone.lock().unwrap() = request;
                reply(
                    &mut stream,
                    &Response::ok(None, json!({ "host_notified": false })),
                );
            }
        });

        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().unwrap());
        let data = call(Method::HandleEndTracking, None).unwrap();
        server.join().unwrap();

        assert_eq!(data["host_notified"], false);
        let request = captured.lock().unwrap().take().expect("captured request");
        assert_eq!(request.method, Method::HandleEndTracking);
        assert_eq!(request.protocol_version, PROTOCOL_VERSION);
        assert!(request
            .id
            .as_deref()
            .is_some_and(|id| id.starts_with("handle_end_tracking-")));
    }

    #[test]
    fn daemon_errors_are_not_retried() {
        let _guard = env_lock();
        let socket = test_socket("gw-hook-err");
        let listener = UnixListener::bind(&socket).unwrap();
        listener.set_nonblocking(true).unwrap();

        let attempts = Arc::new(Mutex::new(0usize));
        let attempts_clone = Arc::clone(&attempts);
        let server = std::thread::spawn(move || {
            let start = Instant::now();
            while start.elapsed() < Duration::from_millis(500) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        *attempts_clone.lock().unwrap() += 1;
                        read_request(&mut stream);
                        reply(
                            &mut stream,
                            &Response::error(None, "missing_field", "route_id is required"),
                        );
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().unwrap());
        let err = call(Method::ScheduleFallbackAlarm, Some(json!({}))).unwrap_err();
        server.join().unwrap();

        match err {
            ClientError::Daemon { code, .. } => assert_eq!(code, "missing_field"),
            other => panic!("expected daemon error, got {other:?}"),
        }
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[test]
    fn lost_response_is_retried_with_same_request_id() {
        let _guard = env_lock();
        let socket = test_socket("gw-hook-lost");
        let listener = UnixListener::bind(&socket).unwrap();
        listener.set_nonblocking(true).unwrap();

        let ids: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let ids_clone = Arc::clone(&ids);
        let server = std::thread::spawn(move || {
            let start = Instant::now();
            let mut handled = 0;
            while handled < 2 && start.elapsed() < Duration::from_secs(5) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        stream.set_nonblocking(false).unwrap();
                        handled += 1;
                        let request = read_request(&mut stream);
                        ids_clone
                            .lock()
                            .unwrap()
                            .push(request.and_then(|request| request.id));
                        if handled == 2 {
                            reply(&mut stream, &Response::ok(None, json!({ "status": "ok" })));
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().unwrap());
        let data = call(Method::GetHealth, None).unwrap();
        server.join().unwrap();

        assert_eq!(data["status"], "ok");
        let ids = ids.lock().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1], "retry must reuse the same request id");
    }

    #[test]
    fn missing_daemon_is_a_transport_error() {
        let _guard = env_lock();
        let socket = test_socket("gw-hook-absent");
        let _socket_guard = EnvGuard::set(SOCKET_ENV, socket.to_str().unwrap());

        let err = call(Method::GetHealth, None).unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
    }
}
