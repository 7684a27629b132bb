//! Native Messaging Host - Thin relay to the pip-sync daemon
//!
//! The browser spawns this binary per connection. Frames from the extension
//! on stdin are forwarded to the daemon socket as JSON lines, and lines from
//! the daemon are written back to stdout as frames. Logs go to stderr since
//! stdout carries frames.

use pip_sync::{read_frame, write_frame, Config, Outbound};
use std::io::{self, BufRead, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::thread;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Send an error envelope back to the extension
fn write_error(message: &str) {
    let envelope = Outbound::Error {
        message: message.to_string(),
    };
    match serde_json::to_vec(&envelope) {
        Ok(bytes) => {
            if let Err(e) = write_frame(&mut io::stdout().lock(), &bytes) {
                error!("Failed to write error frame: {}", e);
            }
        }
        Err(e) => error!("Failed to encode error frame: {}", e),
    }
}

/// Extension -> daemon. Returns when stdin closes or the socket fails.
fn relay_frames(mut socket: UnixStream) {
    let mut stdin = io::stdin().lock();
    loop {
        let frame = match read_frame(&mut stdin) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Extension closed the connection");
                break;
            }
            Err(e) => {
                error!("Read error: {}", e);
                break;
            }
        };
        debug!("Received {} bytes from extension", frame.len());

        // Re-encode so the envelope is guaranteed to fit on one line
        let line = match serde_json::from_slice::<serde_json::Value>(&frame)
            .and_then(|value| serde_json::to_vec(&value))
        {
            Ok(line) => line,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                write_error(&format!("Parse error: {}", e));
                continue;
            }
        };

        if let Err(e) = socket
            .write_all(&line)
            .and_then(|_| socket.write_all(b"\n"))
            .and_then(|_| socket.flush())
        {
            error!("Daemon write failed: {}", e);
            break;
        }
    }
    let _ = socket.shutdown(Shutdown::Both);
}

/// Daemon -> extension. Returns when the daemon closes the socket.
fn relay_lines(socket: UnixStream) {
    for line in BufReader::new(socket).lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Daemon read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Err(e) = write_frame(&mut io::stdout().lock(), line.as_bytes()) {
            error!("Failed to write frame: {}", e);
            break;
        }
    }
    info!("Daemon closed the connection");
}

fn main() {
    let config = Config::load();

    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level)),
        )
        .init();

    let socket_path = config.server.socket_path;
    info!("Native host started, connecting to {:?}", socket_path);

    let socket = match UnixStream::connect(&socket_path) {
        Ok(socket) => socket,
        Err(e) => {
            error!("Daemon unavailable: {}", e);
            write_error(&format!("Service unavailable: {}", e));
            return;
        }
    };
    let reader = match socket.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            error!("Failed to clone socket: {}", e);
            return;
        }
    };

    // Either side closing ends the host
    thread::spawn(move || {
        relay_lines(reader);
        std::process::exit(0);
    });
    relay_frames(socket);
}
