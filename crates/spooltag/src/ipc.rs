//! JSON requests over a Unix domain socket.
//!
//! One request per connection: the client writes a JSON object, the server
//! reads it with a single read of at most 64 KiB, answers with one JSON
//! object and closes the connection. Each connection gets its own thread, so
//! a `write_tag` waiting for a card does not hold up other requests.

use crate::backend::Handlers;
use anyhow::{Context, Result};
use spooltag_protocol::defaults::MAX_IPC_MESSAGE;
use spooltag_protocol::{Request, Response};
use spooltag_reader::CancellationToken;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side deadline; a write request may wait for a card.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind `path`, creating its directory and replacing a stale socket.
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create socket directory {}", dir.display()))?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind socket {}", path.display()))?;
        listener.set_nonblocking(true)?;
        info!(path = %path.display(), "listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept connections until `cancel` fires.
    ///
    /// Connection threads are detached; a request still in flight at
    /// shutdown finishes on its own and does not delay the return.
    pub fn run(&self, handlers: &Handlers, cancel: &CancellationToken) -> Result<()> {
        while !cancel.is_cancelled() {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let handlers = handlers.clone();
                    let spawned = thread::Builder::new()
                        .name("spooltag-ipc-conn".to_string())
                        .spawn(move || {
                            if let Err(e) = serve_connection(stream, &handlers) {
                                warn!("connection failed: {}", e);
                            }
                        });
                    if let Err(e) = spawned {
                        warn!("failed to spawn connection thread: {}", e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => cancel.sleep(ACCEPT_POLL),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context("Failed to accept connection"),
            }
        }
        info!("socket server stopped");
        Ok(())
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn serve_connection(mut stream: UnixStream, handlers: &Handlers) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CONNECTION_TIMEOUT))?;

    let mut buf = vec![0u8; MAX_IPC_MESSAGE];
    let n = stream.read(&mut buf)?;
    if n == 0 {
        return Ok(());
    }

    let response = handlers.handle(&buf[..n]);
    let body = serde_json::to_vec(&response)?;
    stream.write_all(&body)?;
    stream.flush()
}

/// Talks to a running backend.
#[derive(Debug, Clone)]
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Send a request. Transport failures come back as error responses.
    pub fn send(&self, request: &Request) -> Response {
        match self.try_send(request) {
            Ok(response) => response,
            Err(e) => {
                warn!("Error communicating with server: {:#}", e);
                Response::error(format!("{:#}", e))
            }
        }
    }

    fn try_send(&self, request: &Request) -> Result<Response> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .with_context(|| format!("Failed to connect to {}", self.socket_path.display()))?;
        stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
        stream.write_all(&serde_json::to_vec(request)?)?;

        let mut body = Vec::new();
        stream.read_to_end(&mut body)?;
        serde_json::from_slice(&body).context("Invalid response from server")
    }
}
