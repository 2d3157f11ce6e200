//! The request server: a pool of worker threads accepting one-shot
//! connections on a Unix-domain socket.
//!
//! Each accepted connection is a single transaction (read one command
//! line, dispatch, respond, close), so whatever a request leaks or breaks
//! is bounded by that connection. Workers share the token catalogue (behind
//! a lock, swapped wholesale on reload) and the cache; the persistent store
//! stays the source of truth, so a value written through one worker is
//! visible to every other at the latest on its next store read.

use std::fs;
use std::io::{BufReader, Read, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use tracing::{debug, error, info, warn};

use crate::cache::SecretCache;
use crate::catalog::TokenCatalog;
use crate::config::TokenSettings;
use crate::error::{KeeperError, Result};
use crate::protocol::{self, Command};
use crate::store::SecretStore;

#[derive(Debug, Clone, Copy)]
pub struct AccessPolicy {
    pub read: bool,
    pub write: bool,
}

/// Everything a worker needs to serve requests. One per daemon, shared.
pub struct ServerContext {
    pub namespace: String,
    pub catalog: RwLock<TokenCatalog>,
    pub store: SecretStore,
    pub cache: SecretCache,
    pub access: AccessPolicy,
}

impl ServerContext {
    /// Rebuild the token catalogue from config. The new catalogue replaces
    /// the old one only when every token loads; a failed reload keeps the
    /// daemon serving with the previous set.
    pub fn reload_tokens(&self, settings: &[TokenSettings]) {
        match TokenCatalog::load(settings) {
            Ok(catalog) => {
                let count = catalog.len();
                *self.catalog.write().unwrap() = catalog;
                info!(namespace = %self.namespace, tokens = count, "token catalogue reloaded");
            }
            Err(e) => {
                error!(namespace = %self.namespace, "token reload failed, keeping previous catalogue: {e}");
            }
        }
    }
}

/// What the read half of a transaction decided.
enum Action {
    /// Client vanished or the line was unreadable; close silently.
    Abort,
    Syntax,
    Unknown,
    Denied,
    Get(String),
    Set(String, Vec<u8>),
}

/// Serve one connection. Split from the socket loop so the protocol
/// behavior is testable over any byte stream pair.
pub fn handle_connection<S: Read + Write>(stream: &mut S, ctx: &ServerContext) {
    // Read everything through one buffered reader: a `set` body may have
    // been slurped into its buffer along with the command line.
    let action = {
        let mut reader = BufReader::new(&mut *stream);
        match protocol::read_command_line(&mut reader) {
            Err(e) => {
                debug!("client read failed: {e}");
                Action::Abort
            }
            Ok(line) => match protocol::parse_command(&line) {
                Err(()) => Action::Syntax,
                Ok(Command::Unknown) => Action::Unknown,
                Ok(Command::Get(key)) if !ctx.access.read => {
                    debug!(key = %key, "read access denied");
                    Action::Denied
                }
                Ok(Command::Get(key)) => Action::Get(key),
                Ok(Command::Set(key)) if !ctx.access.write => {
                    debug!(key = %key, "write access denied");
                    Action::Denied
                }
                Ok(Command::Set(key)) => {
                    let mut value = Vec::new();
                    match reader.read_to_end(&mut value) {
                        Ok(_) => Action::Set(key, value),
                        Err(e) => {
                            debug!(key = %key, "client aborted set: {e}");
                            Action::Abort
                        }
                    }
                }
            },
        }
    };

    match action {
        Action::Abort => {}
        Action::Syntax => respond(stream, protocol::CLIENT_ERROR_SYNTAX),
        Action::Unknown => respond(stream, protocol::ERROR),
        Action::Denied => respond(stream, protocol::CLIENT_ERROR_ACCESS),
        Action::Get(key) => serve_get(stream, ctx, &key),
        Action::Set(key, value) => serve_set(stream, ctx, &key, &value),
    }
}

fn serve_get<S: Write>(stream: &mut S, ctx: &ServerContext, key: &str) {
    if let Some(value) = ctx.cache.get(key) {
        debug!(key, "cache hit");
        respond(stream, &value);
        return;
    }

    let catalog = ctx.catalog.read().unwrap();
    match ctx.store.get(&catalog, key) {
        Ok(Some(value)) => {
            ctx.cache.insert(key, &value);
            respond(stream, &value);
        }
        Ok(None) => {
            // No such key: the reply is an empty body.
            debug!(key, "no such secret");
        }
        Err(e) => {
            warn!(key, "get failed: {e}");
        }
    }
}

fn serve_set<S: Write>(stream: &mut S, ctx: &ServerContext, key: &str, value: &[u8]) {
    let catalog = ctx.catalog.read().unwrap();
    match ctx.store.put(&catalog, key, value) {
        Ok(()) => {
            ctx.cache.insert(key, value);
            respond(stream, protocol::STORED);
        }
        Err(e) => {
            warn!(key, "set failed: {e}");
            respond(stream, protocol::NOT_STORED);
        }
    }
}

fn respond<S: Write>(stream: &mut S, bytes: &[u8]) {
    if let Err(e) = stream.write_all(bytes).and_then(|_| stream.flush()) {
        debug!("client write failed: {e}");
    }
}

/// The bound socket plus its worker pool.
pub struct Server {
    listener: Arc<UnixListener>,
    socket_file: PathBuf,
    ctx: Arc<ServerContext>,
}

impl Server {
    /// Bind the socket (replacing a stale file), apply the configured mode,
    /// and wrap the context for the workers.
    pub fn bind(
        socket_file: &Path,
        socket_mode: Option<u32>,
        ctx: Arc<ServerContext>,
    ) -> Result<Server> {
        if socket_file.exists() {
            fs::remove_file(socket_file).map_err(|e| {
                KeeperError::Config(format!(
                    "cannot remove stale socket {}: {e}",
                    socket_file.display()
                ))
            })?;
        }
        if let Some(dir) = socket_file.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let listener = UnixListener::bind(socket_file).map_err(|e| {
            KeeperError::Config(format!("cannot bind {}: {e}", socket_file.display()))
        })?;

        if let Some(mode) = socket_mode {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(socket_file, fs::Permissions::from_mode(mode))?;
        }

        info!(socket = %socket_file.display(), "listening");
        Ok(Server {
            listener: Arc::new(listener),
            socket_file: socket_file.to_path_buf(),
            ctx,
        })
    }

    /// Spawn the worker pool. Each worker loops on accept and serves one
    /// connection at a time; an accept error is logged and retried.
    pub fn spawn_workers(&self, count: usize) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|id| {
                let listener = Arc::clone(&self.listener);
                let ctx = Arc::clone(&self.ctx);
                std::thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || worker_loop(id, &listener, &ctx))
                    .expect("worker thread spawn")
            })
            .collect()
    }

    /// Remove the socket file on shutdown.
    pub fn cleanup(&self) {
        if let Err(e) = fs::remove_file(&self.socket_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(socket = %self.socket_file.display(), "socket cleanup failed: {e}");
            }
        }
    }
}

fn worker_loop(id: usize, listener: &UnixListener, ctx: &ServerContext) {
    debug!(worker = id, "worker ready");
    loop {
        match listener.accept() {
            Ok((mut stream, _addr)) => {
                handle_connection(&mut stream, ctx);
                let _ = stream.shutdown(std::net::Shutdown::Both);
            }
            Err(e) => {
                warn!(worker = id, "accept failed: {e}");
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
        }
    }
}

/// Creates the pid file on construction and removes it on drop.
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    pub fn create(path: &Path) -> Result<PidFileGuard> {
        fs::write(path, format!("{}\n", std::process::id())).map_err(|e| {
            KeeperError::Config(format!("cannot write pid file {}: {e}", path.display()))
        })?;
        Ok(PidFileGuard {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
