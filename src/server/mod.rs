//! Server: listener registry and dispatch
//!
//! Listeners are registered in named groups ([`ServerMux`]), each paired with
//! the [`Handler`] that serves its connections. Once `serve` has been called,
//! every entry runs its own accept loop and every accepted connection is
//! handled on its own task, so a stuck handler never delays accepts.

mod handler;

pub use handler::{MuxTunnelHandler, TunnelHandler};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::{Conn, Result};
use crate::config::Timeouts;
use crate::error::Error;
use crate::options::{HandlerOptions, ListenerOptions, ServerOptions};
use crate::storage::Storage;
use crate::transport::{KeepAliveListener, Listener};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Per-connection logic
#[async_trait]
pub trait Handler: Send + Sync {
    /// Called once when the handler is registered
    fn init(&mut self, _opts: &HandlerOptions) -> Result<()> {
        Ok(())
    }

    /// Serve one accepted connection
    async fn handle(&self, conn: Conn, ctx: HandlerContext) -> Result<()>;
}

/// What a handler learns about the connection it serves
#[derive(Clone)]
pub struct HandlerContext {
    pub tag: String,
    /// Sequence number of the connection on its listener
    pub id: u64,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    pub storage: Option<Arc<dyn Storage>>,
    pub timeouts: Timeouts,
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("tag", &self.tag)
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("local", &self.local)
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

struct Entry {
    listener: Arc<dyn Listener>,
    handler: Arc<dyn Handler>,
    options: HandlerOptions,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Entry {
    fn stop(&mut self) -> Option<JoinHandle<()>> {
        self.cancel.cancel();
        self.task.take()
    }
}

/// One listen group: bound address -> entry
#[derive(Default)]
pub struct ServerMux {
    entries: HashMap<SocketAddr, Entry>,
}

impl ServerMux {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.entries.keys().copied().collect()
    }
}

/// Settings applied by `serve`; present while serving
#[derive(Clone)]
struct Serving {
    storage: Option<Arc<dyn Storage>>,
    timeouts: Timeouts,
}

#[derive(Default)]
struct Registry {
    groups: HashMap<String, ServerMux>,
    serving: Option<Serving>,
}

/// Tunnel server
#[derive(Clone, Default)]
pub struct Server {
    registry: Arc<Mutex<Registry>>,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a keep-alive listener for `listener_opts.addr` and register it.
    ///
    /// Returns the bound address, which is the entry's key.
    pub async fn add<H>(
        &self,
        group: &str,
        listener_opts: &ListenerOptions,
        handler: H,
        handler_opts: HandlerOptions,
    ) -> Result<SocketAddr>
    where
        H: Handler + 'static,
    {
        let listener = KeepAliveListener::bind(listener_opts).await?;
        self.add_listener(group, Arc::new(listener), handler, handler_opts)
    }

    /// Register a prebuilt listener
    pub fn add_listener<H>(
        &self,
        group: &str,
        listener: Arc<dyn Listener>,
        mut handler: H,
        mut handler_opts: HandlerOptions,
    ) -> Result<SocketAddr>
    where
        H: Handler + 'static,
    {
        let addr = listener.local_addr()?;
        // untagged entries log and report under their group name
        if handler_opts.tag.is_empty() {
            handler_opts.tag = group.to_string();
        }
        let tag = handler_opts.tag.clone();
        handler.init(&handler_opts)?;

        let mut registry = self.registry.lock();
        let serving = registry.serving.clone();
        let mux = registry.groups.entry(group.to_string()).or_default();
        if mux.entries.contains_key(&addr) {
            return Err(Error::DuplicateListener(format!("{}/{}", group, addr)));
        }

        let mut entry = Entry {
            listener,
            handler: Arc::new(handler),
            options: handler_opts,
            cancel: CancellationToken::new(),
            task: None,
        };
        if let Some(serving) = serving {
            entry.task = Some(spawn_accept_loop(&entry, addr, &serving));
        }
        mux.entries.insert(addr, entry);

        info!("[{}] Registered listener {} in group '{}'", tag, addr, group);
        Ok(addr)
    }

    /// Deregister `addr` from `group`, stop its accept loop and close the listener
    pub async fn remove(&self, group: &str, addr: SocketAddr) -> Result<()> {
        let mut entry = {
            let mut registry = self.registry.lock();
            let mux = registry
                .groups
                .get_mut(group)
                .ok_or_else(|| Error::UnknownListener(format!("{}/{}", group, addr)))?;
            let entry = mux
                .entries
                .remove(&addr)
                .ok_or_else(|| Error::UnknownListener(format!("{}/{}", group, addr)))?;
            if mux.is_empty() {
                registry.groups.remove(group);
            }
            entry
        };

        shutdown_entry(&mut entry).await;
        info!("Removed listener {} from group '{}'", addr, group);
        Ok(())
    }

    /// Apply server-wide options and start an accept loop for every entry.
    ///
    /// Returns immediately; entries added afterwards start on registration.
    pub fn serve(&self, opts: ServerOptions) -> Result<()> {
        let serving = Serving {
            storage: opts.storage,
            timeouts: opts.timeouts,
        };

        let mut registry = self.registry.lock();
        registry.serving = Some(serving.clone());

        let mut started = 0;
        for mux in registry.groups.values_mut() {
            for (addr, entry) in mux.entries.iter_mut() {
                if entry.task.is_none() {
                    entry.task = Some(spawn_accept_loop(entry, *addr, &serving));
                    started += 1;
                }
            }
        }
        info!("Server serving ({} listeners started)", started);
        Ok(())
    }

    /// Stop every accept loop and close every listener
    pub async fn close(&self) -> Result<()> {
        let mut entries: Vec<Entry> = {
            let mut registry = self.registry.lock();
            registry.serving = None;
            registry
                .groups
                .drain()
                .flat_map(|(_, mux)| mux.entries.into_values())
                .collect()
        };

        for entry in entries.iter_mut() {
            shutdown_entry(entry).await;
        }
        info!("Server closed ({} listeners)", entries.len());
        Ok(())
    }

    pub fn is_serving(&self) -> bool {
        self.registry.lock().serving.is_some()
    }

    /// Names of the non-empty groups
    pub fn groups(&self) -> Vec<String> {
        self.registry.lock().groups.keys().cloned().collect()
    }

    /// Bound addresses registered in `group`
    pub fn listeners(&self, group: &str) -> Vec<SocketAddr> {
        self.registry
            .lock()
            .groups
            .get(group)
            .map(ServerMux::addrs)
            .unwrap_or_default()
    }
}

async fn shutdown_entry(entry: &mut Entry) {
    let task = entry.stop();
    if let Err(e) = entry.listener.close().await {
        warn!("Closing listener failed: {}", e);
    }
    if let Some(task) = task {
        let _ = task.await;
    }
}

// ============================================================================
// Accept loop
// ============================================================================

fn spawn_accept_loop(entry: &Entry, addr: SocketAddr, serving: &Serving) -> JoinHandle<()> {
    let tag = entry.options.tag.clone();
    let timeouts = entry
        .options
        .timeouts
        .clone()
        .unwrap_or_else(|| serving.timeouts.clone());

    tokio::spawn(accept_loop(
        tag,
        addr,
        entry.listener.clone(),
        entry.handler.clone(),
        serving.storage.clone(),
        timeouts,
        entry.cancel.clone(),
    ))
}

async fn accept_loop(
    tag: String,
    local: SocketAddr,
    listener: Arc<dyn Listener>,
    handler: Arc<dyn Handler>,
    storage: Option<Arc<dyn Storage>>,
    timeouts: Timeouts,
    cancel: CancellationToken,
) {
    info!("[{}] Listening on {}", tag, local);
    let conn_count = AtomicU64::new(0);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((conn, peer)) => {
                        let id = conn_count.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!("[{}] New connection #{} from {}", tag, id, peer);

                        let ctx = HandlerContext {
                            tag: tag.clone(),
                            id,
                            peer,
                            local,
                            storage: storage.clone(),
                            timeouts: timeouts.clone(),
                        };
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            let tag = ctx.tag.clone();
                            if let Err(e) = handler.handle(conn, ctx).await {
                                warn!("[{}] Connection #{} from {} error: {}", tag, id, peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("[{}] Accept error: {}", tag, e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                }
            }
        }
    }

    info!(
        "[{}] Shutting down (handled {} connections)",
        tag,
        conn_count.load(Ordering::Relaxed)
    );
}
