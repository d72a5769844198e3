//! Connection pinning (spec.md §3 "Connection pinning", §9 "Connection
//! pinning read handler").
//!
//! Grounded on `examples/original_source/src/client_side.cc`'s
//! `ConnStateData::pinConnection`/`stopPinnedConnectionMonitoring`: a client
//! connection that completed connection-oriented auth (NTLM/Negotiate) or a
//! bumped-TLS handshake is bound to one upstream connection for the rest of
//! its lifetime. The source arms a read handler on the idle pinned FD purely
//! to detect silent closure; modeled here as a zero-length idle read exactly
//! as spec.md §9 prescribes ("any readable event on an idle pinned upstream
//! means closure ... either way, tear it down").

use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    sync::{Mutex, Notify},
};
use tracing::{debug, warn};

/// Binding of a client connection to a specific upstream connection
/// (spec.md §3 "Connection pinning").
pub struct PinnedConnection {
    pub upstream_addr: SocketAddr,
    pub host_port: (String, u16),
    pub auth_bound: bool,
    stream: Mutex<Option<TcpStream>>,
    torn_down: Notify,
}

impl PinnedConnection {
    pub fn new(upstream_addr: SocketAddr, host_port: (String, u16), auth_bound: bool, stream: TcpStream) -> Arc<Self> {
        Arc::new(Self {
            upstream_addr,
            host_port,
            auth_bound,
            stream: Mutex::new(Some(stream)),
            torn_down: Notify::new(),
        })
    }

    /// `true` if a reuse request names the same host/port this pin was
    /// established for (spec.md §3 "a cached host/port for reuse validation").
    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.host_port.0.eq_ignore_ascii_case(host) && self.host_port.1 == port
    }

    /// Spawns the idle watcher described above. Any readable event — EOF or
    /// unexpected data — tears the pin down; the caller is notified via
    /// [`PinnedConnection::wait_torn_down`] so it can also close the client
    /// side if it was idle too.
    pub fn watch(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut guard = this.stream.lock().await;
            let Some(stream) = guard.as_mut() else { return };
            let mut probe = [0u8; 1];
            match stream.read(&mut probe).await {
                Ok(0) => debug!(addr = %this.upstream_addr, "pinned upstream closed while idle"),
                Ok(_) => warn!(addr = %this.upstream_addr, "unexpected data on idle pinned upstream"),
                Err(err) => debug!(addr = %this.upstream_addr, %err, "pinned upstream read failed"),
            }
            drop(guard);
            this.tear_down().await;
        });
    }

    pub async fn tear_down(&self) {
        self.stream.lock().await.take();
        self.torn_down.notify_waiters();
    }

    pub async fn wait_torn_down(&self) {
        self.torn_down.notified().await;
    }

    pub async fn is_live(&self) -> bool {
        self.stream.lock().await.is_some()
    }
}
