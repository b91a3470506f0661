//! TCP listener for the replication protocol.
//!
//! One OS thread accepts connections; each session runs on its own
//! thread. The wider network event-loop machinery is an external
//! collaborator; this listener is the minimal surface the protocol
//! needs.

use crate::config::ReplicationConfig;
use crate::leader;
use meridian_core::{Endpoint, Result};
use meridian_pool::DatabasePool;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Replication protocol listener.
pub struct ReplicationServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationServer {
    /// Bind the listener and start accepting sessions.
    ///
    /// `welcome_endpoint` names the database whose identity goes out in
    /// `REPLY_WELCOME`.
    pub fn bind(
        pool: Arc<DatabasePool>,
        welcome_endpoint: Endpoint,
        config: ReplicationConfig,
        addr: impl ToSocketAddrs,
    ) -> Result<ReplicationServer> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let accept_running = Arc::clone(&running);
        let handle = std::thread::Builder::new()
            .name("replication-accept".to_string())
            .spawn(move || {
                accept_loop(listener, pool, welcome_endpoint, config, accept_running);
            })
            .expect("failed to spawn replication accept thread");

        Ok(ReplicationServer {
            local_addr,
            running,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting sessions and join the accept thread.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            // Unblock the accept loop.
            let _ = TcpStream::connect(self.local_addr);
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ReplicationServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    pool: Arc<DatabasePool>,
    welcome_endpoint: Endpoint,
    config: ReplicationConfig,
    running: Arc<AtomicBool>,
) {
    for stream in listener.incoming() {
        if !running.load(Ordering::Acquire) {
            break;
        }
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "replication accept failed");
                continue;
            }
        };
        let peer = stream.peer_addr().ok();
        debug!(?peer, "replication session accepted");

        let session_pool = Arc::clone(&pool);
        let session_endpoint = welcome_endpoint.clone();
        let session_config = config.clone();
        let spawned = std::thread::Builder::new()
            .name("replication-session".to_string())
            .spawn(move || {
                if let Err(e) = stream
                    .set_read_timeout(Some(session_config.idle_timeout))
                    .and_then(|_| stream.set_write_timeout(Some(session_config.active_timeout)))
                {
                    warn!(error = %e, "could not set session timeouts");
                    return;
                }
                if let Err(e) = leader::serve_session(
                    &session_pool,
                    &session_endpoint,
                    &mut stream,
                    &session_config,
                ) {
                    warn!(?peer, error = %e, "replication session ended with error");
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "could not spawn replication session thread");
        }
    }
}
