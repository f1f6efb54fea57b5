//! MySQL-protocol listener, TCP and optionally a unix socket, with the
//! same panic recovery boundary as the PostgreSQL side.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use common::err::server_error::ServerError;
use common::server::Server;

use crate::packets::{PacketChannel, Transport};
use crate::session::{MySession, MySessionContext};

pub struct MyServer {
    addr: String,
    socket_path: Option<String>,
    ctx: Arc<MySessionContext>,
    next_conn_id: Arc<AtomicU32>,
    accept_task: Option<JoinHandle<()>>,
    socket_task: Option<JoinHandle<()>>,
}

impl MyServer {
    pub fn new(
        addr: String,
        socket_path: Option<String>,
        ctx: Arc<MySessionContext>,
        next_conn_id: Arc<AtomicU32>,
    ) -> Self {
        MyServer {
            addr,
            socket_path,
            ctx,
            next_conn_id,
            accept_task: None,
            socket_task: None,
        }
    }
}

fn spawn_session_task(
    transport: Transport,
    peer: String,
    conn_id: u32,
    ctx: Arc<MySessionContext>,
) {
    tokio::spawn(async move {
        let mut session = MySession::new(PacketChannel::new(transport), conn_id, ctx);
        let outcome = std::panic::AssertUnwindSafe(session.run()).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("mysql session {} ({}): {}", conn_id, peer, err);
                session.release();
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    "mysql session {} ({}) panicked: {}\n{}",
                    conn_id,
                    peer,
                    message,
                    std::backtrace::Backtrace::force_capture()
                );
                session.release();
            }
        }
    });
}

#[async_trait::async_trait]
impl Server for MyServer {
    async fn start(&mut self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.addr).await.map_err(|err| {
            ServerError::Config(format!("cannot bind mysql listener {}: {}", self.addr, err))
        })?;
        info!("mysql protocol listening on {}", self.addr);

        let ctx = self.ctx.clone();
        let next_conn_id = self.next_conn_id.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("mysql accept error: {}", err);
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);
                let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                spawn_session_task(socket.into(), peer.to_string(), conn_id, ctx.clone());
            }
        }));

        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
            let unix_listener = UnixListener::bind(path).map_err(|err| {
                ServerError::Config(format!("cannot bind unix socket {}: {}", path, err))
            })?;
            info!("mysql protocol listening on socket {}", path);

            let ctx = self.ctx.clone();
            let next_conn_id = self.next_conn_id.clone();
            let path = path.clone();
            self.socket_task = Some(tokio::spawn(async move {
                loop {
                    let (socket, _) = match unix_listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!("mysql socket accept error: {}", err);
                            continue;
                        }
                    };
                    let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                    spawn_session_task(socket.into(), path.clone(), conn_id, ctx.clone());
                }
            }));
        }
        Ok(())
    }

    async fn shutdown(&mut self, _graceful: bool) -> Result<(), ServerError> {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(task) = self.socket_task.take() {
            task.abort();
        }
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
        info!("mysql listener stopped");
        Ok(())
    }
}
