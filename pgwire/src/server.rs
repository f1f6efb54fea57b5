//! PostgreSQL-protocol listener: one task per accepted connection, with a
//! recovery boundary converting session panics into a fatal client error.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use common::err::server_error::ServerError;
use common::server::Server;

use crate::codec::PgChannel;
use crate::session::{PgSession, SessionContext};

pub struct PgServer {
    addr: String,
    ctx: Arc<SessionContext>,
    next_conn_id: Arc<AtomicU32>,
    accept_task: Option<JoinHandle<()>>,
}

impl PgServer {
    /// The connection id counter is shared with the MySQL listener so ids
    /// are unique across both protocols.
    pub fn new(addr: String, ctx: Arc<SessionContext>, next_conn_id: Arc<AtomicU32>) -> Self {
        PgServer {
            addr,
            ctx,
            next_conn_id,
            accept_task: None,
        }
    }
}

#[async_trait::async_trait]
impl Server for PgServer {
    async fn start(&mut self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.addr).await.map_err(|err| {
            ServerError::Config(format!("cannot bind pg listener {}: {}", self.addr, err))
        })?;
        info!("postgres protocol listening on {}", self.addr);

        let ctx = self.ctx.clone();
        let next_conn_id = self.next_conn_id.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("pg accept error: {}", err);
                        continue;
                    }
                };
                let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _ = socket.set_nodelay(true);
                    let mut session = PgSession::new(PgChannel::new(socket), conn_id, ctx.clone());
                    let outcome =
                        std::panic::AssertUnwindSafe(session.run()).catch_unwind().await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            warn!("pg session {} ({}): {}", conn_id, peer, err);
                            let _ = session.fatal_error(&err).await;
                            session.release();
                        }
                        Err(panic) => {
                            let message = panic
                                .downcast_ref::<&str>()
                                .map(|s| s.to_string())
                                .or_else(|| panic.downcast_ref::<String>().cloned())
                                .unwrap_or_else(|| "unknown panic".to_string());
                            error!(
                                "pg session {} ({}) panicked: {}\n{}",
                                conn_id,
                                peer,
                                message,
                                std::backtrace::Backtrace::force_capture()
                            );
                            let err = ServerError::String("internal error".to_string());
                            let _ = session.fatal_error(&err).await;
                            session.release();
                        }
                    }
                });
            }
        }));
        Ok(())
    }

    async fn shutdown(&mut self, _graceful: bool) -> Result<(), ServerError> {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        info!("postgres listener stopped");
        Ok(())
    }
}
