use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;

/// Binds an already-built gateway router to an ephemeral local port and
/// serves it on a background task for the lifetime of the handle.
///
/// Dropping the handle aborts the serving task; tests that want a graceful
/// shutdown exercise should call [`GatewayHarness::shutdown`] instead of
/// dropping.
pub struct GatewayHarness {
    addr: SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl GatewayHarness {
    pub async fn spawn(router: Router) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.addr)
    }

    /// Trigger the router's graceful shutdown path and wait for the serve
    /// task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.task.await;
    }
}

impl Drop for GatewayHarness {
    fn drop(&mut self) {
        self.task.abort();
    }
}
