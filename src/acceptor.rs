// ABOUTME: The single-reactor accept loop: one task per connection on a current-thread runtime
// ABOUTME: Owns the connection registry and hands each socket off to connection::run

use crate::config::ServerConfig;
use crate::connection;
use crate::contracts::{AuthRegistry, RequestProcessor};
use crate::error::AcceptorError;
use crate::registry::ConnectionRegistry;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Accepts connections on one bound socket and spawns one task per
/// connection. Kept deliberately thin: everything stateful it owns
/// (the registry, the shared config, the pipeline handle) is handed
/// straight to `connection::run`.
pub struct Acceptor<P> {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    processor: Arc<P>,
    auth_registry: Arc<AuthRegistry>,
    registry: ConnectionRegistry,
}

impl<P> Acceptor<P>
where
    P: RequestProcessor + Send + Sync + 'static,
{
    pub async fn bind(
        config: ServerConfig,
        processor: Arc<P>,
        auth_registry: Arc<AuthRegistry>,
    ) -> Result<Self, AcceptorError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| AcceptorError::Bind { addr: config.bind_addr, source })?;

        Ok(Acceptor {
            listener,
            config: Arc::new(config),
            processor,
            auth_registry,
            registry: ConnectionRegistry::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> ConnectionRegistry {
        self.registry.clone()
    }

    /// Run the accept loop until `shutdown` resolves. Every accepted
    /// socket is handed to its own spawned task; the loop itself never
    /// blocks on connection work.
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!(addr = %self.config.bind_addr, "accepting connections");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, closing listener");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, remote_addr)) => {
                            if let Err(e) = socket.set_nodelay(true) {
                                warn!(%remote_addr, error = %e, "failed to set TCP_NODELAY");
                            }
                            let config = self.config.clone();
                            let processor = self.processor.clone();
                            let auth_registry = self.auth_registry.clone();
                            let registry = self.registry.clone();
                            tokio::task::spawn_local(async move {
                                connection::run(socket, remote_addr, config, processor, auth_registry, registry).await;
                            });
                        }
                        Err(e) => {
                            let err = AcceptorError::Accept(e);
                            warn!(error = %err, "accept() failed");
                        }
                    }
                }
            }
        }

        self.close_all();
    }

    /// Enqueue a close-marker on every live connection. Used at shutdown;
    /// each connection's own task performs the actual socket close once
    /// its outbound queue drains.
    fn close_all(&self) {
        for handle in self.registry.snapshot() {
            handle.send_close_session();
        }
    }
}

/// Build and drive an `Acceptor` on a single-threaded Tokio runtime,
/// matching the cooperative single-reactor model this crate's connection
/// handling assumes: one OS thread services every accepted connection.
pub fn run_single_reactor<P, F>(
    config: ServerConfig,
    processor: Arc<P>,
    auth_registry: Arc<AuthRegistry>,
    shutdown: F,
) -> Result<(), AcceptorError>
where
    P: RequestProcessor + Send + Sync + 'static,
    F: std::future::Future<Output = ()> + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(AcceptorError::Runtime)?;

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let acceptor = Acceptor::bind(config, processor, auth_registry).await?;
        acceptor.serve(shutdown).await;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::mock::MockProcessor;

    #[tokio::test]
    async fn bind_picks_an_ephemeral_port_and_reports_it() {
        let config = crate::config::quick_config("127.0.0.1:0".parse().unwrap());
        let processor = Arc::new(MockProcessor::new());
        let auth_registry = Arc::new(AuthRegistry::new());
        let acceptor = Acceptor::bind(config, processor, auth_registry).await.unwrap();
        assert!(acceptor.local_addr().unwrap().port() > 0);
    }
}
