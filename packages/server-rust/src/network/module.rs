//! gRPC server lifecycle.
//!
//! Deferred startup: `new()` builds the shutdown controller and interceptor
//! pipeline, `start()` binds the listener, and `serve()` accepts calls until
//! the shutdown future resolves, then drains. Services are built between
//! `new()` and `serve()` from [`GrpcServer::pipeline`].

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::service::Routes;
use tonic::transport::Server;
use tracing::{info, warn};

use super::shutdown::ShutdownController;
use crate::config::ServerConfig;
use crate::interceptor::{build_pipeline, Pipeline};

/// gRPC server with deferred startup: build, [`start`](Self::start), then [`serve`](Self::serve).
pub struct GrpcServer {
    config: ServerConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
    pipeline: Pipeline,
}

impl GrpcServer {
    /// Builds the server without binding any port.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let shutdown = Arc::new(ShutdownController::new());
        let pipeline = build_pipeline(&config.interceptor_config(), Arc::clone(&shutdown));
        Self {
            config,
            listener: None,
            shutdown,
            pipeline,
        }
    }

    /// Pipeline every service registered on this server must dispatch through.
    #[must_use]
    pub fn pipeline(&self) -> Pipeline {
        self.pipeline.clone()
    }

    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Binds the listener and returns the bound port, which differs from
    /// the configured one when that is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.grpc_port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind gRPC listener on {addr}"))?;
        let port = listener.local_addr()?.port();

        info!(host = %self.config.host, port, "gRPC listener bound");

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves `routes` until `shutdown` resolves, then drains.
    ///
    /// After the signal:
    /// 1. The controller moves to Draining and new calls get `Unavailable`
    /// 2. The listener stops accepting; open calls run to completion
    /// 3. Waits up to the drain timeout for in-flight calls
    /// 4. The controller moves to Stopped
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called or the transport fails.
    pub async fn serve(
        self,
        routes: Routes,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .context("start() must be called before serve()")?;
        let shutdown_ctrl = self.shutdown;
        let drain_timeout = self.config.drain_timeout();

        shutdown_ctrl.set_ready();
        info!("serving gRPC");

        let signal_ctrl = Arc::clone(&shutdown_ctrl);
        let signal = async move {
            tokio::select! {
                () = shutdown => {}
                () = signal_ctrl.triggered() => {}
            }
            info!("shutdown requested, draining in-flight calls");
            signal_ctrl.trigger_shutdown();
        };

        Server::builder()
            .add_routes(routes)
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal)
            .await
            .context("gRPC transport failed")?;

        if shutdown_ctrl.wait_for_drain(drain_timeout).await {
            info!("all calls drained");
        } else {
            warn!(
                remaining = shutdown_ctrl.in_flight_count(),
                "drain timeout expired with calls still in flight"
            );
        }
        Ok(())
    }
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(%err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}

/// Builds, binds and serves until a process signal arrives.
///
/// `make_routes` receives the server's pipeline so every service it
/// registers dispatches through the interceptor chain.
///
/// # Errors
///
/// Propagates bind and transport failures.
pub async fn run<F>(config: ServerConfig, make_routes: F) -> anyhow::Result<()>
where
    F: FnOnce(Pipeline) -> Routes,
{
    let mut server = GrpcServer::new(config);
    let routes = make_routes(server.pipeline());
    server.start().await?;
    server.serve(routes, shutdown_signal()).await
}
