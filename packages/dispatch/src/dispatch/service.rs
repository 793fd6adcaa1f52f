//! Long-running services and the host that runs them.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A long-running unit of the dispatch node.
///
/// Services run until the shutdown token fires and are expected to clean up
/// (announce departure, release leases) before returning.
#[async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Runs a set of services until shutdown is requested.
#[derive(Default)]
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    shutdown: CancellationToken,
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_service(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Token other parts of the process can use to request shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run every service; resolve when all have stopped.
    pub async fn run(self) -> Result<()> {
        let mut handles = Vec::with_capacity(self.services.len());
        for service in self.services {
            let name = service.name();
            let shutdown = self.shutdown.clone();
            handles.push((name, tokio::spawn(service.run(shutdown))));
        }

        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(service = name, error = %e, "service failed"),
                Err(e) => error!(service = name, error = %e, "service panicked"),
            }
        }

        Ok(())
    }

    /// Run until Ctrl+C or SIGTERM, then wind the services down.
    pub async fn run_until_shutdown(self) -> Result<()> {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown.cancel();
        });

        self.run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FlagService {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Service for FlagService {
        fn name(&self) -> &'static str {
            "flag"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn host_stops_services_on_shutdown() {
        let stopped = Arc::new(AtomicBool::new(false));
        let host = ServiceHost::new().with_service(FlagService {
            stopped: stopped.clone(),
        });

        let token = host.shutdown_token();
        let run = tokio::spawn(host.run());
        token.cancel();
        run.await.unwrap().unwrap();

        assert!(stopped.load(Ordering::SeqCst));
    }
}
