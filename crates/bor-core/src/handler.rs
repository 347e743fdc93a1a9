//! Per-connection request handling

use crate::config::ServiceConfig;
use crate::pipeline::Pipeline;
use crate::protocol::{self, BuildRequest};
use crate::result::Response;
use crate::sandbox::DriverRegistry;
use crate::stage::Stager;
use crate::Result;
use std::time::Instant;
use tokio::net::TcpStream;

/// The build-and-test service shared by all connections
#[derive(Debug, Clone)]
pub struct Service {
    stager: Stager,
    pipeline: Pipeline,
    config: ServiceConfig,
}

impl Service {
    /// Resolve drivers and paths from `config`
    pub fn new(config: ServiceConfig, registry: &DriverRegistry) -> Result<Self> {
        let pipeline = Pipeline::new(registry, &config)?;
        Ok(Self {
            stager: Stager::from_config(&config),
            pipeline,
            config,
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Serve one client: read a request, process it, write the response
    ///
    /// Errors are logged. A request that cannot be read or staged is answered
    /// by closing the connection.
    pub async fn handle_connection(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map_or_else(|_| "unknown".to_string(), |a| a.to_string());

        #[allow(deprecated)]
        let linger = stream.set_linger(Some(self.config.linger()));
        if let Err(e) = linger {
            tracing::debug!(%peer, error = %e, "failed to set linger");
        }

        let (request, mut stream) = match protocol::read_request(
            stream,
            self.config.max_request_bytes,
            self.config.read_timeout(),
        )
        .await
        {
            Ok(read) => read,
            Err(e) => {
                tracing::error!(%peer, error = %e, "failed to read request");
                return;
            }
        };

        let started = Instant::now();
        let response = match self.process(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(%peer, error = %e, "failed to process request");
                close(stream).await;
                return;
            }
        };

        tracing::info!(
            %peer,
            suites = response.len(),
            ok = response.iter().filter(|r| r.ok()).count(),
            elapsed = ?started.elapsed(),
            "request processed"
        );

        if let Err(e) = protocol::write_response(&mut stream, &response).await {
            tracing::error!(%peer, error = %e, "failed to send response");
        }
        close(stream).await;
    }

    /// Stage, build and test `request`
    ///
    /// Only staging errors are returned; build and test failures are part of
    /// the response.
    pub async fn process(&self, request: BuildRequest) -> Result<Response> {
        let dir = self.stager.stage(request).await?;
        let response = self.pipeline.run(dir.path()).await;

        if let Err(e) = dir.remove().await {
            tracing::warn!(error = %e, "failed to remove build directory");
        }
        Ok(response)
    }
}

/// Close `stream` on the blocking pool
///
/// With linger set, `close(2)` waits up to the linger time for unsent data to
/// be acknowledged, which must not stall a runtime worker.
async fn close(stream: TcpStream) {
    match stream.into_std() {
        Ok(stream) => {
            if let Err(e) = tokio::task::spawn_blocking(move || drop(stream)).await {
                tracing::warn!(error = %e, "closing connection failed");
            }
        }
        Err(e) => tracing::debug!(error = %e, "failed to detach connection"),
    }
}
