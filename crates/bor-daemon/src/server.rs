//! TCP accept loop

use bor_core::Service;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Serve connections until `shutdown` resolves, then wait for the ones in flight
///
/// At most `max_connections` clients are handled at once; further clients
/// stay in the listen backlog until a slot frees up.
pub async fn run(
    listener: TcpListener,
    service: Service,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let limit = Arc::new(Semaphore::new(service.config().max_connections));
    let service = Arc::new(service);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        while let Some(done) = connections.try_join_next() {
            if let Err(e) = done {
                tracing::error!(error = %e, "connection task failed");
            }
        }

        let permit = tokio::select! {
            () = &mut shutdown => break,
            permit = Arc::clone(&limit).acquire_owned() => permit?,
        };

        let accepted = tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "connection accepted");
                let service = Arc::clone(&service);
                connections.spawn(async move {
                    service.handle_connection(stream).await;
                    drop(permit);
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }

    tracing::info!(in_flight = connections.len(), "shutting down");
    while let Some(done) = connections.join_next().await {
        if let Err(e) = done {
            tracing::error!(error = %e, "connection task failed");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bor_core::sandbox::DriverRegistry;
    use bor_core::ServiceConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn service() -> Service {
        let config = ServiceConfig::builder()
            .listen("127.0.0.1:0")
            .build_driver("plain")
            .test_driver("plain")
            .max_connections(2)
            .build();
        let registry = DriverRegistry::with_builtin(&config.easysandbox);
        Service::new(config, &registry).unwrap()
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        let server = tokio::spawn(run(listener, service(), async move {
            let _ = stopped.await;
        }));

        // A malformed request is answered by closing the connection
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"not json").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn waits_for_connections_in_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        let server = tokio::spawn(run(listener, service(), async move {
            let _ = stopped.await;
        }));

        // Connected but silent: the handler is still waiting for the request
        let mut idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!server.is_finished());

        idle.write_all(b"[]").await.unwrap();
        idle.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
