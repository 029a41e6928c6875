// Broker service main entry point.
mod observability;

use anyhow::{Context, Result};
use broker::config::BrokerConfig;
use broker::relay::RelayHandler;
use broker::transport::tcp::{self, KeepaliveScheduler, RegistryHandle, SharedHandler};
use comet_transport::{TcpServer, TransportConfig};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

struct Running {
    registry: RegistryHandle,
    publisher_addr: Option<SocketAddr>,
    receiver_addr: Option<SocketAddr>,
    keepalive: Option<KeepaliveScheduler>,
    tasks: Vec<JoinHandle<()>>,
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("comet-broker")?;
    let config = BrokerConfig::from_env_or_yaml()?;
    // Expose Prometheus metrics on the configured bind address.
    let metrics_bind = config.metrics_bind;
    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics listener exited");
        }
    });

    let cancel = CancellationToken::new();
    let running = start(&config, cancel.clone()).await?;
    tracing::info!(
        local_ivorn = %config.local_ivorn,
        publisher = ?running.publisher_addr,
        receiver = ?running.receiver_addr,
        subscriptions = config.subscribe_to.len(),
        "broker started"
    );

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    stop(running, cancel).await;
    tracing::info!("broker stopped");
    Ok(())
}

async fn start(config: &BrokerConfig, cancel: CancellationToken) -> Result<Running> {
    let transport = broker::transport::tcp_transport_config(config, TransportConfig::default());
    let mode = config.protocol_mode();
    let (registry, registry_task) = tcp::spawn_registry(cancel.clone());
    let relay: SharedHandler = Arc::new(RelayHandler::new(registry.clone()));
    let mut running = Running {
        registry: registry.clone(),
        publisher_addr: None,
        receiver_addr: None,
        keepalive: None,
        tasks: vec![registry_task],
    };

    if let Some(bind) = config.publisher_bind {
        let server = Arc::new(
            TcpServer::bind(bind, transport.clone())
                .await
                .context("bind publisher listener")?,
        );
        running.publisher_addr = Some(server.local_addr()?);
        running.keepalive = Some(KeepaliveScheduler::start(
            registry.clone(),
            config.keepalive_interval(),
        ));
        let registry = registry.clone();
        let local_ivorn = config.local_ivorn.clone();
        let cancel = cancel.clone();
        running.tasks.push(tokio::spawn(async move {
            if let Err(err) = tcp::serve_publisher(server, registry, local_ivorn, mode, cancel).await
            {
                tracing::warn!(error = %err, "publisher accept loop exited");
            }
        }));
    } else {
        tracing::info!("publisher disabled (COMET_PUBLISHER_BIND not set)");
    }

    if let Some(bind) = config.receiver_bind {
        let server = Arc::new(
            TcpServer::bind(bind, transport.clone())
                .await
                .context("bind receiver listener")?,
        );
        running.receiver_addr = Some(server.local_addr()?);
        let local_ivorn = config.local_ivorn.clone();
        let handler = Arc::clone(&relay);
        let cancel = cancel.clone();
        running.tasks.push(tokio::spawn(async move {
            if let Err(err) = tcp::serve_receiver(server, local_ivorn, handler, cancel).await {
                tracing::warn!(error = %err, "receiver accept loop exited");
            }
        }));
    }

    for remote in &config.subscribe_to {
        running.tasks.push(tokio::spawn(tcp::run_subscriber(
            *remote,
            config.local_ivorn.clone(),
            Arc::clone(&relay),
            config.reconnect_policy(),
            transport.clone(),
            mode,
            cancel.clone(),
        )));
    }
    Ok(running)
}

async fn stop(running: Running, cancel: CancellationToken) {
    let subscribers = running.registry.members().await.len();
    tracing::info!(subscribers, "stopping broker");
    if let Some(keepalive) = running.keepalive {
        keepalive.stop().await;
    }
    cancel.cancel();
    for task in running.tasks {
        let _ = task.await;
    }
}
