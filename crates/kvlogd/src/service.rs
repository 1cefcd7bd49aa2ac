//! Service wiring: broker, store, materializer, publisher and HTTP server.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kvlog_api::{ApiState, build_router};
use kvlog_broker::{HttpSchemaRegistry, LogAdmin, LogConsumer, LogProducer, MemoryLog, ensure_topic};
use kvlog_core::{Envelope, ServiceConfig};
use kvlog_core::config::BrokerKind;
use kvlog_materializer::{Materializer, MaterializerOptions};
use kvlog_publisher::Publisher;
use kvlog_state::open_store;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Broker handles for the enabled sides of the service.
struct Broker {
    admin: Arc<dyn LogAdmin>,
    consumer: Option<Box<dyn LogConsumer>>,
    producer: Option<Arc<dyn LogProducer>>,
}

fn connect_broker(config: &ServiceConfig) -> anyhow::Result<Broker> {
    match config.broker.effective_kind() {
        BrokerKind::Memory => {
            warn!("using the in-process broker, records are neither shared nor persisted");
            let log = MemoryLog::default();
            let consumer = config
                .read_enabled
                .then(|| Box::new(log.consumer()) as Box<dyn LogConsumer>);
            let producer = config
                .write_enabled
                .then(|| Arc::new(log.clone()) as Arc<dyn LogProducer>);
            Ok(Broker {
                admin: Arc::new(log),
                consumer,
                producer,
            })
        }
        BrokerKind::Kafka => connect_kafka(config),
    }
}

#[cfg(feature = "kafka")]
fn connect_kafka(config: &ServiceConfig) -> anyhow::Result<Broker> {
    use kvlog_broker::kafka::{KafkaAdmin, KafkaConsumer, KafkaProducer};

    let properties = &config.broker.properties;
    let consumer = if config.read_enabled {
        Some(Box::new(KafkaConsumer::new(properties)?) as Box<dyn LogConsumer>)
    } else {
        None
    };
    let producer = if config.write_enabled {
        Some(Arc::new(KafkaProducer::new(properties)?) as Arc<dyn LogProducer>)
    } else {
        None
    };
    info!(
        bootstrap = properties.get("bootstrap.servers").map_or("", String::as_str),
        "kafka clients created"
    );
    Ok(Broker {
        admin: Arc::new(KafkaAdmin::new(properties)?),
        consumer,
        producer,
    })
}

#[cfg(not(feature = "kafka"))]
fn connect_kafka(_config: &ServiceConfig) -> anyhow::Result<Broker> {
    anyhow::bail!("kafka broker configured but kvlogd was built without the `kafka` feature")
}

/// A validated configuration with its broker clients created and its
/// listener bound.
pub struct Service {
    config: ServiceConfig,
    envelope: Envelope,
    broker: Broker,
    registry: Option<Arc<HttpSchemaRegistry>>,
    listener: TcpListener,
}

impl Service {
    /// Configuration and broker errors surface here, before the listener
    /// is bound.
    pub async fn bind(config: ServiceConfig) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;
        let envelope = config.envelope()?;
        let registry = match &config.schema_registry.url {
            Some(url) => Some(Arc::new(
                HttpSchemaRegistry::new(
                    url,
                    Duration::from_millis(config.schema_registry.request_timeout_ms),
                )
                .context("invalid schema registry url")?,
            )),
            None => None,
        };
        let broker = connect_broker(&config)?;
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind {}", config.listen))?;
        Ok(Self {
            config,
            envelope,
            broker,
            registry,
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run until `shutdown` resolves or materialization fails.
    ///
    /// The HTTP server drains first, then the publisher flushes, then the
    /// materializer is joined. A materialization failure is returned as
    /// the error.
    pub async fn run<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Service {
            config,
            envelope,
            broker,
            registry,
            listener,
        } = self;
        let addr = listener.local_addr()?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        // ── Read side ──────────────────────────────────────────────

        let mut store = None;
        let mut materializer_handle = None;
        if let Some(consumer) = broker.consumer {
            let opened = open_store(&config.storage)
                .await
                .context("failed to open state store")?;
            info!(backend = ?opened.backend(), "state store opened");

            let mut materializer = Materializer::new(
                config.topic.clone(),
                opened.clone(),
                broker.admin.clone(),
                consumer,
                envelope.clone(),
            )
            .with_options(MaterializerOptions::from(&config.consumer));
            if let Some(registry) = registry {
                materializer = materializer.with_schema_registry(registry);
            }

            let materializer_stop = stop_rx.clone();
            let fail_tx = stop_tx.clone();
            materializer_handle = Some(tokio::spawn(async move {
                let result = materializer.run(materializer_stop).await;
                if let Err(e) = &result {
                    error!(error = %e, "materialization failed, shutting down");
                    let _ = fail_tx.send(true);
                }
                result
            }));
            store = Some(opened);
        } else {
            info!("reads disabled");
        }

        // ── Write side ─────────────────────────────────────────────

        let publisher = match broker.producer {
            Some(producer) => {
                ensure_topic(broker.admin.as_ref(), &config.topic).await;
                Some(Arc::new(Publisher::new(
                    config.topic.clone(),
                    producer,
                    envelope,
                    Duration::from_millis(config.producer.flush_timeout_ms),
                )))
            }
            None => {
                info!("writes disabled");
                None
            }
        };

        // ── HTTP server ────────────────────────────────────────────

        let router = build_router(ApiState {
            store,
            publisher: publisher.clone(),
        });
        info!(
            %addr,
            topic = %config.topic,
            read = config.read_enabled,
            write = config.write_enabled,
            "API server starting"
        );

        let mut stopped = stop_rx;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                tokio::select! {
                    () = shutdown => {}
                    _ = stopped.changed() => {}
                }
                let _ = stop_tx.send(true);
            })
            .await?;

        if let Some(publisher) = &publisher {
            if let Err(e) = publisher.shutdown().await {
                error!(error = %e, "publisher flush failed");
            }
        }
        if let Some(handle) = materializer_handle {
            handle.await.context("materializer task panicked")??;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvlog_core::config::StorageBackend;
    use tokio::sync::oneshot;

    fn config() -> ServiceConfig {
        let mut config = ServiceConfig {
            topic: "kv".to_string(),
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..ServiceConfig::default()
        };
        config.storage.backend = StorageBackend::Dict;
        config.broker.kind = Some(BrokerKind::Memory);
        config.consumer.poll_timeout_ms = 20;
        config.consumer.tail_backoff_ms = 10;
        config.consumer.watermark_timeout_ms = 1_000;
        config
    }

    async fn wait_ready(addr: SocketAddr) {
        let url = format!("http://{addr}/healthz/ready");
        for _ in 0..200 {
            if crate::probe::probe(&url, Duration::from_secs(1)).await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("service never became ready");
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let service = Service::bind(config()).await.unwrap();
        let addr = service.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(service.run(async move {
            let _ = rx.await;
        }));

        wait_ready(addr).await;
        let live = format!("http://{addr}/healthz/live");
        assert!(crate::probe::probe(&live, Duration::from_secs(1)).await.unwrap());

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn write_only_service_is_ready_at_once() {
        let mut config = config();
        config.read_enabled = false;
        let service = Service::bind(config).await.unwrap();
        let addr = service.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(service.run(async move {
            let _ = rx.await;
        }));

        wait_ready(addr).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn blank_topic_is_refused_before_binding() {
        let mut config = config();
        config.topic = "  ".to_string();
        assert!(Service::bind(config).await.is_err());
    }

    #[tokio::test]
    async fn unusable_schema_registry_url_is_refused_before_binding() {
        let mut config = config();
        config.schema_registry.url = Some("https://registry".into());
        match Service::bind(config).await {
            Ok(_) => panic!("https schema registry accepted"),
            Err(e) => assert!(e.to_string().contains("schema registry")),
        }
    }

    #[cfg(not(feature = "kafka"))]
    #[tokio::test]
    async fn kafka_requires_the_feature() {
        let mut config = config();
        config.broker.kind = Some(BrokerKind::Kafka);
        match Service::bind(config).await {
            Ok(_) => panic!("kafka broker accepted without the feature"),
            Err(e) => assert!(e.to_string().contains("kafka")),
        }
    }
}
