use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::messaging::{
    Capabilities, EventSink, EventSource, InMemoryQueue, LogSettings, PgmqQueue, PgmqSettings,
    PullSocket, PushSocket, RedpandaClient, SocketEnd, SocketSettings, StreamsSettings,
    StreamsTransport, Substrate, TopologyDescriptor, TransportError, TransportResult,
};
use crate::metrics::Metrics;
use crate::utils::{retry_on_transient, RetryConfig, RetryResult};

// ============================================================================
// Bootstrapper
// ============================================================================
//
// Startup sequence for either side of the dispatch path:
// 1. connect to the substrate, retrying transient failures on a fixed
//    interval (brokers in the same deployment may still be starting)
// 2. provision the durable topology, create-if-absent
// 3. hand back a TransportClient shared by publisher and consumer
//
// Exhausting the retry budget is fatal; the caller stops startup.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher,
    Consumer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Publisher => f.write_str("publisher"),
            Role::Consumer => f.write_str("consumer"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "publisher" | "producer" => Ok(Role::Publisher),
            "consumer" | "worker" => Ok(Role::Consumer),
            other => Err(format!("unknown role '{}' (expected publisher or consumer)", other)),
        }
    }
}

/// Where and how to reach the chosen substrate
#[derive(Clone)]
pub enum TransportConfig {
    Broadcast(StreamsSettings),
    PushPull(SocketSettings),
    PartitionedLog(LogSettings),
    PollingTable(PgmqSettings),
    /// Process-local queue; behaves like the polling table
    InMemory(InMemoryQueue),
}

impl TransportConfig {
    pub fn substrate(&self) -> Substrate {
        match self {
            TransportConfig::Broadcast(_) => Substrate::Broadcast,
            TransportConfig::PushPull(_) => Substrate::PushPull,
            TransportConfig::PartitionedLog(_) => Substrate::PartitionedLog,
            TransportConfig::PollingTable(_) | TransportConfig::InMemory(_) => {
                Substrate::PollingTable
            }
        }
    }

    /// Endpoint for log lines; credentials are redacted
    pub fn endpoint(&self) -> String {
        match self {
            TransportConfig::Broadcast(settings) => crate::messaging::pgmq::redact_url(&settings.url),
            TransportConfig::PushPull(settings) => settings.endpoint.clone(),
            TransportConfig::PartitionedLog(settings) => settings.brokers.clone(),
            TransportConfig::PollingTable(settings) => {
                crate::messaging::pgmq::redact_url(&settings.database_url)
            }
            TransportConfig::InMemory(_) => "memory://local".to_string(),
        }
    }

    pub fn topology(&self) -> TopologyDescriptor {
        match self {
            TransportConfig::Broadcast(settings) => settings.topology(),
            TransportConfig::PushPull(settings) => {
                TopologyDescriptor::new(Substrate::PushPull, &settings.endpoint)
            }
            TransportConfig::PartitionedLog(settings) => settings.topology(),
            TransportConfig::PollingTable(settings) => settings.topology(),
            TransportConfig::InMemory(_) => TopologyDescriptor::new(Substrate::PollingTable, "memory"),
        }
    }
}

/// A connected transport, cheap to clone and share
#[derive(Clone)]
pub enum TransportClient {
    Broadcast(StreamsTransport),
    PushPull(SocketEnd),
    PartitionedLog(RedpandaClient),
    PollingTable(PgmqQueue),
    InMemory(InMemoryQueue),
}

impl TransportClient {
    pub fn substrate(&self) -> Substrate {
        match self {
            TransportClient::Broadcast(_) => Substrate::Broadcast,
            TransportClient::PushPull(_) => Substrate::PushPull,
            TransportClient::PartitionedLog(_) => Substrate::PartitionedLog,
            TransportClient::PollingTable(_) | TransportClient::InMemory(_) => Substrate::PollingTable,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.substrate().capabilities()
    }

    /// Create the durable topology. Safe to call from many tasks; each
    /// client runs the structural operations at most once.
    pub async fn provision(&self, topology: &TopologyDescriptor) -> TransportResult<()> {
        match self {
            TransportClient::Broadcast(transport) => transport.provision(topology).await,
            TransportClient::PartitionedLog(client) => client.provision(topology).await,
            TransportClient::PollingTable(queue) => queue.provision(topology).await,
            // Nothing durable to create
            TransportClient::PushPull(_) | TransportClient::InMemory(_) => Ok(()),
        }
    }

    pub fn sink(&self) -> TransportResult<Arc<dyn EventSink>> {
        match self {
            TransportClient::Broadcast(transport) => Ok(Arc::new(transport.clone())),
            TransportClient::PushPull(SocketEnd::Push(socket)) => Ok(socket.clone()),
            TransportClient::PushPull(SocketEnd::Pull(_)) => {
                Err(TransportError::Unsupported("sending on the pull end of a socket"))
            }
            TransportClient::PartitionedLog(client) => Ok(Arc::new(client.clone())),
            TransportClient::PollingTable(queue) => Ok(Arc::new(queue.clone())),
            TransportClient::InMemory(queue) => Ok(Arc::new(queue.clone())),
        }
    }

    pub async fn source(&self) -> TransportResult<Arc<dyn EventSource>> {
        match self {
            TransportClient::Broadcast(transport) => Ok(Arc::new(transport.consumer().await?)),
            TransportClient::PushPull(SocketEnd::Pull(socket)) => Ok(socket.clone()),
            TransportClient::PushPull(SocketEnd::Push(_)) => {
                Err(TransportError::Unsupported("pulling from the push end of a socket"))
            }
            TransportClient::PartitionedLog(client) => Ok(Arc::new(client.consumer()?)),
            TransportClient::PollingTable(queue) => Ok(Arc::new(queue.clone())),
            TransportClient::InMemory(queue) => Ok(Arc::new(queue.clone())),
        }
    }

    /// Flush outstanding sends before the process exits. Only the push
    /// socket holds messages locally; broker substrates confirm each send.
    pub async fn close(&self, linger: Duration) -> TransportResult<()> {
        match self {
            TransportClient::PushPull(SocketEnd::Push(socket)) => socket.close(linger).await,
            _ => Ok(()),
        }
    }

    /// Connection pool of the polling-table substrate, shared with the
    /// Postgres-backed stores
    pub fn pg_pool(&self) -> Option<sqlx::PgPool> {
        match self {
            TransportClient::PollingTable(queue) => Some(queue.pool().clone()),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("gave up connecting to {endpoint} after {attempts} attempts: {source}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("cannot connect to {endpoint}: {source}")]
    Rejected {
        endpoint: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to provision {target}: {source}")]
    Topology {
        target: String,
        #[source]
        source: TransportError,
    },
}

impl BootstrapError {
    /// The retry budget ran out; distinct from a configuration problem
    pub fn is_exhausted(&self) -> bool {
        matches!(self, BootstrapError::Exhausted { .. })
    }
}

pub struct Bootstrapper {
    retry: RetryConfig,
    metrics: Option<Arc<Metrics>>,
}

impl Default for Bootstrapper {
    fn default() -> Self {
        Self::new(RetryConfig::startup())
    }
}

impl Bootstrapper {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Connect with bounded retry, then provision the topology
    pub async fn connect(
        &self,
        config: &TransportConfig,
        role: Role,
    ) -> Result<TransportClient, BootstrapError> {
        let client = self.connect_with_retry(config, role).await?;

        let topology = config.topology();
        client
            .provision(&topology)
            .await
            .map_err(|source| BootstrapError::Topology {
                target: topology.target.clone(),
                source,
            })?;

        tracing::info!(
            substrate = %client.substrate(),
            target = %topology.target,
            role = %role,
            "✅ Transport ready"
        );
        Ok(client)
    }

    async fn connect_with_retry(
        &self,
        config: &TransportConfig,
        role: Role,
    ) -> Result<TransportClient, BootstrapError> {
        let substrate = config.substrate();
        let endpoint = config.endpoint();
        let max_attempts = self.retry.max_attempts;

        let result = retry_on_transient("bootstrap", self.retry.clone(), |attempt| {
            let endpoint = endpoint.clone();
            let metrics = self.metrics.clone();
            async move {
                tracing::info!(
                    substrate = %substrate,
                    endpoint = %endpoint,
                    attempt,
                    max_attempts,
                    "🔌 Connecting to transport"
                );

                let result = open(config, role).await;
                if let Some(metrics) = &metrics {
                    metrics.record_bootstrap_attempt(substrate.as_str(), result.is_ok());
                }
                result
            }
        })
        .await;

        match result {
            RetryResult::Success(client) => Ok(client),
            RetryResult::Failed(source) => Err(BootstrapError::Exhausted {
                endpoint,
                attempts: max_attempts,
                source,
            }),
            RetryResult::PermanentFailure(source) => Err(BootstrapError::Rejected { endpoint, source }),
        }
    }
}

async fn open(config: &TransportConfig, role: Role) -> TransportResult<TransportClient> {
    match config {
        TransportConfig::Broadcast(settings) => StreamsTransport::connect(settings.clone())
            .await
            .map(TransportClient::Broadcast),
        TransportConfig::PushPull(settings) => match role {
            Role::Publisher => {
                let socket = PushSocket::bind(settings).await?;
                Ok(TransportClient::PushPull(SocketEnd::Push(Arc::new(socket))))
            }
            Role::Consumer => {
                let socket = PullSocket::connect(settings).await?;
                Ok(TransportClient::PushPull(SocketEnd::Pull(Arc::new(socket))))
            }
        },
        TransportConfig::PartitionedLog(settings) => RedpandaClient::connect(settings.clone())
            .await
            .map(TransportClient::PartitionedLog),
        TransportConfig::PollingTable(settings) => PgmqQueue::connect(settings.clone())
            .await
            .map(TransportClient::PollingTable),
        TransportConfig::InMemory(queue) => Ok(TransportClient::InMemory(queue.clone())),
    }
}
