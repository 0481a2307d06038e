//! Provider connections and the connectors that establish them

use crate::{CoreError, ProviderAddress, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use socket2::{SockRef, TcpKeepalive};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::timeout as tokio_timeout;
use tracing::debug;

/// Connector configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Upper bound on a single connection attempt, in milliseconds
    pub connect_timeout_ms: u64,
    /// Disable Nagle on established sockets
    pub tcp_nodelay: bool,
    /// TCP keepalive idle time in milliseconds, none to leave the OS default
    pub keepalive_ms: Option<u64>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 3_000,
            tcp_nodelay: true,
            keepalive_ms: Some(30_000),
        }
    }
}

impl ConnectorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// An established transport connection to one provider.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Close the underlying handle. Closing twice is a no-op.
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// Opens connections to provider addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &ProviderAddress) -> Result<Box<dyn Connection>>;
}

/// One live connection in the pool, identified by `host:port`.
#[derive(Debug)]
pub struct ConnectionRecord {
    address: ProviderAddress,
    connection: Box<dyn Connection>,
}

impl ConnectionRecord {
    pub fn new(address: ProviderAddress, connection: Box<dyn Connection>) -> Self {
        Self {
            address,
            connection,
        }
    }

    pub fn address(&self) -> &ProviderAddress {
        &self.address
    }

    pub fn host(&self) -> &str {
        &self.address.host
    }

    pub fn port(&self) -> u16 {
        self.address.port
    }

    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

/// TCP connection handed to the transport layer.
pub struct TcpConnection {
    address: ProviderAddress,
    stream: Mutex<Option<TcpStream>>,
    open: AtomicBool,
}

impl TcpConnection {
    pub fn new(address: ProviderAddress, stream: TcpStream) -> Self {
        Self {
            address,
            stream: Mutex::new(Some(stream)),
            open: AtomicBool::new(true),
        }
    }

    /// Exclusive access to the stream; `None` once closed.
    pub async fn stream(&self) -> MutexGuard<'_, Option<TcpStream>> {
        self.stream.lock().await
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("address", &self.address)
            .field("open", &self.is_open())
            .finish()
    }
}

#[async_trait]
impl Connection for TcpConnection {
    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(mut stream) = self.stream.lock().await.take() {
            use tokio::io::AsyncWriteExt;
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of {} returned: {}", self.address, e);
            }
        }
        debug!("Closed connection to {}", self.address);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Plain TCP connector with a bounded connect time.
pub struct TcpConnector {
    config: ConnectorConfig,
}

impl TcpConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    fn tune(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.config.tcp_nodelay)?;
        if let Some(ms) = self.config.keepalive_ms {
            let keepalive = TcpKeepalive::new().with_time(Duration::from_millis(ms));
            SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(ConnectorConfig::default())
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &ProviderAddress) -> Result<Box<dyn Connection>> {
        let target = (address.host.as_str(), address.port);
        let stream = match tokio_timeout(self.config.connect_timeout(), TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(CoreError::ConnectionEstablish {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(CoreError::ConnectTimeout {
                    address: address.to_string(),
                    timeout_ms: self.config.connect_timeout_ms,
                })
            }
        };

        self.tune(&stream).map_err(|e| CoreError::ConnectionEstablish {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        debug!("Connected to provider {}", address);
        Ok(Box::new(TcpConnection::new(address.clone(), stream)))
    }
}
