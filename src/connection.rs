use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::ConnectionConfig;
use crate::errors::{BridgeError, Result};
use crate::transport::{Connection, Session, Transport};

const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// A started connection together with its single session.
#[derive(Clone)]
pub struct TransportSession {
    connection: Arc<dyn Connection>,
    session: Arc<dyn Session>,
}

impl TransportSession {
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open() && self.session.is_open()
    }
}

/// Owns the connection/session pair and drives it through
/// `Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected`.
///
/// Producers, consumers and listeners borrow the session through [`session`];
/// they must be closed before [`disconnect`] runs.
///
/// [`session`]: ConnectionManager::session
/// [`disconnect`]: ConnectionManager::disconnect
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    max_connect_attempts: u32,
    reconnect_delay_ms: u64,
    // Serializes connect() and disconnect().
    lifecycle: AsyncMutex<()>,
    state: Mutex<ConnectionState>,
    current: RwLock<Option<TransportSession>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        ConnectionManager {
            config,
            transport,
            max_connect_attempts: 1,
            reconnect_delay_ms: 1000,
            lifecycle: AsyncMutex::new(()),
            state: Mutex::new(ConnectionState::Disconnected),
            current: RwLock::new(None),
        }
    }

    /// Retries the connect step up to `max_attempts` times with exponential backoff.
    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_connect_attempts = max_attempts.max(1);
        self.reconnect_delay_ms = initial_delay_ms;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn current(&self) -> Option<TransportSession> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let state = self.state();
        if state != ConnectionState::Disconnected {
            return Err(BridgeError::IllegalState(format!(
                "connect() requires a disconnected manager, current state is {}",
                state
            )));
        }

        info!(
            queue_manager = %self.config.queue_manager,
            host = %self.config.host,
            port = self.config.port,
            channel = %self.config.channel,
            "Connecting to broker"
        );
        self.set_state(ConnectionState::Connecting);

        match self.open_session().await {
            Ok(pair) => {
                *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(pair);
                self.set_state(ConnectionState::Connected);
                info!("Connected successfully");
                Ok(())
            }
            Err(cause) => {
                self.set_state(ConnectionState::Disconnected);
                let err = self.connection_error(cause);
                error!("{}", err);
                Err(err)
            }
        }
    }

    async fn establish_connection(&self) -> Result<Arc<dyn Connection>> {
        let mut attempts = 0;
        let mut delay = self.reconnect_delay_ms;

        loop {
            match self.transport.connect(&self.config).await {
                Ok(connection) => return Ok(connection),
                Err(err) => {
                    attempts += 1;
                    if attempts >= self.max_connect_attempts {
                        return Err(err);
                    }
                    warn!(
                        "Failed to connect (attempt {}/{}): {}",
                        attempts, self.max_connect_attempts, err
                    );

                    // Exponential backoff with jitter
                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
                    let sleep_time = (delay as f64 + jitter).max(0.0) as u64;
                    info!("Waiting {}ms before next connect attempt", sleep_time);
                    sleep(Duration::from_millis(sleep_time)).await;

                    delay = std::cmp::min(delay.saturating_mul(2), MAX_RECONNECT_DELAY_MS);
                }
            }
        }
    }

    // Opens, starts and creates the session; a half-built pair is torn down again.
    async fn open_session(&self) -> Result<TransportSession> {
        let connection = self.establish_connection().await?;

        let session = match connection.start().await {
            Ok(()) => connection.create_session().await,
            Err(e) => Err(e),
        };

        match session {
            Ok(session) => Ok(TransportSession {
                connection,
                session,
            }),
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    warn!("Error closing half-open connection: {}", close_err);
                }
                Err(e)
            }
        }
    }

    fn connection_error(&self, cause: BridgeError) -> BridgeError {
        BridgeError::ConnectionError {
            queue_manager: self.config.queue_manager.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            channel: self.config.channel.clone(),
            cause: cause.to_string(),
        }
    }

    /// Closes the session, then the connection. Safe from any state and
    /// always leaves the manager disconnected. Close failures are logged and
    /// returned, never raised, and a session failure does not stop the
    /// connection close.
    pub async fn disconnect(&self) -> Vec<BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;

        let taken = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(pair) = taken else {
            debug!("disconnect() on a manager that is not connected");
            self.set_state(ConnectionState::Disconnected);
            return Vec::new();
        };

        self.set_state(ConnectionState::Disconnecting);
        let mut failures = Vec::new();

        if let Err(e) = pair.session.close().await {
            warn!("Error while closing session: {}", e);
            failures.push(BridgeError::teardown("session", e));
        }
        match pair.connection.close().await {
            Ok(()) => info!("Connection closed gracefully."),
            Err(e) => {
                warn!("Error while closing connection: {}", e);
                failures.push(BridgeError::teardown("connection", e));
            }
        }

        self.set_state(ConnectionState::Disconnected);
        failures
    }

    /// True iff a connection and its session are present and open.
    pub fn is_connected(&self) -> bool {
        self.current().map_or(false, |pair| pair.is_open())
    }

    pub fn transport_session(&self) -> Result<TransportSession> {
        match self.current() {
            Some(pair) if self.state() == ConnectionState::Connected => Ok(pair),
            _ => Err(BridgeError::IllegalState(
                "Not connected. Call connect() first.".to_string(),
            )),
        }
    }

    pub fn session(&self) -> Result<Arc<dyn Session>> {
        self.transport_session().map(|pair| pair.session)
    }

    pub fn connection(&self) -> Result<Arc<dyn Connection>> {
        self.transport_session().map(|pair| pair.connection)
    }
}
