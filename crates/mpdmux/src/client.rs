//! Client lifecycle
//!
//! An [`MpdClient`] dials three connections to the same daemon, one per
//! [`ConnectionRole`], and supervises the background tasks that drive them:
//! the idle watcher, the subscription multiplexer, the listener dispatcher
//! and the keep-alive pinger.
//!
//! ## Shutdown
//!
//! Every task gets a child of one root `CancellationToken`. [`MpdClient::close`]
//! cancels them in a fixed order and waits a bounded time for each:
//!
//! 1. wait for an in-flight subscription command to finish
//! 2. subscription multiplexer (`noidle`, `close`)
//! 3. idle watcher (`noidle`, `close`)
//! 4. keep-alive
//! 5. `close` on the command connection
//!
//! Dropping the client without closing cancels the root token so no task
//! outlives it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mpdmux_config::{Config, DEFAULT_HOST, DEFAULT_KEEPALIVE_SECS, DEFAULT_PORT};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::connection::{CommandConnection, Connection};
use crate::error::{ClientError, ConnectionRole, LoopFailure};
use crate::idle::run_idle_watcher;
use crate::listeners::{run_dispatcher, IdleListener, ListenerRegistry};
use crate::protocol::{Response, Version};
use crate::subscription::{GateState, MuxHandle, SubscriptionMux};

/// How long `close` waits for each background task
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const PING_COMMAND: &str = "ping";

/// Connection parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    /// Interval between keep-alive pings on the command connection
    pub keepalive_interval: Duration,
    /// Bound on each step of [`MpdClient::close`]
    pub shutdown_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            password: None,
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&Config> for ConnectOptions {
    fn from(config: &Config) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            password: config.server.password.clone(),
            keepalive_interval: config.keepalive.interval,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Task handles and their cancellation tokens, in shutdown order
#[derive(Debug)]
struct Supervisor {
    mux: (CancellationToken, JoinHandle<()>),
    idle: (CancellationToken, JoinHandle<()>),
    keepalive: (CancellationToken, JoinHandle<()>),
    dispatcher: JoinHandle<()>,
}

/// A multiplexing MPD client
#[derive(Debug)]
pub struct MpdClient {
    host: String,
    port: u16,
    version: Version,
    id: u16,
    command: Arc<CommandConnection>,
    mux: MuxHandle,
    idle_failure: LoopFailure,
    listeners: ListenerRegistry,
    root: CancellationToken,
    supervisor: Mutex<Option<Supervisor>>,
    closed: AtomicBool,
    shutdown_timeout: Duration,
    span: Span,
}

impl MpdClient {
    /// Connect without a password
    pub async fn connect(host: &str, port: u16) -> Result<Self, ClientError> {
        Self::connect_with_options(ConnectOptions::new(host, port)).await
    }

    /// Connect and authenticate every connection with `password`
    pub async fn connect_with_password(
        host: &str,
        port: u16,
        password: &str,
    ) -> Result<Self, ClientError> {
        Self::connect_with_options(ConnectOptions::new(host, port).with_password(password)).await
    }

    pub async fn from_config(config: &Config) -> Result<Self, ClientError> {
        Self::connect_with_options(ConnectOptions::from(config)).await
    }

    /// Dial the three connections and start the background tasks.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::ConnectionFailed` if any dial fails,
    /// `BadGreeting`/`UnknownVersion` if a banner is wrong, and
    /// `AuthenticationFailed` if the password is rejected.
    pub async fn connect_with_options(options: ConnectOptions) -> Result<Self, ClientError> {
        let addr = options.address();
        let password = options.password.as_deref();

        let command = Connection::open(&addr, password).await?;
        let idle = Connection::open(&addr, password).await?;
        let subscription = Connection::open(&addr, password).await?;

        let version = command.version();
        let id = command.local_port();
        let span = info_span!("mpd_client", id);
        span.in_scope(|| info!(%addr, %version, "Connected to MPD"));

        let command = Arc::new(CommandConnection::new(command));
        let idle_failure = LoopFailure::new(ConnectionRole::IdleWatch);
        let listeners = ListenerRegistry::new(idle_failure.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let root = CancellationToken::new();

        let dispatcher = tokio::spawn(
            run_dispatcher(listeners.clone(), events_rx).instrument(span.clone()),
        );

        let idle_cancel = root.child_token();
        let idle_task = tokio::spawn(
            run_idle_watcher(
                idle,
                events_tx.clone(),
                listeners.clone(),
                idle_cancel.clone(),
                idle_failure.clone(),
            )
            .instrument(span.clone()),
        );

        let mux_cancel = root.child_token();
        let (mux, mux_handle) = SubscriptionMux::new(subscription, events_tx, mux_cancel.clone());
        let mux_task = tokio::spawn(mux.run().instrument(span.clone()));

        let keepalive_cancel = root.child_token();
        let keepalive_task = tokio::spawn(
            run_keepalive(
                Arc::clone(&command),
                options.keepalive_interval,
                keepalive_cancel.clone(),
            )
            .instrument(span.clone()),
        );

        Ok(Self {
            host: options.host,
            port: options.port,
            version,
            id,
            command,
            mux: mux_handle,
            idle_failure,
            listeners,
            root,
            supervisor: Mutex::new(Some(Supervisor {
                mux: (mux_cancel, mux_task),
                idle: (idle_cancel, idle_task),
                keepalive: (keepalive_cancel, keepalive_task),
                dispatcher,
            })),
            closed: AtomicBool::new(false),
            shutdown_timeout: options.shutdown_timeout,
            span,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Protocol version from the command connection's greeting
    pub fn protocol_version(&self) -> Version {
        self.version
    }

    /// Per-instance id used in log spans
    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current state of the subscription connection
    pub fn gate_state(&self) -> GateState {
        self.mux.state()
    }

    /// Why a background loop died, if it did
    pub fn loop_error(&self, role: ConnectionRole) -> Option<ClientError> {
        match role {
            ConnectionRole::IdleWatch => self.idle_failure.error(),
            ConnectionRole::SubscriptionMux => self.mux.failure().error(),
            ConnectionRole::Command => None,
        }
    }

    /// Run a command on the command connection.
    ///
    /// Concurrent calls are serialized; responses never cross.
    pub async fn execute(&self, command: &str) -> Result<Response, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.command
            .execute(command)
            .instrument(self.span.clone())
            .await
    }

    /// Run a command on the subscription connection, interrupting its watch.
    ///
    /// Fails with `ClientError::LoopTerminated` once the multiplexer has died.
    pub async fn execute_subscription_command(
        &self,
        command: &str,
    ) -> Result<Response, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        self.mux.execute(command).instrument(self.span.clone()).await
    }

    /// Register for subsystem change notifications.
    ///
    /// An empty `subsystems` means every subsystem. Names are delivered in
    /// the order the daemon reported them. Once the idle watcher has died or
    /// the client is closed, the listener's `recv` fails right away.
    pub fn idle<I, S>(&self, subsystems: I) -> IdleListener
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listeners.register(subsystems)
    }

    /// Number of listeners that have not been closed
    pub fn listener_count(&self) -> usize {
        self.listeners.active_count()
    }

    /// Shut every connection down in order. Safe to call more than once.
    ///
    /// Every step runs even if an earlier one timed out; the first timeout is
    /// returned.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let supervisor = self.supervisor.lock().await.take();
        let Some(supervisor) = supervisor else {
            return Ok(());
        };

        async move {
            info!("Closing client");
            let mut first_error = None;

            if timeout(self.shutdown_timeout, self.mux.wait_until_idle())
                .await
                .is_err()
            {
                warn!("Subscription command still running at close");
            }

            let steps = [
                (ConnectionRole::SubscriptionMux, supervisor.mux),
                (ConnectionRole::IdleWatch, supervisor.idle),
                (ConnectionRole::Command, supervisor.keepalive),
            ];
            for (role, (cancel, handle)) in steps {
                cancel.cancel();
                if let Err(e) = self.join(role, handle).await {
                    first_error.get_or_insert(e);
                }
            }

            if let Err(e) = self.command.close().await {
                debug!(error = %e, "Failed to send close on command connection");
            }

            self.root.cancel();
            supervisor.dispatcher.abort();
            self.listeners.terminate();

            info!("Client closed");
            first_error.map_or(Ok(()), Err)
        }
        .instrument(self.span.clone())
        .await
    }

    async fn join(&self, role: ConnectionRole, mut handle: JoinHandle<()>) -> Result<(), ClientError> {
        match timeout(self.shutdown_timeout, &mut handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!(%role, error = %e, "Background task failed");
                Ok(())
            }
            Err(_) => {
                warn!(%role, "Background task did not stop in time, aborting");
                handle.abort();
                Err(ClientError::ShutdownTimeout { role })
            }
        }
    }
}

impl Drop for MpdClient {
    fn drop(&mut self) {
        self.root.cancel();
        self.listeners.terminate();
    }
}

/// Ping the command connection every `interval` until cancelled.
///
/// Failures are logged and never stop the loop.
async fn run_keepalive(
    command: Arc<CommandConnection>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match command.execute(PING_COMMAND).await {
                Ok(_) => debug!("Keep-alive ping OK"),
                Err(e) => warn!(error = %e, "Keep-alive ping failed"),
            },
        }
    }
    debug!("Keep-alive stopped");
}
