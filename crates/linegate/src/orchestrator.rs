//! Bridge orchestrator - wires the child process to the transport.
//!
//! Startup order:
//! 1. Health server (if any paths are configured)
//! 2. Child process; its output is buffered from this point on
//! 3. Transport bind
//! 4. READY
//!
//! The event loop owns the `BridgeState` phase. Liveness is cleared as soon as
//! the child is reaped, before its remaining output has been relayed. The loop
//! ends when the child exits or shutdown is requested, then tears everything
//! down exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{LineFramer, codec};
use crate::config::{BridgeConfig, ConfigError};
use crate::health::{HealthError, HealthServer};
use crate::process::{
    self, ChildCommand, ChildExit, ProcessEvent, ProcessEvents, ProcessHandle, SpawnError,
};
use crate::state::BridgeState;
use crate::transport::{
    MessageTransport, TransportBinder, TransportConfig, TransportError, TransportEvent, WsBinder,
};

const TRANSPORT_EVENT_BUFFER: usize = 256;

/// How long to wait for the child after an external shutdown or startup failure.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(5);

/// Status used for every failure that has no child exit code.
pub const FAILURE_STATUS: i32 = 1;

/// Fatal startup failures.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Health(#[from] HealthError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug)]
pub enum ShutdownCause {
    ChildExited(ChildExit),
    /// Signal or shutdown handle.
    Requested,
    StartupFailed(BridgeError),
}

/// Result of one bridge run.
#[derive(Debug)]
pub struct BridgeExit {
    /// Host process exit status.
    pub code: i32,
    pub cause: ShutdownCause,
}

impl BridgeExit {
    fn startup_failed(error: BridgeError) -> Self {
        Self {
            code: FAILURE_STATUS,
            cause: ShutdownCause::StartupFailed(error),
        }
    }
}

pub struct Bridge {
    config: BridgeConfig,
    binder: Arc<dyn TransportBinder>,
    state: Arc<BridgeState>,
    shutdown: CancellationToken,
    exit_grace: Duration,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            binder: Arc::new(WsBinder),
            state: Arc::new(BridgeState::new()),
            shutdown: CancellationToken::new(),
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    pub fn with_binder(mut self, binder: Arc<dyn TransportBinder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn state(&self) -> Arc<BridgeState> {
        Arc::clone(&self.state)
    }

    /// Cancelling this token stops the bridge as if a signal arrived.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn run(self) -> BridgeExit {
        let exit = self.run_inner().await;
        self.state.mark_terminated();
        match &exit.cause {
            ShutdownCause::StartupFailed(e) => error!(error = %e, "Bridge failed to start"),
            cause => info!(code = exit.code, ?cause, "Bridge stopped"),
        }
        exit
    }

    async fn run_inner(&self) -> BridgeExit {
        let prepared = self.config.child_command().and_then(|command| {
            Ok((
                command,
                self.config.transport_config()?,
                self.config.health_config()?,
            ))
        });
        let (command, transport_config, health_config) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => return self.abort(e.into(), None).await,
        };

        let health = match HealthServer::start(&health_config, self.state()).await {
            Ok(health) => health,
            Err(e) => return self.abort(e.into(), None).await,
        };

        let exit = self.run_with_health(&command, &transport_config).await;

        if let Some(health) = health {
            health.stop().await;
        }
        exit
    }

    async fn run_with_health(
        &self,
        command: &ChildCommand,
        transport_config: &TransportConfig,
    ) -> BridgeExit {
        let (process, mut process_events) = match process::start(command) {
            Ok(started) => started,
            Err(e) => return self.abort(e.into(), None).await,
        };
        self.state.mark_process_started();
        info!(pid = ?process.pid(), %command, "Child process started");
        tokio::spawn({
            let state = self.state();
            let exited = process.exited();
            async move {
                exited.await;
                state.mark_process_gone();
            }
        });

        let (event_tx, mut transport_events) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        let transport = match self.binder.bind(transport_config, event_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                return self
                    .abort(e.into(), Some((&process, &mut process_events)))
                    .await;
            }
        };

        if self.state.mark_ready() {
            let port = transport
                .local_addr()
                .map(|addr| addr.port())
                .unwrap_or(transport_config.port);
            info!(
                "WebSocket endpoint: ws://{}:{}{}",
                transport_config.host, port, transport_config.path
            );
        }

        let cause = self
            .relay(
                &process,
                &mut process_events,
                &mut transport_events,
                transport.as_ref(),
            )
            .await;

        self.teardown(cause, &process, &mut process_events, transport.as_ref())
            .await
    }

    async fn relay(
        &self,
        process: &ProcessHandle,
        process_events: &mut ProcessEvents,
        transport_events: &mut mpsc::Receiver<TransportEvent>,
        transport: &dyn MessageTransport,
    ) -> ShutdownCause {
        let mut framer = LineFramer::new();
        loop {
            tokio::select! {
                event = process_events.recv() => match event {
                    Some(ProcessEvent::Output(chunk)) => relay_output(&mut framer, &chunk, transport),
                    Some(ProcessEvent::Diagnostic(chunk)) => log_diagnostic(&chunk),
                    Some(ProcessEvent::Exited(exit)) => {
                        error!(code = ?exit.code, signal = ?exit.signal, "Child exited");
                        return ShutdownCause::ChildExited(exit);
                    }
                    None => return ShutdownCause::ChildExited(ChildExit::unknown()),
                },
                Some(event) = transport_events.recv() => handle_transport_event(event, process),
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return ShutdownCause::Requested;
                }
            }
        }
    }

    async fn teardown(
        &self,
        cause: ShutdownCause,
        process: &ProcessHandle,
        process_events: &mut ProcessEvents,
        transport: &dyn MessageTransport,
    ) -> BridgeExit {
        if !self.state.begin_shutdown() {
            debug!("Shutdown already in progress");
        }
        if matches!(cause, ShutdownCause::ChildExited(_)) {
            self.state.mark_process_gone();
        }

        if let Err(e) = transport.close().await {
            error!(error = %e, "Failed to close transport");
        }

        let code = match &cause {
            ShutdownCause::ChildExited(exit) => exit.status_code(),
            _ => self
                .stop_process(process, process_events)
                .await
                .map(|exit| exit.status_code())
                .unwrap_or(FAILURE_STATUS),
        };

        BridgeExit { code, cause }
    }

    /// Fail startup, killing the child if it was already spawned.
    async fn abort(
        &self,
        error: BridgeError,
        process: Option<(&ProcessHandle, &mut ProcessEvents)>,
    ) -> BridgeExit {
        self.state.begin_shutdown();
        if let Some((process, events)) = process {
            self.stop_process(process, events).await;
        }
        BridgeExit::startup_failed(error)
    }

    async fn stop_process(
        &self,
        process: &ProcessHandle,
        events: &mut ProcessEvents,
    ) -> Option<ChildExit> {
        process.kill();
        let exit = wait_for_exit(events, self.exit_grace).await;
        self.state.mark_process_gone();
        match exit {
            Some(exit) => debug!(code = ?exit.code, signal = ?exit.signal, "Child stopped"),
            None => warn!(
                grace_secs = self.exit_grace.as_secs_f64(),
                "Child did not report exit in time"
            ),
        }
        exit
    }
}

/// Discard remaining output until the child reports its exit.
async fn wait_for_exit(events: &mut ProcessEvents, grace: Duration) -> Option<ChildExit> {
    let wait = async {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Exited(exit) => return Some(exit),
                ProcessEvent::Diagnostic(chunk) => log_diagnostic(&chunk),
                ProcessEvent::Output(chunk) => {
                    trace!(bytes = chunk.len(), "Dropping child output during shutdown")
                }
            }
        }
        None
    };
    tokio::time::timeout(grace, wait).await.ok().flatten()
}

fn relay_output(framer: &mut LineFramer, chunk: &[u8], transport: &dyn MessageTransport) {
    for record in framer.feed(chunk) {
        match codec::decode(&record) {
            Ok(message) => {
                let report = transport.broadcast(&message);
                debug!(
                    id = message.id().map(tracing::field::display),
                    recipients = report.recipients(),
                    delivered = report.delivered(),
                    "Child -> clients"
                );
            }
            Err(e) => warn!(error = %e, line = %record.to_text_lossy(), "Child non-JSON"),
        }
    }
}

fn handle_transport_event(event: TransportEvent, process: &ProcessHandle) {
    match event {
        TransportEvent::Connected(client) => info!(client_id = %client, "Client connected"),
        TransportEvent::Disconnected(client) => info!(client_id = %client, "Client disconnected"),
        TransportEvent::Inbound(client, message) => {
            debug!(
                client_id = %client,
                id = message.id().map(tracing::field::display),
                "Client -> child"
            );
            let record = match codec::encode(&message) {
                Ok(record) => record,
                Err(e) => {
                    warn!(client_id = %client, error = %e, "Failed to encode client message");
                    return;
                }
            };
            if let Err(e) = process.write(record) {
                warn!(client_id = %client, error = %e, "Failed to write to child");
            }
        }
        TransportEvent::Error(e) => warn!(error = %e, "Transport error"),
    }
}

fn log_diagnostic(chunk: &[u8]) {
    for line in String::from_utf8_lossy(chunk).lines() {
        if !line.trim().is_empty() {
            info!(target: "linegate::child", "{}", line);
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
