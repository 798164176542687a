//! Subscription multiplexer
//!
//! One connection serves two duties on a timeshare basis: a standing
//! `idle message` watch, and the channel commands (`subscribe`,
//! `sendmessage`, `readmessages`, ...) whose results depend on that same
//! connection's subscriptions.
//!
//! ## Architecture
//!
//! ```text
//! +---------+  (command, reply)  +-------+      +----------+      +--------+
//! | callers | -----------------> | queue | ---> | mux task | <--> | socket |
//! +---------+                    +-------+      +----------+      +--------+
//!      ^                                          |      |
//!      +--------------- oneshot reply ------------+      +--> dispatcher
//! ```
//!
//! The mux task is the only reader and the only writer of its socket. While
//! watching it races the line stream against the request queue and the
//! cancellation token. A request interrupts the watch with `noidle`; the
//! task drains the rest of the idle response (dispatching any change that
//! raced in), runs the command, replies, and re-enters the watch.
//!
//! The gate state is published on a `watch` channel so `close` can wait
//! for an in-flight command to finish.

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::connection::{send_line, Connection, LineReader, LineWriter, CLOSE_COMMAND, NOIDLE_COMMAND};
use crate::error::{ClientError, ConnectionRole, LoopFailure};
use crate::protocol::{next_line, read_frame, FrameBuilder, Response};

/// The subsystem this connection watches
pub const MESSAGE_SUBSYSTEM: &str = "message";

const IDLE_MESSAGE_COMMAND: &str = "idle message";

/// Commands waiting for their turn on the connection
const REQUEST_QUEUE_SIZE: usize = 32;

/// What the multiplexed connection is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Blocked in `idle message`
    Watching,
    /// Running a command, or between two watches
    Executing,
    /// The task has exited
    Stopped,
}

#[derive(Debug)]
struct MuxRequest {
    command: String,
    reply: oneshot::Sender<Result<Response, ClientError>>,
}

/// Caller side of the multiplexer; cheap to clone
#[derive(Debug, Clone)]
pub(crate) struct MuxHandle {
    requests: mpsc::Sender<MuxRequest>,
    state: watch::Receiver<GateState>,
    failure: LoopFailure,
}

impl MuxHandle {
    /// Run `command` on the multiplexed connection.
    ///
    /// Commands from concurrent callers run one at a time, in queue order.
    pub(crate) async fn execute(&self, command: &str) -> Result<Response, ClientError> {
        if let Some(e) = self.failure.error() {
            return Err(e);
        }

        let (reply, response) = oneshot::channel();
        let request = MuxRequest {
            command: command.to_string(),
            reply,
        };

        if self.requests.send(request).await.is_err() {
            return Err(self.stopped_error().await);
        }

        match response.await {
            Ok(result) => result,
            Err(_) => Err(self.stopped_error().await),
        }
    }

    /// Why the task went away, once it has finished going away
    async fn stopped_error(&self) -> ClientError {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == GateState::Stopped).await;
        self.failure.error_or_closed()
    }

    pub(crate) fn state(&self) -> GateState {
        *self.state.borrow()
    }

    /// Wait until no command is in flight
    pub(crate) async fn wait_until_idle(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s != GateState::Executing).await;
    }

    pub(crate) fn failure(&self) -> &LoopFailure {
        &self.failure
    }
}

/// The task side, consumed by [`SubscriptionMux::run`]
#[derive(Debug)]
pub(crate) struct SubscriptionMux {
    conn: Connection,
    requests: mpsc::Receiver<MuxRequest>,
    state: watch::Sender<GateState>,
    events: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    failure: LoopFailure,
}

impl SubscriptionMux {
    pub(crate) fn new(
        conn: Connection,
        events: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> (Self, MuxHandle) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        let (state_tx, state_rx) = watch::channel(GateState::Executing);
        let failure = LoopFailure::new(ConnectionRole::SubscriptionMux);

        let handle = MuxHandle {
            requests: request_tx,
            state: state_rx,
            failure: failure.clone(),
        };
        let mux = Self {
            conn,
            requests: request_rx,
            state: state_tx,
            events,
            cancel,
            failure,
        };
        (mux, handle)
    }

    pub(crate) async fn run(self) {
        let Self {
            conn,
            mut requests,
            state,
            events,
            cancel,
            failure,
        } = self;
        let (mut reader, mut writer) = conn.into_split();
        info!("Subscription multiplexer started");

        let outcome = multiplex(
            &mut reader,
            &mut writer,
            &mut requests,
            &state,
            &events,
            &cancel,
        )
        .await;

        match outcome {
            Ok(()) => {
                if let Err(e) = send_line(&mut writer, CLOSE_COMMAND).await {
                    debug!(error = %e, "Failed to send close on subscription connection");
                }
                info!("Subscription multiplexer stopped");
            }
            Err(e) => {
                let reason = match e {
                    ClientError::LoopTerminated { reason, .. } => reason,
                    other => other.to_string(),
                };
                error!(%reason, "Subscription multiplexer terminated");
                failure.record(reason);
            }
        }

        // Failure is recorded before Stopped is published and before the
        // queue is dropped, so every waiting caller sees it
        state.send_replace(GateState::Stopped);
        drop(requests);
    }
}

async fn multiplex(
    reader: &mut LineReader,
    writer: &mut LineWriter,
    requests: &mut mpsc::Receiver<MuxRequest>,
    state: &watch::Sender<GateState>,
    events: &mpsc::UnboundedSender<String>,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    loop {
        // Serve whatever queued up while we were busy before watching again
        while let Ok(request) = requests.try_recv() {
            state.send_replace(GateState::Executing);
            serve(reader, writer, request).await?;
        }

        if cancel.is_cancelled() {
            return Ok(());
        }

        send_line(writer, IDLE_MESSAGE_COMMAND).await?;
        state.send_replace(GateState::Watching);
        debug!("Watching for messages");

        let mut frame = FrameBuilder::default();
        let mut pending = None;
        let mut interrupted = false;
        let mut stopping = false;

        let response = loop {
            tokio::select! {
                line = reader.next() => {
                    if let Some(outcome) = frame.push(next_line(line)?) {
                        break outcome?;
                    }
                }
                request = requests.recv(), if !interrupted => {
                    state.send_replace(GateState::Executing);
                    send_line(writer, NOIDLE_COMMAND).await?;
                    interrupted = true;
                    match request {
                        Some(request) => pending = Some(request),
                        None => stopping = true,
                    }
                }
                _ = cancel.cancelled(), if !interrupted => {
                    state.send_replace(GateState::Executing);
                    send_line(writer, NOIDLE_COMMAND).await?;
                    interrupted = true;
                    stopping = true;
                }
            }
        };
        state.send_replace(GateState::Executing);

        for subsystem in response.changed_subsystems() {
            debug!(subsystem, "Subsystem changed");
            let _ = events.send(subsystem.to_string());
        }

        if let Some(request) = pending {
            serve(reader, writer, request).await?;
        }

        if stopping {
            return Ok(());
        }
    }
}

/// Run one queued command and reply to its caller.
///
/// Protocol errors go back to the caller only. A transport or framing
/// failure goes to the caller and also ends the loop.
async fn serve(
    reader: &mut LineReader,
    writer: &mut LineWriter,
    request: MuxRequest,
) -> Result<(), ClientError> {
    debug!(command = %request.command, "Executing subscription command");

    let result = match send_line(writer, &request.command).await {
        Ok(()) => read_frame(reader).await,
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.desyncs_connection() => {
            let reason = e.to_string();
            let _ = request.reply.send(Err(e));
            Err(ClientError::LoopTerminated {
                role: ConnectionRole::SubscriptionMux,
                reason,
            })
        }
        other => {
            let _ = request.reply.send(other);
            Ok(())
        }
    }
}
