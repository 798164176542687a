//! Idle watcher: a standing `idle` on its own connection

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::connection::{send_line, Connection, LineReader, LineWriter, CLOSE_COMMAND, NOIDLE_COMMAND};
use crate::error::{ClientError, LoopFailure};
use crate::listeners::ListenerRegistry;
use crate::protocol::{next_line, FrameBuilder};

const IDLE_COMMAND: &str = "idle";

/// Watch every subsystem until cancelled or the connection fails.
///
/// Changed subsystem names go to `events`. A transport failure is recorded
/// in `failure`, terminates `listeners` and ends the loop for good.
pub(crate) async fn run_idle_watcher(
    conn: Connection,
    events: mpsc::UnboundedSender<String>,
    listeners: ListenerRegistry,
    cancel: CancellationToken,
    failure: LoopFailure,
) {
    let (mut reader, mut writer) = conn.into_split();
    info!("Idle watcher started");

    match watch(&mut reader, &mut writer, &events, &cancel).await {
        Ok(()) => {
            if let Err(e) = send_line(&mut writer, CLOSE_COMMAND).await {
                debug!(error = %e, "Failed to send close on idle connection");
            }
            info!("Idle watcher stopped");
        }
        Err(e) => {
            error!(error = %e, "Idle watcher terminated");
            failure.record(e.to_string());
            listeners.terminate();
        }
    }
}

async fn watch(
    reader: &mut LineReader,
    writer: &mut LineWriter,
    events: &mpsc::UnboundedSender<String>,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        send_line(writer, IDLE_COMMAND).await?;
        debug!("Entered idle");

        let mut frame = FrameBuilder::default();
        let mut interrupted = false;
        let response = loop {
            tokio::select! {
                line = reader.next() => {
                    if let Some(outcome) = frame.push(next_line(line)?) {
                        break outcome?;
                    }
                }
                _ = cancel.cancelled(), if !interrupted => {
                    send_line(writer, NOIDLE_COMMAND).await?;
                    interrupted = true;
                }
            }
        };

        let mut changed = false;
        for subsystem in response.changed_subsystems() {
            debug!(subsystem, "Subsystem changed");
            changed = true;
            let _ = events.send(subsystem.to_string());
        }
        if !changed {
            debug!("Idle interrupted by noidle");
        }
    }
}
