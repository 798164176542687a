//! A single framed TCP connection to the daemon

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::debug;

use crate::error::ClientError;
use crate::protocol::{self, codec_io_error, next_line, quote, Response, Version, SUCCESS};

pub(crate) type LineReader = FramedRead<OwnedReadHalf, LinesCodec>;
pub(crate) type LineWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Politely ends a session; the server closes without replying
pub(crate) const CLOSE_COMMAND: &str = "close";

pub(crate) const NOIDLE_COMMAND: &str = "noidle";

/// Write one command line and flush it
pub(crate) async fn send_line(writer: &mut LineWriter, line: &str) -> Result<(), ClientError> {
    writer
        .send(line)
        .await
        .map_err(|e| ClientError::SendFailed(codec_io_error(e)))
}

/// A greeted, optionally authenticated connection
#[derive(Debug)]
pub(crate) struct Connection {
    reader: LineReader,
    writer: LineWriter,
    version: Version,
    local_port: u16,
}

impl Connection {
    /// Dial `addr`, read the greeting and authenticate when a password is given
    pub(crate) async fn open(addr: &str, password: Option<&str>) -> Result<Self, ClientError> {
        let socket = TcpStream::connect(addr)
            .await
            .map_err(|e| ClientError::ConnectionFailed {
                addr: addr.to_string(),
                source: e,
            })?;
        let local_port = socket.local_addr().map(|a| a.port()).unwrap_or_default();

        let (read_half, write_half) = socket.into_split();
        let mut reader = FramedRead::new(read_half, LinesCodec::new());
        let writer = FramedWrite::new(write_half, LinesCodec::new());

        let greeting = next_line(reader.next().await)?;
        let version = protocol::parse_greeting(&greeting)?;
        debug!(%addr, %version, "Connected");

        let mut conn = Self {
            reader,
            writer,
            version,
            local_port,
        };

        if let Some(password) = password {
            conn.authenticate(password).await?;
        }

        Ok(conn)
    }

    /// `password` must be answered by a bare `OK`
    async fn authenticate(&mut self, password: &str) -> Result<(), ClientError> {
        send_line(&mut self.writer, &format!("password {}", quote(password))).await?;

        let line = next_line(self.reader.next().await)?;
        if line != SUCCESS {
            return Err(ClientError::AuthenticationFailed { line });
        }
        Ok(())
    }

    pub(crate) fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Send one command and read its response frame
    pub(crate) async fn execute(&mut self, command: &str) -> Result<Response, ClientError> {
        send_line(&mut self.writer, command).await?;
        protocol::read_frame(&mut self.reader).await
    }

    /// Send `close` and drop the socket
    pub(crate) async fn close(mut self) -> Result<(), ClientError> {
        send_line(&mut self.writer, CLOSE_COMMAND).await
    }

    pub(crate) fn into_split(self) -> (LineReader, LineWriter) {
        (self.reader, self.writer)
    }
}

/// The connection reserved for synchronous commands.
///
/// No watch ever runs here; the mutex keeps concurrent callers from
/// interleaving their request/response pairs.
#[derive(Debug)]
pub(crate) struct CommandConnection {
    inner: Mutex<Option<Connection>>,
}

impl CommandConnection {
    pub(crate) fn new(conn: Connection) -> Self {
        Self {
            inner: Mutex::new(Some(conn)),
        }
    }

    pub(crate) async fn execute(&self, command: &str) -> Result<Response, ClientError> {
        let mut guard = self.inner.lock().await;
        let conn = guard.as_mut().ok_or(ClientError::Closed)?;
        debug!(command, "Executing");
        conn.execute(command).await
    }

    /// Send `close` once; later calls are no-ops
    pub(crate) async fn close(&self) -> Result<(), ClientError> {
        let conn = self.inner.lock().await.take();
        match conn {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}
