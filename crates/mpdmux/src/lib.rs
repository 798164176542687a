//! Multiplexing client for the MPD control protocol
//!
//! MPD speaks a line-oriented, stateful protocol over TCP. A connection
//! blocked in `idle` cannot run other commands until it is interrupted with
//! `noidle`, so one socket cannot both watch for changes and answer
//! requests without careful coordination. [`MpdClient`] dedicates a
//! connection to each duty:
//!
//! - a **command connection** for synchronous request/response commands
//! - an **idle watcher** that long-polls every subsystem and fans changes out
//!   to [`IdleListener`]s
//! - a **subscription multiplexer** that watches the `message` subsystem and
//!   runs channel commands in between, handing the socket back and forth
//!
//! ## Example
//!
//! ```ignore
//! let client = MpdClient::connect("localhost", 6600).await?;
//! let mut messages = client.idle(["message"]);
//!
//! client.subscribe("chat").await?;
//! client.send_message("chat", "hello").await?;
//!
//! while messages.recv().await.is_ok() {
//!     for message in client.read_messages().await? {
//!         println!("{}: {}", message.channel, message.message);
//!     }
//! }
//!
//! client.close().await?;
//! ```

mod client;
mod commands;
mod connection;
mod error;
mod idle;
mod listeners;
mod protocol;
mod subscription;

pub use client::{ConnectOptions, MpdClient, DEFAULT_SHUTDOWN_TIMEOUT};
pub use commands::{sort_stickers, ChannelMessage, PlaylistInfo, SongSticker, STICKER_SONG_TYPE};
pub use error::{AckError, ClientError, ConnectionRole};
pub use listeners::{IdleListener, DEFAULT_CHANNEL_BUFFER};
pub use protocol::{parse_ack, parse_greeting, quote, read_frame, Info, Response, Version};
pub use subscription::{GateState, MESSAGE_SUBSYSTEM};
