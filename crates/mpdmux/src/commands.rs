//! Typed wrappers over the raw command primitives
//!
//! Stateless commands go through [`MpdClient::execute`]. Channel commands go
//! through [`MpdClient::execute_subscription_command`] because a
//! subscription belongs to the connection that made it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::client::MpdClient;
use crate::error::ClientError;
use crate::protocol::{quote, split_pair, Info, Response};

/// Sticker type for songs
pub const STICKER_SONG_TYPE: &str = "song";

/// A sticker attached to a song
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SongSticker {
    pub uri: String,
    pub name: String,
    pub value: String,
}

/// Sort stickers by name, then numerically by value.
///
/// Values that are not integers sort before numeric ones and keep their
/// relative order.
pub fn sort_stickers(stickers: &mut [SongSticker]) {
    stickers.sort_by_cached_key(|s| (s.name.clone(), s.value.trim().parse::<i64>().ok()));
}

/// A stored playlist
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistInfo {
    pub name: String,
    /// `None` when missing or not a valid RFC 3339 time
    pub last_modified: Option<DateTime<Utc>>,
}

/// A message read from a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelMessage {
    pub channel: String,
    pub message: String,
}

/// Build a command line from a name and quoted arguments
fn command(name: &str, args: &[&str]) -> String {
    let mut line = name.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&quote(arg));
    }
    line
}

/// The value of a `key: value` line whose key must be `expected`
fn expect_field<'a>(line: &'a str, expected: &str) -> Result<&'a str, ClientError> {
    match split_pair(line)? {
        (key, value) if key == expected => Ok(value),
        _ => Err(ClientError::Parse {
            line: line.to_string(),
        }),
    }
}

/// Split `name=value` from a `sticker:` line
fn sticker_pair(line: &str) -> Result<(&str, &str), ClientError> {
    expect_field(line, "sticker")?
        .split_once('=')
        .ok_or_else(|| ClientError::Parse {
            line: line.to_string(),
        })
}

/// Parse a `Last-Modified` value such as `2013-06-01T20:15:00Z`
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

fn parse_stickers(response: &Response) -> Result<Vec<SongSticker>, ClientError> {
    let mut stickers = Vec::new();
    let mut uri: Option<&str> = None;

    for line in &response.lines {
        match split_pair(line)?.0 {
            "file" => uri = Some(expect_field(line, "file")?),
            "sticker" => {
                let file = uri.take().ok_or_else(|| ClientError::Parse {
                    line: line.clone(),
                })?;
                let (name, value) = sticker_pair(line)?;
                stickers.push(SongSticker {
                    uri: file.to_string(),
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
            _ => {
                return Err(ClientError::Parse {
                    line: line.clone(),
                })
            }
        }
    }

    Ok(stickers)
}

fn parse_playlists(response: &Response) -> Result<Vec<PlaylistInfo>, ClientError> {
    let mut playlists: Vec<PlaylistInfo> = Vec::new();

    for line in &response.lines {
        match split_pair(line)? {
            ("playlist", name) => playlists.push(PlaylistInfo {
                name: name.to_string(),
                last_modified: None,
            }),
            ("Last-Modified", value) => {
                let playlist = playlists.last_mut().ok_or_else(|| ClientError::Parse {
                    line: line.clone(),
                })?;
                playlist.last_modified = parse_timestamp(value);
            }
            _ => {
                return Err(ClientError::Parse {
                    line: line.clone(),
                })
            }
        }
    }

    Ok(playlists)
}

fn parse_messages(response: &Response) -> Result<Vec<ChannelMessage>, ClientError> {
    let mut messages = Vec::new();
    let mut lines = response.lines.iter();

    while let Some(channel_line) = lines.next() {
        let channel = expect_field(channel_line, "channel")?;
        let message_line = lines.next().ok_or_else(|| ClientError::Parse {
            line: channel_line.clone(),
        })?;
        messages.push(ChannelMessage {
            channel: channel.to_string(),
            message: expect_field(message_line, "message")?.to_string(),
        });
    }

    Ok(messages)
}

fn parse_values(response: &Response, key: &str) -> Result<Vec<String>, ClientError> {
    response
        .lines
        .iter()
        .map(|line| expect_field(line, key).map(str::to_string))
        .collect()
}

impl MpdClient {
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.execute("ping").await.map(drop)
    }

    pub async fn status(&self) -> Result<Info, ClientError> {
        self.execute("status").await?.to_info()
    }

    pub async fn current_song(&self) -> Result<Info, ClientError> {
        self.execute("currentsong").await?.to_info()
    }

    /// Read one sticker; `None` when it is not set
    pub async fn sticker_get(
        &self,
        sticker_type: &str,
        uri: &str,
        name: &str,
    ) -> Result<Option<String>, ClientError> {
        let response = match self
            .execute(&command("sticker get", &[sticker_type, uri, name]))
            .await
        {
            Ok(response) => response,
            Err(ClientError::Ack(ack)) if ack.message.contains("no such sticker") => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        match response.lines.first() {
            Some(line) => Ok(Some(sticker_pair(line)?.1.to_string())),
            None => Ok(None),
        }
    }

    pub async fn sticker_set(
        &self,
        sticker_type: &str,
        uri: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ClientError> {
        self.execute(&command("sticker set", &[sticker_type, uri, name, value]))
            .await
            .map(drop)
    }

    /// Every sticker called `name` on resources under `uri`
    pub async fn sticker_find(
        &self,
        sticker_type: &str,
        uri: &str,
        name: &str,
    ) -> Result<Vec<SongSticker>, ClientError> {
        let response = self
            .execute(&command("sticker find", &[sticker_type, uri, name]))
            .await?;
        parse_stickers(&response)
    }

    pub async fn list_playlists(&self) -> Result<Vec<PlaylistInfo>, ClientError> {
        let response = self.execute("listplaylists").await?;
        parse_playlists(&response)
    }

    /// Save the queue as a stored playlist
    pub async fn save(&self, name: &str) -> Result<(), ClientError> {
        self.execute(&command("save", &[name])).await.map(drop)
    }

    /// Delete a stored playlist
    pub async fn rm(&self, name: &str) -> Result<(), ClientError> {
        self.execute(&command("rm", &[name])).await.map(drop)
    }

    pub async fn playlist_clear(&self, name: &str) -> Result<(), ClientError> {
        self.execute(&command("playlistclear", &[name]))
            .await
            .map(drop)
    }

    /// Song URIs in a stored playlist
    pub async fn list_playlist(&self, name: &str) -> Result<Vec<String>, ClientError> {
        let response = self.execute(&command("listplaylist", &[name])).await?;
        parse_values(&response, "file")
    }

    pub async fn playlist_add(&self, name: &str, uri: &str) -> Result<(), ClientError> {
        self.execute(&command("playlistadd", &[name, uri]))
            .await
            .map(drop)
    }

    pub async fn subscribe(&self, channel: &str) -> Result<(), ClientError> {
        self.execute_subscription_command(&command("subscribe", &[channel]))
            .await
            .map(drop)
    }

    pub async fn unsubscribe(&self, channel: &str) -> Result<(), ClientError> {
        self.execute_subscription_command(&command("unsubscribe", &[channel]))
            .await
            .map(drop)
    }

    /// Messages waiting on this client's subscribed channels
    pub async fn read_messages(&self) -> Result<Vec<ChannelMessage>, ClientError> {
        let response = self.execute_subscription_command("readmessages").await?;
        parse_messages(&response)
    }

    /// Channels that currently have at least one subscriber
    pub async fn channels(&self) -> Result<Vec<String>, ClientError> {
        let response = self.execute_subscription_command("channels").await?;
        parse_values(&response, "channel")
    }

    pub async fn send_message(&self, channel: &str, text: &str) -> Result<(), ClientError> {
        self.execute_subscription_command(&command("sendmessage", &[channel, text]))
            .await
            .map(drop)
    }
}
