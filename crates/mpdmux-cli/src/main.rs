//! mpdmux CLI
//!
//! Command-line front end for the mpdmux client library.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use mpdmux::{ClientError, MpdClient, MESSAGE_SUBSYSTEM, STICKER_SONG_TYPE};
use mpdmux_config::Config;
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "mpdmux")]
#[command(about = "Multiplexing MPD client")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/mpdmux/config.kdl")]
    config: String,

    /// Daemon host (overrides config and MPD_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Daemon port (overrides config and MPD_PORT)
    #[arg(long)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show player status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the current song
    CurrentSong {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that the daemon answers
    Ping,

    /// Print subsystem changes until interrupted
    Watch {
        /// Subsystems to watch (default: all)
        subsystems: Vec<String>,
    },

    /// Subscribe to a channel and print its messages until interrupted
    Subscribe { channel: String },

    /// Send a message to a channel
    Send { channel: String, text: String },

    /// List channels with subscribers
    Channels,

    /// Read or write song stickers
    Sticker {
        #[command(subcommand)]
        command: StickerCommands,
    },

    /// List stored playlists
    Playlists {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the songs of a stored playlist
    Playlist { name: String },

    /// Validate the configuration file
    Validate,

    /// Write a default configuration file
    Init {
        /// Output path (defaults to --config)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum StickerCommands {
    /// Print one sticker value
    Get { uri: String, name: String },

    /// Set a sticker value
    Set {
        uri: String,
        name: String,
        value: String,
    },

    /// Find a sticker on every song under a directory
    Find {
        uri: String,
        name: String,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    // Expand tilde in config path
    let config_path: PathBuf = shellexpand::tilde(&cli.config).into_owned().into();

    match cli.command {
        Commands::Validate => return cmd_validate(&config_path),
        Commands::Init { output, force } => {
            return cmd_init(output.as_deref().unwrap_or(&config_path), force)
        }
        _ => {}
    }

    let mut config = load_config(&config_path)?;
    if let Some(host) = &cli.host {
        config.server.apply_host_override(host);
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_tracing(&config);
    tracing::debug!(address = %config.server.address(), "Using server");

    let client = MpdClient::from_config(&config).await.into_diagnostic()?;
    let result = run(&client, cli.command).await;
    client.close().await.into_diagnostic()?;
    result
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(config: &Config) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(config.global.log_level.as_str())
            }),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Parse the config file if there is one, then apply MPD_HOST/MPD_PORT
fn load_config(path: &Path) -> miette::Result<Config> {
    let config = if path.exists() {
        mpdmux_config::parse_config(path)?
    } else {
        Config::default()
    };
    Ok(config.with_env_overrides())
}

async fn run(client: &MpdClient, command: Commands) -> miette::Result<()> {
    match command {
        Commands::Status { json } => {
            let info = client.status().await.into_diagnostic()?;
            print_info(&info, json)
        }
        Commands::CurrentSong { json } => {
            let info = client.current_song().await.into_diagnostic()?;
            print_info(&info, json)
        }
        Commands::Ping => {
            client.ping().await.into_diagnostic()?;
            println!("OK (MPD {})", client.protocol_version());
            Ok(())
        }
        Commands::Watch { subsystems } => cmd_watch(client, subsystems).await,
        Commands::Subscribe { channel } => cmd_subscribe(client, &channel).await,
        Commands::Send { channel, text } => {
            client.send_message(&channel, &text).await.into_diagnostic()
        }
        Commands::Channels => {
            for channel in client.channels().await.into_diagnostic()? {
                println!("{}", channel);
            }
            Ok(())
        }
        Commands::Sticker { command } => cmd_sticker(client, command).await,
        Commands::Playlists { json } => {
            let playlists = client.list_playlists().await.into_diagnostic()?;
            if json {
                return print_json(&playlists);
            }
            for playlist in playlists {
                match playlist.last_modified {
                    Some(modified) => println!("{}  ({})", playlist.name, modified),
                    None => println!("{}", playlist.name),
                }
            }
            Ok(())
        }
        Commands::Playlist { name } => {
            for song in client.list_playlist(&name).await.into_diagnostic()? {
                println!("{}", song);
            }
            Ok(())
        }
        Commands::Validate | Commands::Init { .. } => Ok(()),
    }
}

fn print_json<T: Serialize>(value: &T) -> miette::Result<()> {
    let json = serde_json::to_string_pretty(value).into_diagnostic()?;
    println!("{}", json);
    Ok(())
}

fn print_info(info: &mpdmux::Info, json: bool) -> miette::Result<()> {
    if json {
        return print_json(info);
    }
    for (key, value) in info.iter() {
        println!("{}: {}", key, value);
    }
    Ok(())
}

async fn cmd_watch(client: &MpdClient, subsystems: Vec<String>) -> miette::Result<()> {
    let mut listener = client.idle(subsystems);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.into_diagnostic()?;
                break;
            }
            changed = listener.recv() => match changed {
                Ok(subsystem) => println!("changed: {}", subsystem),
                Err(ClientError::Closed) => break,
                Err(e) => return Err(e).into_diagnostic(),
            },
        }
    }

    listener.close();
    Ok(())
}

async fn cmd_subscribe(client: &MpdClient, channel: &str) -> miette::Result<()> {
    let mut listener = client.idle([MESSAGE_SUBSYSTEM]);
    client.subscribe(channel).await.into_diagnostic()?;
    eprintln!("Subscribed to {}, press Ctrl-C to stop", channel);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.into_diagnostic()?;
                break;
            }
            changed = listener.recv() => {
                match changed {
                    Ok(_) => {}
                    Err(ClientError::Closed) => break,
                    Err(e) => return Err(e).into_diagnostic(),
                }
                for message in client.read_messages().await.into_diagnostic()? {
                    println!("[{}] {}", message.channel, message.message);
                }
            }
        }
    }

    listener.close();
    client.unsubscribe(channel).await.into_diagnostic()
}

async fn cmd_sticker(client: &MpdClient, command: StickerCommands) -> miette::Result<()> {
    match command {
        StickerCommands::Get { uri, name } => {
            match client
                .sticker_get(STICKER_SONG_TYPE, &uri, &name)
                .await
                .into_diagnostic()?
            {
                Some(value) => println!("{}", value),
                None => eprintln!("No sticker {} on {}", name, uri),
            }
            Ok(())
        }
        StickerCommands::Set { uri, name, value } => client
            .sticker_set(STICKER_SONG_TYPE, &uri, &name, &value)
            .await
            .into_diagnostic(),
        StickerCommands::Find { uri, name, json } => {
            let mut stickers = client
                .sticker_find(STICKER_SONG_TYPE, &uri, &name)
                .await
                .into_diagnostic()?;
            mpdmux::sort_stickers(&mut stickers);
            if json {
                return print_json(&stickers);
            }
            for sticker in stickers {
                println!("{}\t{}={}", sticker.uri, sticker.name, sticker.value);
            }
            Ok(())
        }
    }
}

fn cmd_validate(config_path: &Path) -> miette::Result<()> {
    println!("Validating configuration: {}", config_path.display());

    let config = mpdmux_config::parse_config(config_path)?;
    println!("Configuration is valid!");
    println!("  Server: {}", config.server.address());
    println!(
        "  Password: {}",
        if config.server.password.is_some() {
            "set"
        } else {
            "none"
        }
    );
    println!("  Keep-alive: every {}s", config.keepalive.interval.as_secs());
    println!("  Log level: {}", config.global.log_level.as_str());
    Ok(())
}

fn cmd_init(path: &Path, force: bool) -> miette::Result<()> {
    if path.exists() && !force {
        return Err(miette::miette!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }

    mpdmux_config::write_config(&Config::default(), path)?;
    println!("Wrote default configuration: {}", path.display());
    Ok(())
}
