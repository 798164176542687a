//! Configuration parsing for mpdmux
//!
//! This crate handles parsing KDL configuration files, applying the
//! conventional `MPD_HOST`/`MPD_PORT` environment overrides and rendering
//! a configuration back to KDL.

mod error;
mod generator;
mod model;
mod parser;

pub use error::ConfigError;
pub use generator::{render_config, write_config};
pub use model::*;
pub use parser::{parse_config, parse_config_str};
