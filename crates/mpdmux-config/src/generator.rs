//! Render a configuration back to KDL

use std::path::Path;

use crate::error::ConfigError;
use crate::model::Config;

/// Quote a value as a KDL string literal
fn kdl_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// Render a configuration as a KDL document that [`crate::parse_config_str`]
/// reads back to the same value.
pub fn render_config(config: &Config) -> String {
    let mut output = String::new();

    output.push_str("// mpdmux configuration\n");
    output.push_str("// MPD_HOST and MPD_PORT override the server block at runtime\n\n");

    output.push_str("global {\n");
    output.push_str(&format!(
        "    log-level {}\n",
        kdl_string(config.global.log_level.as_str())
    ));
    output.push_str("}\n\n");

    output.push_str("server {\n");
    output.push_str(&format!("    host {}\n", kdl_string(&config.server.host)));
    output.push_str(&format!("    port {}\n", config.server.port));
    match &config.server.password {
        Some(password) => {
            output.push_str(&format!("    password {}\n", kdl_string(password)));
        }
        None => output.push_str("    // password \"secret\"\n"),
    }
    output.push_str("}\n\n");

    output.push_str("keepalive {\n");
    output.push_str(&format!(
        "    interval-secs {}\n",
        config.keepalive.interval.as_secs()
    ));
    output.push_str("}\n");

    output
}

/// Make sure rendered output parses before it touches the disk
fn validate_kdl(content: &str) -> Result<(), ConfigError> {
    content.parse::<kdl::KdlDocument>().map_err(|e| ConfigError::Invalid {
        message: format!("Rendered KDL is invalid (this is a bug in mpdmux): {}", e),
    })?;
    Ok(())
}

/// Write a configuration file atomically.
///
/// The document is rendered, validated, written to a sibling temp file and
/// renamed over `path`. An existing file is left untouched on failure.
pub fn write_config(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let content = render_config(config);
    validate_kdl(&content)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Same directory so the rename stays on one filesystem
    let temp_path = path.with_extension("kdl.tmp");

    if let Err(e) = std::fs::write(&temp_path, &content) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e.into());
    }

    tracing::info!("Wrote configuration to {}", path.display());

    Ok(())
}
