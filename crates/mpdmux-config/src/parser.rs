//! KDL configuration parser

use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::*;

/// Parse a configuration file from the given path
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse configuration from a string
pub fn parse_config_str(content: &str) -> Result<Config, ConfigError> {
    let doc: kdl::KdlDocument = content.parse().map_err(|e: kdl::KdlError| {
        // kdl uses an older miette version, so we need to extract offset/len manually
        let offset = e.span.offset();
        let len = e.span.len();
        let span = miette::SourceSpan::from((offset, len));
        ConfigError::ParseError {
            src: content.to_string(),
            span,
            source: e,
        }
    })?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "global" => {
                config.global = parse_global(node)?;
            }
            "server" => {
                config.server = parse_server(node)?;
            }
            "keepalive" => {
                config.keepalive = parse_keepalive(node)?;
            }
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    Ok(config)
}

/// First argument of a node as a string, if present
fn string_arg<'a>(node: &'a kdl::KdlNode, field: &str) -> Result<Option<&'a str>, ConfigError> {
    match node.entries().first() {
        None => Ok(None),
        Some(entry) => entry
            .value()
            .as_string()
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: field.to_string(),
                message: format!("expected a string, got {}", entry.value()),
            }),
    }
}

/// First argument of a node as an integer, if present
fn integer_arg(node: &kdl::KdlNode, field: &str) -> Result<Option<i64>, ConfigError> {
    match node.entries().first() {
        None => Ok(None),
        Some(entry) => entry
            .value()
            .as_i64()
            .map(Some)
            .ok_or_else(|| ConfigError::InvalidValue {
                field: field.to_string(),
                message: format!("expected an integer, got {}", entry.value()),
            }),
    }
}

fn parse_global(node: &kdl::KdlNode) -> Result<GlobalConfig, ConfigError> {
    let mut global = GlobalConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "log-level" => {
                    if let Some(val) = string_arg(child, "log-level")? {
                        global.log_level = val.parse().map_err(|e| ConfigError::InvalidValue {
                            field: "log-level".to_string(),
                            message: e,
                        })?;
                    }
                }
                name => {
                    tracing::warn!("Unknown global config option: {}", name);
                }
            }
        }
    }

    Ok(global)
}

fn parse_server(node: &kdl::KdlNode) -> Result<ServerConfig, ConfigError> {
    let mut server = ServerConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "host" => match string_arg(child, "host")? {
                    Some(host) if !host.trim().is_empty() => server.host = host.to_string(),
                    _ => {
                        return Err(ConfigError::MissingField {
                            field: "server host (e.g., `host \"localhost\"`)".to_string(),
                        })
                    }
                },
                "port" => {
                    if let Some(port) = integer_arg(child, "port")? {
                        server.port = u16::try_from(port)
                            .ok()
                            .filter(|p| *p != 0)
                            .ok_or_else(|| ConfigError::InvalidValue {
                                field: "port".to_string(),
                                message: format!("{} is not a valid TCP port", port),
                            })?;
                    }
                }
                "password" => {
                    server.password = string_arg(child, "password")?
                        .filter(|p| !p.is_empty())
                        .map(str::to_string);
                }
                name => {
                    tracing::warn!("Unknown server config option: {}", name);
                }
            }
        }
    }

    Ok(server)
}

fn parse_keepalive(node: &kdl::KdlNode) -> Result<KeepaliveConfig, ConfigError> {
    let mut keepalive = KeepaliveConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "interval-secs" => {
                    if let Some(secs) = integer_arg(child, "interval-secs")? {
                        if secs <= 0 {
                            return Err(ConfigError::InvalidValue {
                                field: "interval-secs".to_string(),
                                message: "must be greater than zero".to_string(),
                            });
                        }
                        keepalive.interval = Duration::from_secs(secs as u64);
                    }
                }
                name => {
                    tracing::warn!("Unknown keepalive config option: {}", name);
                }
            }
        }
    }

    Ok(keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_config() {
        let config = r#"
            global {
                log-level "debug"
            }

            server {
                host "music.lan"
                port 6601
                password "hunter2"
            }

            keepalive {
                interval-secs 30
            }
        "#;

        let result = parse_config_str(config).unwrap();
        assert_eq!(result.global.log_level, LogLevel::Debug);
        assert_eq!(result.server.host, "music.lan");
        assert_eq!(result.server.port, 6601);
        assert_eq!(result.server.password.as_deref(), Some("hunter2"));
        assert_eq!(result.keepalive.interval, Duration::from_secs(30));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let result = parse_config_str("").unwrap();
        assert_eq!(result, Config::default());
        assert_eq!(result.server.port, DEFAULT_PORT);
        assert_eq!(
            result.keepalive.interval,
            Duration::from_secs(DEFAULT_KEEPALIVE_SECS)
        );
    }

    #[test]
    fn test_unknown_nodes_are_ignored() {
        let config = r#"
            playcount {
                threshold 10
            }
            server {
                host "localhost"
                colour "blue"
            }
        "#;

        let result = parse_config_str(config).unwrap();
        assert_eq!(result.server.host, "localhost");
    }

    #[test]
    fn test_port_out_of_range_fails() {
        let config = r#"
            server {
                port 70000
            }
        "#;

        let err = parse_config_str(config).unwrap_err();
        match err {
            ConfigError::InvalidValue { field, message } => {
                assert_eq!(field, "port");
                assert!(message.contains("70000"));
            }
            _ => panic!("Expected InvalidValue error, got: {:?}", err),
        }
    }

    #[test]
    fn test_port_as_string_fails() {
        let config = r#"
            server {
                port "6600"
            }
        "#;

        let err = parse_config_str(config).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "port"),
            "Expected InvalidValue for port, got: {:?}",
            err
        );
    }

    #[test]
    fn test_empty_host_fails() {
        let config = r#"
            server {
                host ""
            }
        "#;

        let err = parse_config_str(config).unwrap_err();
        match err {
            ConfigError::MissingField { field } => assert!(field.contains("host")),
            _ => panic!("Expected MissingField error, got: {:?}", err),
        }
    }

    #[test]
    fn test_zero_keepalive_interval_fails() {
        let config = r#"
            keepalive {
                interval-secs 0
            }
        "#;

        let err = parse_config_str(config).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_unknown_log_level_fails() {
        let config = r#"
            global {
                log-level "chatty"
            }
        "#;

        let err = parse_config_str(config).unwrap_err();
        match err {
            ConfigError::InvalidValue { message, .. } => assert!(message.contains("chatty")),
            _ => panic!("Expected InvalidValue error, got: {:?}", err),
        }
    }

    #[test]
    fn test_empty_password_means_none() {
        let config = r#"
            server {
                password ""
            }
        "#;

        let result = parse_config_str(config).unwrap();
        assert_eq!(result.server.password, None);
    }

    #[test]
    fn test_syntax_error_reports_span() {
        let config = "server {\n    host \"localhost\"\n";

        let err = parse_config_str(config).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_parse_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.kdl");
        std::fs::write(&path, "server {\n    port 6700\n}\n").unwrap();

        let config = parse_config(&path).unwrap();
        assert_eq!(config.server.port, 6700);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_config(&dir.path().join("absent.kdl")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
