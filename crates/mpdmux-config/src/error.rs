use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Failed to parse KDL")]
    #[diagnostic(code(mpdmux::config::parse_error))]
    ParseError {
        #[source_code]
        src: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source]
        source: kdl::KdlError,
    },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(mpdmux::config::invalid))]
    Invalid { message: String },

    #[error("Invalid value for `{field}`: {message}")]
    #[diagnostic(code(mpdmux::config::invalid_value))]
    InvalidValue { field: String, message: String },

    #[error("Missing required field: {field}")]
    #[diagnostic(code(mpdmux::config::missing_field))]
    MissingField { field: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
