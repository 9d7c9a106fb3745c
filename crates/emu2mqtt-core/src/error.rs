//! Error taxonomy for the bridge.
//!
//! Per-message errors (`FrameError`, `MappingError`) are contained at the
//! pipeline stage that detects them and never unwind past the decode/map
//! boundary. `LinkError` always resolves to a link-state transition, never
//! a process exit. Only `ConfigError` is fatal, and only at startup.

use thiserror::Error;

/// Errors produced by the frame decoder.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// A frame grew past the maximum size without a closing tag.
    /// The span is discarded and decoding resynchronizes.
    #[error("frame exceeded {limit} bytes without a closing tag")]
    Oversized { limit: usize },
}

/// Errors produced while mapping a raw frame to a device event.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MappingError {
    /// The frame's root tag is not part of the known variant set.
    #[error("unrecognized response tag: {0}")]
    Unrecognized(String),

    /// A field required for the frame's variant is absent.
    #[error("{tag} response missing required field {field}")]
    MissingField {
        tag: &'static str,
        field: &'static str,
    },

    /// A field was present but could not be converted.
    #[error("{tag} field {field} has invalid value {value:?}")]
    InvalidValue {
        tag: &'static str,
        field: &'static str,
        value: String,
    },

    /// The frame is not well-formed XML.
    #[error("malformed XML: {0}")]
    Xml(String),
}

/// Result type for mapper operations.
pub type MapResult<T> = std::result::Result<T, MappingError>;

/// I/O failures on either link. Recoverable: triggers backoff/reconnect.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Serial device error (open or read/write).
    #[error("serial link error: {0}")]
    Serial(String),

    /// MQTT broker error (connect, subscribe, or event loop).
    #[error("mqtt link error: {0}")]
    Mqtt(String),

    /// A connect attempt ran past its bounded timeout.
    #[error("connect attempt timed out after {0:?}")]
    ConnectTimeout(std::time::Duration),
}

/// Missing or invalid required configuration. Fatal at startup only.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}
