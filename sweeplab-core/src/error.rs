//! Configuration-level errors. All of these are fatal before any run starts.

use std::path::PathBuf;

use thiserror::Error;

/// Schema violations: a path or value that does not fit the base configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("malformed config path '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    #[error("unknown config path '{path}'")]
    UnknownPath { path: String },

    #[error("config path '{path}' is a namespace, not a leaf")]
    NotALeaf { path: String },

    #[error("sweep axis '{path}' has no candidate values")]
    EmptyAxis { path: String },

    #[error("sweep axis '{path}' lists value '{value}' more than once")]
    DuplicateValue { path: String, value: String },

    #[error("invalid value at '{path}': expected {expected}, found {found}")]
    InvalidValue {
        path: String,
        expected: String,
        found: String,
    },

    #[error("malformed config document: {0}")]
    MalformedDocument(String),
}

/// Errors from reading or writing configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error in {path}: {message}")]
    Yaml { path: PathBuf, message: String },

    #[error("TOML error in {path}: {message}")]
    Toml { path: PathBuf, message: String },

    #[error("unsupported config format '{0}' (expected .yaml, .yml or .toml)")]
    UnsupportedFormat(String),

    #[error("schema error in {path}: {source}")]
    Schema {
        path: PathBuf,
        #[source]
        source: SchemaError,
    },
}
