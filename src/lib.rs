// Divan - object-document mapping for CouchDB-style databases
// Models, revision-checked persistence and views over a REST API

#![warn(rust_2018_idioms)]

pub mod config;
pub mod database;
pub mod datum;
pub mod document;
pub mod model;
pub mod registry;
pub mod server;
pub mod transport;
pub mod validation;
pub mod views;

// Re-exports for convenience
pub use config::{DatabaseConfig, DivanConfig, ModelConfig, RecreatePolicy};
pub use database::{Ack, Database, DatabaseStats};
pub use datum::Datum;
pub use document::{Attributes, Document, DocumentState, SaveOutcome};
pub use model::{DeleteAllOptions, DocumentQuery, Model, ModelDefinition};
pub use registry::{Registry, RegistryBuilder};
pub use transport::{HttpTransport, MemoryTransport, Transport};
pub use validation::{Hook, Phase, Rejection, ValidationPipeline};
pub use views::{DesignDocument, ViewDefinition};

/// Field carrying the model name inside every stored document
pub const TYPE_FIELD: &str = "divan_type";

/// Divan error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Document update conflict: {id}")]
        DocumentConflict { id: String },

        #[error("Database not found: {0}")]
        DatabaseNotFound(String),

        #[error("Database already created: {0}")]
        DatabaseAlreadyCreated(String),

        #[error("Document {id} was deleted and this model does not recreate documents")]
        RecreateForbidden { id: String },

        #[error("Unknown model: {0}")]
        UnknownModel(String),

        #[error("Unknown database: {0}")]
        UnknownDatabase(String),

        #[error("Unknown view: {0}")]
        UnknownView(String),

        #[error("View not found: {0}")]
        ViewNotFound(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Transport error: {0}")]
        Transport(String),

        #[error("Serialization error: {0}")]
        Serialization(String),

        /// Rows of a bulk create refused by the server. The documents that
        /// were written are handed back with their ids and revisions.
        #[error(
            "Bulk write rejected {} of {} document(s)",
            .failures.len(),
            .failures.len() + .persisted.len()
        )]
        BulkWrite {
            failures: Vec<crate::database::BulkRow>,
            persisted: Vec<crate::document::Document>,
        },

        #[error("Server error {status}: {error} ({reason})")]
        Server {
            status: u16,
            error: String,
            reason: String,
        },

        #[error("Internal error: {0}")]
        Internal(String),
    }

    impl From<serde_json::Error> for Error {
        fn from(e: serde_json::Error) -> Self {
            Error::Serialization(e.to_string())
        }
    }

    impl From<reqwest::Error> for Error {
        fn from(e: reqwest::Error) -> Self {
            Error::Transport(e.to_string())
        }
    }

    impl From<config::ConfigError> for Error {
        fn from(e: config::ConfigError) -> Self {
            Error::Config(e.to_string())
        }
    }

    impl From<toml::de::Error> for Error {
        fn from(e: toml::de::Error) -> Self {
            Error::Config(e.to_string())
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_conflict_message_names_document() {
        let err = error::Error::DocumentConflict {
            id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "Document update conflict: abc");
    }
}
