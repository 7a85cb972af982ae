//! Database handle
//!
//! One named database on the server. Lifecycle operations (create, delete,
//! exists, stats), view publishing, and the raw document primitives the
//! model layer is built on. Status codes are translated into the error
//! taxonomy here and nowhere else:
//!
//! - 404 with "Database does not exist." → `DatabaseNotFound`
//! - 412 on create → `DatabaseAlreadyCreated`
//! - 409 on a document write → `DocumentConflict`
//! - 404 on a document read or delete → `None`

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::transport::{HttpTransport, Request, Response, Transport};
use crate::views::DesignDocument;

/// Server acknowledgement of a write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
}

/// Database information as reported by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub db_name: String,
    #[serde(default)]
    pub doc_count: u64,
    #[serde(default)]
    pub doc_del_count: u64,
    /// Numeric on older servers, an opaque string on newer ones
    #[serde(default)]
    pub update_seq: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One row of a `_bulk_docs` reply
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BulkRow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub rev: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl BulkRow {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_conflict(&self) -> bool {
        self.error.as_deref() == Some("conflict")
    }
}

/// Options for a view query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewParams {
    pub key: Option<Value>,
    pub limit: Option<usize>,
    pub include_docs: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ViewRow {
    #[serde(default)]
    pub id: String,
    pub key: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub doc: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ViewResult {
    #[serde(default)]
    pub total_rows: u64,
    #[serde(default)]
    pub offset: u64,
    pub rows: Vec<ViewRow>,
}

/// Handle on one database
pub struct Database {
    key: String,
    config: DatabaseConfig,
    transport: Arc<dyn Transport>,
    designs: Vec<DesignDocument>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("key", &self.key)
            .field("db_name", &self.db_name())
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("designs", &self.designs.len())
            .finish()
    }
}

impl Database {
    /// Handle talking HTTP to the configured server
    pub fn new(key: impl Into<String>, config: DatabaseConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Ok(Self::with_transport(key, config, transport))
    }

    pub fn with_transport(
        key: impl Into<String>,
        config: DatabaseConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            key: key.into(),
            config,
            transport,
            designs: Vec::new(),
        }
    }

    /// Attach the design documents published by `create_views`
    pub fn with_designs(mut self, designs: Vec<DesignDocument>) -> Self {
        self.designs = designs;
        self
    }

    /// Logical name used by the registry
    pub fn name(&self) -> &str {
        &self.key
    }

    /// Server-side database name
    pub fn db_name(&self) -> &str {
        self.config.database.as_deref().unwrap_or(&self.key)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn designs(&self) -> &[DesignDocument] {
        &self.designs
    }

    fn request(&self, request: Request) -> Request {
        Request {
            segments: std::iter::once(self.db_name().to_string())
                .chain(request.segments)
                .collect(),
            ..request
        }
    }

    async fn send(&self, request: Request) -> Result<Response> {
        self.transport.send(self.request(request)).await
    }

    fn failure(&self, response: &Response, id: Option<&str>) -> Error {
        if response.status == 404 && is_missing_database(response) {
            return Error::DatabaseNotFound(self.db_name().to_string());
        }
        if response.status == 409 {
            if let Some(id) = id {
                return Error::DocumentConflict { id: id.to_string() };
            }
        }
        Error::Server {
            status: response.status,
            error: response.error().to_string(),
            reason: response.reason().to_string(),
        }
    }

    // ===== Lifecycle =====

    /// Create the database on the server
    #[instrument(skip(self), fields(database = %self.db_name()))]
    pub async fn create(&self) -> Result<Ack> {
        let response = self.send(Request::put()).await?;
        match response.status {
            201 | 202 => {
                info!("Database created");
                Ok(serde_json::from_value(response.body)?)
            }
            412 => Err(Error::DatabaseAlreadyCreated(self.db_name().to_string())),
            _ => Err(self.failure(&response, None)),
        }
    }

    /// Drop the database and every document in it
    #[instrument(skip(self), fields(database = %self.db_name()))]
    pub async fn delete(&self) -> Result<Ack> {
        let response = self.send(Request::delete()).await?;
        match response.status {
            200 | 202 => {
                info!("Database deleted");
                Ok(serde_json::from_value(response.body)?)
            }
            404 => Err(Error::DatabaseNotFound(self.db_name().to_string())),
            _ => Err(self.failure(&response, None)),
        }
    }

    /// Whether the database exists; never fails
    #[instrument(skip(self), fields(database = %self.db_name()))]
    pub async fn exists(&self) -> bool {
        match self.send(Request::get()).await {
            Ok(response) => response.is_success(),
            Err(e) => {
                warn!(error = %e, "Existence probe failed");
                false
            }
        }
    }

    #[instrument(skip(self), fields(database = %self.db_name()))]
    pub async fn stats(&self) -> Result<DatabaseStats> {
        let response = self.send(Request::get()).await?;
        match response.status {
            200 => Ok(serde_json::from_value(response.body)?),
            404 => Err(Error::DatabaseNotFound(self.db_name().to_string())),
            _ => Err(self.failure(&response, None)),
        }
    }

    /// Publish the design documents of every model bound to this database
    #[instrument(skip(self), fields(database = %self.db_name()))]
    pub async fn create_views(&self) -> Result<Vec<Ack>> {
        let mut acks = Vec::with_capacity(self.designs.len());
        for design in &self.designs {
            acks.push(self.publish_design(design).await?);
        }
        info!(designs = acks.len(), "Views published");
        Ok(acks)
    }

    /// Create or replace one design document. Unchanged views are left alone.
    pub async fn publish_design(&self, design: &DesignDocument) -> Result<Ack> {
        let id = design.id();
        let current = self.get_document(&id).await?;
        let current_rev = current
            .as_ref()
            .and_then(|doc| doc.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let body = design.to_json(current_rev.as_deref());
        if let Some(current) = &current {
            if current.get("views") == body.get("views") {
                debug!(design = %id, "Design document unchanged");
                return Ok(Ack {
                    ok: true,
                    id: Some(id),
                    rev: current_rev,
                });
            }
        }

        self.save_document(Some(&id), body).await
    }

    // ===== Documents =====

    /// Fetch a document; `None` when it is missing or deleted
    #[instrument(skip(self), fields(database = %self.db_name()))]
    pub async fn get_document(&self, id: &str) -> Result<Option<Value>> {
        let response = self.send(Request::get().doc_id(id)).await?;
        match response.status {
            200 => Ok(Some(response.body)),
            404 if !is_missing_database(&response) => Ok(None),
            _ => Err(self.failure(&response, Some(id))),
        }
    }

    /// Write a document. `PUT` at `id` when given, otherwise `POST` and let
    /// the server assign one. A `_rev` in `body` is the revision being
    /// replaced.
    #[instrument(skip(self, body), fields(database = %self.db_name()))]
    pub async fn save_document(&self, id: Option<&str>, body: Value) -> Result<Ack> {
        let request = match id {
            Some(id) => Request::put().doc_id(id),
            None => Request::post(),
        };
        let response = self.send(request.json(body)).await?;
        match response.status {
            200..=202 => Ok(serde_json::from_value(response.body)?),
            _ => {
                let id = id.unwrap_or_default();
                Err(self.failure(&response, Some(id)))
            }
        }
    }

    /// Delete one revision; `None` when there was nothing to delete
    #[instrument(skip(self), fields(database = %self.db_name()))]
    pub async fn delete_document(&self, id: &str, rev: &str) -> Result<Option<Ack>> {
        let response = self
            .send(Request::delete().doc_id(id).param("rev", rev))
            .await?;
        match response.status {
            200 | 202 => Ok(Some(serde_json::from_value(response.body)?)),
            404 if !is_missing_database(&response) => Ok(None),
            _ => Err(self.failure(&response, Some(id))),
        }
    }

    /// Write many documents in one request
    #[instrument(skip(self, docs), fields(database = %self.db_name(), count = docs.len()))]
    pub async fn bulk_docs(&self, docs: Vec<Value>) -> Result<Vec<BulkRow>> {
        let body = serde_json::json!({ "docs": docs });
        let response = self
            .send(Request::post().segment("_bulk_docs").json(body))
            .await?;
        match response.status {
            201 | 202 => Ok(serde_json::from_value(response.body)?),
            _ => Err(self.failure(&response, None)),
        }
    }

    /// Query a view of a design document
    #[instrument(skip(self, params), fields(database = %self.db_name()))]
    pub async fn query_view(
        &self,
        design: &str,
        view: &str,
        params: &ViewParams,
    ) -> Result<ViewResult> {
        let mut request = Request::get()
            .segment("_design")
            .segment(design)
            .segment("_view")
            .segment(view);
        if let Some(key) = &params.key {
            request = request.param("key", key.to_string());
        }
        if let Some(limit) = params.limit {
            request = request.param("limit", limit.to_string());
        }
        if params.include_docs {
            request = request.param("include_docs", "true");
        }

        let response = self.send(request).await?;
        match response.status {
            200 => Ok(serde_json::from_value(response.body)?),
            404 if !is_missing_database(&response) => {
                Err(Error::ViewNotFound(format!("{}/{}", design, view)))
            }
            _ => Err(self.failure(&response, None)),
        }
    }
}

/// Whether a 404 reply refers to the database rather than a document
fn is_missing_database(response: &Response) -> bool {
    let reason = response.reason();
    reason.starts_with("Database does not exist") || reason == "no_db_file"
}
