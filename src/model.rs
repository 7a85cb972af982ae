//! Models
//!
//! A `ModelDefinition` is the static description of a document kind: its
//! name (which doubles as the type tag and design document name), the
//! database it lives in, the attributes it indexes, its validation hooks and
//! its recreate policy. The registry turns definitions into `Model` handles,
//! which carry the model-level operations.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::{ModelConfig, RecreatePolicy};
use crate::database::{Ack, Database, ViewParams, ViewResult};
use crate::datum::Datum;
use crate::document::{Attributes, Document};
use crate::error::{Error, Result};
use crate::validation::{Hook, Phase, ValidationPipeline};
use crate::views::{view_name_for, DesignDocument, ViewDefinition, ALL_VIEW};
use crate::TYPE_FIELD;

/// Builder-style description of a model
#[derive(Debug, Clone)]
pub struct ModelDefinition {
    name: String,
    database: Option<String>,
    views: Vec<ViewDefinition>,
    pipeline: ValidationPipeline,
    recreate: RecreatePolicy,
    auto_views: bool,
}

impl ModelDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: None,
            views: Vec::new(),
            pipeline: ValidationPipeline::new(),
            recreate: RecreatePolicy::default(),
            auto_views: true,
        }
    }

    /// Definition for a model declared in configuration
    pub fn from_config(name: impl Into<String>, config: &ModelConfig) -> Self {
        let mut definition = Self::new(name)
            .recreate(config.recreate)
            .auto_views(config.auto_views);
        definition.database = config.database.clone();
        for attribute in &config.views {
            definition = definition.view_by(attribute.clone());
        }
        definition
    }

    /// Database key; defaults to the model name
    pub fn database(mut self, key: impl Into<String>) -> Self {
        self.database = Some(key.into());
        self
    }

    /// Declare a `by_<attr>` view. Declaring the same attribute twice is a no-op.
    pub fn view_by(mut self, attribute: impl Into<String>) -> Self {
        let view = ViewDefinition::new(attribute);
        if !self.views.contains(&view) {
            self.views.push(view);
        }
        self
    }

    pub fn before_validate<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        self.pipeline
            .push(Phase::BeforeValidate, Hook::new(name, check));
        self
    }

    pub fn after_validate<F>(mut self, name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        self.pipeline
            .push(Phase::AfterValidate, Hook::new(name, check));
        self
    }

    pub fn recreate(mut self, policy: RecreatePolicy) -> Self {
        self.recreate = policy;
        self
    }

    /// Publish views on demand when a query finds them missing
    pub fn auto_views(mut self, enabled: bool) -> Self {
        self.auto_views = enabled;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database_key(&self) -> &str {
        self.database.as_deref().unwrap_or(&self.name)
    }

    pub fn views(&self) -> &[ViewDefinition] {
        &self.views
    }

    pub fn design_document(&self) -> DesignDocument {
        DesignDocument::for_model(&self.name, &self.views)
    }
}

struct ModelInner {
    definition: ModelDefinition,
    database: Arc<Database>,
}

/// Handle on a registered model; cheap to clone
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.name())
            .field("database", &self.inner.database.name())
            .field("views", &self.inner.definition.views)
            .finish()
    }
}

impl Model {
    pub(crate) fn new(definition: ModelDefinition, database: Arc<Database>) -> Self {
        Self {
            inner: Arc::new(ModelInner {
                definition,
                database,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.definition.name()
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.inner.database
    }

    pub fn definition(&self) -> &ModelDefinition {
        &self.inner.definition
    }

    pub fn pipeline(&self) -> &ValidationPipeline {
        &self.inner.definition.pipeline
    }

    pub fn recreate_policy(&self) -> RecreatePolicy {
        self.inner.definition.recreate
    }

    pub fn design_document(&self) -> DesignDocument {
        self.inner.definition.design_document()
    }

    /// Empty, unsaved document
    pub fn new_document(&self) -> Document {
        Document::new(self.clone(), Attributes::new())
    }

    /// Unsaved document with the given attributes
    pub fn build(&self, attributes: impl Into<Attributes>) -> Document {
        Document::new(self.clone(), attributes.into())
    }

    /// Fetch by id; `None` when missing, deleted, or tagged with another
    /// model. Untagged documents (design documents included) are returned.
    pub async fn find(&self, id: &str) -> Result<Option<Document>> {
        let Some(body) = self.database().get_document(id).await? else {
            return Ok(None);
        };
        let owner = body
            .get(TYPE_FIELD)
            .and_then(Value::as_str)
            .filter(|tag| *tag != self.name())
            .map(str::to_string);
        if let Some(owner) = owner {
            debug!(id, %owner, "Document belongs to another model");
            return Ok(None);
        }
        Ok(Some(Document::from_stored(self.clone(), body)?))
    }

    /// Every document of this model
    pub fn all(&self) -> DocumentQuery {
        DocumentQuery::new(self.clone(), ALL_VIEW.to_string(), None)
    }

    /// First document whose `attribute` equals `value`
    pub async fn by(&self, attribute: &str, value: impl Into<Datum>) -> Result<Option<Document>> {
        self.all_by(attribute, value)?.first().await
    }

    /// Every document whose `attribute` equals `value`
    pub fn all_by(&self, attribute: &str, value: impl Into<Datum>) -> Result<DocumentQuery> {
        let view = view_name_for(attribute);
        if !self.design_document().has_view(&view) {
            return Err(Error::UnknownView(format!("{}/{}", self.name(), view)));
        }
        let key = value.into().to_json()?;
        Ok(DocumentQuery::new(self.clone(), view, Some(key)))
    }

    /// Publish this model's design document
    pub async fn create_views(&self) -> Result<Ack> {
        self.database()
            .publish_design(&self.design_document())
            .await
    }

    /// Validate and write many documents in one request.
    ///
    /// Documents refused by validation are skipped. Returns the documents
    /// that were written, in input order. When the server refuses some rows,
    /// `Error::BulkWrite` carries those rows along with the documents that
    /// were written.
    #[instrument(skip(self, batch), fields(model = %self.name()))]
    pub async fn create<I, A>(&self, batch: I) -> Result<Vec<Document>>
    where
        I: IntoIterator<Item = A>,
        A: Into<Attributes>,
    {
        let mut accepted = Vec::new();
        for attributes in batch {
            let document = self.build(attributes);
            match self.pipeline().run(&document) {
                Ok(()) => accepted.push(document),
                Err(rejection) => debug!(%rejection, "Skipping rejected document"),
            }
        }
        if accepted.is_empty() {
            return Ok(accepted);
        }

        let bodies = accepted
            .iter()
            .map(Document::to_bulk_body)
            .collect::<Result<Vec<_>>>()?;
        let rows = self.database().bulk_docs(bodies).await?;
        if rows.len() != accepted.len() {
            return Err(Error::Internal(format!(
                "bulk write returned {} rows for {} documents",
                rows.len(),
                accepted.len()
            )));
        }

        let mut persisted = Vec::with_capacity(accepted.len());
        let mut failures = Vec::new();
        for (mut document, row) in accepted.into_iter().zip(rows) {
            if row.is_ok() {
                document.mark_persisted(Some(row.id), row.rev);
                persisted.push(document);
            } else {
                warn!(id = %row.id, error = ?row.error, reason = ?row.reason, "Bulk create refused a document");
                failures.push(row);
            }
        }
        info!(count = persisted.len(), "Documents created");
        if failures.is_empty() {
            Ok(persisted)
        } else {
            Err(Error::BulkWrite {
                failures,
                persisted,
            })
        }
    }

    /// Delete documents of this model in one bulk request; returns how many
    /// were deleted. Design documents are never touched.
    #[instrument(skip(self), fields(model = %self.name()))]
    pub async fn delete_all(&self, options: DeleteAllOptions) -> Result<usize> {
        let params = ViewParams {
            key: None,
            limit: options.limit,
            include_docs: true,
        };
        let result = self.query_view(ALL_VIEW, &params).await?;

        let tombstones: Vec<Value> = result
            .rows
            .iter()
            .filter(|row| !row.id.starts_with("_design/"))
            .filter_map(|row| {
                let rev = row.doc.as_ref()?.get("_rev")?.as_str()?;
                Some(json!({ "_id": row.id, "_rev": rev, "_deleted": true }))
            })
            .collect();
        if tombstones.is_empty() {
            return Ok(0);
        }

        let rows = self.database().bulk_docs(tombstones).await?;
        for failed in rows.iter().filter(|row| !row.is_ok()) {
            warn!(id = %failed.id, error = ?failed.error, "Bulk delete skipped a document");
        }
        let deleted = rows.iter().filter(|row| row.is_ok()).count();
        info!(deleted, "Documents deleted");
        Ok(deleted)
    }

    /// Query one of this model's views, publishing the design document once
    /// if the server does not have it yet
    async fn query_view(&self, view: &str, params: &ViewParams) -> Result<ViewResult> {
        let database = self.database();
        match database.query_view(self.name(), view, params).await {
            Err(Error::ViewNotFound(missing)) if self.inner.definition.auto_views => {
                info!(view = %missing, "Publishing missing views");
                self.create_views().await?;
                database.query_view(self.name(), view, params).await
            }
            other => other,
        }
    }
}

/// Options for `Model::delete_all`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteAllOptions {
    /// Maximum number of documents to delete; all when `None`
    pub limit: Option<usize>,
}

impl DeleteAllOptions {
    pub fn limit(limit: usize) -> Self {
        Self { limit: Some(limit) }
    }
}

/// Lazy view query. Nothing is sent until `fetch`, `count` or `first` is
/// awaited, and every call queries the server again.
#[derive(Debug, Clone)]
pub struct DocumentQuery {
    model: Model,
    view: String,
    key: Option<Value>,
    limit: Option<usize>,
}

impl DocumentQuery {
    fn new(model: Model, view: String, key: Option<Value>) -> Self {
        Self {
            model,
            view,
            key,
            limit: None,
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    fn params(&self, include_docs: bool) -> ViewParams {
        ViewParams {
            key: self.key.clone(),
            limit: self.limit,
            include_docs,
        }
    }

    /// Matching documents
    pub async fn fetch(&self) -> Result<Vec<Document>> {
        let result = self.model.query_view(&self.view, &self.params(true)).await?;
        result
            .rows
            .into_iter()
            .filter_map(|row| row.doc)
            .filter(|doc| !doc.is_null())
            .map(|doc| Document::from_stored(self.model.clone(), doc))
            .collect()
    }

    /// Number of matching documents
    pub async fn count(&self) -> Result<usize> {
        let result = self.model.query_view(&self.view, &self.params(false)).await?;
        Ok(result.rows.len())
    }

    /// Matching document ids, without fetching the documents
    pub async fn ids(&self) -> Result<Vec<String>> {
        let result = self.model.query_view(&self.view, &self.params(false)).await?;
        Ok(result.rows.into_iter().map(|row| row.id).collect())
    }

    pub async fn first(&self) -> Result<Option<Document>> {
        let query = self.clone().limit(1);
        Ok(query.fetch().await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Registry, RegistryBuilder};
    use crate::transport::MemoryTransport;

    async fn registry(definitions: Vec<ModelDefinition>) -> Registry {
        let mut builder = RegistryBuilder::in_memory(MemoryTransport::new());
        for definition in definitions {
            builder = builder.model(definition);
        }
        let registry = builder.build().unwrap();
        for database in registry.databases() {
            database.create().await.unwrap();
        }
        registry
    }

    fn viewed_model() -> ModelDefinition {
        ModelDefinition::new("viewed_model")
            .view_by("value")
            .view_by("mod")
    }

    fn numbered(count: i64) -> Vec<Attributes> {
        (0..count)
            .map(|n| {
                Attributes::from_iter([
                    ("number", Datum::from(n)),
                    ("double", Datum::from(2 * n)),
                ])
            })
            .collect()
    }

    #[test]
    fn test_definition_builder() {
        let definition = ModelDefinition::new("m")
            .database("shared")
            .view_by("a")
            .view_by("a")
            .view_by("b")
            .recreate(RecreatePolicy::Forbid);
        assert_eq!(definition.database_key(), "shared");
        assert_eq!(definition.views().len(), 2);
        assert!(definition.design_document().has_view("by_b"));
        assert_eq!(ModelDefinition::new("solo").database_key(), "solo");
    }

    #[test]
    fn test_definition_from_config() {
        let config = ModelConfig {
            database: Some("main".to_string()),
            views: vec!["value".to_string()],
            recreate: RecreatePolicy::FreshId,
            auto_views: false,
        };
        let definition = ModelDefinition::from_config("cfg", &config);
        assert_eq!(definition.database_key(), "main");
        assert_eq!(definition.views(), &[ViewDefinition::new("value")]);
        assert_eq!(definition.recreate, RecreatePolicy::FreshId);
        assert!(!definition.auto_views);
    }

    #[tokio::test]
    async fn test_delete_all_with_limit() {
        let registry = registry(vec![ModelDefinition::new("proof_of_concept")]).await;
        let model = registry.model("proof_of_concept").unwrap();

        assert_eq!(model.delete_all(DeleteAllOptions::default()).await.unwrap(), 0);
        model.create(numbered(10)).await.unwrap();
        assert_eq!(model.delete_all(DeleteAllOptions::limit(6)).await.unwrap(), 6);
        assert_eq!(model.delete_all(DeleteAllOptions::default()).await.unwrap(), 4);
        assert_eq!(model.all().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_skips_rejected_documents() {
        let registry = registry(vec![ModelDefinition::new("evens").before_validate(
            "even_only",
            |doc: &Document| doc["number"].as_i64().is_some_and(|n| n % 2 == 0),
        )])
        .await;
        let model = registry.model("evens").unwrap();

        let created = model.create(numbered(10)).await.unwrap();
        assert_eq!(created.len(), 5);
        assert!(created.iter().all(|doc| doc.id().is_some() && doc.rev().is_some()));
        assert_eq!(model.all().count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_views_by_attribute() {
        let registry = registry(vec![viewed_model()]).await;
        let model = registry.model("viewed_model").unwrap();

        let batch: Vec<Attributes> = (0..10)
            .map(|n| {
                Attributes::from_iter([
                    ("value", Datum::from(format!("{} mod 2", n))),
                    ("mod", Datum::from(n % 2)),
                ])
            })
            .collect();
        model.create(batch).await.unwrap();

        assert_eq!(model.all_by("mod", 0).unwrap().count().await.unwrap(), 5);
        let even = model.all_by("mod", 0).unwrap().fetch().await.unwrap();
        assert!(even.iter().all(|doc| doc["mod"] == 0i64));

        let object = model.by("value", "5 mod 2").await.unwrap().unwrap();
        assert_eq!(object["mod"], 1i64);
        assert!(model.by("value", "11 mod 2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undeclared_view_is_rejected_locally() {
        let registry = registry(vec![viewed_model()]).await;
        let model = registry.model("viewed_model").unwrap();
        assert!(matches!(model.all_by("colour", "red"), Err(Error::UnknownView(_))));
        assert!(matches!(
            model.by("colour", "red").await,
            Err(Error::UnknownView(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_views_without_auto_publish() {
        let registry = registry(vec![ModelDefinition::new("manual").auto_views(false)]).await;
        let model = registry.model("manual").unwrap();

        assert!(matches!(model.all().count().await, Err(Error::ViewNotFound(_))));
        model.create_views().await.unwrap();
        assert_eq!(model.all().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_is_restartable() {
        let registry = registry(vec![ModelDefinition::new("lazy")]).await;
        let model = registry.model("lazy").unwrap();

        let query = model.all();
        assert_eq!(query.count().await.unwrap(), 0);
        model.create(numbered(3)).await.unwrap();
        assert_eq!(query.count().await.unwrap(), 3);
        assert_eq!(query.clone().limit(2).fetch().await.unwrap().len(), 2);
        assert_eq!(query.ids().await.unwrap().len(), 3);
        assert!(query.first().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_models_sharing_a_database_stay_apart() {
        let registry = registry(vec![
            ModelDefinition::new("cats").database("zoo"),
            ModelDefinition::new("dogs").database("zoo"),
        ])
        .await;
        let cats = registry.model("cats").unwrap();
        let dogs = registry.model("dogs").unwrap();

        cats.create(numbered(2)).await.unwrap();
        dogs.create(numbered(3)).await.unwrap();
        assert_eq!(cats.all().count().await.unwrap(), 2);
        assert_eq!(dogs.delete_all(DeleteAllOptions::default()).await.unwrap(), 3);
        assert_eq!(cats.all().count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_find_ignores_documents_of_another_model() {
        let registry = registry(vec![
            ModelDefinition::new("cats").database("zoo"),
            ModelDefinition::new("dogs").database("zoo"),
        ])
        .await;
        let cats = registry.model("cats").unwrap();
        let dogs = registry.model("dogs").unwrap();

        let mut tom = cats.build(Attributes::from_iter([("v", 1)]));
        tom.save().await.unwrap();
        let id = tom.id().unwrap().to_string();

        assert!(dogs.find(&id).await.unwrap().is_none());
        assert_eq!(dogs.delete_all(DeleteAllOptions::default()).await.unwrap(), 0);

        let found = cats.find(&id).await.unwrap().unwrap();
        assert_eq!(found["v"], 1i64);
        assert_eq!(cats.all().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_finite_view_key_is_refused() {
        let registry = registry(vec![viewed_model()]).await;
        let model = registry.model("viewed_model").unwrap();
        assert!(matches!(
            model.all_by("value", f64::NAN),
            Err(Error::Serialization(_))
        ));
    }

    /// Refuses the second document of every bulk write
    struct RefuseSecond {
        inner: MemoryTransport,
    }

    #[async_trait::async_trait]
    impl crate::transport::Transport for RefuseSecond {
        async fn send(
            &self,
            mut request: crate::transport::Request,
        ) -> Result<crate::transport::Response> {
            let bulk = request.segments.last().map(String::as_str) == Some("_bulk_docs");
            let refused = request
                .body
                .as_mut()
                .filter(|_| bulk)
                .and_then(|body| body.get_mut("docs"))
                .and_then(Value::as_array_mut)
                .filter(|docs| docs.len() > 1)
                .map(|docs| docs.remove(1));
            let mut response = self.inner.send(request).await?;
            if let (Some(_), Value::Array(rows)) = (refused, &mut response.body) {
                rows.insert(
                    1,
                    json!({"id": "refused", "error": "forbidden", "reason": "not today"}),
                );
            }
            Ok(response)
        }
    }

    #[tokio::test]
    async fn test_bulk_failure_returns_written_documents() {
        let transport = RefuseSecond {
            inner: MemoryTransport::new(),
        };
        let registry = RegistryBuilder::new(crate::config::DivanConfig::default())
            .transport(Arc::new(transport))
            .model(ModelDefinition::new("partial"))
            .build()
            .unwrap();
        registry.database("partial").unwrap().create().await.unwrap();
        let model = registry.model("partial").unwrap();

        match model.create(numbered(4)).await {
            Err(Error::BulkWrite {
                failures,
                persisted,
            }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].id, "refused");
                assert!(!failures[0].is_conflict());
                assert_eq!(persisted.len(), 3);
                assert!(persisted.iter().all(|doc| doc.rev().is_some()));
                let numbers: Vec<i64> = persisted
                    .iter()
                    .filter_map(|doc| doc["number"].as_i64())
                    .collect();
                assert_eq!(numbers, vec![0, 2, 3]);
            }
            other => panic!("expected a bulk write error, got {:?}", other),
        }
        assert_eq!(model.all().count().await.unwrap(), 3);
    }
}
