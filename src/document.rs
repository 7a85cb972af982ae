//! Document entity
//!
//! In-memory form of one stored document: identity, revision token,
//! attributes and lifecycle state. `save` and `delete` implement the
//! persistence protocol:
//!
//! ```text
//! unsaved   --save-->   persisted   (server assigns id and rev)
//! persisted --save-->   persisted   (rev advances, or DocumentConflict)
//! persisted --delete--> deleted     (rev cleared)
//! deleted   --delete--> deleted     (no-op, returns None)
//! deleted   --save-->   persisted   (per the model's RecreatePolicy)
//! ```
//!
//! A save rejected by the validation pipeline changes nothing and never
//! reaches the server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};
use tracing::{debug, instrument};

use crate::config::RecreatePolicy;
use crate::database::Ack;
use crate::datum::Datum;
use crate::error::{Error, Result};
use crate::model::Model;
use crate::validation::Rejection;
use crate::TYPE_FIELD;

static NULL: Datum = Datum::Null;

/// Whether an attribute name is reserved for the server or the type tag
pub fn is_reserved(name: &str) -> bool {
    name.starts_with('_') || name == TYPE_FIELD
}

/// Key-ordered attribute map. Never holds reserved names, so what is kept in
/// memory is exactly what gets stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Datum>")]
pub struct Attributes(BTreeMap<String, Datum>);

fn reserved(name: &str) -> Error {
    Error::Serialization(format!("attribute name '{}' is reserved", name))
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Datum> {
        self.0.get(name)
    }

    /// Set an attribute, returning the previous value. Reserved names
    /// (leading `_` or the type tag) are refused.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Datum>,
    ) -> Result<Option<Datum>> {
        let name = name.into();
        if is_reserved(&name) {
            return Err(reserved(&name));
        }
        Ok(self.0.insert(name, value.into()))
    }

    pub fn remove(&mut self, name: &str) -> Option<Datum> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Datum)> {
        self.0.iter()
    }

    /// Split a stored JSON body into attributes, dropping reserved keys
    pub fn from_stored(body: Map<String, Value>) -> Self {
        Self(
            body.into_iter()
                .filter(|(key, _)| !is_reserved(key))
                .map(|(key, value)| (key, Datum::from(value)))
                .collect(),
        )
    }

    fn to_json(&self) -> Result<Map<String, Value>> {
        self.0
            .iter()
            .map(|(key, value)| Ok((key.clone(), value.to_json()?)))
            .collect()
    }
}

/// Reserved names are skipped
impl<K: Into<String>, V: Into<Datum>> FromIterator<(K, V)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .filter(|(key, _)| !is_reserved(key))
                .collect(),
        )
    }
}

/// Reserved names are skipped
impl From<BTreeMap<String, Datum>> for Attributes {
    fn from(map: BTreeMap<String, Datum>) -> Self {
        map.into_iter().collect()
    }
}

impl TryFrom<Value> for Attributes {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => {
                if let Some(name) = map.keys().find(|key| is_reserved(key)) {
                    return Err(reserved(name));
                }
                Ok(Self(
                    map.into_iter()
                        .map(|(key, value)| (key, Datum::from(value)))
                        .collect(),
                ))
            }
            other => Err(Error::Serialization(format!(
                "attributes must be a JSON object, got {}",
                other
            ))),
        }
    }
}

impl Index<&str> for Attributes {
    type Output = Datum;

    fn index(&self, name: &str) -> &Datum {
        self.0.get(name).unwrap_or(&NULL)
    }
}

/// # Panics
///
/// On a reserved name; use `set` for a fallible write.
impl IndexMut<&str> for Attributes {
    fn index_mut(&mut self, name: &str) -> &mut Datum {
        assert!(!is_reserved(name), "attribute name '{}' is reserved", name);
        self.0.entry(name.to_string()).or_insert(Datum::Null)
    }
}

/// Lifecycle state of a document handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Unsaved,
    Persisted,
    Deleted,
}

/// Result of `Document::save`
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved(Ack),
    /// Validation refused the save; nothing was sent
    Rejected(Rejection),
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved(ack) if ack.ok)
    }

    pub fn ack(&self) -> Option<&Ack> {
        match self {
            SaveOutcome::Saved(ack) => Some(ack),
            SaveOutcome::Rejected(_) => None,
        }
    }
}

/// One document of a model
#[derive(Clone)]
pub struct Document {
    model: Model,
    id: Option<String>,
    rev: Option<String>,
    attributes: Attributes,
    state: DocumentState,
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("model", &self.model.name())
            .field("id", &self.id)
            .field("rev", &self.rev)
            .field("state", &self.state)
            .field("attributes", &self.attributes)
            .finish()
    }
}

impl Document {
    pub(crate) fn new(model: Model, attributes: Attributes) -> Self {
        Self {
            model,
            id: None,
            rev: None,
            attributes,
            state: DocumentState::Unsaved,
        }
    }

    /// Build from a body fetched from the server
    pub(crate) fn from_stored(model: Model, body: Value) -> Result<Self> {
        let Value::Object(mut body) = body else {
            return Err(Error::Serialization(
                "stored document is not a JSON object".to_string(),
            ));
        };
        let id = match body.remove("_id") {
            Some(Value::String(id)) => id,
            _ => {
                return Err(Error::Serialization(
                    "stored document has no _id".to_string(),
                ))
            }
        };
        let rev = match body.remove("_rev") {
            Some(Value::String(rev)) => Some(rev),
            _ => None,
        };

        Ok(Self {
            model,
            id: Some(id),
            rev,
            attributes: Attributes::from_stored(body),
            state: DocumentState::Persisted,
        })
    }

    /// Use a caller-chosen id instead of a server-assigned one.
    /// Only meaningful before the first save.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        if self.state == DocumentState::Unsaved {
            self.id = Some(id.into());
        }
        self
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Attributes {
        &mut self.attributes
    }

    pub fn get(&self, name: &str) -> Option<&Datum> {
        self.attributes.get(name)
    }

    /// Set an attribute, creating it when unknown. Returns the previous value.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Datum>,
    ) -> Result<Option<Datum>> {
        self.attributes.set(name, value)
    }

    /// JSON body for a single-document write
    pub(crate) fn to_body(&self, rev: Option<&str>) -> Result<Value> {
        let mut body = self.attributes.to_json()?;
        body.insert(
            TYPE_FIELD.to_string(),
            Value::String(self.model.name().to_string()),
        );
        if let Some(rev) = rev {
            body.insert("_rev".to_string(), Value::String(rev.to_string()));
        }
        Ok(Value::Object(body))
    }

    /// JSON body for a `_bulk_docs` entry
    pub(crate) fn to_bulk_body(&self) -> Result<Value> {
        let mut body = self.to_body(self.rev.as_deref())?;
        if let (Some(id), Value::Object(map)) = (&self.id, &mut body) {
            map.insert("_id".to_string(), Value::String(id.clone()));
        }
        Ok(body)
    }

    pub(crate) fn mark_persisted(&mut self, id: Option<String>, rev: Option<String>) {
        if id.is_some() {
            self.id = id;
        }
        self.rev = rev;
        self.state = DocumentState::Persisted;
    }

    /// Validate and write the document.
    ///
    /// Returns `SaveOutcome::Rejected` when a validation hook refuses, and
    /// `Error::DocumentConflict` when the server holds a newer revision; in
    /// both cases `id` and `rev` are left untouched.
    #[instrument(skip(self), fields(model = %self.model.name(), id = ?self.id))]
    pub async fn save(&mut self) -> Result<SaveOutcome> {
        if let Err(rejection) = self.model.pipeline().run(self) {
            debug!(%rejection, "Save rejected by validation");
            return Ok(SaveOutcome::Rejected(rejection));
        }

        let database = self.model.database();
        let ack = match (self.state, self.id.as_deref()) {
            (DocumentState::Persisted, Some(id)) => {
                database
                    .save_document(Some(id), self.to_body(self.rev.as_deref())?)
                    .await?
            }
            (DocumentState::Deleted, Some(id)) => match self.model.recreate_policy() {
                RecreatePolicy::SameId => {
                    database.save_document(Some(id), self.to_body(None)?).await?
                }
                RecreatePolicy::FreshId => {
                    database.save_document(None, self.to_body(None)?).await?
                }
                RecreatePolicy::Forbid => {
                    return Err(Error::RecreateForbidden { id: id.to_string() })
                }
            },
            (_, Some(id)) => database.save_document(Some(id), self.to_body(None)?).await?,
            (_, None) => database.save_document(None, self.to_body(None)?).await?,
        };

        self.mark_persisted(ack.id.clone(), ack.rev.clone());
        debug!(id = ?self.id, rev = ?self.rev, "Document saved");
        Ok(SaveOutcome::Saved(ack))
    }

    /// Delete the current revision.
    ///
    /// Returns `None` without contacting the server when the document has no
    /// revision (never saved, or already deleted).
    #[instrument(skip(self), fields(model = %self.model.name(), id = ?self.id))]
    pub async fn delete(&mut self) -> Result<Option<Ack>> {
        let (Some(id), Some(rev)) = (self.id.as_deref(), self.rev.as_deref()) else {
            return Ok(None);
        };

        let ack = self.model.database().delete_document(id, rev).await?;
        self.rev = None;
        self.state = DocumentState::Deleted;
        Ok(ack)
    }
}

impl Index<&str> for Document {
    type Output = Datum;

    fn index(&self, name: &str) -> &Datum {
        &self.attributes[name]
    }
}

impl IndexMut<&str> for Document {
    fn index_mut(&mut self, name: &str) -> &mut Datum {
        &mut self.attributes[name]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelDefinition;
    use crate::registry::{Registry, RegistryBuilder};
    use crate::transport::MemoryTransport;
    use serde_json::json;

    async fn registry(definition: ModelDefinition) -> Registry {
        let registry = RegistryBuilder::in_memory(MemoryTransport::new())
            .model(definition)
            .build()
            .unwrap();
        for database in registry.databases() {
            database.create().await.unwrap();
        }
        registry
    }

    fn sample(model: &Model) -> Document {
        let mut doc = model.new_document();
        doc["hashed_params"] = Datum::from(json!({"is_a": "Hash", "hash_size": 2}));
        doc["simple_param"] = Datum::from("Working well!");
        doc
    }

    #[test]
    fn test_attribute_access() {
        let mut attributes = Attributes::new();
        assert!(attributes["missing"].is_null());
        assert_eq!(attributes.set("dynamic_setter", "Well").unwrap(), None);
        assert_eq!(attributes["dynamic_setter"], "Well");
        attributes["counter"] = Datum::from(3);
        assert_eq!(attributes.get("counter"), Some(&Datum::Integer(3)));
        assert_eq!(attributes.len(), 2);
    }

    #[test]
    fn test_reserved_keys_never_become_attributes() {
        let body = json!({"_id": "x", "_rev": "1-a", TYPE_FIELD: "m", "kept": true});
        let Value::Object(map) = body else { unreachable!() };
        let attributes = Attributes::from_stored(map);
        assert_eq!(attributes.len(), 1);
        assert!(attributes.contains("kept"));
    }

    #[test]
    fn test_try_from_rejects_non_objects() {
        assert!(Attributes::try_from(json!([1, 2])).is_err());
        let attributes = Attributes::try_from(json!({"number": 1, "double": 2})).unwrap();
        assert_eq!(attributes["double"], 2i64);
    }

    #[test]
    fn test_reserved_names_are_refused() {
        let mut attributes = Attributes::new();
        assert!(matches!(attributes.set("_secret", 1), Err(Error::Serialization(_))));
        assert!(matches!(attributes.set(TYPE_FIELD, "x"), Err(Error::Serialization(_))));
        assert!(attributes.is_empty());

        let built = Attributes::from_iter([("_id", 1), ("kept", 2)]);
        assert_eq!(built.len(), 1);
        assert!(Attributes::try_from(json!({"_rev": "1-a", "kept": 2})).is_err());

        let decoded: Attributes = serde_json::from_value(json!({TYPE_FIELD: "x", "kept": 2})).unwrap();
        assert_eq!(decoded, Attributes::from_iter([("kept", 2)]));
    }

    #[test]
    #[should_panic(expected = "is reserved")]
    fn test_index_assignment_to_reserved_name_panics() {
        let mut attributes = Attributes::new();
        attributes["_deleted"] = Datum::from(true);
    }

    #[tokio::test]
    async fn test_refused_names_keep_find_in_agreement() {
        let registry = registry(ModelDefinition::new("proof_of_concept")).await;
        let model = registry.model("proof_of_concept").unwrap();

        let mut doc = model.new_document();
        assert!(doc.set("_secret", 1).is_err());
        assert!(doc.set(TYPE_FIELD, "x").is_err());
        doc.set("kept", 2).unwrap();
        doc.save().await.unwrap();

        let found = model.find(doc.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(doc.attributes(), found.attributes());
    }

    #[tokio::test]
    async fn test_non_finite_float_is_not_saved() {
        let registry = registry(ModelDefinition::new("proof_of_concept")).await;
        let model = registry.model("proof_of_concept").unwrap();

        let mut doc = model.new_document();
        doc.set("ratio", f64::NAN).unwrap();
        assert!(matches!(doc.save().await, Err(Error::Serialization(_))));
        assert!(doc.id().is_none());
        assert_eq!(doc.state(), DocumentState::Unsaved);
        assert_eq!(model.all().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_assigns_identity_and_find_round_trips() {
        let registry = registry(ModelDefinition::new("proof_of_concept")).await;
        let model = registry.model("proof_of_concept").unwrap();

        let mut doc = sample(&model);
        assert_eq!(doc.state(), DocumentState::Unsaved);
        assert!(doc.save().await.unwrap().is_saved());
        assert_eq!(doc.state(), DocumentState::Persisted);

        let found = model.find(doc.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(found.id(), doc.id());
        assert_eq!(found.rev(), doc.rev());
        assert_eq!(found.attributes(), doc.attributes());
    }

    #[tokio::test]
    async fn test_body_carries_type_tag() {
        let registry = registry(ModelDefinition::new("tagged")).await;
        let model = registry.model("tagged").unwrap();
        let mut doc = model.new_document();
        doc.set("a", 1).unwrap();
        doc.save().await.unwrap();

        let raw = model
            .database()
            .get_document(doc.id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw[TYPE_FIELD], "tagged");
        assert_eq!(raw["a"], 1);
    }

    #[tokio::test]
    async fn test_delete_never_saved_is_noop() {
        let registry = registry(ModelDefinition::new("proof_of_concept")).await;
        let mut doc = registry.model("proof_of_concept").unwrap().new_document();
        assert!(doc.delete().await.unwrap().is_none());
        assert!(doc.rev().is_none());
        assert_eq!(doc.state(), DocumentState::Unsaved);
    }

    #[tokio::test]
    async fn test_conflict_keeps_stale_revision() {
        let registry = registry(ModelDefinition::new("proof_of_concept")).await;
        let model = registry.model("proof_of_concept").unwrap();

        let mut object = sample(&model);
        object.save().await.unwrap();
        let stale_rev = object.rev().map(str::to_string);

        let mut retrieved = model.find(object.id().unwrap()).await.unwrap().unwrap();
        retrieved.set("updated_attrib", "New attribute!").unwrap();
        assert!(retrieved.save().await.unwrap().is_saved());

        object.set("lost_race", "I'll fail!").unwrap();
        assert!(matches!(
            object.save().await,
            Err(Error::DocumentConflict { .. })
        ));
        assert_eq!(object.rev().map(str::to_string), stale_rev);

        let stored = model.find(object.id().unwrap()).await.unwrap().unwrap();
        assert_eq!(stored["updated_attrib"], "New attribute!");
        assert!(stored.get("lost_race").is_none());
    }

    #[tokio::test]
    async fn test_recreate_policies() {
        for (policy, same_id) in [(RecreatePolicy::SameId, true), (RecreatePolicy::FreshId, false)] {
            let registry = registry(ModelDefinition::new("recreated").recreate(policy)).await;
            let model = registry.model("recreated").unwrap();

            let mut doc = sample(&model);
            doc.save().await.unwrap();
            let first_id = doc.id().unwrap().to_string();
            assert!(doc.delete().await.unwrap().is_some());
            assert_eq!(doc.state(), DocumentState::Deleted);

            assert!(doc.save().await.unwrap().is_saved());
            assert_eq!(doc.id() == Some(first_id.as_str()), same_id);
            assert!(doc.delete().await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_forbid_recreate() {
        let registry =
            registry(ModelDefinition::new("final").recreate(RecreatePolicy::Forbid)).await;
        let mut doc = sample(&registry.model("final").unwrap());
        doc.save().await.unwrap();
        doc.delete().await.unwrap();
        assert!(matches!(
            doc.save().await,
            Err(Error::RecreateForbidden { .. })
        ));
        assert_eq!(doc.state(), DocumentState::Deleted);
    }

    #[tokio::test]
    async fn test_caller_chosen_id() {
        let registry = registry(ModelDefinition::new("named")).await;
        let model = registry.model("named").unwrap();
        let mut doc = model.new_document().with_id("fixed-id");
        doc.save().await.unwrap();
        assert_eq!(doc.id(), Some("fixed-id"));
        assert!(model.find("fixed-id").await.unwrap().is_some());

        let mut duplicate = model.new_document().with_id("fixed-id");
        assert!(matches!(
            duplicate.save().await,
            Err(Error::DocumentConflict { id }) if id == "fixed-id"
        ));
    }
}
