//! View definitions and design documents
//!
//! Each model owns one design document, `_design/<model>`, holding an
//! `all` view plus one `by_<attr>` view per declared attribute. Every map
//! function filters on the model's type tag, so several models can share a
//! database without seeing each other's documents.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use crate::TYPE_FIELD;

/// Name of the view listing every document of a model
pub const ALL_VIEW: &str = "all";

/// A secondary index over one attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewDefinition {
    attribute: String,
}

impl ViewDefinition {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
        }
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// `by_<attr>`
    pub fn view_name(&self) -> String {
        view_name_for(&self.attribute)
    }
}

pub fn view_name_for(attribute: &str) -> String {
    format!("by_{}", attribute)
}

/// The published form of a model's views
#[derive(Debug, Clone, PartialEq)]
pub struct DesignDocument {
    pub name: String,
    /// View name to JavaScript map source
    pub views: BTreeMap<String, String>,
}

impl DesignDocument {
    pub fn for_model(model: &str, views: &[ViewDefinition]) -> Self {
        let tag = js_string(model);
        let mut map = BTreeMap::new();
        map.insert(
            ALL_VIEW.to_string(),
            format!(
                "function(doc) {{ if (doc.{} === {}) {{ emit(doc._id, null); }} }}",
                TYPE_FIELD, tag
            ),
        );
        for view in views {
            let field = js_string(view.attribute());
            map.insert(
                view.view_name(),
                format!(
                    "function(doc) {{ if (doc.{} === {} && doc.hasOwnProperty({})) {{ emit(doc[{}], null); }} }}",
                    TYPE_FIELD, tag, field, field
                ),
            );
        }

        Self {
            name: model.to_string(),
            views: map,
        }
    }

    /// `_design/<name>`
    pub fn id(&self) -> String {
        format!("_design/{}", self.name)
    }

    pub fn has_view(&self, view: &str) -> bool {
        self.views.contains_key(view)
    }

    /// Body to `PUT`, carrying `rev` when replacing an existing revision
    pub fn to_json(&self, rev: Option<&str>) -> Value {
        let views: Map<String, Value> = self
            .views
            .iter()
            .map(|(name, source)| (name.clone(), json!({ "map": source })))
            .collect();

        let mut body = json!({
            "_id": self.id(),
            "language": "javascript",
            "views": views,
        });
        if let Some(rev) = rev {
            body["_rev"] = Value::String(rev.to_string());
        }
        body
    }
}

fn js_string(raw: &str) -> String {
    Value::String(raw.to_string()).to_string()
}
