//! In-memory transport
//!
//! Emulates the document server's REST contract inside the process: named
//! databases, revision chains with tombstones, `_all_docs`, `_bulk_docs`
//! and design document views.
//!
//! Views are evaluated natively rather than by running their map source.
//! A design document `_design/<model>` indexes the documents whose type tag
//! equals `<model>`; its `all` view emits the document id and each
//! `by_<attr>` view emits the value of `<attr>`. Keys are ordered with a
//! CouchDB-like collation (null < booleans < numbers < strings < arrays <
//! objects).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{Request, Response, Transport};
use crate::error::Result;
use crate::TYPE_FIELD;

const DESIGN_PREFIX: &str = "_design/";

/// In-memory document server
#[derive(Clone, Default)]
pub struct MemoryTransport {
    state: Arc<RwLock<BTreeMap<String, MemDatabase>>>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("databases", &self.state.read().len())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct MemDatabase {
    docs: BTreeMap<String, StoredDoc>,
    update_seq: u64,
    created_at: DateTime<Utc>,
}

impl MemDatabase {
    fn new() -> Self {
        Self {
            docs: BTreeMap::new(),
            update_seq: 0,
            created_at: Utc::now(),
        }
    }

    fn live_docs(&self) -> impl Iterator<Item = (&String, &StoredDoc)> {
        self.docs.iter().filter(|(_, doc)| !doc.deleted)
    }

    /// Write one revision, enforcing the revision check.
    fn write(&mut self, id: String, mut body: Map<String, Value>) -> std::result::Result<String, Response> {
        let given_rev = match body.remove("_rev") {
            Some(Value::String(rev)) => Some(rev),
            Some(_) => return Err(bad_request("Invalid rev format")),
            None => None,
        };
        let deleting = matches!(body.remove("_deleted"), Some(Value::Bool(true)));
        body.retain(|key, _| !key.starts_with('_'));

        let position = match self.docs.get(&id) {
            Some(existing) if !existing.deleted => {
                if given_rev.as_deref() != Some(existing.rev.as_str()) {
                    return Err(conflict());
                }
                existing.position
            }
            Some(tombstone) => {
                if given_rev.as_ref().is_some_and(|rev| *rev != tombstone.rev) {
                    return Err(conflict());
                }
                tombstone.position
            }
            None if deleting => return Err(not_found("missing")),
            None => {
                if given_rev.is_some() {
                    return Err(conflict());
                }
                0
            }
        };

        if deleting && self.docs.get(&id).is_some_and(|doc| doc.deleted) {
            return Err(not_found("deleted"));
        }

        let position = position + 1;
        let rev = format!("{}-{}", position, uuid::Uuid::new_v4().simple());
        self.update_seq += 1;
        self.docs.insert(
            id,
            StoredDoc {
                position,
                rev: rev.clone(),
                body: if deleting { Map::new() } else { body },
                deleted: deleting,
            },
        );
        Ok(rev)
    }
}

#[derive(Debug, Clone)]
struct StoredDoc {
    position: u64,
    rev: String,
    body: Map<String, Value>,
    deleted: bool,
}

impl StoredDoc {
    fn to_json(&self, id: &str) -> Value {
        let mut doc = Map::new();
        doc.insert("_id".to_string(), Value::String(id.to_string()));
        doc.insert("_rev".to_string(), Value::String(self.rev.clone()));
        for (key, value) in &self.body {
            doc.insert(key.clone(), value.clone());
        }
        Value::Object(doc)
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of all databases
    pub fn database_names(&self) -> Vec<String> {
        self.state.read().keys().cloned().collect()
    }

    /// Number of live documents in a database, design documents included
    pub fn doc_count(&self, database: &str) -> Option<usize> {
        self.state
            .read()
            .get(database)
            .map(|db| db.live_docs().count())
    }

    fn dispatch(&self, request: &Request) -> Response {
        let segments: Vec<&str> = request.segments.iter().map(String::as_str).collect();
        let method = &request.method;

        match segments.as_slice() {
            [] if *method == Method::GET => Response::new(
                200,
                json!({"couchdb": "Welcome", "version": crate::VERSION, "vendor": {"name": "divan-memory"}}),
            ),
            ["_all_dbs"] if *method == Method::GET => {
                Response::new(200, json!(self.database_names()))
            }
            [db] => self.database_op(method, db, request),
            [db, "_all_docs"] if *method == Method::GET => self.all_docs(db, request),
            [db, "_bulk_docs"] if *method == Method::POST => self.bulk_docs(db, request),
            [db, "_design", design, "_view", view] if *method == Method::GET => {
                self.query_view(db, design, view, request)
            }
            [db, "_design", design] => {
                let id = format!("{}{}", DESIGN_PREFIX, design);
                self.document_op(method, db, &id, request)
            }
            [db, id] if !id.starts_with('_') => self.document_op(method, db, id, request),
            _ => not_found("missing"),
        }
    }

    fn database_op(&self, method: &Method, name: &str, request: &Request) -> Response {
        if !valid_database_name(name) {
            return Response::new(
                400,
                json!({"error": "illegal_database_name", "reason": format!("Name: '{}'. Only lowercase characters (a-z), digits (0-9), and any of the characters _, $, (, ), +, -, and / are allowed. Must begin with a letter.", name)}),
            );
        }

        match *method {
            Method::PUT => {
                let mut state = self.state.write();
                if state.contains_key(name) {
                    return Response::new(
                        412,
                        json!({"error": "file_exists", "reason": "The database could not be created, the file already exists."}),
                    );
                }
                state.insert(name.to_string(), MemDatabase::new());
                Response::new(201, json!({"ok": true}))
            }
            Method::DELETE => match self.state.write().remove(name) {
                Some(_) => Response::new(200, json!({"ok": true})),
                None => missing_database(),
            },
            Method::GET => match self.state.read().get(name) {
                Some(db) => Response::new(
                    200,
                    json!({
                        "db_name": name,
                        "doc_count": db.live_docs().count(),
                        "doc_del_count": db.docs.values().filter(|doc| doc.deleted).count(),
                        "update_seq": db.update_seq,
                        "instance_start_time": db.created_at.timestamp_micros().to_string(),
                    }),
                ),
                None => missing_database(),
            },
            Method::POST => {
                let body = match object_body(request) {
                    Ok(body) => body,
                    Err(response) => return response,
                };
                let id = match body.get("_id") {
                    Some(Value::String(id)) => id.clone(),
                    Some(_) => return bad_request("Document id must be a string"),
                    None => new_id(),
                };
                self.write_document(name, id, body)
            }
            _ => method_not_allowed(),
        }
    }

    fn document_op(&self, method: &Method, db: &str, id: &str, request: &Request) -> Response {
        match *method {
            Method::GET => {
                let state = self.state.read();
                let Some(database) = state.get(db) else {
                    return missing_database();
                };
                match database.docs.get(id) {
                    Some(doc) if !doc.deleted => Response::new(200, doc.to_json(id)),
                    Some(_) => not_found("deleted"),
                    None => not_found("missing"),
                }
            }
            Method::PUT => match object_body(request) {
                Ok(body) => self.write_document(db, id.to_string(), body),
                Err(response) => response,
            },
            Method::DELETE => {
                let mut state = self.state.write();
                let Some(database) = state.get_mut(db) else {
                    return missing_database();
                };
                match database.docs.get(id) {
                    Some(doc) if !doc.deleted => {}
                    Some(_) => return not_found("deleted"),
                    None => return not_found("missing"),
                }
                let mut tombstone = Map::new();
                if let Some(rev) = query_param(request, "rev") {
                    tombstone.insert("_rev".to_string(), Value::String(rev.to_string()));
                }
                tombstone.insert("_deleted".to_string(), Value::Bool(true));
                match database.write(id.to_string(), tombstone) {
                    Ok(rev) => Response::new(200, json!({"ok": true, "id": id, "rev": rev})),
                    Err(response) => response,
                }
            }
            _ => method_not_allowed(),
        }
    }

    fn write_document(&self, db: &str, id: String, body: Map<String, Value>) -> Response {
        let mut state = self.state.write();
        let Some(database) = state.get_mut(db) else {
            return missing_database();
        };
        match database.write(id.clone(), body) {
            Ok(rev) => {
                debug!(database = %db, id = %id, rev = %rev, "Document written");
                Response::new(201, json!({"ok": true, "id": id, "rev": rev}))
            }
            Err(response) => response,
        }
    }

    fn bulk_docs(&self, db: &str, request: &Request) -> Response {
        let docs = match request
            .body
            .as_ref()
            .and_then(|body| body.get("docs"))
            .and_then(Value::as_array)
        {
            Some(docs) => docs.clone(),
            None => return bad_request("POST body must include `docs` parameter."),
        };

        let mut state = self.state.write();
        let Some(database) = state.get_mut(db) else {
            return missing_database();
        };

        let rows: Vec<Value> = docs
            .into_iter()
            .map(|doc| {
                let Value::Object(body) = doc else {
                    return json!({"error": "bad_request", "reason": "Document must be a JSON object"});
                };
                let id = body
                    .get("_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(new_id);
                match database.write(id.clone(), body) {
                    Ok(rev) => json!({"ok": true, "id": id, "rev": rev}),
                    Err(response) => json!({
                        "id": id,
                        "error": response.error(),
                        "reason": response.reason(),
                    }),
                }
            })
            .collect();

        Response::new(201, Value::Array(rows))
    }

    fn all_docs(&self, db: &str, request: &Request) -> Response {
        let window = match RowWindow::from_request(request) {
            Ok(window) => window,
            Err(response) => return response,
        };
        let state = self.state.read();
        let Some(database) = state.get(db) else {
            return missing_database();
        };

        let rows: Vec<Value> = database
            .live_docs()
            .map(|(id, doc)| {
                let mut row = json!({"id": id, "key": id, "value": {"rev": doc.rev}});
                if window.include_docs {
                    row["doc"] = doc.to_json(id);
                }
                row
            })
            .collect();

        window.reply(rows)
    }

    fn query_view(&self, db: &str, design: &str, view: &str, request: &Request) -> Response {
        let window = match RowWindow::from_request(request) {
            Ok(window) => window,
            Err(response) => return response,
        };
        let key = match query_param(request, "key").map(serde_json::from_str::<Value>) {
            Some(Ok(key)) => Some(key),
            Some(Err(e)) => return bad_request(&format!("Invalid key JSON: {}", e)),
            None => None,
        };

        let state = self.state.read();
        let Some(database) = state.get(db) else {
            return missing_database();
        };
        let design_id = format!("{}{}", DESIGN_PREFIX, design);
        let Some(design_doc) = database.docs.get(&design_id).filter(|doc| !doc.deleted) else {
            return not_found("missing");
        };
        if design_doc
            .body
            .get("views")
            .and_then(|views| views.get(view))
            .is_none()
        {
            return not_found("missing_named_view");
        }

        let emit: Box<dyn Fn(&str, &StoredDoc) -> Option<Value>> = if view == "all" {
            Box::new(|id: &str, _: &StoredDoc| Some(Value::String(id.to_string())))
        } else if let Some(attribute) = view.strip_prefix("by_") {
            let attribute = attribute.to_string();
            Box::new(move |_: &str, doc: &StoredDoc| doc.body.get(&attribute).cloned())
        } else {
            return Response::new(
                501,
                json!({"error": "not_implemented", "reason": format!("View '{}' cannot be evaluated in memory", view)}),
            );
        };

        let mut rows: Vec<(Value, &String, &StoredDoc)> = database
            .live_docs()
            .filter(|(id, doc)| {
                !id.starts_with(DESIGN_PREFIX)
                    && doc.body.get(TYPE_FIELD).and_then(Value::as_str) == Some(design)
            })
            .filter_map(|(id, doc)| emit(id.as_str(), doc).map(|key| (key, id, doc)))
            .collect();
        rows.sort_by(|a, b| collate(&a.0, &b.0).then_with(|| a.1.cmp(b.1)));

        let rows: Vec<Value> = rows
            .into_iter()
            .filter(|(emitted, _, _)| {
                key.as_ref()
                    .map_or(true, |key| collate(emitted, key) == Ordering::Equal)
            })
            .map(|(emitted, id, doc)| {
                let mut row = json!({"id": id, "key": emitted, "value": Value::Null});
                if window.include_docs {
                    row["doc"] = doc.to_json(id);
                }
                row
            })
            .collect();

        window.reply(rows)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path()))]
    async fn send(&self, request: Request) -> Result<Response> {
        let response = self.dispatch(&request);
        debug!(status = response.status, "Memory response");
        Ok(response)
    }
}

/// Paging options shared by `_all_docs` and views
struct RowWindow {
    include_docs: bool,
    limit: Option<usize>,
    skip: usize,
}

impl RowWindow {
    fn from_request(request: &Request) -> std::result::Result<Self, Response> {
        let parse = |name: &str| -> std::result::Result<Option<usize>, Response> {
            query_param(request, name)
                .map(|raw| {
                    raw.parse::<usize>().map_err(|_| {
                        Response::new(
                            400,
                            json!({"error": "query_parse_error", "reason": format!("Invalid value for integer: \"{}\"", raw)}),
                        )
                    })
                })
                .transpose()
        };

        Ok(Self {
            include_docs: query_param(request, "include_docs") == Some("true"),
            limit: parse("limit")?,
            skip: parse("skip")?.unwrap_or(0),
        })
    }

    fn reply(&self, rows: Vec<Value>) -> Response {
        let total_rows = rows.len();
        let rows: Vec<Value> = rows
            .into_iter()
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect();
        Response::new(
            200,
            json!({"total_rows": total_rows, "offset": self.skip, "rows": rows}),
        )
    }
}

/// CouchDB-like key collation
pub fn collate(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(false) => 1,
            Value::Bool(true) => 2,
            Value::Number(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) => 5,
            Value::Object(_) => 6,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => x
            .iter()
            .zip(y.iter())
            .map(|(x, y)| collate(x, y))
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        (Value::Object(x), Value::Object(y)) => x
            .iter()
            .zip(y.iter())
            .map(|((kx, vx), (ky, vy))| kx.cmp(ky).then_with(|| collate(vx, vy)))
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn valid_database_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+-/".contains(c))
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn query_param<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request
        .query
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn object_body(request: &Request) -> std::result::Result<Map<String, Value>, Response> {
    match &request.body {
        Some(Value::Object(body)) => Ok(body.clone()),
        _ => Err(bad_request("Document must be a JSON object")),
    }
}

fn missing_database() -> Response {
    Response::new(
        404,
        json!({"error": "not_found", "reason": "Database does not exist."}),
    )
}

fn not_found(reason: &str) -> Response {
    Response::new(404, json!({"error": "not_found", "reason": reason}))
}

fn conflict() -> Response {
    Response::new(
        409,
        json!({"error": "conflict", "reason": "Document update conflict."}),
    )
}

fn bad_request(reason: &str) -> Response {
    Response::new(400, json!({"error": "bad_request", "reason": reason}))
}

fn method_not_allowed() -> Response {
    Response::new(
        405,
        json!({"error": "method_not_allowed", "reason": "Only GET, PUT, POST and DELETE are allowed"}),
    )
}
