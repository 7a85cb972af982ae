//! HTTP routes definition

use axum::{routing::any, Router};

use super::handlers;

/// Every path is forwarded to the engine, which does its own routing:
/// - /                                   - Welcome
/// - /_all_dbs                           - List databases
/// - /:db                                - Create, drop, info, post document
/// - /:db/_bulk_docs                     - Bulk write
/// - /:db/_all_docs                      - List documents
/// - /:db/_design/:name/_view/:view      - Query a view
/// - /:db/:id                            - Read, write, delete a document
pub fn couch_routes() -> Router {
    Router::new()
        .route("/", any(handlers::root))
        .route("/*path", any(handlers::forward))
}
