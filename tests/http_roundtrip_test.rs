//! The HTTP transport talking to the stand-in server over a real socket

use divan::error::Error;
use divan::server::{serve, AppState, ServerConfig};
use divan::{
    Attributes, DatabaseConfig, Datum, DeleteAllOptions, DivanConfig, MemoryTransport,
    ModelDefinition, Registry, RegistryBuilder,
};
use tokio::net::TcpListener;

/// Start a server on an ephemeral port; returns the port
async fn start(databases: &[&str]) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind listener");
    let port = listener.local_addr().expect("No local address").port();

    let config = ServerConfig {
        http_addr: "127.0.0.1".to_string(),
        http_port: port,
        databases: databases.iter().map(|name| name.to_string()).collect(),
    };
    let state = AppState::new(MemoryTransport::new(), config);
    tokio::spawn(async move {
        if let Err(e) = serve(listener, state).await {
            panic!("Server failed: {}", e);
        }
    });
    port
}

fn registry(port: u16) -> Registry {
    let config = DivanConfig::default().with_database(
        "proof_of_concept",
        DatabaseConfig::default()
            .with_host("127.0.0.1")
            .with_port(port)
            .with_credentials("admin", "top1secret2pass"),
    );
    RegistryBuilder::new(config)
        .model(
            ModelDefinition::new("viewed_model")
                .database("proof_of_concept")
                .view_by("value")
                .view_by("mod"),
        )
        .build()
        .expect("Failed to build registry")
}

#[tokio::test]
async fn test_database_lifecycle_over_http() {
    let port = start(&[]).await;
    let registry = registry(port);
    let database = registry.database("proof_of_concept").unwrap();

    assert!(!database.exists().await);
    assert!(matches!(database.stats().await, Err(Error::DatabaseNotFound(_))));
    assert!(database.create().await.unwrap().ok);
    assert!(matches!(
        database.create().await,
        Err(Error::DatabaseAlreadyCreated(_))
    ));
    assert_eq!(database.stats().await.unwrap().db_name, "proof_of_concept");
    assert!(database.delete().await.unwrap().ok);
    assert!(matches!(database.delete().await, Err(Error::DatabaseNotFound(_))));
}

#[tokio::test]
async fn test_documents_and_views_over_http() {
    let port = start(&["proof_of_concept"]).await;
    let registry = registry(port);
    let model = registry.model("viewed_model").unwrap();

    let params: Vec<Attributes> = (0..10)
        .map(|n: i64| {
            Attributes::from_iter([
                ("mod", Datum::from(n % 2)),
                ("value", Datum::from(format!("{} mod 2", n))),
            ])
        })
        .collect();
    let created = model.create(params).await.unwrap();
    assert_eq!(created.len(), 10);

    let object = model.by("value", "5 mod 2").await.unwrap().unwrap();
    assert_eq!(object["mod"], 1i64);
    assert_eq!(model.all_by("mod", 0).unwrap().count().await.unwrap(), 5);

    let mut stale = model.find(created[0].id().unwrap()).await.unwrap().unwrap();
    let mut fresh = stale.clone();
    fresh.set("touched", true).unwrap();
    assert!(fresh.save().await.unwrap().is_saved());
    stale.set("touched", false).unwrap();
    assert!(matches!(
        stale.save().await,
        Err(Error::DocumentConflict { .. })
    ));

    assert_eq!(model.delete_all(DeleteAllOptions::limit(6)).await.unwrap(), 6);
    assert_eq!(model.delete_all(DeleteAllOptions::default()).await.unwrap(), 4);
    assert!(model.find("_design/viewed_model").await.unwrap().is_some());
}

#[tokio::test]
async fn test_unreachable_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let database = registry(port).database("proof_of_concept").unwrap();
    assert!(!database.exists().await);
    assert!(matches!(database.create().await, Err(Error::Transport(_))));
}
