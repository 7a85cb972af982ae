//! Model registry
//!
//! Built once at startup from configuration plus code-declared models, then
//! read-only. Each model is bound to exactly one database handle; databases
//! are shared between the models that name them.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{DatabaseConfig, DivanConfig};
use crate::database::{Ack, Database};
use crate::error::{Error, Result};
use crate::model::{Model, ModelDefinition};
use crate::transport::{MemoryTransport, Transport};
use crate::views::DesignDocument;

/// Collects configuration and model definitions
pub struct RegistryBuilder {
    config: DivanConfig,
    transport: Option<Arc<dyn Transport>>,
    definitions: Vec<ModelDefinition>,
}

impl RegistryBuilder {
    pub fn new(config: DivanConfig) -> Self {
        Self {
            config,
            transport: None,
            definitions: Vec::new(),
        }
    }

    /// Registry backed by an in-process engine. Databases missing from the
    /// configuration are created with default settings.
    pub fn in_memory(transport: MemoryTransport) -> Self {
        Self::new(DivanConfig::default()).transport(Arc::new(transport))
    }

    /// Route every database through one transport instead of one HTTP
    /// client per database
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn model(mut self, definition: ModelDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn build(self) -> Result<Registry> {
        let RegistryBuilder {
            config,
            transport,
            mut definitions,
        } = self;

        for (name, model_config) in &config.models {
            definitions.push(ModelDefinition::from_config(name.clone(), model_config));
        }

        let mut by_name: BTreeMap<String, ModelDefinition> = BTreeMap::new();
        for definition in definitions {
            let name = definition.name().to_string();
            if by_name.insert(name.clone(), definition).is_some() {
                return Err(Error::Config(format!("model '{}' declared twice", name)));
            }
        }

        let mut designs: BTreeMap<String, Vec<DesignDocument>> = config
            .databases
            .keys()
            .map(|key| (key.clone(), Vec::new()))
            .collect();
        for definition in by_name.values() {
            designs
                .entry(definition.database_key().to_string())
                .or_default()
                .push(definition.design_document());
        }

        let mut databases = BTreeMap::new();
        for (key, designs) in designs {
            let database_config = match (config.databases.get(&key), &transport) {
                (Some(database_config), _) => database_config.clone(),
                (None, Some(_)) => DatabaseConfig::default(),
                (None, None) => return Err(Error::UnknownDatabase(key)),
            };
            let database = match &transport {
                Some(transport) => {
                    Database::with_transport(key.clone(), database_config, transport.clone())
                }
                None => Database::new(key.clone(), database_config)?,
            };
            debug!(database = %key, designs = designs.len(), "Database registered");
            databases.insert(key, Arc::new(database.with_designs(designs)));
        }

        let mut models = BTreeMap::new();
        for (name, definition) in by_name {
            let database = databases
                .get(definition.database_key())
                .cloned()
                .ok_or_else(|| Error::UnknownDatabase(definition.database_key().to_string()))?;
            models.insert(name, Model::new(definition, database));
        }

        info!(
            databases = databases.len(),
            models = models.len(),
            "Registry built"
        );
        Ok(Registry { databases, models })
    }
}

/// Read-only lookup of databases and models
#[derive(Debug, Clone)]
pub struct Registry {
    databases: BTreeMap<String, Arc<Database>>,
    models: BTreeMap<String, Model>,
}

impl Registry {
    pub fn builder(config: DivanConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    pub fn database(&self, name: &str) -> Result<Arc<Database>> {
        self.databases
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownDatabase(name.to_string()))
    }

    pub fn model(&self, name: &str) -> Result<Model> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownModel(name.to_string()))
    }

    pub fn databases(&self) -> impl Iterator<Item = &Arc<Database>> {
        self.databases.values()
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    /// Publish the views of every model stored in `database`
    pub async fn create_views(&self, database: &str) -> Result<Vec<Ack>> {
        self.database(database)?.create_views().await
    }
}
