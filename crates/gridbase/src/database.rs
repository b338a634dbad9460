//! Database connection and metadata schema management

use sea_orm::sea_query::Index;
use sea_orm::{
    ConnectOptions, ConnectionTrait, Database as SeaOrmDatabase, DatabaseConnection,
    DatabaseTransaction, EntityName, EntityTrait, PaginatorTrait, Schema, TransactionTrait,
};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::batch::BatchCoordinator;
use crate::config::GridConfig;
use crate::dialect::Dialect;
use crate::entity::{field, ops, reference, table_meta};
use crate::error::{GridError, Result};
use crate::field::FieldSchemaManager;
use crate::op_log::OpLog;
use crate::record_store::VersionedRecordStore;
use crate::table::TableManager;

const OPS_UNIQUE_INDEX: &str = "ops_collection_doc_id_version_key";

/// Connection pool plus the services bound to its engine
pub struct Database {
    connection: DatabaseConnection,
    dialect: Dialect,
    config: GridConfig,
}

impl Database {
    /// Connect with the pool settings from `config`, retrying transient failures
    pub async fn connect(config: &GridConfig) -> Result<Self> {
        info!("Connecting to database: {}", mask_url(&config.database_url));

        let mut attempts = 0;
        const MAX_ATTEMPTS: u32 = 3;
        const RETRY_DELAY: Duration = Duration::from_secs(2);

        loop {
            attempts += 1;

            let mut opt = ConnectOptions::new(config.database_url.clone());
            opt.max_connections(config.max_connections)
                .min_connections(config.min_connections)
                .connect_timeout(Duration::from_secs(config.connection_timeout_secs))
                .idle_timeout(Duration::from_secs(600))
                .max_lifetime(Duration::from_secs(3600))
                .sqlx_logging(config.enable_sql_logging)
                .sqlx_logging_level(tracing::log::LevelFilter::Debug);

            match SeaOrmDatabase::connect(opt).await {
                Ok(connection) => {
                    let db = Self::from_connection(connection, config.clone());
                    info!(
                        "Connected to {:?} database (pool max: {}, min: {})",
                        db.dialect, config.max_connections, config.min_connections
                    );
                    return Ok(db);
                }
                Err(e) if attempts < MAX_ATTEMPTS => {
                    warn!(
                        "Failed to connect to database (attempt {}/{}): {}",
                        attempts, MAX_ATTEMPTS, e
                    );
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(e) => {
                    error!("Failed to connect to database after {} attempts", MAX_ATTEMPTS);
                    return Err(e.into());
                }
            }
        }
    }

    /// Wrap an already established connection
    pub fn from_connection(connection: DatabaseConnection, config: GridConfig) -> Self {
        let dialect = Dialect::from(connection.get_database_backend());
        Self {
            connection,
            dialect,
            config,
        }
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.connection
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub async fn begin(&self) -> Result<DatabaseTransaction> {
        Ok(self.connection.begin().await?)
    }

    /// Create the metadata tables and the op log index when missing
    pub async fn migrate(&self) -> Result<()> {
        let backend = self.connection.get_database_backend();
        let schema = Schema::new(backend);

        let mut statements = vec![
            schema.create_table_from_entity(table_meta::Entity),
            schema.create_table_from_entity(field::Entity),
            schema.create_table_from_entity(ops::Entity),
            schema.create_table_from_entity(reference::Entity),
        ];
        for statement in statements.iter_mut() {
            statement.if_not_exists();
            self.connection.execute(backend.build(&*statement)).await?;
        }

        let indexes = self
            .connection
            .query_all(self.dialect.table_indexes_query(ops::Entity.table_name()))
            .await?;
        let exists = indexes.iter().any(|row| {
            row.try_get::<String>("", "name")
                .map(|name| name == OPS_UNIQUE_INDEX)
                .unwrap_or(false)
        });
        if !exists {
            let index = Index::create()
                .name(OPS_UNIQUE_INDEX)
                .table(ops::Entity)
                .col(ops::Column::Collection)
                .col(ops::Column::DocId)
                .col(ops::Column::Version)
                .unique()
                .to_owned();
            self.connection.execute(backend.build(&index)).await?;
            debug!("Created index {}", OPS_UNIQUE_INDEX);
        }

        info!("Metadata schema is up to date");
        Ok(())
    }

    /// Ping the pool and read from the metadata tables
    pub async fn health_check(&self) -> Result<u64> {
        self.connection.ping().await?;
        table_meta::Entity::find()
            .count(&self.connection)
            .await
            .map_err(|e| GridError::Other(anyhow::anyhow!("Health check failed: {}", e)))
    }

    pub fn batch_coordinator(&self) -> BatchCoordinator {
        BatchCoordinator::new(self.dialect, &self.config)
    }

    pub fn field_manager(&self) -> FieldSchemaManager {
        FieldSchemaManager::new(self.dialect)
    }

    pub fn table_manager(&self) -> TableManager {
        TableManager::new(self.dialect)
    }

    pub fn record_store(&self) -> VersionedRecordStore {
        VersionedRecordStore::new(self.dialect)
    }

    pub fn op_log(&self) -> OpLog {
        OpLog::new()
    }
}

/// Mask the password of a database URL for logging
pub fn mask_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => match parsed.password() {
            Some(password) => url.replacen(password, "****", 1),
            None => url.to_string(),
        },
        Err(_) => match url.find('@') {
            Some(at_pos) => format!("****{}", &url[at_pos..]),
            None => url.to_string(),
        },
    }
}
