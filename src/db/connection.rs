use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::Surreal;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("SCHED_DB_URL").unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("SCHED_DB_NAMESPACE").unwrap_or_else(|_| "lab".to_string()),
            database: env::var("SCHED_DB_DATABASE").unwrap_or_else(|_| "scheduler".to_string()),
            username: env::var("SCHED_DB_USERNAME").ok(),
            password: env::var("SCHED_DB_PASSWORD").ok(),
        }
    }
}

impl DatabaseConfig {
    /// Fresh in-memory database, independent of the environment.
    pub fn memory() -> Self {
        Self {
            url: "memory".to_string(),
            namespace: "lab".to_string(),
            database: "scheduler".to_string(),
            username: None,
            password: None,
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}
