use anyhow::Result;
use serde::{Deserialize, Serialize};
use surrealdb::{RecordId, sql::Datetime};

use super::Db;
use crate::program::Program;
use crate::task::{TaskResult, TaskStatus};
use crate::types::PasswordHash;

/// Persisted user able to own tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: RecordId,
    pub name: String,
    /// Hex SHA-256 of salt and password.
    pub password_hash: PasswordHash,
    pub salt: String,
    pub is_active: bool,
    #[serde(default)]
    pub is_system: bool,
    pub created_at: Option<Datetime>,
    pub updated_at: Option<Datetime>,
}

/// Payload for creating a new user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCreate {
    pub name: String,
    pub password_hash: PasswordHash,
    pub salt: String,
    pub is_system: bool,
}

/// Persisted run of a task, committed on its terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: RecordId,
    pub task_id: i64,
    pub task_name: String,
    pub user: RecordId,
    pub status: TaskStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, with = "payload_text")]
    pub data: Option<TaskRecordData>,
    pub created_at: Option<Datetime>,
    pub updated_at: Option<Datetime>,
}

/// Results and program of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecordData {
    pub result: TaskResult,
    pub program: Program,
}

/// Run payloads are stored as JSON text: SurrealDB drops `null` members of
/// objects, and results and settings carry them freely.
mod payload_text {
    use serde::{Deserialize, Deserializer, Serializer, de, ser};

    use super::TaskRecordData;

    pub fn serialize<S: Serializer>(
        data: &Option<TaskRecordData>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match data {
            Some(data) => {
                let text = serde_json::to_string(data).map_err(ser::Error::custom)?;
                serializer.serialize_some(&text)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<TaskRecordData>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|text| serde_json::from_str(&text).map_err(de::Error::custom))
            .transpose()
    }
}

impl TaskRecordData {
    /// The stored form of a payload.
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = [
        "DEFINE TABLE IF NOT EXISTS user SCHEMAFULL;
         DEFINE FIELD IF NOT EXISTS name ON TABLE user TYPE string;
         DEFINE FIELD IF NOT EXISTS password_hash ON TABLE user TYPE string;
         DEFINE FIELD IF NOT EXISTS salt ON TABLE user TYPE string;
         DEFINE FIELD IF NOT EXISTS is_active ON TABLE user TYPE bool DEFAULT true;
         DEFINE FIELD IF NOT EXISTS is_system ON TABLE user TYPE bool DEFAULT false;
         DEFINE FIELD IF NOT EXISTS created_at ON TABLE user TYPE datetime DEFAULT time::now();
         DEFINE FIELD IF NOT EXISTS updated_at ON TABLE user TYPE datetime VALUE time::now();",

        "DEFINE TABLE IF NOT EXISTS task_record SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS task_id ON TABLE task_record TYPE int;
         DEFINE FIELD IF NOT EXISTS task_name ON TABLE task_record TYPE string;
         DEFINE FIELD IF NOT EXISTS user ON TABLE task_record TYPE record<user>;
         DEFINE FIELD IF NOT EXISTS status ON TABLE task_record TYPE string;
         DEFINE FIELD IF NOT EXISTS tags ON TABLE task_record TYPE array<string> DEFAULT [];
         DEFINE FIELD IF NOT EXISTS data ON TABLE task_record TYPE option<string>;
         DEFINE FIELD IF NOT EXISTS created_at ON TABLE task_record TYPE datetime DEFAULT time::now();
         DEFINE FIELD IF NOT EXISTS updated_at ON TABLE task_record TYPE datetime VALUE time::now();",

        "DEFINE INDEX IF NOT EXISTS user_name ON TABLE user COLUMNS name UNIQUE;
         DEFINE INDEX IF NOT EXISTS task_record_task_id ON TABLE task_record COLUMNS task_id;
         DEFINE INDEX IF NOT EXISTS task_record_user ON TABLE task_record COLUMNS user;",
    ];

    for query in schema_queries {
        db.query(query).await?;
    }

    Ok(())
}
