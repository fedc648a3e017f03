//! Task run records.

use anyhow::Result;
use surrealdb::RecordId;

use super::Db;
use super::schema::{TaskRecord, TaskRecordData};
use crate::task::TaskStatus;
use crate::types::{TaskId, TaskName};

/// Store for `task_record` rows.
#[derive(Clone)]
pub struct RecordStore {
    db: Db,
}

impl RecordStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Open a record for a task submitted by `user`.
    pub async fn create_record(
        &self,
        task_id: TaskId,
        task_name: &TaskName,
        user: &RecordId,
        tags: Vec<String>,
    ) -> Result<TaskRecord> {
        let query = r#"
            CREATE task_record CONTENT {
                task_id: $task_id,
                task_name: $task_name,
                user: $user,
                status: $status,
                tags: $tags
            }
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("task_id", task_id.get() as i64))
            .bind(("task_name", task_name.to_string()))
            .bind(("user", user.clone()))
            .bind(("status", TaskStatus::NotSubmitted))
            .bind(("tags", tags))
            .await?;

        let records: Vec<TaskRecord> = res.take(0)?;
        records
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("Failed to create record for task {}", task_id))
    }

    /// Commit the terminal status and the collected data of a run.
    pub async fn attach_result(
        &self,
        record: &RecordId,
        status: TaskStatus,
        data: TaskRecordData,
    ) -> Result<()> {
        let query = r#"
            UPDATE $record SET
                status = $status,
                data = $data
        "#;

        self.db
            .query(query)
            .bind(("record", record.clone()))
            .bind(("status", status))
            .bind(("data", data.to_text()?))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn find_by_task_id(&self, task_id: TaskId) -> Result<Option<TaskRecord>> {
        let query = "SELECT * FROM task_record WHERE task_id = $task_id LIMIT 1";

        let mut res = self
            .db
            .query(query)
            .bind(("task_id", task_id.get() as i64))
            .await?;

        let records: Vec<TaskRecord> = res.take(0)?;
        Ok(records.into_iter().next())
    }

    /// Records owned by `user`, newest first.
    pub async fn list_for_user(&self, user: &RecordId) -> Result<Vec<TaskRecord>> {
        let query = "SELECT * FROM task_record WHERE user = $user ORDER BY created_at DESC";

        let mut res = self.db.query(query).bind(("user", user.clone())).await?;
        Ok(res.take(0)?)
    }
}
