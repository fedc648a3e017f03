//! User storage and credential checks.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::Db;
use crate::db::schema::{UserCreate, UserRecord};
use crate::error::{SchedulerError, SchedulerResult};
use crate::types::PasswordHash;

/// Name of the account the scheduler itself submits tasks as.
pub const SYSTEM_USER: &str = "BIG BROTHER";

/// Hash a password with its per-user salt.
pub fn hash_password(password: &str, salt: &str) -> PasswordHash {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    PasswordHash::new(format!("{:x}", hasher.finalize()))
}

/// User store for database operations.
#[derive(Clone)]
pub struct UserStore {
    db: Db,
}

impl UserStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create a user. Fails with [`SchedulerError::UserExists`] if the name
    /// is taken.
    pub async fn create_user(&self, name: &str, password: &str) -> SchedulerResult<UserRecord> {
        self.insert_user(name, password, false).await
    }

    async fn insert_user(
        &self,
        name: &str,
        password: &str,
        is_system: bool,
    ) -> SchedulerResult<UserRecord> {
        if self.find_user(name).await?.is_some() {
            return Err(SchedulerError::UserExists(name.to_string()));
        }

        let salt = Uuid::new_v4().simple().to_string();
        let create = UserCreate {
            name: name.to_string(),
            password_hash: hash_password(password, &salt),
            salt,
            is_system,
        };

        let query = r#"
            CREATE user CONTENT {
                name: $name,
                password_hash: $password_hash,
                salt: $salt,
                is_system: $is_system,
                is_active: true
            }
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("name", create.name))
            .bind(("password_hash", create.password_hash))
            .bind(("salt", create.salt))
            .bind(("is_system", create.is_system))
            .await?;

        let users: Vec<UserRecord> = res.take(0)?;
        users
            .into_iter()
            .next()
            .ok_or_else(|| SchedulerError::Database(format!("failed to create user `{name}`")))
    }

    pub async fn find_user(&self, name: &str) -> SchedulerResult<Option<UserRecord>> {
        let query = "SELECT * FROM user WHERE name = $name LIMIT 1";

        let mut res = self
            .db
            .query(query)
            .bind(("name", name.to_string()))
            .await?;

        let users: Vec<UserRecord> = res.take(0)?;
        Ok(users.into_iter().next())
    }

    /// Check a user's password.
    pub async fn verify(&self, name: &str, password: &str) -> SchedulerResult<UserRecord> {
        let user = self
            .find_user(name)
            .await?
            .filter(|u| u.is_active)
            .ok_or_else(|| SchedulerError::UserNotFound(name.to_string()))?;

        if hash_password(password, &user.salt) != user.password_hash {
            return Err(SchedulerError::InvalidCredentials(name.to_string()));
        }
        Ok(user)
    }

    /// Load the system account, creating it on first use.
    ///
    /// The secret is regenerated every process start, so an existing account
    /// has its password replaced.
    pub async fn get_or_create_system_user(&self, secret: &str) -> SchedulerResult<UserRecord> {
        let Some(existing) = self.find_user(SYSTEM_USER).await? else {
            return self.insert_user(SYSTEM_USER, secret, true).await;
        };

        let salt = Uuid::new_v4().simple().to_string();
        let query = r#"
            UPDATE $id SET
                password_hash = $password_hash,
                salt = $salt,
                is_system = true
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("id", existing.id.clone()))
            .bind(("password_hash", hash_password(secret, &salt)))
            .bind(("salt", salt))
            .await?;

        let users: Vec<UserRecord> = res.take(0)?;
        Ok(users.into_iter().next().unwrap_or(existing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DatabaseConfig, create_connection, ensure_schema};

    async fn setup_test_db() -> Db {
        let db = create_connection(DatabaseConfig::memory()).await.unwrap();
        ensure_schema(&db).await.unwrap();
        db
    }

    #[test]
    fn test_hash_depends_on_salt() {
        assert_eq!(hash_password("pw", "a"), hash_password("pw", "a"));
        assert_ne!(hash_password("pw", "a"), hash_password("pw", "b"));
        assert_eq!(hash_password("pw", "a").as_str().len(), 64);
    }

    #[tokio::test]
    async fn test_create_and_verify() {
        let store = UserStore::new(setup_test_db().await);
        let user = store.create_user("alice", "s3cret").await.unwrap();
        assert_eq!(user.name, "alice");
        assert_ne!(user.password_hash.as_str(), "s3cret");

        let verified = store.verify("alice", "s3cret").await.unwrap();
        assert_eq!(verified.id, user.id);
        assert!(matches!(
            store.verify("alice", "wrong").await,
            Err(SchedulerError::InvalidCredentials(_))
        ));
        assert!(matches!(
            store.verify("bob", "s3cret").await,
            Err(SchedulerError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_user_rejected() {
        let store = UserStore::new(setup_test_db().await);
        store.create_user("alice", "a").await.unwrap();
        assert!(matches!(
            store.create_user("alice", "b").await,
            Err(SchedulerError::UserExists(_))
        ));
    }

    #[tokio::test]
    async fn test_system_user_secret_rotates() {
        let store = UserStore::new(setup_test_db().await);
        let first = store.get_or_create_system_user("one").await.unwrap();
        assert!(first.is_system);
        let second = store.get_or_create_system_user("two").await.unwrap();
        assert_eq!(first.id, second.id);

        assert!(store.verify(SYSTEM_USER, "two").await.is_ok());
        assert!(store.verify(SYSTEM_USER, "one").await.is_err());
    }
}
