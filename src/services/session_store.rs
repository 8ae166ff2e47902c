//! SQLite persistence for sessions and their uploads.

use crate::models::{
    Metadata,
    session::{Session, ValidationPolicy},
    upload::Upload,
};
use chrono::{Duration, Utc};
use sqlx::{SqlitePool, types::Json};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("could not create a unique attachment session")]
    SessionIdExhausted,
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Attempts at minting a fresh session token before giving up.
pub const SESSION_ID_ATTEMPTS: usize = 5;

/// An attach claim older than this is treated as abandoned (the process
/// holding it died) and may be taken over.
pub const ATTACH_CLAIM_MINUTES: i64 = 15;

const SESSION_COLUMNS: &str = "id, owner, target_kind, scope, created_at, policy, metadata";
const UPLOAD_COLUMNS: &str = "id, session_id, staged_path, original_filename, size_bytes, created_at";

/// Fields of a session chosen by the caller at creation time.
#[derive(Clone, Debug, Default)]
pub struct NewSession {
    pub owner: Option<String>,
    pub target_kind: Option<String>,
    pub scope: String,
    pub policy: ValidationPolicy,
}

#[derive(Clone)]
pub struct SessionStore {
    db: Arc<SqlitePool>,
}

impl SessionStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Insert a session under a freshly generated token, retrying on collision.
    pub async fn create(&self, new: &NewSession) -> StoreResult<Session> {
        for attempt in 1..=SESSION_ID_ATTEMPTS {
            let id = Uuid::new_v4().simple().to_string();
            match self.insert(&id, new).await {
                Ok(session) => return Ok(session),
                Err(err) if is_unique_violation(&err) => {
                    tracing::warn!(attempt, "session id collision, retrying");
                }
                Err(err) => return Err(StoreError::Sqlx(err)),
            }
        }
        Err(StoreError::SessionIdExhausted)
    }

    /// Insert a session with a caller-chosen token. Fails on an existing token.
    pub async fn insert(&self, id: &str, new: &NewSession) -> Result<Session, sqlx::Error> {
        sqlx::query_as::<_, Session>(&format!(
            "INSERT INTO sessions (id, owner, target_kind, scope, created_at, policy, metadata)
             VALUES (?, ?, ?, ?, ?, ?, '{{}}')
             RETURNING {}",
            SESSION_COLUMNS
        ))
        .bind(id)
        .bind(&new.owner)
        .bind(&new.target_kind)
        .bind(&new.scope)
        .bind(Utc::now())
        .bind(Json(&new.policy))
        .fetch_one(&*self.db)
        .await
    }

    pub async fn get(&self, id: &str) -> StoreResult<Option<Session>> {
        Ok(sqlx::query_as::<_, Session>(&format!(
            "SELECT {} FROM sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?)
    }

    /// Merge values into the session metadata in a single statement so that
    /// concurrent merges never drop each other's keys. Per key, last write wins.
    pub async fn merge_metadata(&self, id: &str, values: &Metadata) -> StoreResult<bool> {
        if values.is_empty() {
            return Ok(self.get(id).await?.is_some());
        }
        let result = sqlx::query("UPDATE sessions SET metadata = json_patch(metadata, ?) WHERE id = ?")
            .bind(Json(values))
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Mark the session as being attached. Only one caller wins; the others get
    /// `false`, as does a caller naming a missing session.
    pub async fn claim_for_attach(&self, id: &str) -> StoreResult<bool> {
        let now = Utc::now();
        let stale = now - Duration::minutes(ATTACH_CLAIM_MINUTES);
        let result = sqlx::query(
            "UPDATE sessions SET attaching_at = ?
             WHERE id = ? AND (attaching_at IS NULL OR attaching_at < ?)",
        )
        .bind(now)
        .bind(id)
        .bind(stale)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop an attach claim so the session can be attached again.
    pub async fn release_claim(&self, id: &str) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET attaching_at = NULL WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Remove the session row and every upload row. Staged bytes must already be
    /// gone; see `SessionEngine::abandon`.
    pub async fn delete(&self, id: &str) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM uploads WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn insert_upload(
        &self,
        session_id: &str,
        staged_path: &str,
        original_filename: &str,
        size_bytes: i64,
    ) -> StoreResult<Upload> {
        Ok(sqlx::query_as::<_, Upload>(&format!(
            "INSERT INTO uploads (session_id, staged_path, original_filename, size_bytes, created_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {}",
            UPLOAD_COLUMNS
        ))
        .bind(session_id)
        .bind(staged_path)
        .bind(original_filename)
        .bind(size_bytes)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?)
    }

    /// Uploads of a session in creation order.
    pub async fn list_uploads(&self, session_id: &str) -> StoreResult<Vec<Upload>> {
        Ok(sqlx::query_as::<_, Upload>(&format!(
            "SELECT {} FROM uploads WHERE session_id = ? ORDER BY id ASC",
            UPLOAD_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Fetch an upload only if it belongs to the given session.
    pub async fn get_upload(&self, session_id: &str, upload_id: i64) -> StoreResult<Option<Upload>> {
        Ok(sqlx::query_as::<_, Upload>(&format!(
            "SELECT {} FROM uploads WHERE id = ? AND session_id = ?",
            UPLOAD_COLUMNS
        ))
        .bind(upload_id)
        .bind(session_id)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn delete_upload(&self, upload_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn store() -> SessionStore {
        SessionStore::new(Arc::new(db::memory_pool().await.unwrap()))
    }

    fn meta(pairs: &[(&str, &[&str])]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[tokio::test]
    async fn create_and_fetch() {
        let store = store().await;
        let new = NewSession {
            owner: Some("alice".into()),
            target_kind: Some("crm.contact".into()),
            scope: "avatar".into(),
            policy: ValidationPolicy::from_lists("pdf", "", true),
        };
        let session = store.create(&new).await.unwrap();
        assert_eq!(session.id.len(), 32);
        assert!(session.id.chars().all(|c| c.is_ascii_hexdigit()));

        let fetched = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(fetched.owner.as_deref(), Some("alice"));
        assert_eq!(fetched.scope, "avatar");
        assert_eq!(fetched.policy.0, new.policy);
        assert!(fetched.metadata.0.is_empty());
        assert!(store.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_tokens_are_unique_violations() {
        let store = store().await;
        let new = NewSession::default();
        store.insert("abc", &new).await.unwrap();
        let err = store.insert("abc", &new).await.unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn metadata_merge_keeps_other_keys() {
        let store = store().await;
        let session = store.create(&NewSession::default()).await.unwrap();

        assert!(store.merge_metadata(&session.id, &meta(&[("a", &["1"]), ("b", &["2"])])).await.unwrap());
        assert!(store.merge_metadata(&session.id, &meta(&[("b", &["3", "4"])])).await.unwrap());

        let merged = store.get(&session.id).await.unwrap().unwrap().metadata.0;
        assert_eq!(merged, meta(&[("a", &["1"]), ("b", &["3", "4"])]));
        assert!(!store.merge_metadata("missing", &meta(&[("a", &["1"])])).await.unwrap());
    }

    #[tokio::test]
    async fn uploads_are_scoped_and_ordered() {
        let store = store().await;
        let one = store.create(&NewSession::default()).await.unwrap();
        let two = store.create(&NewSession::default()).await.unwrap();

        let a = store.insert_upload(&one.id, "/tmp/a", "a.txt", 1).await.unwrap();
        let b = store.insert_upload(&one.id, "/tmp/b", "b.txt", 2).await.unwrap();
        let c = store.insert_upload(&two.id, "/tmp/c", "c.txt", 3).await.unwrap();

        let listed: Vec<i64> = store.list_uploads(&one.id).await.unwrap().iter().map(|u| u.id).collect();
        assert_eq!(listed, vec![a.id, b.id]);

        assert!(store.get_upload(&one.id, c.id).await.unwrap().is_none());
        assert_eq!(store.get_upload(&two.id, c.id).await.unwrap().unwrap(), c);

        // Staged paths are unique.
        assert!(store.insert_upload(&two.id, "/tmp/a", "dup.txt", 1).await.is_err());

        assert!(store.delete(&one.id).await.unwrap());
        assert!(store.list_uploads(&one.id).await.unwrap().is_empty());
        assert_eq!(store.list_uploads(&two.id).await.unwrap().len(), 1);
        assert!(!store.delete(&one.id).await.unwrap());
    }

    #[tokio::test]
    async fn attach_claims_are_exclusive() {
        let store = store().await;
        let session = store.create(&NewSession::default()).await.unwrap();

        assert!(store.claim_for_attach(&session.id).await.unwrap());
        assert!(!store.claim_for_attach(&session.id).await.unwrap());
        assert!(!store.claim_for_attach("missing").await.unwrap());

        store.release_claim(&session.id).await.unwrap();
        assert!(store.claim_for_attach(&session.id).await.unwrap());

        // A claim left behind by a dead process expires.
        sqlx::query("UPDATE sessions SET attaching_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::minutes(ATTACH_CLAIM_MINUTES + 1))
            .bind(&session.id)
            .execute(&*store.db)
            .await
            .unwrap();
        assert!(store.claim_for_attach(&session.id).await.unwrap());
    }
}
