//! SQLite persistence for permanent attachments.

use super::session_store::StoreResult;
use crate::models::{
    Metadata,
    attachment::{Attachment, NewAttachment, OwnerRef},
};
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool, types::Json};
use std::sync::Arc;

const ATTACHMENT_COLUMNS: &str = "id, storage_path, original_filename, size_bytes, owner_type, owner_id, uploaded_by, scope, created_at, properties";

#[derive(Clone)]
pub struct AttachmentStore {
    db: Arc<SqlitePool>,
}

impl AttachmentStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn insert(&self, new: &NewAttachment) -> StoreResult<Attachment> {
        let mut conn = self.db.acquire().await?;
        Ok(insert_with(&mut conn, new).await?)
    }

    /// Insert every record and delete the originating session with its upload
    /// rows, all in one transaction. Returns `None` and changes nothing when the
    /// session is already gone.
    pub async fn commit_session(
        &self,
        session_id: &str,
        items: &[NewAttachment],
    ) -> StoreResult<Option<Vec<Attachment>>> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM uploads WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        if removed.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(None);
        }

        let mut created = Vec::with_capacity(items.len());
        for new in items {
            created.push(insert_with(&mut tx, new).await?);
        }
        tx.commit().await?;
        Ok(Some(created))
    }

    pub async fn get(&self, id: i64) -> StoreResult<Option<Attachment>> {
        Ok(sqlx::query_as::<_, Attachment>(&format!(
            "SELECT {} FROM attachments WHERE id = ?",
            ATTACHMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await?)
    }

    pub async fn list_for_owner(&self, owner: &OwnerRef) -> StoreResult<Vec<Attachment>> {
        Ok(sqlx::query_as::<_, Attachment>(&format!(
            "SELECT {} FROM attachments WHERE owner_type = ? AND owner_id = ? ORDER BY id ASC",
            ATTACHMENT_COLUMNS
        ))
        .bind(&owner.owner_type)
        .bind(&owner.owner_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Replace the stored properties. The owner pair is never touched.
    pub async fn update_properties(&self, id: i64, properties: &Metadata) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE attachments SET properties = ? WHERE id = ?")
            .bind(Json(properties))
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM attachments WHERE id = ?")
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

async fn insert_with(conn: &mut SqliteConnection, new: &NewAttachment) -> Result<Attachment, sqlx::Error> {
    sqlx::query_as::<_, Attachment>(&format!(
        "INSERT INTO attachments
            (storage_path, original_filename, size_bytes, owner_type, owner_id, uploaded_by, scope, created_at, properties)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING {}",
        ATTACHMENT_COLUMNS
    ))
    .bind(&new.storage_path)
    .bind(&new.original_filename)
    .bind(new.size_bytes)
    .bind(&new.owner.owner_type)
    .bind(&new.owner.owner_id)
    .bind(&new.uploaded_by)
    .bind(&new.scope)
    .bind(Utc::now())
    .bind(Json(&new.properties))
    .fetch_one(&mut *conn)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        services::session_store::{NewSession, SessionStore},
    };

    fn new_attachment(path: &str, owner_id: &str) -> NewAttachment {
        NewAttachment {
            storage_path: path.to_string(),
            original_filename: "report.pdf".into(),
            size_bytes: 42,
            owner: OwnerRef::new("crm.contact", owner_id),
            uploaded_by: Some("alice".into()),
            scope: String::new(),
            properties: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn insert_get_update_delete() {
        let store = AttachmentStore::new(Arc::new(db::memory_pool().await.unwrap()));
        let created = store.insert(&new_attachment("crm/contact/1/report.pdf", "1")).await.unwrap();
        assert_eq!(created.owner(), OwnerRef::new("crm.contact", "1"));

        let mut props = Metadata::new();
        props.insert("title".into(), vec!["Q3".into()]);
        assert!(store.update_properties(created.id, &props).await.unwrap());
        let fetched = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.properties.0, props);
        assert_eq!(fetched.owner_id, "1");

        assert!(store.delete(created.id).await.unwrap());
        assert!(store.get(created.id).await.unwrap().is_none());
        assert!(!store.update_properties(created.id, &props).await.unwrap());
    }

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let pool = Arc::new(db::memory_pool().await.unwrap());
        let store = AttachmentStore::new(pool.clone());
        let sessions = SessionStore::new(pool);
        let session = sessions.create(&NewSession::default()).await.unwrap();
        sessions.insert_upload(&session.id, "/tmp/staged-a", "a.pdf", 42).await.unwrap();
        store.insert(&new_attachment("taken.pdf", "9")).await.unwrap();

        let batch = vec![new_attachment("fresh.pdf", "1"), new_attachment("taken.pdf", "1")];
        assert!(store.commit_session(&session.id, &batch).await.is_err());
        let owner = OwnerRef::new("crm.contact", "1");
        assert!(store.list_for_owner(&owner).await.unwrap().is_empty());
        assert!(sessions.get(&session.id).await.unwrap().is_some());
        assert_eq!(sessions.list_uploads(&session.id).await.unwrap().len(), 1);

        let batch = vec![new_attachment("a.pdf", "1"), new_attachment("b.pdf", "1")];
        let created = store.commit_session(&session.id, &batch).await.unwrap().unwrap();
        assert!(sessions.get(&session.id).await.unwrap().is_none());
        assert!(sessions.list_uploads(&session.id).await.unwrap().is_empty());

        // A second commit of the same session finds nothing to consume.
        let again = vec![new_attachment("c.pdf", "1")];
        assert!(store.commit_session(&session.id, &again).await.unwrap().is_none());
        let listed: Vec<String> = store
            .list_for_owner(&owner)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.storage_path)
            .collect();
        assert_eq!(created.len(), 2);
        assert_eq!(listed, vec!["a.pdf", "b.pdf"]);
    }
}
