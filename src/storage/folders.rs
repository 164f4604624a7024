use super::live::LiveQuery;
use super::schema::FeedStore;
use super::types::{Folder, StoreError, StoreResult, Table};
use crate::util::strip_control_chars;

const FOLDERS: &[Table] = &[Table::Folders];

impl FeedStore {
    // ========================================================================
    // Folder Operations
    // ========================================================================

    /// Strip control characters and surrounding whitespace; reject names that
    /// end up empty.
    pub(crate) fn sanitize_folder_name(name: &str) -> StoreResult<String> {
        let sanitized = strip_control_chars(name);
        let trimmed = sanitized.trim();
        if trimmed.is_empty() {
            return Err(StoreError::ConstraintViolation(
                "folder name cannot be empty or whitespace-only".to_string(),
            ));
        }
        Ok(trimmed.to_owned())
    }

    /// Create a folder. Returns `false` if it already existed.
    pub async fn create_folder(&self, name: &str) -> StoreResult<bool> {
        let name = Self::sanitize_folder_name(name)?;

        let (gate, mut tx) = self.begin_write().await?;
        let created = sqlx::query("INSERT OR IGNORE INTO folders (name) VALUES (?)")
            .bind(&name)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        tx.commit().await?;
        drop(gate);

        if created {
            self.notify(FOLDERS);
        }
        Ok(created)
    }

    /// Delete a folder. Its sources stay and become unfiled.
    pub async fn delete_folder(&self, name: &str) -> StoreResult<bool> {
        let (gate, mut tx) = self.begin_write().await?;
        let deleted = sqlx::query("DELETE FROM folders WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        tx.commit().await?;
        drop(gate);

        if deleted {
            // ON DELETE SET NULL rewrote the referencing sources
            self.notify(&[Table::Folders, Table::Sources]);
            tracing::info!(folder = %name, "Deleted folder");
        }
        Ok(deleted)
    }

    /// Rename a folder; its sources follow the new name.
    ///
    /// Renaming onto an existing folder name is a `ConstraintViolation`.
    pub async fn rename_folder(&self, old_name: &str, new_name: &str) -> StoreResult<bool> {
        let new_name = Self::sanitize_folder_name(new_name)?;

        let (gate, mut tx) = self.begin_write().await?;
        let renamed = sqlx::query("UPDATE folders SET name = ? WHERE name = ?")
            .bind(&new_name)
            .bind(old_name)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;
        tx.commit().await?;
        drop(gate);

        if renamed {
            // ON UPDATE CASCADE rewrote the referencing sources
            self.notify(&[Table::Folders, Table::Sources]);
        }
        Ok(renamed)
    }

    /// Every folder, ordered by name.
    pub async fn all_folders(&self) -> StoreResult<Vec<Folder>> {
        let rows = sqlx::query_as::<_, Folder>("SELECT name FROM folders ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub fn watch_folders(&self) -> LiveQuery<Folder> {
        self.live_query(FOLDERS, |store| async move { store.all_folders().await })
    }
}
