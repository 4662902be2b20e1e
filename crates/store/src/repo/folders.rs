//! Folder (scan root) operations.

use crate::error::{ErrorKind, Result};
use crate::models::{Folder, FolderRow};
use crate::repo::Store;
use exn::ResultExt;
use std::path::{Component, Path, PathBuf};
use time::UtcDateTime;

/// Normalize a scan-root path to absolute + lexically cleaned, so the same
/// directory always maps to the same folder row.
fn normalize(path: impl AsRef<Path>) -> Result<PathBuf> {
    let absolute = std::path::absolute(path.as_ref()).or_raise(|| ErrorKind::InvalidData("folder path"))?;
    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                cleaned.pop();
            }
            other => cleaned.push(other),
        }
    }
    Ok(cleaned)
}

impl Store {
    /// Insert a new folder and return it. The path is normalized to
    /// absolute + cleaned before storing.
    pub async fn add_folder(&self, path: impl AsRef<Path>) -> Result<Folder> {
        let path = normalize(path)?;
        let path = path.to_string_lossy();
        let row: FolderRow = sqlx::query_as(
            "INSERT INTO folders (path, created_at) VALUES (?1, ?2) RETURNING id, path, created_at",
        )
        .bind(path.as_ref())
        .bind(UtcDateTime::now().unix_timestamp())
        .fetch_one(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        Folder::try_from(row)
    }

    /// Return the folder with the given id.
    pub async fn get_folder(&self, id: i64) -> Result<Folder> {
        let row: Option<FolderRow> =
            sqlx::query_as("SELECT id, path, created_at FROM folders WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        match row {
            Some(row) => Folder::try_from(row),
            None => exn::bail!(ErrorKind::FolderNotFound(id)),
        }
    }

    /// Return all folders ordered by id ascending.
    pub async fn list_folders(&self) -> Result<Vec<Folder>> {
        let rows: Vec<FolderRow> =
            sqlx::query_as("SELECT id, path, created_at FROM folders ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(Folder::try_from).collect()
    }

    /// Remove the folder with the given id. Returns `false` if no row was
    /// deleted. Files under the folder are left in place; callers that want
    /// a full purge delete them first.
    pub async fn delete_folder(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM folders WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Return the folder id for the given path, creating the folder if it
    /// does not exist. Lookup and insert both use the normalized path, so
    /// folders are always stored by absolute path.
    pub async fn get_or_create_folder_by_path(&self, path: impl AsRef<Path>) -> Result<i64> {
        let normalized = normalize(path)?;
        let text = normalized.to_string_lossy();
        let existing: Option<(i64,)> = sqlx::query_as("SELECT id FROM folders WHERE path = ?1")
            .bind(text.as_ref())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if let Some((id,)) = existing {
            return Ok(id);
        }
        Ok(self.add_folder(normalized).await?.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[test]
    fn test_normalize_cleans_dot_components() {
        let cleaned = normalize("/data/photos/./album/../album").unwrap();
        assert_eq!(cleaned, PathBuf::from("/data/photos/album"));
    }

    #[tokio::test]
    async fn test_add_and_get_folder() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let folder = store.add_folder("/data/photos").await.unwrap();
        let fetched = store.get_folder(folder.id).await.unwrap();
        assert_eq!(fetched, folder);
        assert_eq!(fetched.path, "/data/photos");
    }

    #[tokio::test]
    async fn test_get_missing_folder_fails() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let err = store.get_folder(999).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::FolderNotFound(999)));
    }

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let first = store.get_or_create_folder_by_path("/data/music").await.unwrap();
        let second = store.get_or_create_folder_by_path("/data/music/").await.unwrap();
        let third = store.get_or_create_folder_by_path("/data/./music").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(store.list_folders().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_folder() {
        let db = Database::connect_in_memory().await.unwrap();
        let store = Store::from(&db);
        let folder = store.add_folder("/data/docs").await.unwrap();
        assert!(store.delete_folder(folder.id).await.unwrap());
        assert!(!store.delete_folder(folder.id).await.unwrap());
    }
}
