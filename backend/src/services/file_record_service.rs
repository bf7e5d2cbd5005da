//! File records as seen by the transfer core.

use std::path::Path;

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::file_record::{FileRecord, StorageTier};
use crate::storage::filesystem;

const FILE_COLUMNS: &str =
    "id, path, size, checksum, storage_tier, removed, created_at, updated_at";

#[derive(Clone)]
pub struct FileRecordService {
    db: SqlitePool,
}

impl FileRecordService {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn get(&self, id: Uuid) -> Result<FileRecord> {
        sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM file_records WHERE id = ?",
            FILE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("File record {} not found", id)))
    }

    pub async fn find_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(&format!(
            "SELECT {} FROM file_records WHERE path = ? AND removed = 0",
            FILE_COLUMNS
        ))
        .bind(path)
        .fetch_optional(&self.db)
        .await?;
        Ok(record)
    }

    /// Index an existing local file, hashing it once.
    pub async fn register(&self, path: &Path, tier: StorageTier) -> Result<FileRecord> {
        let path_str = path
            .to_str()
            .ok_or_else(|| AppError::Validation(format!("Path is not UTF-8: {}", path.display())))?;
        let (size, checksum) = filesystem::sha256_file(path).await.map_err(|e| match e {
            AppError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => {
                AppError::NotFound(format!("File {} does not exist", path.display()))
            }
            other => other,
        })?;
        let now = Utc::now();

        if let Some(existing) = self.find_by_path(path_str).await? {
            sqlx::query(
                "UPDATE file_records SET size = ?, checksum = ?, storage_tier = ?, updated_at = ? WHERE id = ?",
            )
            .bind(size as i64)
            .bind(&checksum)
            .bind(tier)
            .bind(now)
            .bind(existing.id)
            .execute(&self.db)
            .await?;
            return self.get(existing.id).await;
        }

        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO file_records (id, path, size, checksum, storage_tier, removed, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(id)
        .bind(path_str)
        .bind(size as i64)
        .bind(&checksum)
        .bind(tier)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;

        tracing::debug!(file_id = %id, path = %path.display(), size, "Registered file record");
        self.get(id).await
    }

    /// Record a path a pull will fill in. Nothing needs to exist yet.
    pub async fn reserve(&self, path: &Path, tier: StorageTier) -> Result<FileRecord> {
        let path_str = path
            .to_str()
            .ok_or_else(|| AppError::Validation(format!("Path is not UTF-8: {}", path.display())))?;
        if let Some(existing) = self.find_by_path(path_str).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO file_records (id, path, size, checksum, storage_tier, removed, created_at, updated_at)
            VALUES (?, ?, 0, NULL, ?, 0, ?, ?)
            "#,
        )
        .bind(id)
        .bind(path_str)
        .bind(tier)
        .bind(now)
        .bind(now)
        .execute(&self.db)
        .await?;
        self.get(id).await
    }

    /// Size and checksum of the record's file, rehashing only when the
    /// stored checksum is missing or the size on disk has changed.
    pub async fn size_and_checksum(&self, record: &FileRecord) -> Result<(i64, String)> {
        let path = Path::new(&record.path);
        let on_disk = filesystem::file_len(path)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Source file {} is missing", record.path)))?;

        if let Some(checksum) = &record.checksum {
            if on_disk as i64 == record.size {
                return Ok((record.size, checksum.clone()));
            }
        }

        let (size, checksum) = filesystem::sha256_file(path).await?;
        sqlx::query("UPDATE file_records SET size = ?, checksum = ?, updated_at = ? WHERE id = ?")
            .bind(size as i64)
            .bind(&checksum)
            .bind(Utc::now())
            .bind(record.id)
            .execute(&self.db)
            .await?;
        Ok((size as i64, checksum))
    }

    /// The file left this instance (completed move).
    pub async fn mark_removed(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE file_records SET removed = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn service() -> FileRecordService {
        let pool = db::create_memory_pool().await.unwrap();
        db::migrate(&pool).await.unwrap();
        FileRecordService::new(pool)
    }

    #[tokio::test]
    async fn test_register_hashes_file() {
        let svc = service().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        tokio::fs::write(&path, b"abc").await.unwrap();

        let record = svc.register(&path, StorageTier::Hot).await.unwrap();
        assert_eq!(record.size, 3);
        assert_eq!(
            record.checksum.as_deref(),
            Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert!(!record.removed);

        // Re-registering the same path updates in place.
        tokio::fs::write(&path, b"abcd").await.unwrap();
        let again = svc.register(&path, StorageTier::Hot).await.unwrap();
        assert_eq!(again.id, record.id);
        assert_eq!(again.size, 4);
    }

    #[tokio::test]
    async fn test_reserve_needs_no_file() {
        let svc = service().await;
        let path = Path::new("/srv/hot/incoming/wanted.bin");
        let record = svc.reserve(path, StorageTier::Hot).await.unwrap();
        assert_eq!(record.size, 0);
        assert!(record.checksum.is_none());

        let again = svc.reserve(path, StorageTier::Hot).await.unwrap();
        assert_eq!(again.id, record.id);
    }

    #[tokio::test]
    async fn test_register_missing_file() {
        let svc = service().await;
        let err = svc
            .register(Path::new("/definitely/not/here"), StorageTier::Hot)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_size_and_checksum_rehashes_on_change() {
        let svc = service().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.bin");
        tokio::fs::write(&path, b"12345").await.unwrap();
        let record = svc.register(&path, StorageTier::Cold).await.unwrap();

        let (size, sum) = svc.size_and_checksum(&record).await.unwrap();
        assert_eq!(size, 5);
        assert_eq!(Some(sum), record.checksum.clone());

        tokio::fs::write(&path, b"123456").await.unwrap();
        let (size, sum) = svc.size_and_checksum(&record).await.unwrap();
        assert_eq!(size, 6);
        assert_eq!(sum, filesystem::sha256_bytes(b"123456"));
    }

    #[tokio::test]
    async fn test_mark_removed() {
        let svc = service().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c");
        tokio::fs::write(&path, b"x").await.unwrap();
        let record = svc.register(&path, StorageTier::Hot).await.unwrap();
        svc.mark_removed(record.id).await.unwrap();
        assert!(svc.get(record.id).await.unwrap().removed);
        assert!(svc
            .find_by_path(path.to_str().unwrap())
            .await
            .unwrap()
            .is_none());
    }
}
