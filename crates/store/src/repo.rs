//! Repository for file records and the timecode directory index.
//!
//! Both tables live in the same database and are always mutated together
//! (registering a file may create its bucket; registering a completion marker
//! attaches it to its bucket), so one repository owns both.

use crate::Database;
use crate::error::{ErrorKind, Result};
use crate::models::{
    ArchiveStats, CopyOutcome, FileRecord, FileRow, NewFile, Removal, TimecodeDir, TimecodeDirRow, TimecodeFlags,
    from_secs, to_secs,
};
use crate::timecode::TimecodeScheme;
use exn::{OptionExt, ResultExt};
use sqlx::{SqliteConnection, SqlitePool};
use std::path::Path;
use std::time::Duration;
use suprsync_checksum::Checksum;
use time::UtcDateTime;
use tracing::{debug, warn};

/// A file that has been read and hashed, ready to be inserted.
struct Prepared {
    local_path: String,
    local_checksum: String,
    archive_name: String,
    remote_path: String,
    timecode: Option<i64>,
    size: i64,
    created_at: f64,
    deletable: bool,
}

/// `None` means "no limit" for both attempt caps and batch sizes.
fn attempts_cap(max_attempts: Option<u32>) -> i64 {
    max_attempts.map_or(i64::MAX, i64::from)
}

/// Durable access to [`FileRecord`]s and [`TimecodeDir`]s.
///
/// Every mutating call runs inside exactly one transaction, so a crash leaves
/// the store either before or after the call, never half-way.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
    checksum: Checksum,
    scheme: TimecodeScheme,
}
impl From<&Database> for Repository {
    fn from(db: &Database) -> Self {
        Self::new(db.pool().clone())
    }
}
impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, checksum: Checksum::default(), scheme: TimecodeScheme::default() }
    }

    /// Algorithm used to hash files that are registered without a checksum.
    #[must_use]
    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksum = checksum;
        self
    }

    /// How remote paths map onto time buckets.
    #[must_use]
    pub fn with_timecodes(mut self, scheme: TimecodeScheme) -> Self {
        self.scheme = scheme;
        self
    }

    #[must_use]
    pub fn checksum(&self) -> Checksum {
        self.checksum
    }

    #[must_use]
    pub fn timecodes(&self) -> &TimecodeScheme {
        &self.scheme
    }

    fn sqlx_hates_paths(path: impl AsRef<Path>) -> Result<String> {
        Ok(path.as_ref().to_str().ok_or_raise(|| ErrorKind::InvalidData("path"))?.to_string())
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Read (and, unless a checksum was supplied, hash) the local file.
    ///
    /// Runs outside any transaction: hashing a large file must not hold the
    /// database write lock.
    async fn prepare(&self, file: NewFile) -> Result<Prepared> {
        let local_path =
            std::path::absolute(&file.local_path).or_raise(|| ErrorKind::Unreadable(file.local_path.clone()))?;
        let metadata =
            tokio::fs::metadata(&local_path).await.or_raise(|| ErrorKind::Unreadable(local_path.clone()))?;
        if !metadata.is_file() {
            exn::bail!(ErrorKind::Unreadable(local_path));
        }
        let local_checksum = match file.checksum {
            // Remote tools print lowercase hex and verification compares exactly.
            Some(checksum) => {
                if checksum.is_empty() || !checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
                    exn::bail!(ErrorKind::InvalidData("checksum"));
                }
                checksum.to_ascii_lowercase()
            },
            None => {
                let algorithm = self.checksum;
                let path = local_path.clone();
                tokio::task::spawn_blocking(move || algorithm.hash_file(path))
                    .await
                    .or_raise(|| ErrorKind::Unreadable(local_path.clone()))?
                    .or_raise(|| ErrorKind::Unreadable(local_path.clone()))?
            },
        };
        Ok(Prepared {
            local_path: Self::sqlx_hates_paths(&local_path)?,
            local_checksum,
            timecode: self.scheme.from_remote_path(&file.remote_path),
            archive_name: file.archive_name,
            remote_path: file.remote_path,
            size: i64::try_from(metadata.len()).or_raise(|| ErrorKind::InvalidData("file size"))?,
            created_at: to_secs(file.timestamp.unwrap_or_else(UtcDateTime::now)),
            deletable: file.deletable,
        })
    }

    async fn insert_file(conn: &mut SqliteConnection, file: &Prepared) -> Result<FileRecord> {
        let row: FileRow = sqlx::query_as(include_str!("../queries/insert_file.sql"))
            .bind(&file.local_path)
            .bind(&file.local_checksum)
            .bind(&file.archive_name)
            .bind(&file.remote_path)
            .bind(file.timecode)
            .bind(file.size)
            .bind(file.created_at)
            .bind(file.deletable)
            .fetch_one(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if let Some(timecode) = file.timecode
            && let Some(dir) = Self::ensure_bucket(conn, &file.archive_name, timecode).await?
            && dir.finalized
        {
            warn!(
                archive = %file.archive_name,
                timecode,
                path = %file.local_path,
                "File registered into an already finalized bucket"
            );
        }
        row.try_into()
    }

    /// Create the index row for a bucket unless it is at or below the
    /// finalized watermark.
    ///
    /// A new bucket appearing under the watermark would pull the watermark
    /// back down; such buckets are reported instead of created.
    async fn ensure_bucket(conn: &mut SqliteConnection, archive: &str, timecode: i64) -> Result<Option<TimecodeDir>> {
        let watermark = Self::watermark(&mut *conn, archive).await?;
        if watermark.is_none_or(|w| timecode > w) {
            sqlx::query(include_str!("../queries/insert_timecode_dir.sql"))
                .bind(archive)
                .bind(timecode)
                .execute(&mut *conn)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        let dir: Option<TimecodeDirRow> = sqlx::query_as(include_str!("../queries/get_timecode_dir.sql"))
            .bind(archive)
            .bind(timecode)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if dir.is_none() {
            warn!(archive, timecode, ?watermark, "Bucket below finalized watermark was never indexed");
        }
        Ok(dir.map(TimecodeDir::from))
    }

    async fn watermark(conn: &mut SqliteConnection, archive: &str) -> Result<Option<i64>> {
        sqlx::query_scalar(include_str!("../queries/finalized_until.sql"))
            .bind(archive)
            .bind(archive)
            .fetch_one(conn)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Register a file to be copied to the remote archive.
    ///
    /// The file is read once to compute its checksum (unless one is given).
    /// Returns [`ErrorKind::Unreadable`] if it cannot be read; in that case
    /// nothing is written.
    pub async fn register(&self, file: NewFile) -> Result<FileRecord> {
        let prepared = self.prepare(file).await?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let record = Self::insert_file(&mut *tx, &prepared).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        debug!(id = record.id, path = %record.local_path.display(), archive = %record.archive_name, "Registered file");
        Ok(record)
    }

    // =========================================================================
    // Get/Fetch
    // =========================================================================

    pub async fn get(&self, id: i64) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as(include_str!("../queries/get_file.sql"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(FileRecord::try_from).transpose()
    }

    /// All records (in every archive) registered for a local path, oldest first.
    pub async fn find_by_local_path(&self, path: impl AsRef<Path>) -> Result<Vec<FileRecord>> {
        let path = std::path::absolute(path.as_ref()).or_raise(|| ErrorKind::InvalidData("path"))?;
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/find_by_local_path.sql"))
            .bind(Self::sqlx_hates_paths(path)?)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Every record of an archive, in registration order.
    pub async fn known_files(&self, archive: &str) -> Result<Vec<FileRecord>> {
        self.fetch_files(include_str!("../queries/list_known_files.sql"), archive).await
    }

    async fn fetch_files(&self, sql: &'static str, archive: &str) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRow> =
            sqlx::query_as(sql).bind(archive).fetch_all(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Records that still need copying: not removed, not copy-complete, and
    /// with fewer than `max_attempts` failed attempts. Oldest first.
    pub async fn copyable(
        &self,
        archive: &str,
        max_attempts: Option<u32>,
        limit: Option<usize>,
    ) -> Result<Vec<FileRecord>> {
        let limit = limit.map_or(Ok(-1), i64::try_from).or_raise(|| ErrorKind::InvalidData("limit"))?;
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/list_copyable.sql"))
            .bind(archive)
            .bind(attempts_cap(max_attempts))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Records whose local file may be removed now: copy-complete, deletable,
    /// not yet removed, and registered at least `grace` ago.
    pub async fn deletable(&self, archive: &str, grace: Duration) -> Result<Vec<FileRecord>> {
        self.deletable_at(archive, grace, UtcDateTime::now()).await
    }

    pub async fn deletable_at(&self, archive: &str, grace: Duration, now: UtcDateTime) -> Result<Vec<FileRecord>> {
        let cutoff = to_secs(now) - grace.as_secs_f64();
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/list_deletable.sql"))
            .bind(archive)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Uncopied records that will no longer be retried.
    pub async fn exhausted_files(&self, archive: &str, max_attempts: u32) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/list_exhausted.sql"))
            .bind(archive)
            .bind(i64::from(max_attempts))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Commit the outcome of a copy batch in one transaction.
    pub async fn record_copy_outcomes(&self, outcomes: &[CopyOutcome], now: UtcDateTime) -> Result<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        for outcome in outcomes {
            let (remote_checksum, copied_at, failed) = outcome.bindings(now);
            let updated = sqlx::query(include_str!("../queries/record_copy_outcome.sql"))
                .bind(remote_checksum)
                .bind(copied_at)
                .bind(failed)
                .bind(outcome.id())
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
            if updated.rows_affected() == 0 {
                exn::bail!(ErrorKind::NotFound("file", outcome.id()));
            }
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    /// Record local removals in one transaction.
    ///
    /// Records that were already marked removed are left untouched. Returns
    /// how many records changed.
    pub async fn mark_removed(&self, removals: &[(i64, Removal)]) -> Result<u64> {
        if removals.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let mut changed = 0;
        for (id, removal) in removals {
            changed += sqlx::query(include_str!("../queries/mark_removed.sql"))
                .bind(removal.to_secs())
                .bind(*id)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?
                .rows_affected();
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(changed)
    }

    /// Give an exhausted record a fresh set of copy attempts.
    pub async fn reset_failed_attempts(&self, id: i64) -> Result<()> {
        self.update_one(include_str!("../queries/reset_failed_attempts.sql"), id, None).await
    }

    /// Reclassify whether a record's local file may be deleted.
    pub async fn set_deletable(&self, id: i64, deletable: bool) -> Result<()> {
        self.update_one(include_str!("../queries/set_deletable.sql"), id, Some(deletable)).await
    }

    async fn update_one(&self, sql: &'static str, id: i64, flag: Option<bool>) -> Result<()> {
        let mut query = sqlx::query(sql);
        if let Some(flag) = flag {
            query = query.bind(flag);
        }
        let updated = query.bind(id).execute(&self.pool).await.or_raise(|| ErrorKind::Database)?;
        if updated.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotFound("file", id));
        }
        Ok(())
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Aggregate counters for observability.
    ///
    /// `max_attempts` decides which uncopied files count as exhausted.
    pub async fn archive_stats(&self, archive: &str, max_attempts: Option<u32>) -> Result<ArchiveStats> {
        let (num_files, uncopied_files, total_bytes, uncopied_bytes): (i64, i64, i64, i64) =
            sqlx::query_as(include_str!("../queries/archive_stats.sql"))
                .bind(archive)
                .fetch_one(&self.pool)
                .await
                .or_raise(|| ErrorKind::Database)?;
        let exhausted_files: i64 = sqlx::query_scalar(include_str!("../queries/count_exhausted.sql"))
            .bind(archive)
            .bind(attempts_cap(max_attempts))
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let last_file_added = self.last_path(include_str!("../queries/last_file_added.sql"), archive).await?;
        let last_file_copied = self.last_path(include_str!("../queries/last_file_copied.sql"), archive).await?;
        let copied_until = self.copied_until(archive).await?;
        let finalized_until = self.finalized_until(archive).await?;
        let count = |n: i64| u64::try_from(n).or_raise(|| ErrorKind::InvalidData("count"));
        Ok(ArchiveStats {
            archive_name: archive.to_string(),
            num_files: count(num_files)?,
            uncopied_files: count(uncopied_files)?,
            total_bytes: count(total_bytes)?,
            uncopied_bytes: count(uncopied_bytes)?,
            exhausted_files: count(exhausted_files)?,
            last_file_added,
            last_file_copied,
            copied_until: copied_until.map(to_secs),
            finalized_until,
            finalized_until_time: finalized_until.map(|tc| self.scheme.end_of(tc)),
        })
    }

    async fn last_path(&self, sql: &'static str, archive: &str) -> Result<Option<String>> {
        sqlx::query_scalar(sql).bind(archive).fetch_optional(&self.pool).await.or_raise(|| ErrorKind::Database)
    }

    /// Instant before which every registered file of the archive is copy-complete.
    pub async fn copied_until(&self, archive: &str) -> Result<Option<UtcDateTime>> {
        let secs: Option<f64> = sqlx::query_scalar(include_str!("../queries/copied_until.sql"))
            .bind(archive)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        secs.map(from_secs).transpose()
    }

    // =========================================================================
    // Timecode directories
    // =========================================================================

    /// Make sure a bucket is indexed, returning its current state.
    ///
    /// Returns `None` for a bucket that was never indexed and lies at or below
    /// the finalized watermark: it is not created, so the watermark never
    /// moves backwards.
    pub async fn upsert_timecode_dir(&self, archive: &str, timecode: i64) -> Result<Option<TimecodeDir>> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let dir = Self::ensure_bucket(&mut *tx, archive, timecode).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(dir)
    }

    pub async fn get_timecode_dir(&self, archive: &str, timecode: i64) -> Result<Option<TimecodeDir>> {
        let row: Option<TimecodeDirRow> = sqlx::query_as(include_str!("../queries/get_timecode_dir.sql"))
            .bind(archive)
            .bind(timecode)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(TimecodeDir::from))
    }

    /// Every indexed bucket of an archive, oldest first.
    pub async fn timecode_dirs(&self, archive: &str) -> Result<Vec<TimecodeDir>> {
        let rows: Vec<TimecodeDirRow> = sqlx::query_as(include_str!("../queries/list_timecode_dirs.sql"))
            .bind(archive)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().map(TimecodeDir::from).collect())
    }

    /// Raise flags on a bucket. Flags that are already set stay set.
    pub async fn update_timecode_dir(&self, id: i64, flags: TimecodeFlags) -> Result<TimecodeDir> {
        let row: Option<TimecodeDirRow> = sqlx::query_as(include_str!("../queries/update_timecode_dir.sql"))
            .bind(flags.completed)
            .bind(flags.synced)
            .bind(flags.finalized)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.ok_or_raise(|| ErrorKind::NotFound("timecode dir", id))?.into())
    }

    /// Records the store knows belong to a bucket.
    pub async fn bucket_files(&self, archive: &str, timecode: i64) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRow> = sqlx::query_as(include_str!("../queries/list_bucket_files.sql"))
            .bind(archive)
            .bind(timecode)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(FileRecord::try_from).collect()
    }

    /// Number of records in a bucket that are not copy-complete.
    pub async fn bucket_uncopied(&self, archive: &str, timecode: i64) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(include_str!("../queries/count_bucket_uncopied.sql"))
            .bind(archive)
            .bind(timecode)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        u64::try_from(count).or_raise(|| ErrorKind::InvalidData("count"))
    }

    /// Register a bucket's completion marker and attach it to the bucket, in
    /// one transaction.
    ///
    /// Returns `None` (and writes nothing) if the bucket already has a marker.
    pub async fn attach_finalize_marker(&self, dir: &TimecodeDir, marker: NewFile) -> Result<Option<FileRecord>> {
        if dir.finalize_file_id.is_some() {
            return Ok(None);
        }
        let prepared = self.prepare(marker).await?;
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let record = Self::insert_file(&mut *tx, &prepared).await?;
        let attached = sqlx::query(include_str!("../queries/attach_finalize_marker.sql"))
            .bind(record.id)
            .bind(dir.id)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if attached.rows_affected() == 0 {
            // Someone else attached a marker first; dropping the transaction
            // rolls back our insert.
            return Ok(None);
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(Some(record))
    }

    /// The finalized watermark: the largest bucket id such that it and every
    /// indexed bucket below it is finalized.
    pub async fn finalized_until(&self, archive: &str) -> Result<Option<i64>> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
        Self::watermark(&mut *conn, archive).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const ARCHIVE: &str = "timestreams";
    const MD5_TEST: &str = "098f6bcd4621d373cade4e832627b4f6";

    async fn setup() -> (Database, Repository, TempDir) {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db);
        (db, repo, tempfile::tempdir().unwrap())
    }

    fn write(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    fn at(secs: i64) -> UtcDateTime {
        UtcDateTime::from_unix_timestamp(secs).unwrap()
    }

    #[tokio::test]
    async fn test_register_hashes_file() {
        let (db, repo, dir) = setup().await;
        let path = write(&dir, "17145/a.g3", b"test");
        let record = repo.register(NewFile::new(&path, "17145/a.g3", ARCHIVE)).await.unwrap();
        assert_eq!(record.local_checksum, MD5_TEST);
        assert_eq!(record.size, 4);
        assert_eq!(record.timecode, Some(17145));
        assert!(record.deletable);
        assert_eq!(record.failed_attempts, 0);
        assert!(record.remote_checksum.is_none());
        assert_eq!(repo.get(record.id).await.unwrap(), Some(record));
        // Registering into a bucket indexes it.
        let dirs = repo.timecode_dirs(ARCHIVE).await.unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].timecode, 17145);
        db.close().await;
    }

    #[tokio::test]
    async fn test_register_with_checksum_and_timestamp() {
        let (db, repo, dir) = setup().await;
        let path = write(&dir, "a.g3", b"whatever");
        let record = repo
            .register(NewFile::new(&path, "a.g3", ARCHIVE).with_checksum("cafe").keep().at(at(1_714_500_000)))
            .await
            .unwrap();
        assert_eq!(record.local_checksum, "cafe");
        assert!(!record.deletable);
        assert_eq!(record.created_at, at(1_714_500_000));
        assert_eq!(record.timecode, None);
        assert!(repo.timecode_dirs(ARCHIVE).await.unwrap().is_empty());
        db.close().await;
    }

    #[tokio::test]
    async fn test_register_normalizes_supplied_checksum() {
        let (db, repo, dir) = setup().await;
        let path = write(&dir, "a.g3", b"test");
        let record = repo
            .register(NewFile::new(&path, "a.g3", ARCHIVE).with_checksum("098F6BCD4621D373CADE4E832627B4F6"))
            .await
            .unwrap();
        assert_eq!(record.local_checksum, MD5_TEST);

        for bad in ["", "not-hex", "cafe "] {
            let err = repo.register(NewFile::new(&path, "b.g3", ARCHIVE).with_checksum(bad)).await.unwrap_err();
            assert!(matches!(&*err, ErrorKind::InvalidData("checksum")));
        }
        assert_eq!(repo.known_files(ARCHIVE).await.unwrap().len(), 1);
        db.close().await;
    }

    #[tokio::test]
    async fn test_register_blake3() {
        let db = Database::connect_in_memory().await.unwrap();
        let repo = Repository::from(&db).with_checksum(Checksum::Blake3);
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "empty", b"");
        let record = repo.register(NewFile::new(&path, "empty", ARCHIVE)).await.unwrap();
        assert_eq!(record.local_checksum, Checksum::Blake3.hash_bytes(b""));
        db.close().await;
    }

    #[tokio::test]
    async fn test_register_unreadable_file() {
        let (db, repo, dir) = setup().await;
        let missing = dir.path().join("missing.g3");
        let err = repo.register(NewFile::new(&missing, "missing.g3", ARCHIVE)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unreadable(p) if p == &missing));
        // Directories are not files.
        let err = repo.register(NewFile::new(dir.path(), "dir", ARCHIVE)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unreadable(_)));
        assert!(repo.known_files(ARCHIVE).await.unwrap().is_empty());
        db.close().await;
    }

    #[tokio::test]
    async fn test_copyable_ordering_limit_and_attempts() {
        let (db, repo, dir) = setup().await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let path = write(&dir, &format!("{i}.g3"), b"test");
            let file = NewFile::new(&path, format!("{i}.g3"), ARCHIVE).at(at(1_000 + i));
            ids.push(repo.register(file).await.unwrap().id);
        }
        let other = write(&dir, "other.g3", b"test");
        repo.register(NewFile::new(&other, "other.g3", "ancillary")).await.unwrap();

        let all = repo.copyable(ARCHIVE, None, None).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
        let two = repo.copyable(ARCHIVE, None, Some(2)).await.unwrap();
        assert_eq!(two.iter().map(|r| r.id).collect::<Vec<_>>(), ids[..2]);

        let now = at(2_000);
        let outcomes = vec![
            CopyOutcome::Verified { id: ids[0], remote_checksum: MD5_TEST.to_string() },
            CopyOutcome::Mismatch { id: ids[1], remote_checksum: "bad".to_string() },
            CopyOutcome::Failed { id: ids[2] },
        ];
        repo.record_copy_outcomes(&outcomes, now).await.unwrap();

        // Copied files drop out; failed ones stay until they run out of attempts.
        let left = repo.copyable(ARCHIVE, Some(1), None).await.unwrap();
        assert_eq!(left.iter().map(|r| r.id).collect::<Vec<_>>(), ids[3..]);
        let left = repo.copyable(ARCHIVE, Some(2), None).await.unwrap();
        assert_eq!(left.iter().map(|r| r.id).collect::<Vec<_>>(), ids[1..]);

        let mismatched = repo.get(ids[1]).await.unwrap().unwrap();
        assert_eq!(mismatched.remote_checksum.as_deref(), Some("bad"));
        assert_eq!(mismatched.copied_at, Some(now));
        assert_eq!(mismatched.failed_attempts, 1);
        let failed = repo.get(ids[2]).await.unwrap().unwrap();
        assert_eq!((failed.remote_checksum, failed.copied_at, failed.failed_attempts), (None, None, 1));

        let exhausted = repo.exhausted_files(ARCHIVE, 1).await.unwrap();
        assert_eq!(exhausted.iter().map(|r| r.id).collect::<Vec<_>>(), ids[1..3]);
        repo.reset_failed_attempts(ids[2]).await.unwrap();
        assert_eq!(repo.exhausted_files(ARCHIVE, 1).await.unwrap().len(), 1);
        db.close().await;
    }

    #[tokio::test]
    async fn test_record_outcome_for_unknown_record_rolls_back() {
        let (db, repo, dir) = setup().await;
        let path = write(&dir, "a.g3", b"test");
        let record = repo.register(NewFile::new(&path, "a.g3", ARCHIVE)).await.unwrap();
        let outcomes = vec![
            CopyOutcome::Verified { id: record.id, remote_checksum: MD5_TEST.to_string() },
            CopyOutcome::Failed { id: 999 },
        ];
        let err = repo.record_copy_outcomes(&outcomes, at(2_000)).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound("file", 999)));
        let record = repo.get(record.id).await.unwrap().unwrap();
        assert!(record.remote_checksum.is_none(), "the whole batch must roll back");
        db.close().await;
    }

    #[tokio::test]
    async fn test_deletable_and_mark_removed() {
        let (db, repo, dir) = setup().await;
        let registered = at(1_000);
        let mut records = Vec::new();
        for (name, keep) in [("a", false), ("b", false), ("c", true), ("d", false)] {
            let path = write(&dir, name, b"test");
            let file = NewFile::new(&path, name, ARCHIVE).deletable(!keep).at(registered);
            records.push(repo.register(file).await.unwrap());
        }
        let outcomes: Vec<_> = records[..3]
            .iter()
            .map(|r| CopyOutcome::Verified { id: r.id, remote_checksum: MD5_TEST.to_string() })
            .collect();
        repo.record_copy_outcomes(&outcomes, at(1_500)).await.unwrap();

        // Inside the grace period nothing is deletable.
        assert!(repo.deletable_at(ARCHIVE, Duration::from_secs(3600), at(2_000)).await.unwrap().is_empty());
        // The uncopied and the kept file never are.
        let deletable = repo.deletable_at(ARCHIVE, Duration::from_secs(1000), at(2_000)).await.unwrap();
        assert_eq!(deletable.iter().map(|r| r.id).collect::<Vec<_>>(), vec![records[0].id, records[1].id]);

        let removals = vec![(records[0].id, Removal::At(at(2_000))), (records[1].id, Removal::AlreadyGone)];
        assert_eq!(repo.mark_removed(&removals).await.unwrap(), 2);
        // Already removed records are not touched again.
        assert_eq!(repo.mark_removed(&removals).await.unwrap(), 0);
        assert_eq!(repo.get(records[1].id).await.unwrap().unwrap().removed_at, Some(Removal::AlreadyGone));
        assert!(repo.deletable_at(ARCHIVE, Duration::ZERO, at(2_000)).await.unwrap().is_empty());

        repo.set_deletable(records[2].id, true).await.unwrap();
        let deletable = repo.deletable_at(ARCHIVE, Duration::ZERO, at(2_000)).await.unwrap();
        assert_eq!(deletable.iter().map(|r| r.id).collect::<Vec<_>>(), vec![records[2].id]);
        assert!(matches!(&*repo.set_deletable(404, true).await.unwrap_err(), ErrorKind::NotFound("file", 404)));
        db.close().await;
    }

    #[tokio::test]
    async fn test_find_by_local_path() {
        let (db, repo, dir) = setup().await;
        let path = write(&dir, "a.g3", b"test");
        repo.register(NewFile::new(&path, "a.g3", ARCHIVE)).await.unwrap();
        repo.register(NewFile::new(&path, "a.g3", "mirror")).await.unwrap();
        assert_eq!(repo.find_by_local_path(&path).await.unwrap().len(), 2);
        assert!(repo.find_by_local_path(dir.path().join("b.g3")).await.unwrap().is_empty());
        db.close().await;
    }

    #[tokio::test]
    async fn test_archive_stats() {
        let (db, repo, dir) = setup().await;
        let empty = repo.archive_stats(ARCHIVE, Some(3)).await.unwrap();
        assert_eq!(empty.num_files, 0);
        assert_eq!(empty.copied_until, None);
        assert_eq!(empty.last_file_added, None);

        let a = write(&dir, "a.g3", b"test");
        let b = write(&dir, "b.g3", b"longer contents");
        let a = repo.register(NewFile::new(&a, "a.g3", ARCHIVE).at(at(1_000))).await.unwrap();
        let b = repo.register(NewFile::new(&b, "b.g3", ARCHIVE).at(at(1_100))).await.unwrap();
        repo.record_copy_outcomes(
            &[CopyOutcome::Verified { id: a.id, remote_checksum: a.local_checksum.clone() }],
            at(1_200),
        )
        .await
        .unwrap();

        let stats = repo.archive_stats(ARCHIVE, Some(3)).await.unwrap();
        assert_eq!(stats.num_files, 2);
        assert_eq!(stats.uncopied_files, 1);
        assert_eq!(stats.total_bytes, 4 + 15);
        assert_eq!(stats.uncopied_bytes, 15);
        assert_eq!(stats.exhausted_files, 0);
        assert_eq!(stats.last_file_added.as_deref(), b.local_path.to_str());
        assert_eq!(stats.last_file_copied.as_deref(), a.local_path.to_str());
        assert_eq!(stats.copied_until, Some(1_100.0));

        repo.record_copy_outcomes(&[CopyOutcome::Verified { id: b.id, remote_checksum: b.local_checksum }], at(1_300))
            .await
            .unwrap();
        assert_eq!(repo.copied_until(ARCHIVE).await.unwrap(), Some(at(1_100)));
        db.close().await;
    }

    #[tokio::test]
    async fn test_timecode_flags_are_monotonic() {
        let (db, repo, _dir) = setup().await;
        let dir = repo.upsert_timecode_dir(ARCHIVE, 17145).await.unwrap().unwrap();
        assert!(!dir.completed && !dir.synced && !dir.finalized);
        let dir = repo.update_timecode_dir(dir.id, TimecodeFlags::COMPLETED).await.unwrap();
        let dir = repo.update_timecode_dir(dir.id, TimecodeFlags::SYNCED).await.unwrap();
        assert!(dir.completed && dir.synced && !dir.finalized);
        // Upserting again keeps the state.
        assert_eq!(repo.upsert_timecode_dir(ARCHIVE, 17145).await.unwrap(), Some(dir.clone()));
        let dir = repo.update_timecode_dir(dir.id, TimecodeFlags::default()).await.unwrap();
        assert!(dir.completed && dir.synced);
        let err = repo.update_timecode_dir(404, TimecodeFlags::COMPLETED).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound("timecode dir", 404)));
        db.close().await;
    }

    #[tokio::test]
    async fn test_finalized_until_is_contiguous_prefix() {
        let (db, repo, _dir) = setup().await;
        assert_eq!(repo.finalized_until(ARCHIVE).await.unwrap(), None);
        let mut dirs = Vec::new();
        for tc in 17140..17145 {
            dirs.push(repo.upsert_timecode_dir(ARCHIVE, tc).await.unwrap().unwrap());
        }
        for dir in [&dirs[0], &dirs[1], &dirs[3]] {
            repo.update_timecode_dir(dir.id, TimecodeFlags::FINALIZED).await.unwrap();
        }
        // 17142 is a gap: 17143 must not count.
        assert_eq!(repo.finalized_until(ARCHIVE).await.unwrap(), Some(17141));
        repo.update_timecode_dir(dirs[2].id, TimecodeFlags::FINALIZED).await.unwrap();
        assert_eq!(repo.finalized_until(ARCHIVE).await.unwrap(), Some(17143));
        // Other archives are independent.
        assert_eq!(repo.finalized_until("ancillary").await.unwrap(), None);

        // A never-seen bucket under the watermark is not created.
        assert_eq!(repo.upsert_timecode_dir(ARCHIVE, 17130).await.unwrap(), None);
        assert_eq!(repo.finalized_until(ARCHIVE).await.unwrap(), Some(17143));
        db.close().await;
    }

    #[tokio::test]
    async fn test_bucket_queries() {
        let (db, repo, dir) = setup().await;
        let a = write(&dir, "17145/a.g3", b"test");
        let b = write(&dir, "17145/b.g3", b"test");
        let c = write(&dir, "17146/c.g3", b"test");
        let a = repo.register(NewFile::new(&a, "17145/a.g3", ARCHIVE)).await.unwrap();
        repo.register(NewFile::new(&b, "17145/b.g3", ARCHIVE)).await.unwrap();
        repo.register(NewFile::new(&c, "17146/c.g3", ARCHIVE)).await.unwrap();
        assert_eq!(repo.bucket_files(ARCHIVE, 17145).await.unwrap().len(), 2);
        assert_eq!(repo.bucket_uncopied(ARCHIVE, 17145).await.unwrap(), 2);
        repo.record_copy_outcomes(&[CopyOutcome::Verified { id: a.id, remote_checksum: MD5_TEST.to_string() }], at(1))
            .await
            .unwrap();
        assert_eq!(repo.bucket_uncopied(ARCHIVE, 17145).await.unwrap(), 1);
        assert_eq!(repo.bucket_uncopied(ARCHIVE, 17146).await.unwrap(), 1);
        assert_eq!(repo.bucket_uncopied(ARCHIVE, 17147).await.unwrap(), 0);
        db.close().await;
    }

    #[tokio::test]
    async fn test_attach_finalize_marker_once() {
        let (db, repo, dir) = setup().await;
        let bucket = repo.upsert_timecode_dir(ARCHIVE, 17140).await.unwrap().unwrap();
        let marker = write(&dir, "17145/sync/marker.yaml", b"timecode: 17140\n");
        let new = NewFile::new(&marker, "17145/suprsync/sync/marker.yaml", ARCHIVE);
        let record = repo.attach_finalize_marker(&bucket, new.clone()).await.unwrap().unwrap();
        let bucket = repo.get_timecode_dir(ARCHIVE, 17140).await.unwrap().unwrap();
        assert_eq!(bucket.finalize_file_id, Some(record.id));
        // The marker lives in the bucket it was written in.
        assert_eq!(record.timecode, Some(17145));
        assert!(repo.get_timecode_dir(ARCHIVE, 17145).await.unwrap().is_some());

        assert_eq!(repo.attach_finalize_marker(&bucket, new.clone()).await.unwrap(), None);
        // A stale view of the bucket loses the race and leaves nothing behind.
        let stale = TimecodeDir { finalize_file_id: None, ..bucket };
        assert_eq!(repo.attach_finalize_marker(&stale, new).await.unwrap(), None);
        assert_eq!(repo.known_files(ARCHIVE).await.unwrap().len(), 1);
        db.close().await;
    }
}
