/// Completion state of one time bucket of an archive.
///
/// The flags only ever go from `false` to `true`:
/// `finalized` implies `synced` implies `completed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimecodeDir {
    pub id: i64,
    pub archive_name: String,
    pub timecode: i64,
    /// No file will be registered into this bucket any more.
    pub completed: bool,
    /// Every file known to be in the bucket is copy-complete.
    pub synced: bool,
    /// The bucket's completion marker has been verified on the remote side.
    pub finalized: bool,
    /// Record of the completion marker, once one has been registered.
    pub finalize_file_id: Option<i64>,
}

/// Flags to raise on a [`TimecodeDir`]. `false` leaves a flag as it is.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimecodeFlags {
    pub completed: bool,
    pub synced: bool,
    pub finalized: bool,
}

impl TimecodeFlags {
    pub const COMPLETED: Self = Self { completed: true, synced: false, finalized: false };
    pub const SYNCED: Self = Self { completed: false, synced: true, finalized: false };
    pub const FINALIZED: Self = Self { completed: false, synced: false, finalized: true };
}

#[derive(sqlx::FromRow)]
pub(crate) struct TimecodeDirRow {
    id: i64,
    archive_name: String,
    timecode: i64,
    completed: bool,
    synced: bool,
    finalized: bool,
    finalize_file_id: Option<i64>,
}
impl From<TimecodeDirRow> for TimecodeDir {
    fn from(row: TimecodeDirRow) -> Self {
        Self {
            id: row.id,
            archive_name: row.archive_name,
            timecode: row.timecode,
            completed: row.completed,
            synced: row.synced,
            finalized: row.finalized,
            finalize_file_id: row.finalize_file_id,
        }
    }
}
