use serde::Serialize;

/// Aggregate counters for one archive, published with every daemon tick.
///
/// Timestamps are unix seconds so that telemetry sinks only ever see plain
/// numbers and strings.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct ArchiveStats {
    pub archive_name: String,
    pub num_files: u64,
    pub uncopied_files: u64,
    pub total_bytes: u64,
    pub uncopied_bytes: u64,
    /// Uncopied files that have used up their copy attempts.
    pub exhausted_files: u64,
    pub last_file_added: Option<String>,
    pub last_file_copied: Option<String>,
    /// Every file registered before this instant is copy-complete.
    pub copied_until: Option<f64>,
    /// Newest bucket such that it and every known bucket before it is finalized.
    pub finalized_until: Option<i64>,
    /// End of [`finalized_until`](Self::finalized_until) as a unix timestamp.
    pub finalized_until_time: Option<i64>,
}
