//! Upload lifecycle state machine
//!
//! The stage order is fixed and linear. Every productive stage has three
//! labels: an in-progress label written before the unit of work, a completed
//! label written after it, and a failed label written when it errors. The
//! in-progress label doubles as the journal key for the stage's failures.

/// Initial status of a freshly scheduled upload.
pub const WAITING: &str = "waiting";
/// Terminal status once the retry budget is exhausted.
pub const ABORTED: &str = "aborted";
/// Out-of-band failure: the live warehouse schema could not be fetched.
pub const FETCHING_REMOTE_SCHEMA_FAILED: &str = "fetching_remote_schema_failed";
/// Out-of-band failure: invariant violation ahead of the stage loop.
pub const INTERNAL_PROCESSING_FAILED: &str = "internal_processing_failed";

/// The eight productive stages of an upload, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadStage {
    GeneratedUploadSchema,
    CreatedTableUploads,
    GeneratedLoadFiles,
    UpdatedTableUploadsCounts,
    CreatedRemoteSchema,
    ExportedUserTables,
    ExportedIdentities,
    ExportedData,
}

impl UploadStage {
    pub const ALL: [UploadStage; 8] = [
        UploadStage::GeneratedUploadSchema,
        UploadStage::CreatedTableUploads,
        UploadStage::GeneratedLoadFiles,
        UploadStage::UpdatedTableUploadsCounts,
        UploadStage::CreatedRemoteSchema,
        UploadStage::ExportedUserTables,
        UploadStage::ExportedIdentities,
        UploadStage::ExportedData,
    ];

    /// The first productive stage; also the restart point when the remote
    /// schema changed or the persisted status is unrecognized.
    pub fn first() -> UploadStage {
        UploadStage::GeneratedUploadSchema
    }

    /// The stage's task name: in-progress status label and journal key.
    pub fn task(&self) -> &'static str {
        match self {
            UploadStage::GeneratedUploadSchema => "generating_upload_schema",
            UploadStage::CreatedTableUploads => "creating_table_uploads",
            UploadStage::GeneratedLoadFiles => "generating_load_files",
            UploadStage::UpdatedTableUploadsCounts => "updating_table_uploads_counts",
            UploadStage::CreatedRemoteSchema => "creating_remote_schema",
            UploadStage::ExportedUserTables => "exporting_user_tables",
            UploadStage::ExportedIdentities => "exporting_identities",
            UploadStage::ExportedData => "exporting_data",
        }
    }

    pub fn in_progress_status(&self) -> &'static str {
        self.task()
    }

    pub fn completed_status(&self) -> &'static str {
        match self {
            UploadStage::GeneratedUploadSchema => "generated_upload_schema",
            UploadStage::CreatedTableUploads => "created_table_uploads",
            UploadStage::GeneratedLoadFiles => "generated_load_files",
            UploadStage::UpdatedTableUploadsCounts => "updated_table_uploads_counts",
            UploadStage::CreatedRemoteSchema => "created_remote_schema",
            UploadStage::ExportedUserTables => "exported_user_tables",
            UploadStage::ExportedIdentities => "exported_identities",
            UploadStage::ExportedData => "exported_data",
        }
    }

    pub fn failed_status(&self) -> &'static str {
        match self {
            UploadStage::GeneratedUploadSchema => "failed_generating_upload_schema",
            UploadStage::CreatedTableUploads => "failed_creating_table_uploads",
            UploadStage::GeneratedLoadFiles => "failed_generating_load_files",
            UploadStage::UpdatedTableUploadsCounts => "failed_updating_table_uploads_counts",
            UploadStage::CreatedRemoteSchema => "failed_creating_remote_schema",
            UploadStage::ExportedUserTables => "failed_exporting_user_tables",
            UploadStage::ExportedIdentities => "failed_exporting_identities",
            UploadStage::ExportedData => "failed_exporting_data",
        }
    }

    /// Successor stage; `None` after the final stage.
    pub fn next(&self) -> Option<UploadStage> {
        match self {
            UploadStage::GeneratedUploadSchema => Some(UploadStage::CreatedTableUploads),
            UploadStage::CreatedTableUploads => Some(UploadStage::GeneratedLoadFiles),
            UploadStage::GeneratedLoadFiles => Some(UploadStage::UpdatedTableUploadsCounts),
            UploadStage::UpdatedTableUploadsCounts => Some(UploadStage::CreatedRemoteSchema),
            UploadStage::CreatedRemoteSchema => Some(UploadStage::ExportedUserTables),
            UploadStage::ExportedUserTables => Some(UploadStage::ExportedIdentities),
            UploadStage::ExportedIdentities => Some(UploadStage::ExportedData),
            UploadStage::ExportedData => None,
        }
    }

    pub fn from_completed(status: &str) -> Option<UploadStage> {
        Self::ALL
            .into_iter()
            .find(|s| s.completed_status() == status)
    }

    /// Stage to run next for a persisted upload status.
    ///
    /// In-progress and failed labels re-enter their own stage; completed
    /// labels advance to the successor; terminal labels return `None`.
    /// Anything else (including `waiting`, the two out-of-band failure
    /// labels, and unrecognized strings) restarts from the first productive
    /// stage.
    pub fn next_for_db_status(status: &str) -> Option<UploadStage> {
        if status == ABORTED {
            return None;
        }
        for stage in Self::ALL {
            if status == stage.in_progress_status() || status == stage.failed_status() {
                return Some(stage);
            }
            if status == stage.completed_status() {
                return stage.next();
            }
        }
        Some(UploadStage::first())
    }
}

/// Whether a persisted upload status is terminal for the pipeline.
pub fn is_terminal(status: &str) -> bool {
    status == ABORTED || status == UploadStage::ExportedData.completed_status()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_linear() {
        let mut stage = UploadStage::first();
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, UploadStage::ALL.to_vec());
    }

    #[test]
    fn test_labels_are_consistent() {
        for stage in UploadStage::ALL {
            assert_eq!(stage.in_progress_status(), stage.task());
            assert_eq!(
                stage.failed_status(),
                format!("failed_{}", stage.task()).as_str()
            );
            assert_ne!(stage.completed_status(), stage.in_progress_status());
        }
    }

    #[test]
    fn test_next_for_db_status_reenters_same_stage() {
        assert_eq!(
            UploadStage::next_for_db_status("exporting_data"),
            Some(UploadStage::ExportedData)
        );
        assert_eq!(
            UploadStage::next_for_db_status("failed_generating_load_files"),
            Some(UploadStage::GeneratedLoadFiles)
        );
    }

    #[test]
    fn test_next_for_db_status_advances_after_completion() {
        assert_eq!(
            UploadStage::next_for_db_status("generated_load_files"),
            Some(UploadStage::UpdatedTableUploadsCounts)
        );
        assert_eq!(UploadStage::next_for_db_status("exported_data"), None);
    }

    #[test]
    fn test_next_for_db_status_restarts_on_unknown_labels() {
        for status in [WAITING, "", "bogus", FETCHING_REMOTE_SCHEMA_FAILED, INTERNAL_PROCESSING_FAILED] {
            assert_eq!(
                UploadStage::next_for_db_status(status),
                Some(UploadStage::first()),
                "status {status:?} should restart the pipeline"
            );
        }
        assert_eq!(UploadStage::next_for_db_status(ABORTED), None);
    }

    #[test]
    fn test_is_terminal() {
        assert!(is_terminal(ABORTED));
        assert!(is_terminal("exported_data"));
        assert!(!is_terminal("exporting_data"));
        assert!(!is_terminal(WAITING));
    }
}
