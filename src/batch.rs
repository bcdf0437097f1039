use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{ErrorKind, UploadError};
use crate::repository::RepositoryClient;
use crate::traversal::BatchTraversal;
use crate::upload::{
    PrepareOptions, ProgressEvent, ProgressSink, UploadContext, UploadCoordinator, UploadOptions,
};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub label_prefix: String,
    pub note: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub path: String,
    pub label: String,
    pub accession: Option<String>,
    pub subject_id: String,
    pub experiment_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub path: String,
    pub kind: ErrorKind,
    pub message: String,
    /// Set when the metadata record was written before the failure.
    pub committed_accession: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub uploaded: Vec<BatchItem>,
    pub rejected: Vec<BatchFailure>,
    pub failed: Vec<BatchFailure>,
    pub cancelled: bool,
}

pub struct BatchUploader<'a, R: RepositoryClient> {
    coordinator: &'a UploadCoordinator<R>,
    options: BatchOptions,
}

impl<'a, R: RepositoryClient> BatchUploader<'a, R> {
    pub fn new(coordinator: &'a UploadCoordinator<R>, options: BatchOptions) -> Self {
        Self {
            coordinator,
            options,
        }
    }

    pub fn run(&self, root: &Path, sink: &dyn ProgressSink) -> Result<BatchReport, UploadError> {
        if !root.is_dir() {
            return Err(UploadError::io(root, "not a directory"));
        }
        let cancel = self.coordinator.cancel_token().clone();
        let traversal = BatchTraversal::new(root).with_cancel(cancel.clone());
        let run_stamp = chrono::Utc::now().format("%Y%m%d%H%M%S").to_string();
        let prepare = PrepareOptions::default();

        let mut report = BatchReport::default();
        let mut cursor: Option<PathBuf> = None;
        let mut sequence = 0usize;
        loop {
            let mut accepted: Option<UploadContext> = None;
            let next = traversal.next(cursor.as_deref(), |candidate| {
                let mut ctx = UploadContext::new();
                match self.coordinator.prepare(&mut ctx, candidate, &prepare, sink) {
                    Ok(()) => {
                        accepted = Some(ctx);
                        true
                    }
                    Err(UploadError::Cancelled) => false,
                    Err(err) => {
                        warn!(file = %candidate.display(), error = %err, "candidate rejected");
                        report.rejected.push(BatchFailure {
                            path: candidate.display().to_string(),
                            kind: err.kind(),
                            message: err.to_string(),
                            committed_accession: None,
                        });
                        false
                    }
                }
            });
            let (Some(file), Some(mut ctx)) = (next, accepted) else {
                break;
            };
            sequence += 1;
            let label = item_label(&self.options.label_prefix, &run_stamp, sequence);
            sink.event(ProgressEvent {
                message: format!("batch item {sequence}: {}", file.display()),
                elapsed: None,
            });

            if self.options.dry_run {
                if let Some(item) = ctx.prepared() {
                    report.uploaded.push(BatchItem {
                        path: file.display().to_string(),
                        label,
                        accession: None,
                        subject_id: item.binding.subject_id.clone(),
                        experiment_id: item.binding.experiment_id.clone(),
                    });
                }
            } else {
                let options = UploadOptions {
                    label: Some(label),
                    note: self.options.note.clone(),
                };
                match self.coordinator.upload(&mut ctx, &options, sink) {
                    Ok(receipt) => report.uploaded.push(BatchItem {
                        path: file.display().to_string(),
                        label: receipt.label,
                        accession: Some(receipt.accession),
                        subject_id: receipt.subject_id,
                        experiment_id: receipt.experiment_id,
                    }),
                    Err(err) => {
                        warn!(file = %file.display(), error = %err, "batch item failed");
                        report.failed.push(BatchFailure {
                            path: file.display().to_string(),
                            kind: err.kind(),
                            message: err.to_string(),
                            committed_accession: ctx
                                .metadata_committed()
                                .then(|| ctx.accession().map(ToString::to_string))
                                .flatten(),
                        });
                    }
                }
            }
            cursor = Some(file);
        }

        report.cancelled = cancel.is_cancelled();
        info!(
            uploaded = report.uploaded.len(),
            rejected = report.rejected.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled,
            "batch finished"
        );
        Ok(report)
    }
}

pub fn item_label(prefix: &str, run_stamp: &str, sequence: usize) -> String {
    format!("{prefix}_{run_stamp}_{sequence:04}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_distinct_and_ordered() {
        let a = item_label("qc", "20260101", 1);
        let b = item_label("qc", "20260101", 2);
        assert_eq!(a, "qc_20260101_0001");
        assert!(a < b);
    }
}
