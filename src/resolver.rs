use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::domain::{AmbiguousBinding, BindingChoice, DependencySet, ResolvedBinding};
use crate::error::{UidLevel, UploadError};
use crate::repository::{RepositoryClient, ResultSet, paths};

pub const COL_ID: &str = "ID";
pub const COL_LABEL: &str = "label";
pub const COL_SUBJECT_ID: &str = "subject_ID";
pub const COL_SUBJECT_LABEL: &str = "subject_label";
pub const COL_UID: &str = "UID";
pub const COL_NAME: &str = "Name";

#[derive(Debug, Clone)]
pub struct Resolution {
    pub binding: ResolvedBinding,
    pub candidates: Vec<AmbiguousBinding>,
}

impl Resolution {
    pub fn is_ambiguous(&self) -> bool {
        is_ambiguous(&self.candidates)
    }

    pub fn ambiguity(&self) -> Option<UploadError> {
        self.is_ambiguous()
            .then(|| UploadError::Ambiguity(self.candidates.clone()))
    }
}

/// More than one subject, or one subject with several experiments.
pub fn is_ambiguous(candidates: &[AmbiguousBinding]) -> bool {
    candidates.len() > 1
        || candidates
            .first()
            .is_some_and(|candidate| candidate.experiment_ids.len() > 1)
}

pub struct DependencyResolver<'a, R: RepositoryClient + ?Sized> {
    repository: &'a R,
    project: &'a str,
}

impl<'a, R: RepositoryClient + ?Sized> DependencyResolver<'a, R> {
    pub fn new(repository: &'a R, project: &'a str) -> Self {
        Self {
            repository,
            project,
        }
    }

    pub fn resolve(
        &self,
        dependencies: &DependencySet,
        choice: Option<&BindingChoice>,
    ) -> Result<Resolution, UploadError> {
        let candidates = self.discover(dependencies)?;
        let choice = match choice {
            Some(choice) => {
                ensure_candidate(&candidates, choice)?;
                choice.clone()
            }
            None => default_choice(&candidates).ok_or_else(|| {
                UploadError::Format("input references no studies".to_string())
            })?,
        };
        if candidates.len() > 1 {
            info!(
                candidates = candidates.len(),
                subject = %choice.subject_id,
                experiment = %choice.experiment_id,
                "several subjects match; using the first"
            );
        }
        let binding = self.confirm(dependencies, &choice)?;
        Ok(Resolution {
            binding,
            candidates,
        })
    }

    pub fn discover(
        &self,
        dependencies: &DependencySet,
    ) -> Result<Vec<AmbiguousBinding>, UploadError> {
        let sessions = self
            .repository
            .query_table(&paths::project_experiments(self.project))?;
        debug!(rows = sessions.len(), project = self.project, "sessions listed");

        let mut candidates: Vec<AmbiguousBinding> = Vec::new();
        let mut matched_studies = BTreeSet::new();
        for row in sessions.rows() {
            let Some(study_uid) = row.get(COL_UID) else {
                continue;
            };
            if !dependencies.study_uids.contains(study_uid) {
                continue;
            }
            let (Some(subject_id), Some(experiment_id)) = (row.get(COL_SUBJECT_ID), row.get(COL_ID))
            else {
                continue;
            };
            matched_studies.insert(study_uid.clone());

            let experiment_label = row
                .get(COL_LABEL)
                .cloned()
                .unwrap_or_else(|| experiment_id.clone());
            let index = match candidates
                .iter()
                .position(|candidate| &candidate.subject_id == subject_id)
            {
                Some(index) => index,
                None => {
                    candidates.push(AmbiguousBinding {
                        subject_id: subject_id.clone(),
                        subject_label: row
                            .get(COL_SUBJECT_LABEL)
                            .cloned()
                            .unwrap_or_else(|| subject_id.clone()),
                        experiment_ids: Vec::new(),
                        experiment_labels: Vec::new(),
                    });
                    candidates.len() - 1
                }
            };
            let candidate = &mut candidates[index];
            if !candidate.experiment_ids.contains(experiment_id) {
                candidate.experiment_ids.push(experiment_id.clone());
                candidate.experiment_labels.push(experiment_label);
            }
        }

        if let Some(missing) = dependencies
            .study_uids
            .iter()
            .find(|uid| !matched_studies.contains(*uid))
        {
            return Err(UploadError::Dependency {
                level: UidLevel::Study,
                uid: missing.clone(),
            });
        }
        Ok(candidates)
    }

    pub fn confirm(
        &self,
        dependencies: &DependencySet,
        choice: &BindingChoice,
    ) -> Result<ResolvedBinding, UploadError> {
        let scans = self
            .repository
            .query_table(&paths::experiment_scans(self.project, &choice.experiment_id))?;

        let mut scan_ids = BTreeSet::new();
        for series_uid in &dependencies.series_uids {
            let matching = matching_ids(&scans, series_uid);
            if matching.is_empty() {
                return Err(UploadError::Dependency {
                    level: UidLevel::Series,
                    uid: series_uid.clone(),
                });
            }
            scan_ids.extend(matching);
        }

        let mut file_to_instance_uid = BTreeMap::new();
        let mut instance_uid_to_file = BTreeMap::new();
        let mut file_to_scan = BTreeMap::new();
        for scan_id in &scan_ids {
            let catalog = self.repository.query_table(&paths::scan_files(
                self.project,
                &choice.experiment_id,
                scan_id,
            ))?;
            for entry in catalog.rows() {
                let (Some(name), Some(uid)) = (entry.get(COL_NAME), entry.get(COL_UID)) else {
                    continue;
                };
                if !dependencies.sop_instance_uids.contains(uid)
                    || instance_uid_to_file.contains_key(uid)
                {
                    continue;
                }
                file_to_instance_uid.insert(name.clone(), uid.clone());
                instance_uid_to_file.insert(uid.clone(), name.clone());
                file_to_scan.insert(name.clone(), scan_id.clone());
            }
        }

        if let Some(missing) = dependencies
            .sop_instance_uids
            .iter()
            .find(|uid| !instance_uid_to_file.contains_key(*uid))
        {
            return Err(UploadError::Dependency {
                level: UidLevel::Instance,
                uid: missing.clone(),
            });
        }

        Ok(ResolvedBinding {
            subject_id: choice.subject_id.clone(),
            experiment_id: choice.experiment_id.clone(),
            scan_ids,
            file_to_instance_uid,
            instance_uid_to_file,
            file_to_scan,
        })
    }
}

// Ties go to the first subject and experiment in repository response order.
pub fn default_choice(candidates: &[AmbiguousBinding]) -> Option<BindingChoice> {
    let first = candidates.first()?;
    let experiment_id = first.experiment_ids.first()?;
    Some(BindingChoice {
        subject_id: first.subject_id.clone(),
        experiment_id: experiment_id.clone(),
    })
}

pub fn ensure_candidate(
    candidates: &[AmbiguousBinding],
    choice: &BindingChoice,
) -> Result<(), UploadError> {
    let known = candidates.iter().any(|candidate| {
        candidate.subject_id == choice.subject_id
            && candidate.experiment_ids.contains(&choice.experiment_id)
    });
    if known {
        Ok(())
    } else {
        Err(UploadError::PreconditionFailed(format!(
            "subject {} / experiment {} does not hold the referenced studies",
            choice.subject_id, choice.experiment_id
        )))
    }
}

fn matching_ids(table: &ResultSet, uid: &str) -> Vec<String> {
    table
        .rows()
        .iter()
        .filter(|row| row.get(COL_UID).map(String::as_str) == Some(uid))
        .filter_map(|row| row.get(COL_ID).cloned())
        .collect()
}
