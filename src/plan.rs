use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::domain::{ArchiveId, Checksum, SelectionEntry};
use crate::error::AtbError;

pub type ArchiveChecksums = BTreeMap<ArchiveId, Checksum>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchPlanEntry {
    pub archive_id: ArchiveId,
    pub source_url: String,
    pub expected_checksum: Option<Checksum>,
    pub wanted_members: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchPlan {
    entries: Vec<FetchPlanEntry>,
}

impl FetchPlan {
    pub fn build(
        selection: &[SelectionEntry],
        checksums: &ArchiveChecksums,
    ) -> Result<Self, AtbError> {
        let mut grouped: BTreeMap<ArchiveId, FetchPlanEntry> = BTreeMap::new();

        for row in selection {
            let entry = grouped
                .entry(row.archive_id.clone())
                .or_insert_with(|| FetchPlanEntry {
                    archive_id: row.archive_id.clone(),
                    source_url: row.source_url.clone(),
                    expected_checksum: None,
                    wanted_members: BTreeSet::new(),
                });

            if entry.source_url != row.source_url {
                return Err(AtbError::PlanConflict {
                    archive: row.archive_id.to_string(),
                    message: format!("urls differ: {} vs {}", entry.source_url, row.source_url),
                });
            }

            if let Some(checksum) = &row.checksum {
                match &entry.expected_checksum {
                    Some(existing) if existing != checksum => {
                        return Err(AtbError::PlanConflict {
                            archive: row.archive_id.to_string(),
                            message: format!("checksums differ: {existing} vs {checksum}"),
                        });
                    }
                    Some(_) => {}
                    None => entry.expected_checksum = Some(checksum.clone()),
                }
            }

            entry.wanted_members.insert(row.member_path.clone());
        }

        let entries = grouped
            .into_values()
            .map(|mut entry| {
                if entry.expected_checksum.is_none() {
                    entry.expected_checksum = checksums.get(&entry.archive_id).cloned();
                }
                entry
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[FetchPlanEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn member_count(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.wanted_members.len())
            .sum()
    }
}
