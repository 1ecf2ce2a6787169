//! Aggregator
//!
//! Merges every visible artifact into one [`AggregatedDataset`]. The result
//! depends only on the contents of the artifact directories, never on which
//! run produced them or in which order files are listed:
//!
//! 1. collect `data/<identity>.csv` + sidecar from every source, in source order
//! 2. deduplicate identities across sources by content hash
//! 3. sort by `(universe index, identity)`
//! 4. parse each CSV (all cells as text) and prefix the universe columns
//!
//! Unreadable artifacts and cross-source conflicts become [`AggregationError`]
//! entries in the report; they never stop the scan.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, AsArray};
use arrow::datatypes::{DataType, Field, Schema};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact::{content_hash, ArtifactRecord, ArtifactStore, StoredArtifact};
use crate::storage::{dimension_column, AggregatedDataset, UNIVERSE_ID_COLUMN};
use crate::universe::UniverseId;

/// One artifact that could not be merged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("artifact {identity} ({}): {reason}", .path.display())]
pub struct AggregationError {
    identity: UniverseId,
    path: PathBuf,
    reason: String,
}

impl AggregationError {
    fn new(identity: &UniverseId, path: &Path, reason: impl Into<String>) -> Self {
        Self {
            identity: identity.clone(),
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Identity of the offending artifact.
    #[must_use]
    pub const fn identity(&self) -> &UniverseId {
        &self.identity
    }

    /// Artifact file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What went wrong.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Outcome of an aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct AggregationReport {
    /// Merged records
    pub dataset: AggregatedDataset,
    /// Artifacts merged into the dataset
    pub artifacts_merged: usize,
    /// Identical copies of an identity found in later sources and dropped
    pub duplicates: usize,
    /// Unparsable artifacts and conflicts
    pub errors: Vec<AggregationError>,
}

impl AggregationReport {
    /// True when every discovered artifact was merged or deduplicated.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "aggregated {} artifacts into {} rows",
            self.artifacts_merged,
            self.dataset.num_rows()
        )?;
        if self.duplicates > 0 {
            write!(f, " ({} duplicates dropped)", self.duplicates)?;
        }
        for err in &self.errors {
            write!(f, "\n  unmerged: {err}")?;
        }
        Ok(())
    }
}

/// An artifact accepted for merging.
struct Candidate {
    stored: StoredArtifact,
    record: ArtifactRecord,
    bytes: Vec<u8>,
    hash: String,
}

/// Parsed artifact: header plus rows of text cells.
struct Table {
    header: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

/// Merge the artifacts of a single output directory.
#[must_use]
pub fn aggregate(store: &ArtifactStore) -> AggregationReport {
    finalize(std::slice::from_ref(store))
}

/// Merge the artifacts of several output directories (one per partial run).
///
/// When the same identity appears in more than one source, byte-identical
/// copies are deduplicated (the first source wins). Copies with different
/// content are a conflict: the identity is excluded and reported.
#[must_use]
pub fn finalize(sources: &[ArtifactStore]) -> AggregationReport {
    let mut report = AggregationReport::default();
    let mut accepted: FxHashMap<UniverseId, Candidate> = FxHashMap::default();
    let mut conflicted: FxHashSet<UniverseId> = FxHashSet::default();

    for store in sources {
        let listed = match store.list() {
            Ok(listed) => listed,
            Err(e) => {
                warn!(source = %store.root().display(), error = %e, "cannot scan artifact directory");
                continue;
            }
        };
        debug!(source = %store.root().display(), artifacts = listed.len(), "scanning source");

        for stored in listed {
            let candidate = match load(store, stored) {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "skipping artifact");
                    report.errors.push(e);
                    continue;
                }
            };
            let id = candidate.stored.id.clone();
            match accepted.get(&id) {
                None => {
                    accepted.insert(id, candidate);
                }
                Some(existing) if conflicted.contains(&id) => {
                    report
                        .errors
                        .push(conflict(&existing.stored.artifact_path, &candidate));
                }
                Some(existing) if existing.hash == candidate.hash => {
                    debug!(universe = %id.short(), "identical artifact in later source");
                    report.duplicates += 1;
                }
                Some(existing) => {
                    let err = conflict(&existing.stored.artifact_path, &candidate);
                    warn!(error = %err, "conflicting artifacts");
                    report.errors.push(err);
                    conflicted.insert(id);
                }
            }
        }
    }

    let mut merged: Vec<Candidate> = accepted
        .into_iter()
        .filter(|(id, _)| !conflicted.contains(id))
        .map(|(_, c)| c)
        .collect();
    merged.sort_by(|a, b| {
        (a.record.universe_index(), &a.stored.id).cmp(&(b.record.universe_index(), &b.stored.id))
    });

    let mut tables = Vec::with_capacity(merged.len());
    for candidate in merged {
        match parse_csv(&candidate.bytes) {
            Ok(table) => tables.push((candidate, table)),
            Err(reason) => {
                let err = AggregationError::new(
                    &candidate.stored.id,
                    &candidate.stored.artifact_path,
                    format!("unparsable CSV: {reason}"),
                );
                warn!(error = %err, "skipping artifact");
                report.errors.push(err);
            }
        }
    }

    report.artifacts_merged = tables.len();
    report.dataset = assemble(&tables);
    info!(
        artifacts = report.artifacts_merged,
        rows = report.dataset.num_rows(),
        errors = report.errors.len(),
        "aggregation finished"
    );
    report
}

fn conflict(first: &Path, candidate: &Candidate) -> AggregationError {
    AggregationError::new(
        &candidate.stored.id,
        &candidate.stored.artifact_path,
        format!("conflicts with {} (content differs)", first.display()),
    )
}

fn load(store: &ArtifactStore, stored: StoredArtifact) -> Result<Candidate, AggregationError> {
    let bytes = fs::read(&stored.artifact_path)
        .map_err(|e| AggregationError::new(&stored.id, &stored.artifact_path, e.to_string()))?;
    let record = store.load_record(&stored.id).map_err(|e| {
        AggregationError::new(
            &stored.id,
            &stored.artifact_path,
            format!("missing or malformed metadata: {e}"),
        )
    })?;
    if record.universe_id() != &stored.id {
        return Err(AggregationError::new(
            &stored.id,
            &stored.artifact_path,
            format!("metadata belongs to {}", record.universe_id()),
        ));
    }
    let hash = content_hash(&bytes);
    Ok(Candidate {
        stored,
        record,
        bytes,
        hash,
    })
}

/// Parse CSV bytes keeping every cell as text. Empty cells are null.
fn parse_csv(bytes: &[u8]) -> Result<Table, arrow::error::ArrowError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Table {
            header: Vec::new(),
            rows: Vec::new(),
        });
    }

    let format = arrow::csv::reader::Format::default().with_header(true);
    let (inferred, _) = format.infer_schema(Cursor::new(bytes), None)?;
    let header: Vec<String> = inferred.fields().iter().map(|f| f.name().clone()).collect();
    let schema = Arc::new(Schema::new(
        header
            .iter()
            .map(|name| Field::new(name, DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));

    let reader = arrow::csv::ReaderBuilder::new(schema)
        .with_header(true)
        .build(Cursor::new(bytes))?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch?;
        let columns: Vec<_> = batch.columns().iter().map(|c| c.as_string::<i32>()).collect();
        for row in 0..batch.num_rows() {
            rows.push(
                columns
                    .iter()
                    .map(|c| c.is_valid(row).then(|| c.value(row).to_string()))
                    .collect(),
            );
        }
    }
    Ok(Table { header, rows })
}

fn assemble(tables: &[(Candidate, Table)]) -> AggregatedDataset {
    let dimensions: BTreeSet<&str> = tables
        .iter()
        .flat_map(|(c, _)| c.record.dimensions().keys().map(String::as_str))
        .collect();

    let mut columns = vec![UNIVERSE_ID_COLUMN.to_string()];
    columns.extend(dimensions.iter().map(|d| dimension_column(d)));
    let leading = columns.len();

    let mut position: FxHashMap<String, usize> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| (c.clone(), i))
        .collect();
    for (_, table) in tables {
        for name in &table.header {
            if !position.contains_key(name) {
                position.insert(name.clone(), columns.len());
                columns.push(name.clone());
            }
        }
    }

    let mut dataset = AggregatedDataset::new(columns);
    let width = dataset.columns().len();
    for (candidate, table) in tables {
        let mut prefix = vec![None; width];
        prefix[0] = Some(candidate.stored.id.to_string());
        for (name, value) in candidate.record.dimensions() {
            if let Some(&i) = position.get(&dimension_column(name)) {
                prefix[i] = Some(value.to_string());
            }
        }

        if table.rows.is_empty() {
            push(&mut dataset, prefix);
            continue;
        }
        for cells in &table.rows {
            let mut row = prefix.clone();
            for (name, cell) in table.header.iter().zip(cells) {
                // artifact columns shadowing a universe column are ignored
                if let Some(&i) = position.get(name) {
                    if i >= leading {
                        row[i].clone_from(cell);
                    }
                }
            }
            push(&mut dataset, row);
        }
    }
    dataset
}

fn push(dataset: &mut AggregatedDataset, row: Vec<Option<String>>) {
    debug_assert_eq!(row.len(), dataset.columns().len(), "rows are built at dataset width");
    if let Err(e) = dataset.push_row(row) {
        warn!(error = %e, "row dropped from consolidated dataset");
    }
}
