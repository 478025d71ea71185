use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use medvault_core::{
    Directory, Identity, LineDiagnostic, PersonId, RecordEntry, RecordRow, Role,
    SECTION_SEPARATOR,
};
use parking_lot::{Mutex, MutexGuard};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

const DOCTOR_PREFIX: &str = "Doctor=";
const NURSE_SEPARATOR: &str = ",Nurse=";

/// Outcome of one full rewrite of the record file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistReport {
    pub patients: usize,
    pub rows: usize,
    pub bytes: usize,
    pub digest: String,
}

/// Patient → relationship rows → dated entries.
///
/// The on-disk form is a sequence of blocks:
///
/// ```text
/// <patientId>
/// Doctor=<id>,Nurse=<id>
/// <date>:<text>
/// ---
/// ```
#[derive(Debug)]
pub struct RecordStore {
    directory: Arc<Directory>,
    rows: BTreeMap<PersonId, Vec<RecordRow>>,
    diagnostics: Vec<LineDiagnostic>,
}

impl RecordStore {
    #[must_use]
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory, rows: BTreeMap::new(), diagnostics: Vec::new() }
    }

    /// Load the record file at `path`. A missing file yields an empty store.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read.
    pub fn load(directory: Arc<Directory>, path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "record file not found, starting empty");
            return Ok(Self::new(directory));
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read record file {}", path.display()))?;
        let store = Self::parse(directory, &text);
        tracing::info!(
            path = %path.display(),
            patients = store.patient_count(),
            rows = store.row_count(),
            skipped = store.diagnostics.len(),
            "loaded record file"
        );
        Ok(store)
    }

    /// Parse record-file text. Corrupt blocks are skipped whole and reported
    /// through [`RecordStore::diagnostics`].
    #[must_use]
    pub fn parse(directory: Arc<Directory>, text: &str) -> Self {
        let mut store = Self::new(directory);
        let mut lines = text.lines().enumerate().map(|(index, line)| (index + 1, line));

        while let Some((start, header)) = lines.next() {
            if header.trim().is_empty() {
                continue;
            }

            let mut body = Vec::new();
            let mut terminated = false;
            for (line_no, line) in lines.by_ref() {
                if line == SECTION_SEPARATOR {
                    terminated = true;
                    break;
                }
                body.push((line_no, line));
            }
            if !terminated {
                store.skip(LineDiagnostic::new(start, header, "block is not terminated by `---`"));
                break;
            }

            let patient_id = PersonId::new(header.trim());
            if store.rows.contains_key(&patient_id) {
                store.skip(LineDiagnostic::new(start, header, "duplicate patient block"));
                continue;
            }
            match store.parse_block(&patient_id, &body) {
                Ok(rows) if rows.is_empty() => {
                    store.skip(LineDiagnostic::new(start, header, "block has no record rows"));
                }
                Ok(rows) => {
                    store.rows.insert(patient_id, rows);
                }
                Err(diagnostic) => store.skip(diagnostic),
            }
        }

        store
    }

    /// Render the whole index in record-file format, blocks in patient-id order.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (patient_id, rows) in &self.rows {
            out.push_str(patient_id.as_str());
            out.push('\n');
            for row in rows {
                out.push_str(&row.to_string());
                out.push('\n');
            }
            out.push_str(SECTION_SEPARATOR);
            out.push('\n');
        }
        out
    }

    /// Write the index to `path` through a temporary sibling file that is synced and
    /// renamed over the previous file.
    ///
    /// # Errors
    /// Returns an error when the temporary file cannot be created, written, synced,
    /// or renamed into place.
    pub fn save(&self, path: &Path) -> Result<PersistReport> {
        let body = self.render();
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create record directory {}", parent.display()))?;

        let mut temp = NamedTempFile::new_in(parent).with_context(|| {
            format!("failed to create temporary record file in {}", parent.display())
        })?;
        temp.write_all(body.as_bytes()).context("failed to write temporary record file")?;
        temp.as_file().sync_all().context("failed to sync temporary record file")?;
        temp.persist(path)
            .with_context(|| format!("failed to replace record file {}", path.display()))?;

        Ok(PersistReport {
            patients: self.patient_count(),
            rows: self.row_count(),
            bytes: body.len(),
            digest: format!("sha256:{}", hex::encode(Sha256::digest(body.as_bytes()))),
        })
    }

    #[must_use]
    pub fn get(&self, patient_id: &str) -> Option<&[RecordRow]> {
        self.rows.get(patient_id).map(Vec::as_slice)
    }

    /// First row of `patient_id` whose doctor or nurse is `staff_id`.
    #[must_use]
    pub fn find(&self, patient_id: &str, staff_id: &str) -> Option<&RecordRow> {
        self.rows.get(patient_id)?.iter().find(|row| row.involves(staff_id))
    }

    fn find_mut(&mut self, patient_id: &str, staff_id: &str) -> Option<&mut RecordRow> {
        self.rows.get_mut(patient_id)?.iter_mut().find(|row| row.involves(staff_id))
    }

    /// Open a new row for (`patient_id`, `doctor`) with `nurse_id` attached.
    ///
    /// Succeeds only when the patient and nurse exist with those roles, both belong
    /// to the doctor's division, and the doctor has no row for this patient yet.
    /// Returns `false` without touching the index otherwise.
    pub fn create(&mut self, patient_id: &str, doctor: &Identity, nurse_id: &str) -> bool {
        if doctor.role() != Role::Doctor {
            return false;
        }
        let Some(division) = doctor.division() else {
            return false;
        };
        let Some(patient) = self.directory.resolve_role(patient_id, Role::Patient) else {
            return false;
        };
        let Some(nurse) = self.directory.resolve_role(nurse_id, Role::Nurse) else {
            return false;
        };
        if patient.division() != Some(division) || nurse.division() != Some(division) {
            return false;
        }

        let rows = self.rows.entry(patient.id.clone()).or_default();
        if rows.iter().any(|row| row.doctor_id() == &doctor.id) {
            return false;
        }
        rows.push(RecordRow::new(
            patient.id.clone(),
            doctor.id.clone(),
            nurse.id.clone(),
            division.clone(),
        ));
        true
    }

    /// Append `entry` to the row `staff_id` holds for `patient_id`. Returns `false`
    /// when there is no such row.
    pub fn append(&mut self, patient_id: &str, staff_id: &str, entry: RecordEntry) -> bool {
        match self.find_mut(patient_id, staff_id) {
            Some(row) => {
                row.append(entry);
                true
            }
            None => false,
        }
    }

    /// Remove every row of `patient_id`, returning how many were dropped.
    pub fn delete(&mut self, patient_id: &str) -> usize {
        self.rows.remove(patient_id).map_or(0, |rows| rows.len())
    }

    /// Distinct patients across all rows where `staff_id` is doctor or nurse,
    /// ordered by patient id.
    #[must_use]
    pub fn patients_for(&self, staff_id: &str) -> Vec<&Identity> {
        let ids = self
            .rows
            .values()
            .flatten()
            .filter(|row| row.involves(staff_id))
            .map(RecordRow::patient_id)
            .collect::<BTreeSet<_>>();
        ids.into_iter()
            .filter_map(|id| self.directory.resolve_role(id.as_str(), Role::Patient))
            .collect()
    }

    #[must_use]
    pub fn patient_count(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    /// Blocks skipped while parsing.
    #[must_use]
    pub fn diagnostics(&self) -> &[LineDiagnostic] {
        &self.diagnostics
    }

    fn parse_block(
        &self,
        patient_id: &PersonId,
        body: &[(usize, &str)],
    ) -> Result<Vec<RecordRow>, LineDiagnostic> {
        let mut rows: Vec<RecordRow> = Vec::new();
        for &(line_no, line) in body {
            if line.starts_with(DOCTOR_PREFIX) {
                let row = self.parse_row_line(patient_id, line_no, line)?;
                if rows.iter().any(|existing| existing.doctor_id() == row.doctor_id()) {
                    return Err(LineDiagnostic::new(line_no, line, "duplicate doctor row"));
                }
                rows.push(row);
                continue;
            }

            let Some(row) = rows.last_mut() else {
                return Err(LineDiagnostic::new(line_no, line, "entry before any record row"));
            };
            let Some((date, text)) = line.split_once(':') else {
                return Err(LineDiagnostic::new(line_no, line, "entry is missing `date:`"));
            };
            row.append(RecordEntry::new(date, text));
        }
        Ok(rows)
    }

    fn parse_row_line(
        &self,
        patient_id: &PersonId,
        line_no: usize,
        line: &str,
    ) -> Result<RecordRow, LineDiagnostic> {
        let malformed = || LineDiagnostic::new(line_no, line, "expected Doctor=<id>,Nurse=<id>");
        let rest = line.strip_prefix(DOCTOR_PREFIX).ok_or_else(malformed)?;
        let (doctor_id, nurse_id) = rest.split_once(NURSE_SEPARATOR).ok_or_else(malformed)?;
        if doctor_id.is_empty() || nurse_id.is_empty() {
            return Err(malformed());
        }
        let division = self
            .directory
            .resolve_by_id(doctor_id)
            .and_then(Identity::division)
            .ok_or_else(|| {
                LineDiagnostic::new(line_no, line, format!("unknown doctor `{doctor_id}`"))
            })?;
        Ok(RecordRow::new(
            patient_id.clone(),
            PersonId::new(doctor_id),
            PersonId::new(nurse_id),
            division.clone(),
        ))
    }

    fn skip(&mut self, diagnostic: LineDiagnostic) {
        tracing::warn!(
            line = diagnostic.line,
            reason = %diagnostic.reason,
            "skipping corrupt record block"
        );
        self.diagnostics.push(diagnostic);
    }
}

/// Process-wide handle to the record store and its backing file.
///
/// Every mutation and every persistence call goes through the one mutex, so two
/// sessions ending together write their snapshots one after the other and neither
/// loses the other's changes.
#[derive(Debug, Clone)]
pub struct SharedRecordStore {
    inner: Arc<Mutex<RecordStore>>,
    path: PathBuf,
}

impl SharedRecordStore {
    #[must_use]
    pub fn new(store: RecordStore, path: impl Into<PathBuf>) -> Self {
        Self { inner: Arc::new(Mutex::new(store)), path: path.into() }
    }

    /// Load the record file at `path` and wrap it for sharing.
    ///
    /// # Errors
    /// Returns an error when the file exists but cannot be read.
    pub fn open(directory: Arc<Directory>, path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = RecordStore::load(directory, &path)?;
        Ok(Self::new(store, path))
    }

    pub fn lock(&self) -> MutexGuard<'_, RecordStore> {
        self.inner.lock()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the backing file from the current index. The lock is held for the
    /// whole write.
    ///
    /// # Errors
    /// Returns an error when the file cannot be replaced.
    pub fn persist(&self) -> Result<PersistReport> {
        let store = self.inner.lock();
        store.save(&self.path)
    }
}
