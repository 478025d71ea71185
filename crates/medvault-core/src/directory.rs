use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::{
    Division, DivisionId, Identity, LineDiagnostic, PersonId, Profile, Role, SerialNumber,
    SECTION_SEPARATOR,
};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("failed to read identity directory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Role-tagged identities and divisions, loaded once and read-only afterwards.
///
/// The file holds a divisions section (`divisionId:divisionName`) and, after a
/// `---` line, a persons section
/// (`serial:type:divisionId:personId:personName[:attendingDoctorId]`).
#[derive(Debug, Default)]
pub struct Directory {
    divisions: Vec<Division>,
    identities: Vec<Identity>,
    by_serial: HashMap<SerialNumber, usize>,
    by_id: HashMap<PersonId, usize>,
    diagnostics: Vec<LineDiagnostic>,
}

impl Directory {
    /// Read and parse a directory file. Bad lines are skipped, see [`Directory::diagnostics`].
    ///
    /// # Errors
    /// Returns [`DirectoryError::Read`] when the file cannot be read.
    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let text = fs::read_to_string(path)
            .map_err(|source| DirectoryError::Read { path: path.to_path_buf(), source })?;
        let directory = Self::parse(&text);
        tracing::info!(
            path = %path.display(),
            divisions = directory.divisions.len(),
            identities = directory.identities.len(),
            skipped = directory.diagnostics.len(),
            "loaded identity directory"
        );
        Ok(directory)
    }

    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut directory = Self::default();
        let mut lines = text.lines().enumerate().map(|(index, line)| (index + 1, line));

        for (line_no, line) in lines.by_ref() {
            if line.trim() == SECTION_SEPARATOR {
                break;
            }
            if !line.trim().is_empty() {
                directory.parse_division(line_no, line);
            }
        }

        for (line_no, line) in lines {
            if !line.trim().is_empty() {
                directory.parse_person(line_no, line);
            }
        }

        directory
    }

    #[must_use]
    pub fn resolve(&self, serial: &SerialNumber) -> Option<&Identity> {
        self.by_serial.get(serial).map(|index| &self.identities[*index])
    }

    /// Resolve a textual person id. Ids shared by several certificates resolve to
    /// the first one listed.
    #[must_use]
    pub fn resolve_by_id(&self, id: &str) -> Option<&Identity> {
        self.by_id.get(id).map(|index| &self.identities[*index])
    }

    #[must_use]
    pub fn resolve_division(&self, id: &str) -> Option<&Division> {
        self.divisions.iter().find(|division| division.id().as_str() == id)
    }

    /// Resolve `id` only if it names a person holding `role`.
    #[must_use]
    pub fn resolve_role(&self, id: &str, role: Role) -> Option<&Identity> {
        self.resolve_by_id(id).filter(|identity| identity.role() == role)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Lines skipped while parsing.
    #[must_use]
    pub fn diagnostics(&self) -> &[LineDiagnostic] {
        &self.diagnostics
    }

    fn parse_division(&mut self, line_no: usize, line: &str) {
        let fields = line.split(':').map(str::trim).collect::<Vec<_>>();
        let [id, name, ..] = fields.as_slice() else {
            self.skip(line_no, line, "expected divisionId:divisionName");
            return;
        };
        if id.is_empty() {
            self.skip(line_no, line, "empty division id");
            return;
        }
        if self.division_index(id).is_some() {
            self.skip(line_no, line, "duplicate division id");
            return;
        }
        self.divisions.push(Division::new(DivisionId::new(*id), *name));
    }

    fn parse_person(&mut self, line_no: usize, line: &str) {
        let fields = line.split(':').map(str::trim).collect::<Vec<_>>();
        let [serial, kind, division_id, id, name, extra @ ..] = fields.as_slice() else {
            self.skip(line_no, line, "expected serial:type:divisionId:personId:personName");
            return;
        };
        let Some(serial) = SerialNumber::parse(serial) else {
            self.skip(line_no, line, "invalid serial number");
            return;
        };
        let Some(role) = Role::parse(kind) else {
            self.skip(line_no, line, format!("unknown person type `{kind}`"));
            return;
        };
        if id.is_empty() {
            self.skip(line_no, line, "empty person id");
            return;
        }
        if self.by_serial.contains_key(&serial) {
            self.skip(line_no, line, "duplicate serial number");
            return;
        }

        let division_index = if role == Role::GovernmentAgency {
            None
        } else if let Some(index) = self.division_index(division_id) {
            Some(index)
        } else {
            self.skip(line_no, line, format!("division `{division_id}` not found"));
            return;
        };
        let division = division_index.map(|index| self.divisions[index].id().clone());

        let profile = match (role, division) {
            (Role::Doctor, Some(division)) => Profile::Doctor { division },
            (Role::Nurse, Some(division)) => Profile::Nurse { division },
            (Role::Patient, Some(division)) => {
                let Some(doctor) = extra.first().filter(|doctor| !doctor.is_empty()) else {
                    self.skip(line_no, line, "patient is missing the attending doctor id");
                    return;
                };
                Profile::Patient { division, attending_doctor: PersonId::new(*doctor) }
            }
            _ => Profile::GovernmentAgency,
        };

        let identity = Identity { id: PersonId::new(*id), name: (*name).to_string(), profile };
        let index = self.identities.len();
        if let (Role::Patient, Some(division_index)) = (role, division_index) {
            self.divisions[division_index].add_member(identity.id.clone());
        }
        if self.by_id.contains_key(identity.id.as_str()) {
            tracing::debug!(line = line_no, id = %identity.id, "person id listed more than once");
        } else {
            self.by_id.insert(identity.id.clone(), index);
        }
        self.by_serial.insert(serial, index);
        self.identities.push(identity);
    }

    fn division_index(&self, id: &str) -> Option<usize> {
        self.divisions.iter().position(|division| division.id().as_str() == id)
    }

    fn skip(&mut self, line_no: usize, line: &str, reason: impl Into<String>) {
        let diagnostic = LineDiagnostic::new(line_no, line, reason);
        tracing::warn!(
            line = diagnostic.line,
            reason = %diagnostic.reason,
            "skipping identity directory line"
        );
        self.diagnostics.push(diagnostic);
    }
}
