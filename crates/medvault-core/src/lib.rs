use std::borrow::Borrow;
use std::fmt::{Display, Formatter};

use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

mod directory;

pub use directory::{Directory, DirectoryError};

/// Line that terminates every server reply block on the wire.
pub const END_OF_MESSAGE: &str = "ENDOFMSG";

/// Reply that opens the second phase of a write exchange.
pub const WRITE_PROMPT: &str = "Write information";

/// Separator line used by both the directory file and the record file.
pub const SECTION_SEPARATOR: &str = "---";

/// One skipped line (or block) from a text file that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineDiagnostic {
    pub line: usize,
    pub content: String,
    pub reason: String,
}

impl LineDiagnostic {
    #[must_use]
    pub fn new(line: usize, content: &str, reason: impl Into<String>) -> Self {
        Self { line, content: content.to_string(), reason: reason.into() }
    }
}

impl Display for LineDiagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {} ({})", self.line, self.reason, self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PersonId(String);

impl PersonId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PersonId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for PersonId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PersonId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DivisionId(String);

impl DivisionId {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for DivisionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DivisionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Certificate serial number in canonical decimal form (no sign, no leading zeros).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SerialNumber(String);

impl SerialNumber {
    /// Parse a decimal serial number; `007` and `7` name the same certificate.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let digits = value.strip_prefix('+').unwrap_or(value);
        if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        let canonical = digits.trim_start_matches('0');
        if canonical.is_empty() {
            return Some(Self("0".to_string()));
        }
        Some(Self(canonical.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SerialNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Doctor,
    Nurse,
    GovernmentAgency,
    Patient,
}

impl Role {
    pub const ALL: [Role; 4] = [Self::Doctor, Self::Nurse, Self::GovernmentAgency, Self::Patient];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Doctor => "Doctor",
            Self::Nurse => "Nurse",
            Self::GovernmentAgency => "GovernmentAgency",
            Self::Patient => "Patient",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Doctor" => Some(Self::Doctor),
            "Nurse" => Some(Self::Nurse),
            "GovernmentAgency" => Some(Self::GovernmentAgency),
            "Patient" => Some(Self::Patient),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_staff(self) -> bool {
        matches!(self, Self::Doctor | Self::Nurse)
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role-specific attributes of an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Profile {
    Doctor { division: DivisionId },
    Nurse { division: DivisionId },
    GovernmentAgency,
    Patient { division: DivisionId, attending_doctor: PersonId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: PersonId,
    pub name: String,
    pub profile: Profile,
}

impl Identity {
    #[must_use]
    pub fn role(&self) -> Role {
        match self.profile {
            Profile::Doctor { .. } => Role::Doctor,
            Profile::Nurse { .. } => Role::Nurse,
            Profile::GovernmentAgency => Role::GovernmentAgency,
            Profile::Patient { .. } => Role::Patient,
        }
    }

    /// Division the identity belongs to; agencies are not part of any division.
    #[must_use]
    pub fn division(&self) -> Option<&DivisionId> {
        match &self.profile {
            Profile::Doctor { division }
            | Profile::Nurse { division }
            | Profile::Patient { division, .. } => Some(division),
            Profile::GovernmentAgency => None,
        }
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

/// Organizational unit scoping which patients staff can see.
#[derive(Debug, Clone, Eq)]
pub struct Division {
    id: DivisionId,
    name: String,
    members: Vec<PersonId>,
}

impl Division {
    #[must_use]
    pub fn new(id: DivisionId, name: impl Into<String>) -> Self {
        Self { id, name: name.into(), members: Vec::new() }
    }

    #[must_use]
    pub fn id(&self) -> &DivisionId {
        &self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Patient members in the order they were registered.
    #[must_use]
    pub fn members(&self) -> &[PersonId] {
        &self.members
    }

    pub(crate) fn add_member(&mut self, patient: PersonId) {
        self.members.push(patient);
    }
}

impl PartialEq for Division {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for Division {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    date: String,
    text: String,
}

impl RecordEntry {
    /// Trailing carriage returns are dropped from `text`; the record file is
    /// line-oriented and would lose them on reload.
    #[must_use]
    pub fn new(date: impl Into<String>, text: impl Into<String>) -> Self {
        let mut text = text.into();
        text.truncate(text.trim_end_matches('\r').len());
        Self { date: date.into(), text }
    }

    #[must_use]
    pub fn date(&self) -> &str {
        &self.date
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl Display for RecordEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.date, self.text)
    }
}

/// Relationship between one patient and one doctor/nurse pair, holding dated entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRow {
    patient_id: PersonId,
    doctor_id: PersonId,
    nurse_id: PersonId,
    division: DivisionId,
    entries: Vec<RecordEntry>,
}

impl RecordRow {
    #[must_use]
    pub fn new(
        patient_id: PersonId,
        doctor_id: PersonId,
        nurse_id: PersonId,
        division: DivisionId,
    ) -> Self {
        Self { patient_id, doctor_id, nurse_id, division, entries: Vec::new() }
    }

    #[must_use]
    pub fn patient_id(&self) -> &PersonId {
        &self.patient_id
    }

    #[must_use]
    pub fn doctor_id(&self) -> &PersonId {
        &self.doctor_id
    }

    #[must_use]
    pub fn nurse_id(&self) -> &PersonId {
        &self.nurse_id
    }

    #[must_use]
    pub fn division(&self) -> &DivisionId {
        &self.division
    }

    #[must_use]
    pub fn entries(&self) -> &[RecordEntry] {
        &self.entries
    }

    /// True when `staff_id` is this row's doctor or nurse.
    #[must_use]
    pub fn involves(&self, staff_id: &str) -> bool {
        self.doctor_id.as_str() == staff_id || self.nurse_id.as_str() == staff_id
    }

    pub fn append(&mut self, entry: RecordEntry) {
        self.entries.push(entry);
    }
}

impl Display for RecordRow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Doctor={},Nurse={}", self.doctor_id, self.nurse_id)?;
        for entry in &self.entries {
            write!(f, "\n{entry}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    ListOwnPatients,
    ListDivisionPatients,
    Read,
    Write,
    Create,
    Delete,
    Quit,
}

impl Operation {
    pub const ALL: [Operation; 7] = [
        Self::ListOwnPatients,
        Self::ListDivisionPatients,
        Self::Read,
        Self::Write,
        Self::Create,
        Self::Delete,
        Self::Quit,
    ];

    /// Wire token selecting this operation.
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::ListOwnPatients => "1",
            Self::ListDivisionPatients => "2",
            Self::Read => "3",
            Self::Write => "4",
            Self::Create => "5",
            Self::Delete => "6",
            Self::Quit => "quit",
        }
    }

    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|operation| operation.token() == token)
    }
}

/// What a granted operation lets the caller touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Rows where the caller is the doctor or the nurse.
    Assigned,
    /// Patients of the caller's own division.
    Division,
    /// The caller's own rows, arguments ignored.
    OwnRecords,
    /// Any patient.
    Unrestricted,
    /// The session itself.
    Session,
}

const GRANTS: &[(Role, Operation, Scope)] = &[
    (Role::Doctor, Operation::ListOwnPatients, Scope::Assigned),
    (Role::Nurse, Operation::ListOwnPatients, Scope::Assigned),
    (Role::Doctor, Operation::ListDivisionPatients, Scope::Division),
    (Role::Nurse, Operation::ListDivisionPatients, Scope::Division),
    (Role::Doctor, Operation::Read, Scope::Assigned),
    (Role::Nurse, Operation::Read, Scope::Assigned),
    (Role::Patient, Operation::Read, Scope::OwnRecords),
    (Role::GovernmentAgency, Operation::Read, Scope::Unrestricted),
    (Role::Doctor, Operation::Write, Scope::Assigned),
    (Role::Nurse, Operation::Write, Scope::Assigned),
    (Role::Doctor, Operation::Create, Scope::Division),
    (Role::GovernmentAgency, Operation::Delete, Scope::Unrestricted),
    (Role::Doctor, Operation::Quit, Scope::Session),
    (Role::Nurse, Operation::Quit, Scope::Session),
    (Role::GovernmentAgency, Operation::Quit, Scope::Session),
    (Role::Patient, Operation::Quit, Scope::Session),
];

/// Look up the scope `role` is granted for `operation`; `None` means denied.
#[must_use]
pub fn grant(role: Role, operation: Operation) -> Option<Scope> {
    GRANTS
        .iter()
        .find(|(granted_role, granted_operation, _)| {
            *granted_role == role && *granted_operation == operation
        })
        .map(|(_, _, scope)| *scope)
}

/// One parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    operation: Option<Operation>,
    args: Vec<String>,
}

impl Command {
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let mut tokens = line.split_whitespace();
        let operation = tokens.next().and_then(Operation::from_token);
        let args = tokens.map(str::to_string).collect();
        Self { operation, args }
    }

    /// `None` for unrecognized or empty input.
    #[must_use]
    pub fn operation(&self) -> Option<Operation> {
        self.operation
    }

    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }
}

/// Menu text offered to `role`; also the reply to anything it may not do.
#[must_use]
pub fn menu(role: Role) -> String {
    let mut options = String::new();
    if role.is_staff() {
        options.push_str("Enter 1 : list patient records\n");
        options.push_str("Enter 2 : list division records\n");
        options.push_str("Enter 3 : and {patient's id} to read a patient record (e.g 3 5)\n");
        options.push_str("Enter 4 : and {patient id} to write a patient record (e.g 4 5)\n");
    }
    if role == Role::Doctor {
        options.push_str(
            "Enter 5 : and {patient id} and {nurse id} to create a patient record (e.g 5 6 2)\n",
        );
    }
    if role == Role::GovernmentAgency {
        options.push_str("Enter 3 : and {patient id} to read a patient record (e.g: 3 5)\n");
        options.push_str("Enter 6 : and {patient id} to delete a patient record (e.g 6 5)\n");
    }
    if role == Role::Patient {
        options.push_str("Enter 3: to read your patient record\n");
    }
    options.push_str("Enter 'quit' to log off\n");
    options
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    ViewedAssociatedPatients,
    ViewedDivisionPatients,
    ReadOwnRecord,
    AccessedRecords,
    CreatedRecord,
    DeletedRecord,
    WroteRecord,
    TriedToAccess,
    TriedToCreate,
    TriedToWrite,
    TriedToDelete,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewedAssociatedPatients => "viewed associated patient records",
            Self::ViewedDivisionPatients => "viewed division patient records",
            Self::ReadOwnRecord => "read patient record",
            Self::AccessedRecords => "accessed patient records",
            Self::CreatedRecord => "created patient record",
            Self::DeletedRecord => "deleted patient record",
            Self::WroteRecord => "wrote to patient record",
            Self::TriedToAccess => "tried to access patient records",
            Self::TriedToCreate => "tried to create patient record",
            Self::TriedToWrite => "tried to write to patient record",
            Self::TriedToDelete => "tried to delete patient record",
        }
    }

    /// Phrase recorded when `operation` is attempted but refused. List and quit
    /// operations are not audited.
    #[must_use]
    pub fn attempt(operation: Operation) -> Option<Self> {
        match operation {
            Operation::Read => Some(Self::TriedToAccess),
            Operation::Write => Some(Self::TriedToWrite),
            Operation::Create => Some(Self::TriedToCreate),
            Operation::Delete => Some(Self::TriedToDelete),
            Operation::ListOwnPatients | Operation::ListDivisionPatients | Operation::Quit => None,
        }
    }
}

impl Display for AuditAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Source of the current time for entry dates and audit timestamps.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    offset: UtcOffset,
    fixed: Option<OffsetDateTime>,
}

impl Clock {
    /// Wall clock shifted to `offset`. Capture the local offset before spawning
    /// threads; `time` refuses to query it from a multi-threaded process.
    #[must_use]
    pub fn system(offset: UtcOffset) -> Self {
        Self { offset, fixed: None }
    }

    #[must_use]
    pub fn fixed(at: OffsetDateTime) -> Self {
        Self { offset: at.offset(), fixed: Some(at) }
    }

    #[must_use]
    pub fn now(&self) -> OffsetDateTime {
        self.fixed.unwrap_or_else(|| OffsetDateTime::now_utc().to_offset(self.offset))
    }

    /// Current day as `yyyy-MM-dd`.
    ///
    /// # Errors
    /// Returns [`time::error::Format`] when the date cannot be rendered.
    pub fn today(&self) -> Result<String, time::error::Format> {
        format_date(self.now())
    }

    /// Current instant as `yyyy-MM-dd HH:mm:ss`.
    ///
    /// # Errors
    /// Returns [`time::error::Format`] when the instant cannot be rendered.
    pub fn timestamp(&self) -> Result<String, time::error::Format> {
        format_timestamp(self.now())
    }
}

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// # Errors
/// Returns [`time::error::Format`] when `at` cannot be rendered.
pub fn format_date(at: OffsetDateTime) -> Result<String, time::error::Format> {
    at.format(DATE_FORMAT)
}

/// # Errors
/// Returns [`time::error::Format`] when `at` cannot be rendered.
pub fn format_timestamp(at: OffsetDateTime) -> Result<String, time::error::Format> {
    at.format(TIMESTAMP_FORMAT)
}
