use std::sync::Arc;

use medvault_core::{
    grant, menu, AuditAction, Clock, Command, Directory, Identity, Operation, PersonId,
    RecordEntry, Scope, END_OF_MESSAGE, WRITE_PROMPT,
};
use medvault_store::SharedRecordStore;

mod audit;

pub use audit::{AuditEntry, AuditSink, FileAuditLog, MemoryAuditLog};

const NO_ASSOCIATED_RECORD: &str = "Patient has no record associated with you\n";
const NO_RECORDS: &str = "Patient doesn't have any records\n";
const NO_OWN_RECORDS: &str = "You don't have any record\n";
const LOGGED_OFF: &str = "Logged off\n";
const WRITE_FAILED: &str = "Unable to write record\n";

/// Answer to one client line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Message(String),
    /// First phase of a write: the next raw line is the entry body.
    AwaitWriteBody,
    /// The session should end after this reply.
    Closed,
}

impl Reply {
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::Message(text) => text,
            Self::AwaitWriteBody => WRITE_PROMPT,
            Self::Closed => LOGGED_OFF,
        }
    }

    /// Reply text as sent on the wire: the text, a line break, then the
    /// end-of-message line.
    #[must_use]
    pub fn frame(&self) -> String {
        format!("{}\n{END_OF_MESSAGE}\n", self.text())
    }
}

/// Per-session command dispatcher for one authenticated identity.
///
/// Every operation is looked up in the role grant table first; anything not granted,
/// or missing its arguments, is answered with the role's menu. Read, write, create
/// and delete attempts are audited whether or not they succeed.
pub struct AccessController {
    identity: Identity,
    directory: Arc<Directory>,
    store: SharedRecordStore,
    audit: Arc<dyn AuditSink>,
    clock: Clock,
    pending_write: Option<PersonId>,
}

impl AccessController {
    #[must_use]
    pub fn new(
        identity: Identity,
        directory: Arc<Directory>,
        store: SharedRecordStore,
        audit: Arc<dyn AuditSink>,
        clock: Clock,
    ) -> Self {
        Self { identity, directory, store, audit, clock, pending_write: None }
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// True between the two phases of a write.
    #[must_use]
    pub fn awaiting_write_body(&self) -> bool {
        self.pending_write.is_some()
    }

    /// Handle one raw client line. While a write is pending the line is taken
    /// verbatim as the entry body.
    pub fn handle(&mut self, line: &str) -> Reply {
        if let Some(patient_id) = self.pending_write.take() {
            return self.complete_write(&patient_id, line);
        }

        let command = Command::parse(line);
        let Some(operation) = command.operation() else {
            return self.menu_reply();
        };
        let Some(scope) = grant(self.identity.role(), operation) else {
            return self.deny(operation, &command);
        };

        match (operation, scope) {
            (Operation::Quit, _) => Reply::Closed,
            (Operation::ListOwnPatients, _) => self.list_own_patients(),
            (Operation::ListDivisionPatients, _) => self.list_division_patients(),
            (Operation::Read, Scope::OwnRecords) => self.read_own_records(),
            (Operation::Read, scope) => match command.arg(0) {
                Some(patient_id) => self.read_patient(patient_id, scope),
                None => self.deny(operation, &command),
            },
            (Operation::Write, _) => match command.arg(0) {
                Some(patient_id) => self.begin_write(patient_id),
                None => self.deny(operation, &command),
            },
            (Operation::Create, _) => match (command.arg(0), command.arg(1)) {
                (Some(patient_id), Some(nurse_id)) => self.create_record(patient_id, nurse_id),
                _ => self.deny(operation, &command),
            },
            (Operation::Delete, _) => match command.arg(0) {
                Some(patient_id) => self.delete_record(patient_id),
                None => self.deny(operation, &command),
            },
        }
    }

    fn list_own_patients(&self) -> Reply {
        let mut out = String::from("Name : ID\n");
        {
            let store = self.store.lock();
            for patient in store.patients_for(self.identity.id.as_str()) {
                out.push_str(&format!("{patient}\n"));
            }
        }
        self.record(AuditAction::ViewedAssociatedPatients, self.identity.id.as_str());
        self.with_menu(out)
    }

    fn list_division_patients(&self) -> Reply {
        let mut out = String::from("Name:ID\n");
        let division =
            self.identity.division().and_then(|id| self.directory.resolve_division(id.as_str()));
        let Some(division) = division else {
            return self.menu_reply();
        };
        for member in division.members() {
            if let Some(patient) = self.directory.resolve_by_id(member.as_str()) {
                out.push_str(&format!("{patient}\n"));
            }
        }
        self.record(AuditAction::ViewedDivisionPatients, division.name());
        self.with_menu(out)
    }

    fn read_own_records(&self) -> Reply {
        let mut out = String::new();
        {
            let store = self.store.lock();
            match store.get(self.identity.id.as_str()) {
                Some(rows) if !rows.is_empty() => {
                    for row in rows {
                        out.push_str(&format!("{row}\n"));
                    }
                }
                _ => out.push_str(NO_OWN_RECORDS),
            }
        }
        self.record(AuditAction::ReadOwnRecord, self.identity.id.as_str());
        self.with_menu(out)
    }

    fn read_patient(&self, patient_id: &str, scope: Scope) -> Reply {
        let mut out = String::new();
        let action = {
            let store = self.store.lock();
            match store.get(patient_id) {
                Some(rows) if !rows.is_empty() => {
                    if scope == Scope::Unrestricted {
                        for row in rows {
                            out.push_str(&format!("{row}\n"));
                        }
                        AuditAction::AccessedRecords
                    } else if let Some(row) = store.find(patient_id, self.identity.id.as_str()) {
                        out.push_str(&format!("{row}\n"));
                        AuditAction::AccessedRecords
                    } else {
                        out.push_str(NO_ASSOCIATED_RECORD);
                        AuditAction::TriedToAccess
                    }
                }
                _ => {
                    out.push_str(NO_RECORDS);
                    AuditAction::AccessedRecords
                }
            }
        };
        self.record(action, patient_id);
        self.with_menu(out)
    }

    fn begin_write(&mut self, patient_id: &str) -> Reply {
        let holds_row = self.store.lock().find(patient_id, self.identity.id.as_str()).is_some();
        if !holds_row {
            self.record(AuditAction::TriedToWrite, patient_id);
            return self.with_menu(NO_ASSOCIATED_RECORD.to_string());
        }
        self.pending_write = Some(PersonId::new(patient_id));
        Reply::AwaitWriteBody
    }

    fn complete_write(&self, patient_id: &PersonId, body: &str) -> Reply {
        let today = match self.clock.today() {
            Ok(today) => today,
            Err(err) => {
                tracing::error!(error = %err, patient = %patient_id, "cannot date record entry");
                self.record(AuditAction::TriedToWrite, patient_id.as_str());
                return self.with_menu(WRITE_FAILED.to_string());
            }
        };
        let entry = RecordEntry::new(today, body);
        let written =
            self.store.lock().append(patient_id.as_str(), self.identity.id.as_str(), entry);
        if written {
            self.record(AuditAction::WroteRecord, patient_id.as_str());
            self.with_menu("Record was successfully written\n".to_string())
        } else {
            tracing::warn!(patient = %patient_id, "record row vanished before the write body arrived");
            self.record(AuditAction::TriedToWrite, patient_id.as_str());
            self.with_menu(NO_ASSOCIATED_RECORD.to_string())
        }
    }

    fn create_record(&self, patient_id: &str, nurse_id: &str) -> Reply {
        let created = self.store.lock().create(patient_id, &self.identity, nurse_id);
        if created {
            self.record(AuditAction::CreatedRecord, patient_id);
            self.with_menu("Record for patient was successfully created\n".to_string())
        } else {
            self.record(AuditAction::TriedToCreate, patient_id);
            self.with_menu("Unable to create record for patient\n".to_string())
        }
    }

    fn delete_record(&self, patient_id: &str) -> Reply {
        let removed = self.store.lock().delete(patient_id);
        tracing::debug!(patient = patient_id, rows = removed, "deleted patient rows");
        self.record(AuditAction::DeletedRecord, patient_id);
        self.with_menu("Patient record was deleted\n".to_string())
    }

    fn deny(&self, operation: Operation, command: &Command) -> Reply {
        if let Some(action) = AuditAction::attempt(operation) {
            self.record(action, command.arg(0).unwrap_or("-"));
        }
        tracing::debug!(
            actor = %self.identity.id,
            role = %self.identity.role(),
            operation = operation.token(),
            "operation refused"
        );
        self.menu_reply()
    }

    fn record(&self, action: AuditAction, subject: &str) {
        let timestamp = self.clock.timestamp().unwrap_or_else(|err| {
            tracing::error!(error = %err, "cannot format audit timestamp");
            self.clock.now().to_string()
        });
        self.audit.record(AuditEntry::new(
            timestamp,
            self.identity.id.as_str(),
            action,
            subject,
        ));
    }

    fn menu_reply(&self) -> Reply {
        Reply::Message(menu(self.identity.role()))
    }

    fn with_menu(&self, mut text: String) -> Reply {
        text.push('\n');
        text.push_str(&menu(self.identity.role()));
        Reply::Message(text)
    }
}
