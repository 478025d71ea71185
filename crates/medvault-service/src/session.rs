use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use medvault_api::{AccessController, AuditSink, Reply};
use medvault_core::{Clock, Directory, SerialNumber};
use medvault_store::SharedRecordStore;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::sync::watch;

/// Longest request line accepted, not counting the line terminator.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer presented no certificate")]
    MissingPeerCertificate,
    #[error("no identity registered for certificate serial {serial}")]
    UnknownIdentity { serial: String },
    #[error("request line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Empty line, `quit`, or a command that logged the client off.
    LoggedOff,
    /// The client closed the connection.
    Disconnected,
    /// No input arrived within the idle timeout.
    IdleTimeout,
    /// The server is shutting down.
    Shutdown,
}

/// Shared count of live connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCounter(Arc<AtomicUsize>);

impl ConnectionCounter {
    #[must_use]
    pub fn open(&self) -> ActiveConnection {
        let active = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(active, "client connected");
        ActiveConnection { counter: self.0.clone() }
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Held for the life of one connection; dropping it decrements the counter.
#[derive(Debug)]
pub struct ActiveConnection {
    counter: Arc<AtomicUsize>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        let active = self.counter.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        tracing::info!(active, "client disconnected");
    }
}

/// State shared by every session of the process.
pub struct ServerState {
    pub directory: Arc<Directory>,
    pub store: SharedRecordStore,
    pub audit: Arc<dyn AuditSink>,
    pub clock: Clock,
    pub idle_timeout: Option<Duration>,
    pub connections: ConnectionCounter,
    shutdown: watch::Sender<bool>,
}

impl ServerState {
    #[must_use]
    pub fn new(
        directory: Arc<Directory>,
        store: SharedRecordStore,
        audit: Arc<dyn AuditSink>,
        clock: Clock,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            directory,
            store,
            audit,
            clock,
            idle_timeout,
            connections: ConnectionCounter::default(),
            shutdown: watch::channel(false).0,
        }
    }

    /// Ask every session to end at its next wait for input. A command already
    /// being handled completes first.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Rewrite the record file from the current index on the blocking pool.
    /// Failures are logged; the caller keeps running.
    pub async fn checkpoint(&self) {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.persist()).await {
            Ok(Ok(report)) => tracing::info!(
                path = %self.store.path().display(),
                patients = report.patients,
                rows = report.rows,
                bytes = report.bytes,
                digest = %report.digest,
                "record store persisted"
            ),
            Ok(Err(err)) => tracing::error!(
                path = %self.store.path().display(),
                error = %format_args!("{err:#}"),
                "failed to persist record store"
            ),
            Err(err) => tracing::error!(error = %err, "record store persistence task failed"),
        }
    }
}

/// Run one client session to completion, then release the connection slot and
/// persist the record store, whatever the outcome.
///
/// # Errors
/// Returns [`SessionError`] when the peer cannot be identified or the connection
/// fails mid-session.
pub async fn serve_connection<S>(
    state: Arc<ServerState>,
    stream: S,
    peer_serial: Option<SerialNumber>,
    connection: ActiveConnection,
) -> Result<SessionEnd, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = run_session(&state, stream, peer_serial).await;
    match &outcome {
        Ok(end) => tracing::info!(?end, "session ended"),
        Err(err @ (SessionError::UnknownIdentity { .. } | SessionError::MissingPeerCertificate)) => {
            tracing::warn!(error = %err, "rejected client");
        }
        Err(err) => tracing::warn!(error = %err, "client connection error"),
    }
    drop(connection);
    state.checkpoint().await;
    outcome
}

async fn run_session<S>(
    state: &ServerState,
    stream: S,
    peer_serial: Option<SerialNumber>,
) -> Result<SessionEnd, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let serial = peer_serial.ok_or(SessionError::MissingPeerCertificate)?;
    let identity = state
        .directory
        .resolve(&serial)
        .cloned()
        .ok_or_else(|| SessionError::UnknownIdentity { serial: serial.to_string() })?;
    tracing::info!(id = %identity.id, role = %identity.role(), serial = %serial, "client identified");

    let mut controller = AccessController::new(
        identity,
        state.directory.clone(),
        state.store.clone(),
        state.audit.clone(),
        state.clock,
    );

    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);
    let mut shutdown = state.shutdown.subscribe();
    loop {
        let next = tokio::select! {
            next = read_line(&mut reader) => next?,
            () = idle(state.idle_timeout) => return Ok(SessionEnd::IdleTimeout),
            () = shutdown_requested(&mut shutdown) => return Ok(SessionEnd::Shutdown),
        };
        let Some(line) = next else {
            return Ok(SessionEnd::Disconnected);
        };

        if !controller.awaiting_write_body()
            && (line.is_empty() || line.eq_ignore_ascii_case("quit"))
        {
            return Ok(SessionEnd::LoggedOff);
        }

        let reply = controller.handle(&line);
        writer.write_all(reply.frame().as_bytes()).await?;
        writer.flush().await?;
        if reply == Reply::Closed {
            return Ok(SessionEnd::LoggedOff);
        }
    }
}

/// Next line without its `\n` or `\r\n` terminator, or `None` at end of stream.
/// At most [`MAX_LINE_BYTES`] plus the terminator are buffered.
async fn read_line<R>(reader: &mut R) -> Result<Option<String>, SessionError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = (&mut *reader).take(MAX_LINE_BYTES as u64 + 2).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > MAX_LINE_BYTES {
        return Err(SessionError::LineTooLong { limit: MAX_LINE_BYTES });
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err).into())
}

async fn idle(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use medvault_api::MemoryAuditLog;
    use medvault_core::{menu, Role};
    use medvault_store::RecordStore;
    use time::{Duration as TimeDuration, OffsetDateTime};
    use std::io::ErrorKind;

    use tokio::io::{AsyncBufReadExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::task::JoinHandle;

    use super::*;

    const DIRECTORY: &str = "\
c:Cardio
o:Oncology
---
100:Doctor:c:D1:Dana Doctor
101:Nurse:c:N1:Nils Nurse
102:Patient:c:P1:Pia Patient:D1
103:Doctor:c:D3:Dag Doctor
104:Patient:c:P3:Pelle Patient:D1
105:GovernmentAgency::G1:Health Agency
";

    struct Harness {
        state: Arc<ServerState>,
        audit: MemoryAuditLog,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(idle_timeout: Option<Duration>) -> Result<Self> {
            let dir = tempfile::tempdir()?;
            let directory = Arc::new(Directory::parse(DIRECTORY));
            let store =
                SharedRecordStore::new(RecordStore::new(directory.clone()), dir.path().join("records"));
            let audit = MemoryAuditLog::new();
            let clock =
                Clock::fixed(OffsetDateTime::UNIX_EPOCH + TimeDuration::seconds(1_700_000_000));
            let state = Arc::new(ServerState::new(
                directory,
                store,
                Arc::new(audit.clone()),
                clock,
                idle_timeout,
            ));
            Ok(Self { state, audit, dir })
        }

        fn connect(&self, serial: &str) -> Client {
            self.open(SerialNumber::parse(serial))
        }

        fn open(&self, serial: Option<SerialNumber>) -> Client {
            let (client, server) = tokio::io::duplex(16 * 1024);
            let state = self.state.clone();
            let connection = state.connections.open();
            let task =
                tokio::spawn(async move { serve_connection(state, server, serial, connection).await });
            let (reader, writer) = tokio::io::split(client);
            Client { reader: BufReader::new(reader), writer, task }
        }

        fn records(&self) -> Result<String> {
            Ok(fs::read_to_string(self.dir.path().join("records"))?)
        }
    }

    struct Client {
        reader: BufReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
        task: JoinHandle<Result<SessionEnd, SessionError>>,
    }

    impl Client {
        async fn send(&mut self, line: &str) -> Result<()> {
            self.writer.write_all(format!("{line}\n").as_bytes()).await?;
            Ok(())
        }

        /// Text of the next reply, without its end-of-message line.
        async fn reply(&mut self) -> Result<String> {
            let mut reply = String::new();
            loop {
                let mut line = String::new();
                let read = self.reader.read_line(&mut line).await?;
                assert!(read > 0, "connection closed before end of message; got {reply:?}");
                if line == "ENDOFMSG\n" {
                    return Ok(reply);
                }
                reply.push_str(&line);
            }
        }

        async fn request(&mut self, line: &str) -> Result<String> {
            self.send(line).await?;
            self.reply().await
        }

        async fn at_eof(&mut self) -> Result<bool> {
            let mut line = String::new();
            Ok(self.reader.read_line(&mut line).await? == 0)
        }

        async fn finish(self) -> Result<Result<SessionEnd, SessionError>> {
            drop(self.writer);
            drop(self.reader);
            Ok(self.task.await?)
        }
    }

    #[tokio::test]
    async fn doctor_creates_record_and_store_is_persisted_on_quit() -> Result<()> {
        let harness = Harness::new(None)?;
        let mut doctor = harness.connect("100");

        assert_eq!(
            doctor.request("5 P1 N1").await?,
            format!("Record for patient was successfully created\n\n{}\n", menu(Role::Doctor))
        );
        assert_eq!(
            doctor.request("5 P1 N1").await?,
            format!("Unable to create record for patient\n\n{}\n", menu(Role::Doctor))
        );
        doctor.send("quit").await?;
        assert!(doctor.at_eof().await?);

        assert_eq!(doctor.finish().await?.ok(), Some(SessionEnd::LoggedOff));
        assert_eq!(harness.state.connections.active(), 0);
        assert_eq!(harness.records()?, "P1\nDoctor=D1,Nurse=N1\n---\n");
        Ok(())
    }

    #[tokio::test]
    async fn write_body_is_read_raw_even_when_empty() -> Result<()> {
        let harness = Harness::new(None)?;
        let mut doctor = harness.connect("100");
        doctor.request("5 P1 N1").await?;

        assert_eq!(doctor.request("4 P1").await?, "Write information\n");
        assert_eq!(
            doctor.request("").await?,
            format!("Record was successfully written\n\n{}\n", menu(Role::Doctor))
        );
        assert_eq!(doctor.request("4 P1").await?, "Write information\n");
        doctor.request("QUIT").await?;

        // an empty line outside a write ends the session
        doctor.send("").await?;
        assert!(doctor.at_eof().await?);
        assert_eq!(doctor.finish().await?.ok(), Some(SessionEnd::LoggedOff));

        assert_eq!(
            harness.records()?,
            "P1\nDoctor=D1,Nurse=N1\n2023-11-14:\n2023-11-14:QUIT\n---\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn quit_is_case_insensitive() -> Result<()> {
        let harness = Harness::new(None)?;
        let mut patient = harness.connect("102");
        assert_eq!(
            patient.request("3").await?,
            format!("You don't have any record\n\n{}\n", menu(Role::Patient))
        );
        patient.send("QuIt").await?;
        assert!(patient.at_eof().await?);
        assert_eq!(patient.finish().await?.ok(), Some(SessionEnd::LoggedOff));
        Ok(())
    }

    #[tokio::test]
    async fn quit_with_arguments_logs_off_with_reply() -> Result<()> {
        let harness = Harness::new(None)?;
        let mut agency = harness.connect("105");
        assert_eq!(agency.request("quit now").await?, "Logged off\n\n");
        assert!(agency.at_eof().await?);
        assert_eq!(agency.finish().await?.ok(), Some(SessionEnd::LoggedOff));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_identity_is_closed_without_reply() -> Result<()> {
        let harness = Harness::new(None)?;
        let mut stranger = harness.connect("999");

        assert!(stranger.at_eof().await?);
        let outcome = stranger.finish().await?;
        assert!(matches!(outcome, Err(SessionError::UnknownIdentity { ref serial }) if serial == "999"));
        assert_eq!(harness.state.connections.active(), 0);
        assert!(harness.audit.lines().is_empty());
        assert_eq!(harness.records()?, "");
        Ok(())
    }

    #[tokio::test]
    async fn missing_certificate_is_rejected() -> Result<()> {
        let harness = Harness::new(None)?;
        let mut anonymous = harness.open(None);
        assert!(anonymous.at_eof().await?);
        assert!(matches!(anonymous.finish().await?, Err(SessionError::MissingPeerCertificate)));
        Ok(())
    }

    #[tokio::test]
    async fn client_disconnect_still_persists() -> Result<()> {
        let harness = Harness::new(None)?;
        let mut doctor = harness.connect("100");
        doctor.request("5 P3 N1").await?;

        assert_eq!(doctor.finish().await?.ok(), Some(SessionEnd::Disconnected));
        assert_eq!(harness.records()?, "P3\nDoctor=D1,Nurse=N1\n---\n");
        Ok(())
    }

    #[tokio::test]
    async fn idle_session_times_out() -> Result<()> {
        let harness = Harness::new(Some(Duration::from_millis(50)))?;
        let mut nurse = harness.connect("101");
        assert!(nurse.request("1").await?.starts_with("Name : ID\n"));

        assert!(nurse.at_eof().await?);
        assert_eq!(nurse.finish().await?.ok(), Some(SessionEnd::IdleTimeout));
        assert_eq!(harness.state.connections.active(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_sessions_keep_every_mutation() -> Result<()> {
        let harness = Harness::new(None)?;
        let mut first = harness.connect("100");
        let mut second = harness.connect("103");
        assert_eq!(harness.state.connections.active(), 2);

        let (a, b) = tokio::join!(first.request("5 P1 N1"), second.request("5 P1 N1"));
        assert!(a?.starts_with("Record for patient was successfully created\n"));
        assert!(b?.starts_with("Record for patient was successfully created\n"));

        let (a, b) = tokio::join!(first.finish(), second.finish());
        assert!(a?.is_ok());
        assert!(b?.is_ok());

        let records = harness.records()?;
        assert!(records.starts_with("P1\n"));
        assert!(records.contains("Doctor=D1,Nurse=N1\n"));
        assert!(records.contains("Doctor=D3,Nurse=N1\n"));
        assert_eq!(harness.state.store.lock().get("P1").map(<[_]>::len), Some(2));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_request_line_ends_session() -> Result<()> {
        let harness = Harness::new(None)?;
        let mut nurse = harness.connect("101");

        let line = format!("3 {}", "x".repeat(MAX_LINE_BYTES));
        // the server may hang up before the tail of the line is written
        if let Err(err) = nurse.send(&line).await {
            let kind = err.downcast_ref::<std::io::Error>().map(std::io::Error::kind);
            assert_eq!(kind, Some(ErrorKind::BrokenPipe));
        }

        assert!(nurse.at_eof().await?);
        let outcome = nurse.finish().await?;
        assert!(matches!(outcome, Err(SessionError::LineTooLong { limit: MAX_LINE_BYTES })));
        assert!(harness.audit.lines().is_empty());
        assert_eq!(harness.state.connections.active(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn write_body_at_line_limit_is_accepted() -> Result<()> {
        let harness = Harness::new(None)?;
        let mut doctor = harness.connect("100");
        doctor.request("5 P1 N1").await?;
        assert_eq!(doctor.request("4 P1").await?, "Write information\n");

        let body = "y".repeat(MAX_LINE_BYTES);
        doctor.send(&format!("{body}\r")).await?;
        assert!(doctor.reply().await?.starts_with("Record was successfully written\n"));
        assert_eq!(doctor.finish().await?.ok(), Some(SessionEnd::Disconnected));
        assert!(harness.records()?.contains(&format!("2023-11-14:{body}\n")));
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_ends_waiting_sessions_and_persists() -> Result<()> {
        let harness = Harness::new(None)?;
        let mut doctor = harness.connect("100");
        doctor.request("5 P1 N1").await?;
        assert_eq!(doctor.request("4 P1").await?, "Write information\n");

        harness.state.begin_shutdown();
        assert!(doctor.at_eof().await?);
        assert_eq!(doctor.finish().await?.ok(), Some(SessionEnd::Shutdown));
        assert_eq!(harness.records()?, "P1\nDoctor=D1,Nurse=N1\n---\n");

        // sessions opened after the request end at once
        let mut late = harness.connect("101");
        assert!(late.at_eof().await?);
        assert_eq!(late.finish().await?.ok(), Some(SessionEnd::Shutdown));
        Ok(())
    }
}
