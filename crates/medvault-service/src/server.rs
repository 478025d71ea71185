use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::Instrument;
use ulid::Ulid;

use crate::session::{serve_connection, ServerState};
use crate::tls::peer_serial;

/// Accept connections until `shutdown` resolves. Each connection gets its own
/// task; a failed handshake or session never stops the listener.
///
/// On shutdown the open sessions are told to stop and awaited for up to
/// `drain_timeout`, then aborted. Every session has ended when this returns.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
    handshake_timeout: Duration,
    drain_timeout: Duration,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);
    tracing::info!(addr = ?listener.local_addr().ok(), "server has started");

    let mut sessions = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => spawn_connection(
                    &mut sessions,
                    tcp,
                    peer,
                    acceptor.clone(),
                    state.clone(),
                    handshake_timeout,
                ),
                Err(err) => tracing::error!(error = %err, "error accepting client connection"),
            },
            Some(joined) = sessions.join_next(), if !sessions.is_empty() => report_task(joined),
            () = &mut shutdown => {
                tracing::info!("shutdown requested, no longer accepting connections");
                break;
            }
        }
    }
    drop(listener);
    drain(&mut sessions, &state, drain_timeout).await;
}

async fn drain(sessions: &mut JoinSet<()>, state: &ServerState, limit: Duration) {
    state.begin_shutdown();
    if sessions.is_empty() {
        return;
    }
    tracing::info!(sessions = sessions.len(), "waiting for open sessions to end");
    let drained = timeout(limit, async {
        while let Some(joined) = sessions.join_next().await {
            report_task(joined);
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!(remaining = sessions.len(), timeout = ?limit, "aborting sessions still open");
        sessions.shutdown().await;
    }
}

fn report_task(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            tracing::error!(error = %err, "session task panicked");
        }
    }
}

fn spawn_connection(
    sessions: &mut JoinSet<()>,
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    state: Arc<ServerState>,
    handshake_timeout: Duration,
) {
    let connection = state.connections.open();
    let span = tracing::info_span!("session", session = %Ulid::new(), %peer);

    sessions.spawn(
        async move {
            let tls = match timeout(handshake_timeout, acceptor.accept(tcp)).await {
                Ok(Ok(tls)) => tls,
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "TLS handshake failed");
                    return;
                }
                Err(_) => {
                    tracing::warn!(timeout = ?handshake_timeout, "TLS handshake timed out");
                    return;
                }
            };

            let serial = tls
                .get_ref()
                .1
                .peer_certificates()
                .and_then(<[_]>::first)
                .and_then(|cert| match peer_serial(cert) {
                    Ok(serial) => Some(serial),
                    Err(err) => {
                        tracing::warn!(error = %err, "ignoring unreadable peer certificate");
                        None
                    }
                });

            // the outcome is logged by serve_connection
            let _ = serve_connection(state, tls, serial, connection).await;
        }
        .instrument(span),
    );
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::{anyhow, Result};
    use medvault_api::MemoryAuditLog;
    use medvault_core::{menu, Clock, Directory, Role};
    use medvault_store::{RecordStore, SharedRecordStore};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use time::OffsetDateTime;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::TlsConnector;

    use super::*;
    use crate::tls::build_acceptor;
    use crate::tls::test_pki::TestPki;

    const DIRECTORY: &str = "\
c:Cardio
---
300:Nurse:c:N1:Nils Nurse
301:Patient:c:P1:Pia Patient:D1
302:Doctor:c:D1:Dana Doctor
";

    struct Running {
        state: Arc<ServerState>,
        addr: SocketAddr,
        pki: TestPki,
        stop: oneshot::Sender<()>,
        server: JoinHandle<()>,
        dir: tempfile::TempDir,
    }

    impl Running {
        async fn start() -> Result<Self> {
            let dir = tempfile::tempdir()?;
            let pki = TestPki::create(dir.path())?;
            let acceptor =
                build_acceptor(&pki.ca_path, &pki.server_cert_path, &pki.server_key_path)?;

            let directory = Arc::new(Directory::parse(DIRECTORY));
            let store = SharedRecordStore::new(
                RecordStore::new(directory.clone()),
                dir.path().join("records"),
            );
            let state = Arc::new(ServerState::new(
                directory,
                store,
                Arc::new(MemoryAuditLog::new()),
                Clock::fixed(OffsetDateTime::UNIX_EPOCH),
                None,
            ));

            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let addr = listener.local_addr()?;
            let (stop, stopped) = oneshot::channel::<()>();
            let server = tokio::spawn(serve(
                listener,
                acceptor,
                state.clone(),
                Duration::from_secs(5),
                Duration::from_secs(5),
                async move {
                    let _ = stopped.await;
                },
            ));
            Ok(Self { state, addr, pki, stop, server, dir })
        }

        async fn connect(&self, serial: &[u8]) -> Result<TlsClient> {
            let (client_cert, client_key) = self.pki.client(serial)?;
            let mut roots = RootCertStore::empty();
            roots.add(self.pki.ca_cert.der().clone())?;
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_client_auth_cert(
                    vec![client_cert.der().clone()],
                    PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(client_key.serialize_der())),
                )?;
            let tcp = TcpStream::connect(self.addr).await?;
            let tls = TlsConnector::from(Arc::new(config))
                .connect(ServerName::try_from("localhost")?, tcp)
                .await?;
            let (reader, writer) = tokio::io::split(tls);
            Ok(TlsClient { reader: BufReader::new(reader), writer })
        }

        async fn shut_down(self) -> Result<(Arc<ServerState>, tempfile::TempDir)> {
            let _ = self.stop.send(());
            self.server.await?;
            Ok((self.state, self.dir))
        }
    }

    struct TlsClient {
        reader: BufReader<ReadHalf<TlsStream<TcpStream>>>,
        writer: WriteHalf<TlsStream<TcpStream>>,
    }

    impl TlsClient {
        async fn request(&mut self, line: &str) -> Result<String> {
            self.writer.write_all(format!("{line}\n").as_bytes()).await?;
            let mut reply = String::new();
            loop {
                let mut line = String::new();
                if self.reader.read_line(&mut line).await? == 0 {
                    return Err(anyhow!("server closed the connection early"));
                }
                if line == "ENDOFMSG\n" {
                    return Ok(reply);
                }
                reply.push_str(&line);
            }
        }

        /// True once the server has closed the stream; an abrupt close also counts.
        async fn closed(&mut self) -> bool {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap_or(0) == 0
        }
    }

    #[tokio::test]
    async fn tls_client_is_identified_by_certificate_serial() -> Result<()> {
        let running = Running::start().await?;

        // 0x012c == 300, the nurse's serial
        let mut nurse = running.connect(&[0x01, 0x2c]).await?;
        assert_eq!(nurse.request("1").await?, format!("Name : ID\n\n{}\n", menu(Role::Nurse)));

        nurse.writer.write_all(b"quit\n").await?;
        assert!(nurse.closed().await);

        running.shut_down().await?;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_waits_for_open_sessions_and_their_writes() -> Result<()> {
        let running = Running::start().await?;

        // 0x012e == 302, the doctor's serial
        let mut doctor = running.connect(&[0x01, 0x2e]).await?;
        assert!(doctor
            .request("5 P1 N1")
            .await?
            .starts_with("Record for patient was successfully created\n"));
        assert_eq!(doctor.request("4 P1").await?, "Write information\n");
        assert!(doctor
            .request("admitted")
            .await?
            .starts_with("Record was successfully written\n"));
        assert_eq!(running.state.connections.active(), 1);

        let (state, dir) = running.shut_down().await?;
        assert_eq!(state.connections.active(), 0);
        assert!(doctor.closed().await);
        assert_eq!(
            fs::read_to_string(dir.path().join("records"))?,
            "P1\nDoctor=D1,Nurse=N1\n1970-01-01:admitted\n---\n"
        );
        Ok(())
    }
}
