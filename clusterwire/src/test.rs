use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use socket2::Socket;
use static_assertions::assert_impl_all;

use crate::protocol::{encode_frame, tag};
use crate::security::{HandshakeStatus, PlainChannel, SecureChannel};
use crate::*;

assert_impl_all!(Connection: Send);
assert_impl_all!(AgentClient: Send);
assert_impl_all!(ConnectionParameters: Send, Sync, Clone);

/// Records what it is asked to do; refuses to uninstall.
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<CommandRequest>>>,
}

impl AgentHandler for Recorder {
    fn handle(&self, request: &CommandRequest) -> std::result::Result<String, String> {
        self.seen.lock().unwrap().push(request.clone());
        match request.action {
            Action::Uninstall => Err(format!("{} is still in use", request.component)),
            _ => Ok(format!("{} ok", request)),
        }
    }
}

struct Agent {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<Result<()>>>,
}

impl Agent {
    fn start<H: AgentHandler + Send + Sync + 'static>(
        handler: H,
        address: &str,
        password: Option<&str>,
    ) -> (Agent, String) {
        let listener = Listener::new(address).unwrap();
        let bound = listener.local_address().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let config = ListenConfig {
            stop_listening: Some(stop.clone()),
            password: password.map(str::to_string),
            ..Default::default()
        };
        let thread = thread::spawn(move || serve(handler, listener, &config));
        (
            Agent {
                stop,
                thread: Some(thread),
            },
            bound,
        )
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap().unwrap();
        }
    }
}

fn tcp_port(bound: &str) -> u16 {
    bound.rsplit(':').next().unwrap().parse().unwrap()
}

fn no_passfile(conninfo: &str) -> String {
    format!("{} passfile=/nonexistent/clusterpass", conninfo)
}

#[test]
fn commands_over_local_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = address::local_socket_path(dir.path().to_str().unwrap(), 7272);
    let recorder = Recorder::default();
    let (_agent, _) = Agent::start(
        recorder.clone(),
        &format!("unix:{}", socket.display()),
        None,
    );

    let mut client = AgentClient::connect_str(&no_passfile(&format!(
        "host={} port=7272 user=ops application_name=tests",
        dir.path().display()
    )))
    .unwrap();
    assert_eq!(
        client.connection().host().map(|h| h.kind),
        Some(HostKind::LocalSocket)
    );

    assert_eq!(
        client
            .execute(&CommandRequest::new(Component::Hadoop, Action::Status))
            .unwrap(),
        "status hadoop ok"
    );
    assert_eq!(
        client
            .execute(&CommandRequest::install(Component::Spark, Some("3.5.1")))
            .unwrap(),
        "install spark 3.5.1 ok"
    );
    client
        .execute(&CommandRequest::configure(
            Component::Kafka,
            "log.retention.hours",
            "72",
        ))
        .unwrap();

    let e = client
        .execute(&CommandRequest::new(Component::Hive, Action::Uninstall))
        .unwrap_err();
    assert_eq!(
        e.kind(),
        &ErrorKind::Remote("hive is still in use".to_string())
    );

    // the session survives a refused command
    client
        .execute(&CommandRequest::new(Component::Hive, Action::Stop))
        .unwrap();
    client.close();

    let seen = recorder.seen.lock().unwrap();
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[1].version.as_deref(), Some("3.5.1"));
    assert_eq!(seen[2].name.as_deref(), Some("log.retention.hours"));
    assert_eq!(seen[2].value.as_deref(), Some("72"));
}

#[test]
fn falls_back_to_working_host() {
    let (_agent, bound) = Agent::start(DryRunHandler, "tcp:127.0.0.1:0", None);
    let refused = {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let conninfo = format!(
        "clusterwire://ops@127.0.0.1:{},127.0.0.1:{}/main",
        refused,
        tcp_port(&bound)
    );
    let mut params = ConnectionParameters::parse(&conninfo).unwrap();
    params.set("passfile", "/nonexistent/clusterpass").unwrap();

    let mut client = AgentClient::connect(&params).unwrap();
    let errors = client.connection().error_message();
    assert_eq!(errors.lines().count(), 1, "{}", errors);
    assert!(errors.contains(&format!("port {} failed", refused)));
    assert_eq!(
        client.connection().host().map(|h| h.port.as_str()),
        Some(tcp_port(&bound).to_string().as_str())
    );

    let reply = client
        .execute(&CommandRequest::new(Component::Presto, Action::Restart))
        .unwrap();
    assert_eq!(reply, "restart presto: accepted (dry run)");
    client.close();
}

#[test]
fn password_authentication() {
    let (_agent, bound) = Agent::start(DryRunHandler, "tcp:127.0.0.1:0", Some("s3cret"));
    let base = no_passfile(&format!("host=127.0.0.1 port={} user=ops", tcp_port(&bound)));

    let mut client = AgentClient::connect_str(&format!("{} password=s3cret", base)).unwrap();
    client
        .execute(&CommandRequest::new(Component::Flink, Action::Start))
        .unwrap();
    client.close();

    let e = AgentClient::connect_str(&format!("{} password=wrong", base)).unwrap_err();
    assert_eq!(
        e.kind(),
        &ErrorKind::Authentication("password authentication failed for user \"ops\"".to_string())
    );

    let e = AgentClient::connect_str(&base).unwrap_err();
    assert!(matches!(e.kind(), ErrorKind::Authentication(_)), "{:?}", e);
}

#[test]
fn password_from_passfile() {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    let (_agent, bound) = Agent::start(DryRunHandler, "tcp:127.0.0.1:0", Some("from-file"));
    let mut passfile = tempfile::NamedTempFile::new().unwrap();
    writeln!(passfile, "127.0.0.1:{}:*:ops:from-file", tcp_port(&bound)).unwrap();
    std::fs::set_permissions(passfile.path(), std::fs::Permissions::from_mode(0o600)).unwrap();

    let client = AgentClient::connect_str(&format!(
        "host=127.0.0.1 port={} user=ops passfile={}",
        tcp_port(&bound),
        passfile.path().display()
    ))
    .unwrap();
    client.close();
}

#[test]
fn nothing_listening() {
    let dir = tempfile::tempdir().unwrap();
    let e = AgentClient::connect_str(&no_passfile(&format!(
        "host={},{} port=7373",
        dir.path().display(),
        Path::new("/nonexistent").display()
    )))
    .unwrap_err();
    match e.kind() {
        ErrorKind::ConnectionFailed(text) => {
            assert_eq!(text.lines().count(), 2, "{}", text);
            assert!(text.lines().all(|l| l.contains(".s.CLUSTER.7373")));
        }
        kind => panic!("unexpected {:?}", kind),
    }
}

#[test]
fn parse_errors_are_synchronous() {
    let mut conn = Connection::new();
    let params = ConnectionParameters::parse("host=a,b port=1,2,3").unwrap();
    assert!(matches!(
        conn.start(&params).unwrap_err().kind(),
        ErrorKind::InvalidConnectionString(_)
    ));
    assert_eq!(conn.status(), ConnectionStatus::NeedsConnect);
}

/// Plain channel whose writes fail once `broken` is set.
struct Breakable {
    broken: Arc<AtomicBool>,
}

impl SecureChannel for Breakable {
    fn name(&self) -> &'static str {
        "breakable"
    }

    fn poll_handshake(&mut self, _socket: &Socket) -> HandshakeStatus {
        HandshakeStatus::Complete
    }

    fn failure_reason(&self) -> Option<&str> {
        None
    }

    fn read(&mut self, socket: &Socket, buf: &mut [u8]) -> io::Result<usize> {
        PlainChannel.read(socket, buf)
    }

    fn write(&mut self, socket: &Socket, buf: &[u8]) -> io::Result<usize> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link severed"));
        }
        PlainChannel.write(socket, buf)
    }
}

/// Answer a startup message the way an agent without authentication does.
fn accept_startup<S: Read + Write>(stream: &mut S) {
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).unwrap();
    let mut startup = vec![0u8; i32::from_be_bytes(len) as usize - 4];
    stream.read_exact(&mut startup).unwrap();
    assert_eq!(&startup[..4], &protocol::PROTOCOL_VERSION.to_be_bytes());

    let mut out = Vec::new();
    encode_frame(&mut out, Some(tag::AUTHENTICATION), &protocol::AUTH_OK.to_be_bytes());
    encode_frame(&mut out, Some(tag::READY), b"");
    stream.write_all(&out).unwrap();
    stream.flush().unwrap();
}

/// Read one tagged frame.
fn read_frame<S: Read>(stream: &mut S) -> (u8, Vec<u8>) {
    let mut head = [0u8; 5];
    stream.read_exact(&mut head).unwrap();
    let len = i32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    let mut payload = vec![0u8; len - 4];
    stream.read_exact(&mut payload).unwrap();
    (head[0], payload)
}

#[test]
fn deferred_write_error_explains_peer_close() {
    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let broken = Arc::new(AtomicBool::new(false));
    let channel = Breakable {
        broken: broken.clone(),
    };
    let conn = Connection::from_transport(Socket::from(ours), Box::new(channel)).unwrap();

    let agent = thread::spawn(move || {
        accept_startup(&mut theirs);
        theirs
    });
    let mut client = AgentClient::from_connection(conn).unwrap();
    let theirs = agent.join().unwrap();

    // the command cannot go out, then the agent hangs up without a word
    broken.store(true, Ordering::SeqCst);
    drop(theirs);
    let request = CommandRequest::new(Component::Storm, Action::Start);
    let e = client.execute(&request).unwrap_err();
    assert_eq!(
        e.kind(),
        &ErrorKind::ConnectionFailed("could not send data to server: link severed".to_string())
    );
    assert!(client.connection().socket_fd().is_none());

    // with the socket gone the same reason is still what the caller sees
    let e = client.execute(&request).unwrap_err();
    assert_eq!(
        e.kind(),
        &ErrorKind::ConnectionFailed("could not send data to server: link severed".to_string())
    );
}

#[cfg(feature = "tls")]
mod tls {
    use super::*;

    #[test]
    fn handshake_through_connect_poll() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        let mut root = tempfile::NamedTempFile::new().unwrap();
        root.write_all(cert.pem().as_bytes()).unwrap();

        let config = Arc::new(
            rustls::ServerConfig::builder_with_provider(Arc::new(
                rustls::crypto::ring::default_provider(),
            ))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(
                vec![cert.der().clone()],
                rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der()).unwrap(),
            )
            .unwrap(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let agent = thread::spawn(move || {
            let (tcp, _) = listener.accept().unwrap();
            let session = rustls::ServerConnection::new(config).unwrap();
            let mut stream = rustls::StreamOwned::new(session, tcp);
            accept_startup(&mut stream);
            let (opcode, _) = read_frame(&mut stream);
            let mut out = Vec::new();
            encode_frame(&mut out, Some(tag::COMPLETE), b"secured\0");
            stream.write_all(&out).unwrap();
            stream.flush().unwrap();
            opcode
        });

        let mut conn = Connection::new();
        conn.start(
            &ConnectionParameters::parse(&no_passfile(&format!(
                "host=localhost hostaddr=127.0.0.1 port={} sslmode=verify-full sslrootcert={}",
                port,
                root.path().display()
            )))
            .unwrap(),
        )
        .unwrap();
        let mut handshake_waits = 0;
        loop {
            match conn.connect_poll() {
                ConnectPoll::Pending(interest) => {
                    conn.wait(interest, None).unwrap();
                    handshake_waits += 1;
                }
                ConnectPoll::Established => break,
                ConnectPoll::Failed => panic!("{}", conn.error_message()),
            }
        }
        assert!(handshake_waits > 0);
        assert_eq!(conn.channel_name(), Some("tls"));

        let mut client = AgentClient::from_connection(conn).unwrap();
        let request = CommandRequest::new(Component::Kafka, Action::Status);
        assert_eq!(client.execute(&request).unwrap(), "secured");
        assert_eq!(agent.join().unwrap(), request.opcode());
    }
}
