//! Agent side: listener, worker pool and the per-connection session.
//!
//! The install/start/configure procedures themselves live behind
//! [`AgentHandler`]; this module only transports decoded requests to it and
//! its answers back.

use std::fs;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chainerror::*;

use crate::command::CommandRequest;
use crate::error::*;
use crate::poll::{self, Readiness};
use crate::protocol::{self, parse_frame, tag, FrameReader, ParseResult};

/// Executes decoded requests. `Err` text is sent to the client as an error.
pub trait AgentHandler {
    fn handle(&self, request: &CommandRequest) -> std::result::Result<String, String>;
}

/// Acknowledges every request without doing anything.
#[derive(Debug, Default)]
pub struct DryRunHandler;

impl AgentHandler for DryRunHandler {
    fn handle(&self, request: &CommandRequest) -> std::result::Result<String, String> {
        log::info!("dry run: {}", request);
        Ok(format!("{}: accepted (dry run)", request))
    }
}

pub trait Stream: Read + Write + Send + AsRawFd {
    fn shutdown(&mut self) -> Result<()>;
    fn peer(&self) -> String;
}

impl Stream for TcpStream {
    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both).map_err(minto_cherr!())
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "tcp:?".to_string())
    }
}

impl Stream for UnixStream {
    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both).map_err(minto_cherr!())
    }

    fn peer(&self) -> String {
        "local socket".to_string()
    }
}

#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

impl Listener {
    /// Bind `tcp:<host>:<port>` or `unix:<path>`. A stale socket file at
    /// `path` is replaced.
    pub fn new<S: ?Sized + AsRef<str>>(address: &S) -> Result<Self> {
        let address = address.as_ref();
        if let Some(addr) = address.strip_prefix("tcp:") {
            Ok(Listener::Tcp(TcpListener::bind(addr).map_err(minto_cherr!())?))
        } else if let Some(path) = address.strip_prefix("unix:") {
            // ignore error on non-existent file
            let _ = fs::remove_file(path);
            Ok(Listener::Unix(
                UnixListener::bind(path).map_err(minto_cherr!())?,
                PathBuf::from(path),
            ))
        } else {
            Err(cherr!(ErrorKind::InvalidAddress))
        }
    }

    /// The bound address in the form [`Listener::new`] accepts.
    pub fn local_address(&self) -> Result<String> {
        match self {
            Listener::Tcp(l) => Ok(format!("tcp:{}", l.local_addr().map_err(minto_cherr!())?)),
            Listener::Unix(_, path) => Ok(format!("unix:{}", path.display())),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(l) => l.as_raw_fd(),
            Listener::Unix(l, _) => l.as_raw_fd(),
        }
    }

    /// Accept one connection, waiting at most `timeout` milliseconds
    /// (0 waits indefinitely).
    pub fn accept(&self, timeout: u64) -> Result<Box<dyn Stream>> {
        if timeout > 0 {
            let deadline = Instant::now() + Duration::from_millis(timeout);
            if poll::wait(self.as_raw_fd(), true, false, Some(deadline))
                .map_err(minto_cherr!())?
                == Readiness::Timeout
            {
                return Err(cherr!(ErrorKind::Timeout));
            }
        }
        match self {
            Listener::Tcp(l) => {
                let (s, addr) = l.accept().map_err(minto_cherr!())?;
                s.set_nodelay(true).map_err(minto_cherr!())?;
                log::info!("accepted connection from {}", addr);
                Ok(Box::new(s))
            }
            Listener::Unix(l, _) => {
                let (s, _) = l.accept().map_err(minto_cherr!())?;
                log::info!("accepted local connection");
                Ok(Box::new(s))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = fs::remove_file(path);
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    NewJob(Job),
    Terminate,
}

struct ThreadPool {
    max_workers: usize,
    workers: Vec<Worker>,
    num_busy: Arc<AtomicUsize>,
    sender: mpsc::Sender<Message>,
    receiver: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl ThreadPool {
    /// A pool starting with `initial_workers` threads (at least one) and
    /// growing up to `max_workers` while all are busy.
    fn new(initial_workers: usize, max_workers: usize) -> ThreadPool {
        let (sender, receiver) = mpsc::channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let num_busy = Arc::new(AtomicUsize::new(0));

        let workers = (0..initial_workers.max(1))
            .map(|_| Worker::new(Arc::clone(&receiver), Arc::clone(&num_busy)))
            .collect();

        ThreadPool {
            max_workers,
            workers,
            sender,
            receiver,
            num_busy,
        }
    }

    fn execute<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(Message::NewJob(Box::new(f)))
            .map_err(|_| cherr!(ErrorKind::Io(io::ErrorKind::BrokenPipe)))?;
        if self.num_busy() + 1 >= self.workers.len() && self.workers.len() < self.max_workers {
            self.workers.push(Worker::new(
                Arc::clone(&self.receiver),
                Arc::clone(&self.num_busy),
            ));
        }
        Ok(())
    }

    fn num_busy(&self) -> usize {
        self.num_busy.load(Ordering::SeqCst)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for _ in &self.workers {
            let _ = self.sender.send(Message::Terminate);
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

struct Worker {
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(receiver: Arc<Mutex<mpsc::Receiver<Message>>>, num_busy: Arc<AtomicUsize>) -> Worker {
        let thread = thread::spawn(move || loop {
            let message = match receiver.lock() {
                Ok(receiver) => receiver.recv(),
                Err(_) => break,
            };
            match message {
                Ok(Message::NewJob(job)) => {
                    num_busy.fetch_add(1, Ordering::SeqCst);
                    job();
                    num_busy.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(Message::Terminate) | Err(_) => break,
            }
        });

        Worker {
            thread: Some(thread),
        }
    }
}

/// Configuration for [`listen`] and [`serve`].
///
/// ```rust
/// let l = clusterwire::ListenConfig::default();
/// assert_eq!(l.initial_worker_threads, 1);
/// assert_eq!(l.max_worker_threads, 100);
/// assert_eq!(l.idle_timeout, 0);
/// assert!(l.stop_listening.is_none());
/// assert!(l.password.is_none());
/// ```
#[derive(Clone, Debug)]
pub struct ListenConfig {
    pub initial_worker_threads: usize,
    pub max_worker_threads: usize,
    /// Seconds without new connections after which the server returns
    /// [`ErrorKind::Timeout`]; 0 never times out.
    pub idle_timeout: u64,
    /// Set to `true` to make the server stop accepting and return.
    pub stop_listening: Option<Arc<AtomicBool>>,
    /// Password clients must send during startup.
    pub password: Option<String>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            initial_worker_threads: 1,
            max_worker_threads: 100,
            idle_timeout: 0,
            stop_listening: None,
            password: None,
        }
    }
}

/// Bind `address` and serve agent sessions with `handler` until stopped or
/// idle. See [`serve`].
pub fn listen<S, H>(handler: H, address: &S, config: &ListenConfig) -> Result<()>
where
    S: ?Sized + AsRef<str>,
    H: AgentHandler + Send + Sync + 'static,
{
    let listener = Listener::new(address)?;
    serve(handler, listener, config)
}

/// Serve agent sessions on an already bound listener, one worker thread per
/// connection.
///
/// With an `idle_timeout` this returns [`ErrorKind::Timeout`] once no new
/// connection arrived for that long and no session is active. With
/// `stop_listening` it returns `Ok(())` shortly after the flag is set.
pub fn serve<H>(handler: H, listener: Listener, config: &ListenConfig) -> Result<()>
where
    H: AgentHandler + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    let password: Option<Arc<str>> = config.password.as_deref().map(Arc::from);
    let mut pool = ThreadPool::new(config.initial_worker_threads, config.max_worker_threads);
    log::info!("agent listening on {}", listener.local_address()?);

    loop {
        let mut to_wait = config.idle_timeout * 1000;
        let wait_time = config.stop_listening.as_ref().map(|_| 100).unwrap_or(to_wait);
        let mut stream = loop {
            match listener.accept(wait_time) {
                Err(e) => match e.kind() {
                    ErrorKind::Timeout => {
                        if let Some(stop) = config.stop_listening.as_ref() {
                            if stop.load(Ordering::SeqCst) {
                                return Ok(());
                            }
                            if config.idle_timeout == 0 {
                                continue;
                            }
                        }

                        if to_wait <= wait_time {
                            if pool.num_busy() == 0 {
                                return Err(e);
                            }
                            to_wait = config.idle_timeout * 1000;
                        } else {
                            to_wait -= wait_time;
                        }
                        continue;
                    }
                    _ => return Err(e),
                },
                Ok(stream) => break stream,
            }
        };

        let handler = handler.clone();
        let password = password.clone();
        pool.execute(move || {
            let peer = stream.peer();
            if let Err(e) = Session::new(&mut *stream).run(&*handler, password.as_deref()) {
                match e.kind() {
                    ErrorKind::ConnectionClosed => log::debug!("{}: connection closed", peer),
                    _ => log::warn!("{}: session error: {}", peer, e),
                }
            }
            let _ = stream.shutdown();
        })?;
    }
}

fn text_payload(text: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(text.len() + 1);
    payload.extend(text.bytes().filter(|&b| b != 0));
    payload.push(0);
    payload
}

/// One client connection on the agent side.
struct Session<'a> {
    stream: &'a mut dyn Stream,
    buf: Vec<u8>,
}

impl<'a> Session<'a> {
    fn new(stream: &'a mut dyn Stream) -> Self {
        Session {
            stream,
            buf: Vec::new(),
        }
    }

    /// The next frame, or `None` if the client closed between frames.
    fn next_frame(&mut self, tagged: bool) -> Result<Option<(Option<u8>, Vec<u8>)>> {
        let mut chunk = [0u8; 8192];
        loop {
            match parse_frame(&self.buf, tagged) {
                ParseResult::Complete {
                    tag,
                    payload,
                    consumed,
                } => {
                    self.buf.drain(..consumed);
                    return Ok(Some((tag, payload)));
                }
                ParseResult::Incomplete { .. } => {}
                ParseResult::Invalid { error } => {
                    return Err(cherr!(ErrorKind::Protocol(error)))
                }
            }

            let n = loop {
                match self.stream.read(&mut chunk) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    r => break r.map_err(minto_cherr!())?,
                }
            };
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(cherr!(ErrorKind::ConnectionClosed));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn send(&mut self, tag: u8, payload: &[u8]) -> Result<()> {
        let mut out = Vec::with_capacity(payload.len() + 5);
        protocol::encode_frame(&mut out, Some(tag), payload);
        self.stream.write_all(&out).map_err(minto_cherr!())?;
        self.stream.flush().map_err(minto_cherr!())
    }

    fn send_error(&mut self, text: &str) -> Result<()> {
        self.send(tag::ERROR, &text_payload(text))
    }

    fn send_auth(&mut self, code: i32) -> Result<()> {
        self.send(tag::AUTHENTICATION, &code.to_be_bytes())
    }

    fn run(&mut self, handler: &dyn AgentHandler, password: Option<&str>) -> Result<()> {
        let payload = match self.next_frame(false)? {
            Some((_, payload)) => payload,
            None => return Ok(()),
        };
        let (version, parameters) = match protocol::parse_startup(&payload) {
            Ok(startup) => startup,
            Err(reason) => {
                self.send_error(&reason)?;
                return Err(cherr!(ErrorKind::Protocol(reason)));
            }
        };
        if version != protocol::PROTOCOL_VERSION {
            let reason = format!("unsupported protocol version 0x{:08x}", version);
            self.send_error(&reason)?;
            return Err(cherr!(ErrorKind::Protocol(reason)));
        }
        let user = parameters
            .iter()
            .find(|(k, _)| k == "user")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();
        log::debug!("startup from user \"{}\" with {:?}", user, parameters);

        if let Some(expected) = password {
            self.send_auth(protocol::AUTH_PASSWORD)?;
            let answer = match self.next_frame(true)? {
                Some((Some(tag::PASSWORD), payload)) => FrameReader::new(&payload).read_string(),
                Some(_) => None,
                None => return Ok(()),
            };
            if answer.as_deref() != Some(expected) {
                log::warn!("password authentication failed for user \"{}\"", user);
                return self.send_error(&format!(
                    "password authentication failed for user \"{}\"",
                    user
                ));
            }
        }
        self.send_auth(protocol::AUTH_OK)?;
        self.send(tag::READY, &[])?;

        loop {
            let (frame_tag, payload) = match self.next_frame(true)? {
                Some((Some(frame_tag), payload)) => (frame_tag, payload),
                Some((None, _)) | None => return Ok(()),
            };
            if frame_tag == tag::TERMINATE {
                log::debug!("client terminated the session");
                return Ok(());
            }
            if frame_tag & 0x80 == 0 {
                let reason = format!("unexpected message type 0x{:02x}", frame_tag);
                self.send_error(&reason)?;
                return Err(cherr!(ErrorKind::Protocol(reason)));
            }

            match CommandRequest::decode(frame_tag, &payload) {
                Ok(request) => match handler.handle(&request) {
                    Ok(text) => self.send(tag::COMPLETE, &text_payload(&text))?,
                    Err(text) => self.send_error(&text)?,
                },
                Err(reason) => self.send_error(&reason)?,
            }
        }
    }
}
