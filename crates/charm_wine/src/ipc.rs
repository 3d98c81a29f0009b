//! Single-instance handoff over a Unix socket.
//!
//! The first process binds the socket and becomes the primary instance. Later
//! invocations connect, send one `||`-separated message and exit.

use std::{
    fs,
    io::{self, Read, Write},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use fslock::LockFile;
use log::{debug, info, warn};

const SEPARATOR: &str = "||";
const ACCEPT_INTERVAL: Duration = Duration::from_millis(100);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
    #[error("Unable to lock {0}. {1}")]
    Lock(PathBuf, #[source] io::Error),
    #[error("Malformed message {0:?}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Open a file as if the user had picked it.
    ProcessFile(PathBuf),
    ShowDialog { title: String, body: String },
}

impl Message {
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Message::ProcessFile(path) => {
                format!("process_file{SEPARATOR}{}", path.display())
            }
            Message::ShowDialog { title, body } => {
                format!("show_dialog{SEPARATOR}{title}{SEPARATOR}{body}")
            }
        }
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        let raw = raw.trim_end_matches(['\n', '\0']);
        let mut fields = raw.splitn(3, SEPARATOR);

        match (fields.next(), fields.next(), fields.next()) {
            (Some("process_file"), Some(path), None) if !path.is_empty() => {
                // Paths may themselves contain the separator.
                Ok(Message::ProcessFile(PathBuf::from(path)))
            }
            (Some("process_file"), Some(head), Some(tail)) => Ok(Message::ProcessFile(
                PathBuf::from(format!("{head}{SEPARATOR}{tail}")),
            )),
            (Some("show_dialog"), Some(title), body) => Ok(Message::ShowDialog {
                title: title.to_owned(),
                body: body.unwrap_or_default().to_owned(),
            }),
            _ => Err(Error::Malformed(raw.to_owned())),
        }
    }
}

/// Outcome of [`acquire`].
#[derive(Debug)]
pub enum Instance {
    Primary(Server),
    /// Another instance owns the socket and got the message.
    Secondary,
}

/// Becomes the primary instance, or hands `message` to the existing one.
///
/// A lock file beside the socket serializes concurrent invocations. A socket nobody
/// listens on is taken over.
pub fn acquire(socket: &Path, message: Option<&Message>) -> Result<Instance, Error> {
    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent)?;
    }

    let lock_path = lock_path(socket);
    let mut lock = LockFile::open(&lock_path).map_err(|e| Error::Lock(lock_path.clone(), e))?;
    lock.lock().map_err(|e| Error::Lock(lock_path.clone(), e))?;

    if socket.exists() {
        match UnixStream::connect(socket) {
            Ok(stream) => {
                if let Some(message) = message {
                    send_on(stream, message)?;
                }
                return Ok(Instance::Secondary);
            }
            Err(e) => {
                warn!("Taking over stale socket {}. {e}", socket.display());
                fs::remove_file(socket)?;
            }
        }
    }

    let listener = UnixListener::bind(socket)?;
    info!("Listening on {}", socket.display());
    Ok(Instance::Primary(Server::start(listener, socket)?))
}

/// Sends one message to the instance listening on `socket`.
pub fn send(socket: &Path, message: &Message) -> Result<(), Error> {
    send_on(UnixStream::connect(socket)?, message)
}

fn send_on(mut stream: UnixStream, message: &Message) -> Result<(), Error> {
    debug!("Sending {message:?}");
    stream.write_all(message.encode().as_bytes())?;
    stream.shutdown(std::net::Shutdown::Write)?;
    Ok(())
}

fn lock_path(socket: &Path) -> PathBuf {
    let mut name = socket.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    socket.with_file_name(name)
}

/// The primary instance's listener. Messages arrive on a channel fed by a background
/// accept loop; dropping the server stops the loop and unlinks the socket.
#[derive(Debug)]
pub struct Server {
    path: PathBuf,
    rx: Receiver<Message>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Server {
    fn start(listener: UnixListener, path: &Path) -> Result<Self, Error> {
        listener.set_nonblocking(true)?;

        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let worker = thread::spawn(move || {
            while flag.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => match read_message(stream) {
                        Ok(message) => {
                            debug!("Received {message:?}");
                            if tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Ignoring message. {e}"),
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_INTERVAL);
                    }
                    Err(e) => {
                        warn!("Accept error. {e}");
                        thread::sleep(ACCEPT_INTERVAL);
                    }
                }
            }
        });

        Ok(Self {
            path: path.to_path_buf(),
            rx,
            running,
            worker: Some(worker),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits up to `timeout` for the next message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Unable to remove {}. {e}", self.path.display());
        }
    }
}

fn read_message(mut stream: UnixStream) -> Result<Message, Error> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut raw = String::new();
    stream.read_to_string(&mut raw)?;
    Message::parse(&raw)
}
