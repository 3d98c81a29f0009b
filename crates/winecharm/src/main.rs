use std::{
    env,
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver},
        Arc,
    },
    thread,
    time::Duration,
};

use charm_cfg::Script;
use charm_wine::{
    deps,
    ipc::{self, Instance, Message},
    mp, process, supervisor, Cancellation, Event, Manager, Opened, Paths, ProgressView, Reporter,
    User,
};
use log::{error, info, warn};
use path_absolutize::Absolutize;

const EXTENSIONS: [&str; 6] = ["exe", "msi", "charm", "bottle", "prefix", "wzt"];
const POLL: Duration = Duration::from_millis(200);

fn main() {
    let log = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("winecharm", log::LevelFilter::Trace)
        .with_module_level("charm_wine", log::LevelFilter::Debug);
    let max_level = log.max_level();
    let _ = indicatif_log_bridge::LogWrapper::new(mp().clone(), log).try_init();
    log::set_max_level(max_level);

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("Unable to locate data directory. {0}")]
    Xdg(#[from] charm_wine::XdgError),
    #[error("{0}")]
    Engine(#[from] charm_wine::Error),
    #[error("Script error. {0}")]
    Script(#[from] charm_cfg::Error),
    #[error("Launch error. {0}")]
    Launch(#[from] supervisor::Error),
    #[error("Instance handoff error. {0}")]
    Ipc(#[from] ipc::Error),
    #[error("{0}")]
    Deps(#[from] deps::Error),
    #[error("Unable to install interrupt handler. {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
    #[error("Unsupported file {0}, expected one of: {}", EXTENSIONS.join(", "))]
    Unsupported(PathBuf),
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(OsStr::to_str)
        .map(str::to_lowercase)
        .unwrap_or_default()
}

fn run() -> Result<(), Error> {
    let file = env::args_os().nth(1).map(PathBuf::from);

    if let Some(file) = &file {
        let extension = extension(file);
        if !EXTENSIONS.contains(&extension.as_str()) && !file.to_string_lossy().ends_with(".tar.zst") {
            return Err(Error::Unsupported(file.clone()));
        }
        if extension == "charm" {
            return headless(file);
        }
    }

    let paths = Paths::detect()?;
    paths.ensure()?;

    let message = file
        .map(|f| f.absolutize().map(|p| Message::ProcessFile(p.into_owned())))
        .transpose()?;

    let server = match ipc::acquire(&paths.socket, message.as_ref())? {
        Instance::Secondary => {
            info!("Handed over to the running instance");
            return Ok(());
        }
        Instance::Primary(server) => server,
    };

    deps::check()?;

    let (tx, rx) = mpsc::channel();
    let ended = render(rx);
    let mut manager = Manager::new(paths, User::current(), Reporter::new(tx))?;

    let shutdown = Shutdown::new(manager.cancellation());
    let handler = shutdown.clone();
    ctrlc::set_handler(move || {
        if handler.interrupt() {
            warn!("Interrupted again, exiting without cleanup");
            if let Some(pgid) = handler.cancel.current_group() {
                process::signal_group(pgid, libc::SIGKILL);
            }
            std::process::exit(130);
        }
        info!("Stopping, press Ctrl+C again to force");
    })?;

    for key in manager.reconcile() {
        info!("Already running: {key}");
    }

    if let Some(Message::ProcessFile(path)) = &message {
        if !shutdown.requested() {
            open(&mut manager, path);
        }
    }

    info!("Waiting for files, press Ctrl+C to quit");
    while !shutdown.requested() {
        for event in ended.try_iter() {
            for key in manager.handle_event(&event) {
                info!("Added shortcut {key}");
            }
        }

        match server.recv_timeout(POLL) {
            Some(Message::ProcessFile(path)) if !shutdown.requested() => {
                open(&mut manager, &path);
            }
            Some(Message::ShowDialog { title, body }) => info!("{title}: {body}"),
            Some(Message::ProcessFile(path)) => info!("Ignoring {}", path.display()),
            None => {}
        }
    }

    // Dropping the server removes the socket.
    info!("Shutting down");
    Ok(())
}

/// Ctrl+C handling. The first press cancels the running operation and stops the loop
/// once it has unwound, any further press asks for an immediate exit.
#[derive(Debug, Clone)]
struct Shutdown {
    presses: Arc<AtomicUsize>,
    cancel: Cancellation,
}

impl Shutdown {
    fn new(cancel: Cancellation) -> Self {
        Self {
            presses: Arc::default(),
            cancel,
        }
    }

    /// Returns `true` when the process should exit right away.
    fn interrupt(&self) -> bool {
        let presses = self.presses.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancel.cancel();
        presses > 1
    }

    fn requested(&self) -> bool {
        self.presses.load(Ordering::SeqCst) > 0
    }
}

/// Draws progress on a separate thread and passes process exits back.
fn render(rx: Receiver<Event>) -> Receiver<Event> {
    let (tx, ended) = mpsc::channel();

    thread::spawn(move || {
        let mut view = ProgressView::new();
        for event in rx {
            view.update(&event);
            if matches!(event, Event::ProcessEnded { .. }) && tx.send(event).is_err() {
                break;
            }
        }
    });

    ended
}

fn open(manager: &mut Manager, path: &Path) {
    info!("Opening {}", path.display());

    match manager.open_file(path) {
        Ok(Opened::Script(key)) => {
            if let Ok(script) = manager.script(&key) {
                info!("{} is ready in {}", script.progname, script.wineprefix.display());
            }
        }
        Ok(Opened::Restored(restored)) => info!(
            "Restored {} with {} scripts",
            restored.target.display(),
            restored.scripts.len()
        ),
        Err(e) if e.is_cancelled() => info!("Cancelled"),
        Err(e) => error!("Unable to open {}. {e}", path.display()),
    }
}

/// Runs a script in the foreground and returns once it exits.
fn headless(path: &Path) -> Result<(), Error> {
    let script = Script::read(path)?;
    let code = supervisor::run_headless(&script)?;

    match code {
        0 => info!("{} exited", script.progname),
        2 => info!("{} was cancelled", script.progname),
        code => warn!("{} exited with code {code}", script.progname),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use charm_wine::Cancellation;

    use super::Shutdown;

    #[test]
    fn first_interrupt_cancels_second_forces() {
        let cancel = Cancellation::new();
        let shutdown = Shutdown::new(cancel.clone());
        let handler = shutdown.clone();
        assert!(!shutdown.requested());

        let operation = cancel.begin().unwrap();
        assert!(!handler.interrupt());
        assert!(shutdown.requested());
        assert!(cancel.is_cancelled());
        assert!(cancel.check().unwrap_err().is_cancelled());
        drop(operation);

        assert!(handler.interrupt());
        assert!(shutdown.requested());
    }
}
