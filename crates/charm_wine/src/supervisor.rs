//! Launching scripts and keeping track of what they left running.

use std::{
    borrow::Cow,
    collections::HashMap,
    fs::{self, OpenOptions},
    io::{self, Write},
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

use charm_cfg::Script;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;

use crate::{
    command::WineEnv,
    exe,
    process::{self, GRACE},
    procfs::Proc,
    runner, Event, Reporter,
};

/// Environment variable carrying the correlation id of a launch.
pub const UNIQUE_ID_ENV: &str = "WINECHARM_UNIQUE_ID";

/// Wine's own processes, never mistaken for a script's.
pub const SYSTEM_EXES: [&str; 15] = [
    "start.exe",
    "winedbg.exe",
    "conhost.exe",
    "explorer.exe",
    "services.exe",
    "rpcss.exe",
    "svchost.exe",
    "plugplay.exe",
    "winedevice.exe",
    "winemenubuilder.exe",
    "wineboot.exe",
    "rundll32.exe",
    "tabtip.exe",
    "mscorsvw.exe",
    "wmiprvse.exe",
];

/// Exit code of a program the user backed out of.
const CANCELLED_EXIT: i32 = 2;
const DISCOVERY_DELAY: Duration = Duration::from_secs(5);
const WATCH_INTERVAL: Duration = Duration::from_secs(1);
const TOOL_TIMEOUT: Duration = Duration::from_secs(10);
const LOG_TAIL_LINES: usize = 20;

lazy_static! {
    static ref WINEDBG_EXE: Regex = Regex::new(r"'([^']+)'").unwrap();
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unable to start {0}. {1}")]
    Spawn(PathBuf, #[source] io::Error),
    #[error("Runner error. {0}")]
    Runner(#[from] runner::Error),
    #[error("Script error. {0}")]
    Script(#[from] charm_cfg::Error),
    #[error("{0} does not exist")]
    NotLaunchable(PathBuf),
    #[error("{0} is already running")]
    AlreadyRunning(String),
    #[error("{0} is not running")]
    NotRunning(String),
    #[error("IO error. {0}")]
    Io(#[from] io::Error),
}

/// Everything needed to start one script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub wine: PathBuf,
    pub prefix: PathBuf,
    pub exe_dir: PathBuf,
    pub exe_name: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub wine_debug: String,
    pub msi: bool,
}

impl LaunchPlan {
    /// Resolves and validates the script's runner and splits its arguments.
    pub fn new(script: &Script) -> Result<Self, Error> {
        let wine = runner::resolve(&script.runner)?;
        if !script.runner.trim().is_empty() && wine.is_absolute() {
            runner::validate(&wine)?;
        }

        let env = script.env_pairs()?;
        let args = shlex::split(&script.args).unwrap_or_else(|| {
            script
                .args
                .split_whitespace()
                .map(ToOwned::to_owned)
                .collect()
        });

        Ok(Self {
            wine,
            prefix: script.wineprefix.clone(),
            exe_dir: script
                .exe_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default(),
            exe_name: script
                .exe_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            args,
            env,
            wine_debug: script.wine_debug.clone(),
            msi: exe::is_msi(&script.exe_file),
        })
    }

    /// `export PATH=<runner dir>:$PATH; cd <exe dir> && <debug> <env> WINEPREFIX=<prefix>
    /// <runner> <exe> <args>`, every value shell-quoted.
    #[must_use]
    pub fn shell_line(&self) -> String {
        let mut line = String::new();

        if let Some(bin) = self.wine.parent().filter(|p| !p.as_os_str().is_empty()) {
            line.push_str(&format!("export PATH={}:$PATH; ", quote(&bin.to_string_lossy())));
        }
        line.push_str(&format!("cd {} && ", quote(&self.exe_dir.to_string_lossy())));

        if !self.wine_debug.trim().is_empty() {
            line.push_str(self.wine_debug.trim());
            line.push(' ');
        }
        for (key, value) in &self.env {
            line.push_str(&format!("{key}={} ", quote(value)));
        }
        line.push_str(&format!(
            "WINEPREFIX={} {}",
            quote(&self.prefix.to_string_lossy()),
            quote(&self.wine.to_string_lossy())
        ));

        if self.msi {
            line.push_str(" msiexec /i");
        }
        line.push(' ');
        line.push_str(&quote(&self.exe_name));

        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote(arg));
        }

        line
    }

    #[must_use]
    pub fn command(&self, unique_id: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(self.shell_line())
            .env(UNIQUE_ID_ENV, unique_id)
            .stdin(Stdio::null())
            .process_group(0);
        command
    }
}

fn quote(value: &str) -> String {
    let value = value.replace('\0', "");
    shlex::try_quote(&value)
        .map(Cow::into_owned)
        .unwrap_or_default()
}

/// Runs a script in the foreground with inherited output and returns its exit code.
pub fn run_headless(script: &Script) -> Result<i32, Error> {
    if !script.is_launchable() {
        return Err(Error::NotLaunchable(script.exe_file.clone()));
    }

    let plan = LaunchPlan::new(script)?;
    let unique_id = uuid::Uuid::new_v4().to_string();
    info!("Running {} headless ({unique_id})", script.progname);

    let status = plan
        .command(&unique_id)
        .status()
        .map_err(|e| Error::Spawn(script.exe_file.clone(), e))?;

    Ok(status.code().unwrap_or(1))
}

/// One running script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub unique_id: Option<String>,
    /// Group of the shell started for the launch, gone once it exits.
    pub pgid: Option<libc::pid_t>,
    pub pid: Option<libc::pid_t>,
    pub pids: Vec<libc::pid_t>,
    pub wineprefix: PathBuf,
    pub runner: PathBuf,
    pub exe_file: PathBuf,
    pub exe_name: String,
    pub exe_parent_name: String,
    pub manually_stopped: bool,
}

impl ProcessRecord {
    fn new(script: &Script, runner: PathBuf, unique_id: Option<String>) -> Self {
        Self {
            unique_id,
            pgid: None,
            pid: None,
            pids: Vec::new(),
            wineprefix: script.wineprefix.clone(),
            runner,
            exe_file: script.exe_file.clone(),
            exe_name: script
                .exe_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            exe_parent_name: script
                .exe_file
                .parent()
                .and_then(Path::file_name)
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            manually_stopped: false,
        }
    }
}

/// Table of running scripts keyed by script hash. Clones share the table.
#[derive(Debug, Clone)]
pub struct Supervisor {
    table: Arc<Mutex<HashMap<String, ProcessRecord>>>,
    reporter: Reporter,
    proc: Proc,
    discovery_delay: Duration,
}

impl Supervisor {
    #[must_use]
    pub fn new(reporter: Reporter) -> Self {
        Self::with_proc(reporter, Proc::default(), DISCOVERY_DELAY)
    }

    pub(crate) fn with_proc(reporter: Reporter, proc: Proc, discovery_delay: Duration) -> Self {
        Self {
            table: Arc::default(),
            reporter,
            proc,
            discovery_delay,
        }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, ProcessRecord>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_running(&self, key: &str) -> bool {
        self.table().contains_key(key)
    }

    #[must_use]
    pub fn record(&self, key: &str) -> Option<ProcessRecord> {
        self.table().get(key).cloned()
    }

    #[must_use]
    pub fn running(&self) -> Vec<String> {
        let mut keys = self.table().keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Starts a script, re-reading its `.charm` first so outside edits apply.
    ///
    /// Output goes to the script's `.log`; returns the launch's unique id.
    pub fn launch(&self, script: &Script) -> Result<String, Error> {
        let script = if script.script_path.is_file() {
            Script::read(&script.script_path)?
        } else {
            script.clone()
        };
        let key = script.sha256sum.clone();

        if self.is_running(&key) {
            return Err(Error::AlreadyRunning(script.progname));
        }
        if !script.is_launchable() {
            return Err(Error::NotLaunchable(script.exe_file));
        }

        let log_path = script.log_path();
        let plan = match LaunchPlan::new(&script) {
            Ok(plan) => plan,
            Err(e) => {
                append_log(&log_path, &format!("Unable to launch {}. {e}", script.progname));
                return Err(e);
            }
        };

        let unique_id = uuid::Uuid::new_v4().to_string();
        append_log(
            &log_path,
            &format!("=== Launching {} ({unique_id}) ===", script.progname),
        );

        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let mut command = plan.command(&unique_id);
        command.stdout(log.try_clone()?).stderr(log);
        debug!("Launching: {command:?}");

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                append_log(&log_path, &format!("Unable to start {}. {e}", plan.exe_name));
                return Err(Error::Spawn(script.exe_file, e));
            }
        };

        let mut record = ProcessRecord::new(&script, plan.wine.clone(), Some(unique_id.clone()));
        let pid = libc::pid_t::try_from(child.id()).ok();
        record.pgid = pid;
        record.pid = pid;

        info!("Launched {} as {pid:?}", script.progname);
        self.table().insert(key.clone(), record);
        self.reporter.send(Event::ProcessStarted { key: key.clone() });

        let supervisor = self.clone();
        let discovery_key = key.clone();
        thread::spawn(move || supervisor.discover_later(&discovery_key));

        let supervisor = self.clone();
        thread::spawn(move || supervisor.monitor(&key, child, &log_path));

        Ok(unique_id)
    }

    fn discover_later(&self, key: &str) {
        thread::sleep(self.discovery_delay);

        let Some(record) = self.record(key) else {
            return;
        };

        let mut pids = discover_with_winedbg(&record);
        for pid in self.descendants(&record) {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }

        if let Some(record) = self.table().get_mut(key) {
            debug!("Discovered {pids:?} for {}", record.exe_name);
            for pid in pids {
                if !record.pids.contains(&pid) {
                    record.pids.push(pid);
                }
            }
        }
    }

    /// Live processes of a record found through `/proc`: those carrying its unique id,
    /// and those in its prefix that mention its executable or game directory.
    fn descendants(&self, record: &ProcessRecord) -> Vec<libc::pid_t> {
        let mut pids = record
            .unique_id
            .as_deref()
            .map(|id| self.proc.with_env(UNIQUE_ID_ENV, id))
            .unwrap_or_default();

        let needles = [&record.exe_name, &record.exe_parent_name];
        for needle in needles.into_iter().filter(|n| !n.is_empty()) {
            for pid in self.proc.in_prefix(&record.wineprefix, needle) {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }

        pids.retain(|pid| {
            Some(*pid) != record.pgid
                && self
                    .proc
                    .cmdline(*pid)
                    .is_some_and(|c| !is_system_process(&c))
        });
        pids.sort_unstable();
        pids
    }

    fn monitor(&self, key: &str, mut child: Child, log_path: &Path) {
        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("Unable to wait for {key}. {e}");
                self.end(key);
                return;
            }
        };
        info!("Launch of {key} exited with {status}");

        let Some(record) = self.record(key) else {
            return;
        };
        if record.manually_stopped {
            self.end(key);
            return;
        }

        let code = status.code().unwrap_or(-1);
        if code != 0 && code != CANCELLED_EXIT {
            self.reporter.send(Event::ProcessFailed {
                key: key.to_owned(),
                code,
                log_tail: process::log_tail(log_path, LOG_TAIL_LINES),
            });
        }

        self.watch(key);
    }

    /// Keeps a record alive while any of its processes, or their rediscovered
    /// successors, are still running.
    fn watch(&self, key: &str) {
        loop {
            let Some(mut record) = self.record(key) else {
                return;
            };
            if record.manually_stopped {
                break;
            }

            record.pids.retain(|pid| process::alive(*pid));
            if record.pids.is_empty() {
                record.pids = self.descendants(&record);
                if record.pids.is_empty() {
                    break;
                }
                warn!("Rediscovered {} as {:?}", record.exe_name, record.pids);
            }

            if let Some(current) = self.table().get_mut(key) {
                current.pgid = None;
                current.pid = record.pids.first().copied();
                current.pids.clone_from(&record.pids);
            }

            thread::sleep(WATCH_INTERVAL);
        }

        self.end(key);
    }

    fn end(&self, key: &str) {
        if self.table().remove(key).is_some() {
            self.reporter.send(Event::ProcessEnded {
                key: key.to_owned(),
            });
        }
    }

    /// Stops a running script: its known processes get SIGTERM then SIGKILL, the prefix's
    /// wineserver is killed when none are known, and anything else carrying the launch's
    /// unique id goes too.
    pub fn terminate(&self, key: &str) -> Result<(), Error> {
        let record = {
            let mut table = self.table();
            let record = table
                .get_mut(key)
                .ok_or_else(|| Error::NotRunning(key.to_owned()))?;
            record.manually_stopped = true;
            record.clone()
        };

        info!("Terminating {}", record.exe_name);

        if let Some(pgid) = record.pgid {
            process::signal_group(pgid, libc::SIGTERM);
        }

        if record.pids.is_empty() {
            kill_wineserver(&record);
        } else {
            for pid in &record.pids {
                process::terminate_pid(*pid, GRACE);
            }
        }

        if let Some(id) = &record.unique_id {
            for pid in self.proc.with_env(UNIQUE_ID_ENV, id) {
                process::terminate_pid(pid, GRACE);
            }
        }

        if record.pgid.is_none() {
            // Nothing to reap when the record only tracks rediscovered processes.
            self.end(key);
        }
        Ok(())
    }

    /// Marks scripts whose programs are already running, typically after a restart, and
    /// starts watching them. Returns the keys found.
    pub fn reconcile<'a>(&self, scripts: impl IntoIterator<Item = &'a Script>) -> Vec<String> {
        let mut found = Vec::new();

        for script in scripts {
            let key = &script.sha256sum;
            if self.is_running(key) {
                continue;
            }

            let mut record = ProcessRecord::new(script, PathBuf::new(), None);
            if record.exe_name.is_empty() {
                continue;
            }

            record.pids = self
                .proc
                .in_prefix(&script.wineprefix, &record.exe_name)
                .into_iter()
                .filter(|pid| process::alive(*pid))
                .collect();
            if record.pids.is_empty() {
                continue;
            }

            record.pid = record.pids.first().copied();
            record.unique_id = record
                .pid
                .and_then(|pid| self.proc.env_var(pid, UNIQUE_ID_ENV));
            record.runner = runner::resolve(&script.runner).unwrap_or_default();

            info!("{} is already running as {:?}", script.progname, record.pids);
            self.table().insert(key.clone(), record);
            self.reporter.send(Event::ProcessStarted { key: key.clone() });
            found.push(key.clone());

            let supervisor = self.clone();
            let key = key.clone();
            thread::spawn(move || supervisor.watch(&key));
        }

        found
    }
}

fn is_system_process(cmdline: &str) -> bool {
    let cmdline = cmdline.to_lowercase();
    cmdline.contains("wineserver") || SYSTEM_EXES.iter().any(|exe| cmdline.contains(exe))
}

fn append_log(path: &Path, line: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{line}"));

    if let Err(e) = result {
        warn!("Unable to write to {}. {e}", path.display());
    }
}

fn wine_env(record: &ProcessRecord) -> Option<WineEnv> {
    let wine = if record.runner.as_os_str().is_empty() {
        Path::new("wine")
    } else {
        record.runner.as_path()
    };
    WineEnv::new(wine, &record.wineprefix).ok()
}

fn kill_wineserver(record: &ProcessRecord) {
    let Some(env) = wine_env(record) else {
        return;
    };

    info!("Killing wineserver of {}", record.wineprefix.display());
    let mut command = env.wine_tool("wineserver", &["-k"]);
    if let Err(e) = process::run_with_timeout(&mut command, TOOL_TIMEOUT) {
        warn!("wineserver -k failed. {e}");
    }
}

/// Asks `winedbg` which processes run in the prefix and finds their PIDs with `ps`.
fn discover_with_winedbg(record: &ProcessRecord) -> Vec<libc::pid_t> {
    let Some(env) = wine_env(record) else {
        return Vec::new();
    };

    let winedbg = match process::run_with_timeout(
        &mut env.wine_tool("winedbg", &["--command", "info proc"]),
        TOOL_TIMEOUT,
    ) {
        Ok(output) => output.stdout,
        Err(e) => {
            debug!("winedbg unavailable. {e}");
            return Vec::new();
        }
    };

    let names = parse_winedbg(&winedbg, &record.exe_name);
    if names.is_empty() {
        return Vec::new();
    }

    let mut ps = Command::new("ps");
    ps.args(["-ax", "-o", "pid=,args="]);
    match process::run_with_timeout(&mut ps, TOOL_TIMEOUT) {
        Ok(output) => parse_ps(&output.stdout, &names, &record.exe_parent_name),
        Err(e) => {
            debug!("ps failed. {e}");
            Vec::new()
        }
    }
}

/// Executable names from `winedbg --command 'info proc'` lines that mention `exe_name`,
/// minus wine's own processes.
fn parse_winedbg(output: &str, exe_name: &str) -> Vec<String> {
    let exe_name = exe_name.to_lowercase();
    let mut names = Vec::new();

    for line in output.lines().filter(|l| l.to_lowercase().contains(&exe_name)) {
        let Some(name) = WINEDBG_EXE.captures(line).and_then(|c| c.get(1)) else {
            continue;
        };
        let name = name.as_str().to_owned();
        let lower = name.to_lowercase();
        if !SYSTEM_EXES.contains(&lower.as_str()) && !names.contains(&name) {
            names.push(name);
        }
    }

    names
}

/// PIDs of `ps -ax -o pid=,args=` lines naming one of `names` and `parent_dir`.
fn parse_ps(output: &str, names: &[String], parent_dir: &str) -> Vec<libc::pid_t> {
    output
        .lines()
        .filter(|line| names.iter().any(|n| line.contains(n.as_str())))
        .filter(|line| parent_dir.is_empty() || line.contains(parent_dir))
        .filter_map(|line| line.split_whitespace().next()?.parse().ok())
        .collect()
}

/// Removes a script's log file, if any.
pub fn clear_log(script: &Script) -> Result<(), io::Error> {
    match fs::remove_file(script.log_path()) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
