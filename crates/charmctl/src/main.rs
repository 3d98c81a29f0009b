use std::{
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver},
    thread,
    time::Duration,
};

use charm_cfg::Arch;
use charm_wine::{
    catalog::Variant, deps, mp, Event, Manager, Opened, ProgressView, Reporter, SortKey,
};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;

const POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known scripts
    List {
        /// Only show scripts whose name contains this
        #[arg(short, long, default_value = "")]
        filter: String,
        #[arg(short, long, value_enum, default_value_t = Sort::Name)]
        sort: Sort,
        #[arg(short, long)]
        reverse: bool,
    },
    /// Rescan the prefixes directory, or merge scripts from another one
    Load { dir: Option<PathBuf> },
    /// Open an executable, script or archive
    Open { file: PathBuf },
    /// Edit a script
    Script {
        /// Script name, file name or hash prefix
        script: String,
        #[command(subcommand)]
        command: ScriptCommand,
    },
    /// Launch a script
    Launch {
        script: String,
        /// Wait for the program to exit
        #[arg(short, long)]
        wait: bool,
    },
    /// Stop a script launched by this instance
    Terminate { script: String },
    /// Archive a script's prefix as a .prefix backup
    Backup { script: String, dest: PathBuf },
    /// Archive a script's prefix as a portable .bottle
    Bottle { script: String, dest: PathBuf },
    /// Restore a .prefix, .bottle, .wzt or template archive
    Restore { archive: PathBuf },
    /// Manage prefix templates
    Template {
        #[command(subcommand)]
        command: TemplateCommand,
    },
    /// Manage wine runners
    Runner {
        #[command(subcommand)]
        command: RunnerCommand,
    },
    /// Show or change settings
    Settings {
        #[command(subcommand)]
        command: Option<SettingsCommand>,
    },
    /// Check that the programs WineCharm needs are installed
    Deps,
}

#[derive(Subcommand)]
enum ScriptCommand {
    /// Show the script
    Show,
    Rename { name: String },
    /// Set environment variables, as `KEY=value;OTHER=value`
    Env { vars: String },
    Args { args: String },
    /// Use a runner, or the default one when empty
    Runner {
        #[arg(default_value = "")]
        runner: String,
    },
    /// Regenerate the script, keeping the old one as .bak
    Reset,
    /// Remove the script's log file
    ClearLog,
    /// Turn shortcuts found in the script's prefix into scripts
    Harvest,
    /// Delete the script file
    Delete,
    /// Delete the script's whole prefix
    DeletePrefix,
}

#[derive(Subcommand)]
enum TemplateCommand {
    List,
    /// Build the default template for an architecture
    Init { arch: Arch },
    /// Copy a template under a new name
    Clone { source: PathBuf, name: String },
    /// Copy an existing prefix directory in as a template
    Import { source: PathBuf },
    /// Archive a template
    Backup { dir: PathBuf, dest: PathBuf },
    Delete { dir: PathBuf },
    /// Use a template for new prefixes
    Set { dir: PathBuf },
}

#[derive(Subcommand)]
enum RunnerCommand {
    List,
    /// Copy a runner directory or unpack a runner archive
    Import { source: PathBuf },
    /// Archive a runner
    Backup { dir: PathBuf, dest: PathBuf },
    /// Unpack a runner archive
    Restore { archive: PathBuf },
    Delete { dir: PathBuf },
    /// List downloadable runners
    Catalog {
        /// Fetch even when the cached listing is fresh
        #[arg(short, long)]
        refresh: bool,
    },
    /// Download and unpack a runner from the catalog
    Download { name: String },
    /// Use a wine binary by default, or the system wine when omitted
    Default { wine: Option<PathBuf> },
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// Switch architecture, building its template when missing
    Arch { arch: Arch },
    /// Put every new script in one shared prefix
    SinglePrefix {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
    /// Debug variables new scripts get
    WineDebug { value: String },
    /// Environment variables new scripts get, as `KEY=value;OTHER=value`
    EnvVars { value: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Sort {
    Name,
    Prefix,
    Mtime,
}

impl From<Sort> for SortKey {
    fn from(sort: Sort) -> Self {
        match sort {
            Sort::Name => SortKey::Progname,
            Sort::Prefix => SortKey::Wineprefix,
            Sort::Mtime => SortKey::Mtime,
        }
    }
}

fn main() {
    let log = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .with_module_level("charmctl", log::LevelFilter::Trace);
    let max_level = log.max_level();
    let _ = indicatif_log_bridge::LogWrapper::new(mp().clone(), log).try_init();
    log::set_max_level(max_level);

    match run() {
        Ok(()) => {}
        Err(Error::Engine(e)) if e.is_cancelled() => info!("Cancelled"),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("{0}")]
    Engine(#[from] charm_wine::Error),
    #[error("{0}")]
    Deps(#[from] deps::Error),
    #[error("Unable to install interrupt handler. {0}")]
    Signal(#[from] ctrlc::Error),
}

fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    if let Commands::Deps = cli.command {
        deps::check()?;
        info!("Everything is installed");
        return Ok(());
    }

    let (tx, rx) = mpsc::channel();
    let ended = render(rx);
    let mut manager = Manager::detect(Reporter::new(tx))?;

    let cancel = manager.cancellation();
    ctrlc::set_handler(move || cancel.cancel())?;

    match cli.command {
        Commands::List {
            filter,
            sort,
            reverse,
        } => {
            manager.reconcile();
            manager.sort(sort.into(), reverse);
            list(&manager, &filter);
        }
        Commands::Load { dir } => {
            let count = match dir {
                Some(dir) => manager.load_scripts(&dir),
                None => manager.reload(),
            };
            info!("{count} scripts loaded, {} known", manager.registry().len());
        }
        Commands::Open { file } => match manager.open_file(&file)? {
            Opened::Script(key) => info!("Created {key}"),
            Opened::Restored(restored) => info!(
                "Restored {} with {} scripts",
                restored.target.display(),
                restored.scripts.len()
            ),
        },
        Commands::Script { script, command } => edit(&mut manager, &script, command)?,
        Commands::Launch { script, wait } => {
            let key = manager.key(&script)?;
            let id = manager.launch(&key)?;
            info!("Launched {key} as {id}");
            if wait {
                wait_for(&mut manager, &key, &ended);
            }
        }
        Commands::Terminate { script } => {
            manager.reconcile();
            manager.terminate(&script)?;
        }
        Commands::Backup { script, dest } => manager.backup_prefix(&script, &dest)?,
        Commands::Bottle { script, dest } => manager.create_bottle(&script, &dest)?,
        Commands::Restore { archive } => {
            let restored = manager.restore(&archive)?;
            info!(
                "Restored {} with {} scripts",
                restored.target.display(),
                restored.scripts.len()
            );
        }
        Commands::Template { command } => template(&mut manager, command)?,
        Commands::Runner { command } => runner(&mut manager, command)?,
        Commands::Settings { command } => settings(&mut manager, command)?,
        Commands::Deps => {}
    }

    Ok(())
}

/// Draws progress on a separate thread and passes process events back.
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

/// Blocks until `key` exits or Ctrl+C is pressed, then picks up any shortcuts an
/// installer left behind.
fn wait_for(manager: &mut Manager, key: &str, ended: &Receiver<Event>) {
    let cancel = manager.cancellation();
    while !cancel.is_cancelled() {
        let Ok(event) = ended.recv_timeout(POLL) else {
            continue;
        };
        for added in manager.handle_event(&event) {
            info!("Added shortcut {added}");
        }
        if matches!(&event, Event::ProcessEnded { key: k } if k == key) {
            return;
        }
    }
    info!("Stopped waiting, the program keeps running");
}

fn list(manager: &Manager, filter: &str) {
    let running = manager.supervisor().running();
    for script in manager.registry().filter(filter) {
        let marker = if running.contains(&script.sha256sum) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {} {:<32} {}",
            script.short_hash(),
            script.progname,
            script.wineprefix.display()
        );
    }
}

fn edit(manager: &mut Manager, query: &str, command: ScriptCommand) -> Result<(), Error> {
    match command {
        ScriptCommand::Show => print!("{}", manager.script(query)?.to_yaml()),
        ScriptCommand::Rename { name } => manager.rename(query, &name)?,
        ScriptCommand::Env { vars } => manager.set_env_vars(query, &vars)?,
        ScriptCommand::Args { args } => manager.set_args(query, &args)?,
        ScriptCommand::Runner { runner } => manager.set_runner(query, &runner)?,
        ScriptCommand::Reset => {
            let key = manager.reset(query)?;
            info!("Reset {key}");
        }
        ScriptCommand::ClearLog => manager.clear_log(query)?,
        ScriptCommand::Harvest => {
            let prefix = manager.script(query)?.wineprefix.clone();
            for key in manager.harvest(&prefix) {
                info!("Added shortcut {key}");
            }
        }
        ScriptCommand::Delete => manager.delete(query)?,
        ScriptCommand::DeletePrefix => manager.delete_prefix(query)?,
    }
    Ok(())
}

fn template(manager: &mut Manager, command: TemplateCommand) -> Result<(), Error> {
    match command {
        TemplateCommand::List => {
            let current = manager.settings().template_path();
            for template in manager.templates() {
                let marker = if template.dir == current { "*" } else { " " };
                let arch = template.arch.map_or("?", Arch::as_str);
                println!("{marker} {:<6} {}", arch, template.dir.display());
            }
        }
        TemplateCommand::Init { arch } => match manager.init_template(arch)? {
            Some(initialized) => info!("Template for {arch} is ready ({initialized:?})"),
            None => info!("Template for {arch} already exists"),
        },
        TemplateCommand::Clone { source, name } => {
            created(&manager.clone_template(&source, &name)?);
        }
        TemplateCommand::Import { source } => created(&manager.import_template(&source)?),
        TemplateCommand::Backup { dir, dest } => manager.backup_template(&dir, &dest)?,
        TemplateCommand::Delete { dir } => manager.delete_template(&dir)?,
        TemplateCommand::Set { dir } => manager.set_template(&dir)?,
    }
    Ok(())
}

fn runner(manager: &mut Manager, command: RunnerCommand) -> Result<(), Error> {
    match command {
        RunnerCommand::List => {
            let current = manager.settings().runner_path();
            for runner in manager.runners() {
                let marker = if current.as_ref() == Some(&runner.wine) {
                    "*"
                } else {
                    " "
                };
                let arch = runner.arch.map_or("?", Arch::as_str);
                println!("{marker} {:<6} {:<40} {}", arch, runner.name, runner.wine.display());
            }
        }
        RunnerCommand::Import { source } => created(&manager.import_runner(&source)?),
        RunnerCommand::Backup { dir, dest } => manager.backup_runner(&dir, &dest)?,
        RunnerCommand::Restore { archive } => created(&manager.restore_runner(&archive)?),
        RunnerCommand::Delete { dir } => manager.delete_runner(&dir)?,
        RunnerCommand::Catalog { refresh } => {
            let catalog = manager.catalog(refresh)?;
            for variant in Variant::ALL {
                println!("{variant}:");
                for entry in catalog.entries(variant) {
                    println!("  {}", entry.name);
                }
            }
        }
        RunnerCommand::Download { name } => created(&manager.download_runner(&name)?),
        RunnerCommand::Default { wine } => manager.set_default_runner(wine.as_deref())?,
    }
    Ok(())
}

fn settings(manager: &mut Manager, command: Option<SettingsCommand>) -> Result<(), Error> {
    match command {
        None => {
            let settings = manager.settings();
            println!("template: {}", settings.template);
            println!("arch: {}", settings.arch);
            println!("runner: {}", settings.runner.as_deref().unwrap_or(""));
            println!("wine_debug: {}", settings.wine_debug);
            println!("env_vars: {}", settings.env_vars);
            println!("single-prefix: {}", settings.single_prefix);
        }
        Some(SettingsCommand::Arch { arch }) => {
            if let Some(initialized) = manager.set_arch(arch)? {
                info!("Built template for {arch} ({initialized:?})");
            }
        }
        Some(SettingsCommand::SinglePrefix { enabled }) => manager.set_single_prefix(enabled)?,
        Some(SettingsCommand::WineDebug { value }) => {
            manager.update_settings(|s| s.wine_debug = value.trim().to_owned())?;
        }
        Some(SettingsCommand::EnvVars { value }) => {
            charm_cfg::parse_env_vars(&value).map_err(charm_wine::Error::from)?;
            manager.update_settings(|s| s.env_vars = value.trim().to_owned())?;
        }
    }
    Ok(())
}

fn created(path: &Path) {
    info!("Created {}", path.display());
}
