//! Host programs the manager shells out to.

use log::debug;

pub const REQUIRED: [&str; 7] = [
    "exiftool",
    "wine",
    "winetricks",
    "wrestool",
    "icotool",
    "pgrep",
    "xdg-open",
];

/// Any one of these is enough.
pub const TERMINALS: [&str; 6] = [
    "gnome-terminal",
    "konsole",
    "xfce4-terminal",
    "kitty",
    "alacritty",
    "xterm",
];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Missing required programs: {}", .0.join(", "))]
    Missing(Vec<String>),
}

/// Fails with every missing program at once.
pub fn check() -> Result<(), Error> {
    check_with(|program| which::which(program).is_ok())
}

fn check_with(found: impl Fn(&str) -> bool) -> Result<(), Error> {
    let mut missing = REQUIRED
        .iter()
        .filter(|p| !found(p))
        .map(|p| (*p).to_owned())
        .collect::<Vec<_>>();

    if !TERMINALS.iter().any(|t| found(t)) {
        missing.push(format!("a terminal emulator ({})", TERMINALS.join(", ")));
    }

    debug!("Missing programs: {missing:?}");
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::Missing(missing))
    }
}
