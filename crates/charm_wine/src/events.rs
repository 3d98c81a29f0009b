use std::sync::mpsc::Sender;

use indicatif::{ProgressBar, ProgressFinish, ProgressStyle};
use log::{error, info, trace};

/// Progress and lifecycle notifications for whoever drives the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StepStarted {
        index: usize,
        total: usize,
        name: String,
    },
    StepFinished {
        index: usize,
        total: usize,
    },
    /// Fraction of the current step, in `0.0..=1.0`.
    Fraction(f64),
    /// Indeterminate progress tick.
    Pulse,
    Cancelled,
    ProcessStarted {
        key: String,
    },
    ProcessEnded {
        key: String,
    },
    ProcessFailed {
        key: String,
        code: i32,
        log_tail: String,
    },
    Dialog {
        title: String,
        body: String,
    },
}

/// Cloneable sending half of the event channel. A reporter without a channel drops
/// everything, which is what the command line tools and tests use.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    tx: Option<Sender<Event>>,
}

impl Reporter {
    #[must_use]
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    #[must_use]
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn send(&self, event: Event) {
        trace!("Event: {event:?}");
        if let Some(tx) = &self.tx {
            // The receiver going away only means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }

    pub fn fraction(&self, fraction: f64) {
        self.send(Event::Fraction(fraction.clamp(0.0, 1.0)));
    }

    pub fn pulse(&self) {
        self.send(Event::Pulse);
    }

    pub fn dialog(&self, title: impl Into<String>, body: impl Into<String>) {
        self.send(Event::Dialog {
            title: title.into(),
            body: body.into(),
        });
    }
}

const FRACTION_STEPS: u64 = 1000;

/// Renders engine events on the terminal: one bar per step, plus log lines for process
/// and dialog events.
#[derive(Debug, Default)]
pub struct ProgressView {
    bar: Option<ProgressBar>,
}

impl ProgressView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, event: &Event) {
        match event {
            Event::StepStarted { index, total, name } => {
                self.finish();
                let bar = ProgressBar::new_spinner()
                    .with_message(format!("[{index}/{total}] {name}"))
                    .with_finish(ProgressFinish::AndClear);
                self.bar = Some(charm_download::mp().add(bar));
            }
            Event::StepFinished { .. } => self.finish(),
            Event::Fraction(fraction) => {
                if let Some(bar) = &self.bar {
                    if bar.length().is_none() {
                        bar.set_length(FRACTION_STEPS);
                        if let Ok(style) =
                            ProgressStyle::with_template("{spinner:.green} [{wide_bar:.cyan/blue}] {percent}% {msg}")
                        {
                            bar.set_style(style.progress_chars("#>-"));
                        }
                    }
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    bar.set_position((fraction * FRACTION_STEPS as f64) as u64);
                }
            }
            Event::Pulse => {
                if let Some(bar) = &self.bar {
                    bar.tick();
                }
            }
            Event::Cancelled => {
                self.finish();
                info!("Cancelled");
            }
            Event::ProcessStarted { key } => info!("Started {}", short(key)),
            Event::ProcessEnded { key } => info!("{} exited", short(key)),
            Event::ProcessFailed {
                key,
                code,
                log_tail,
            } => error!("{} exited with code {code}. Log tail:\n{log_tail}", short(key)),
            Event::Dialog { title, body } => info!("{title}: {body}"),
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_using_style();
        }
    }
}

fn short(key: &str) -> &str {
    key.get(..10).unwrap_or(key)
}
