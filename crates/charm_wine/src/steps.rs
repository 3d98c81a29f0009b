use log::info;

use crate::{process, Cancellation, Event, Reporter};

/// Runs the named steps of one operation in order, reporting progress and honouring
/// cancellation between steps.
pub(crate) struct Steps<'a> {
    total: usize,
    index: usize,
    cancel: &'a Cancellation,
    reporter: &'a Reporter,
}

impl<'a> Steps<'a> {
    pub fn new(total: usize, cancel: &'a Cancellation, reporter: &'a Reporter) -> Self {
        Self {
            total,
            index: 0,
            cancel,
            reporter,
        }
    }

    pub fn run<T, E>(&mut self, name: &str, step: impl FnOnce() -> Result<T, E>) -> Result<T, E>
    where
        E: From<process::Error>,
    {
        if self.cancel.is_cancelled() {
            self.reporter.send(Event::Cancelled);
            return Err(process::Error::Cancelled.into());
        }

        self.index += 1;
        info!("[{}/{}] {name}", self.index, self.total);
        self.reporter.send(Event::StepStarted {
            index: self.index,
            total: self.total,
            name: name.to_owned(),
        });

        let result = step();

        if result.is_err() && self.cancel.is_cancelled() {
            self.reporter.send(Event::Cancelled);
        } else if result.is_ok() {
            self.reporter.send(Event::StepFinished {
                index: self.index,
                total: self.total,
            });
        }

        result
    }
}
