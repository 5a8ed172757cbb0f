use std::io::{self, BufRead, Write};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::warn;

use super::calibration::{CalibrationEvent, CalibrationInput, ManualCalibration};

/// Manual calibration from a line-based terminal: `x y` marks a point, `u`
/// undoes, `r` resets, `q` aborts, an empty line confirms. End of input
/// aborts.
pub struct TerminalCalibration<R, W> {
    input: R,
    output: W,
}

impl TerminalCalibration<io::StdinLock<'static>, io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> TerminalCalibration<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn read_line(&mut self, prompt: &str) -> Option<String> {
        let _ = write!(self.output, "{} > ", prompt);
        let _ = self.output.flush();
        let mut line = String::new();
        match blocking(|| self.input.read_line(&mut line)) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }
}

impl<R: BufRead, W: Write> CalibrationInput for TerminalCalibration<R, W> {
    fn card_count(&mut self, default: usize) -> usize {
        let prompt = format!("How many cards are on the page? [{}]", default);
        let line = self.read_line(&prompt);
        parse_card_count(line.as_deref(), default)
    }

    fn next_event(&mut self, session: &ManualCalibration) -> CalibrationEvent {
        loop {
            let Some(line) = self.read_line(&session.prompt()) else {
                return CalibrationEvent::Abort;
            };
            match parse_event(&line) {
                Some(event) => return event,
                None => warn!("Expected `x y`, u, r, q or an empty line; got {:?}", line),
            }
        }
    }
}

/// Anything but a whole number of at least one keeps `default`.
pub fn parse_card_count(line: Option<&str>, default: usize) -> usize {
    line.and_then(|line| line.trim().parse::<usize>().ok())
        .filter(|&count| count >= 1)
        .unwrap_or(default)
}

pub fn parse_event(line: &str) -> Option<CalibrationEvent> {
    match line.trim() {
        "" => return Some(CalibrationEvent::Confirm),
        "u" => return Some(CalibrationEvent::Undo),
        "r" => return Some(CalibrationEvent::Reset),
        "q" => return Some(CalibrationEvent::Abort),
        _ => {}
    }

    let mut parts = line.split_whitespace().map(str::parse::<u32>);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(Ok(x)), Some(Ok(y)), None) => Some(CalibrationEvent::Point { x, y }),
        _ => None,
    }
}

/// Runs a blocking read without stalling other tasks on a multi-threaded
/// runtime. `block_in_place` is unavailable on the current-thread runtime.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}
