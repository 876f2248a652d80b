//! Single-line dot progress bar.
//!
//! Rendering happens on a dedicated thread fed by a private channel, so the
//! hub never blocks on the terminal. Substep glyphs are rate limited to one
//! per second and wrap a fixed-width sub-bar; an idle thread prints a neutral
//! pulse for liveness. Only the done frame stops the thread.

use std::io::{self, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use junction_common::protocol::StepStatus;

const SUBBAR_WIDTH: usize = 25;
const MAX_PULSES: usize = 10;
const SUBSTEP_MIN_INTERVAL: Duration = Duration::from_secs(1);

const GREEN: &str = "\x1b[32m";
const GREY: &str = "\x1b[90m";
const CYAN: &str = "\x1b[36m";
const YELLOW: &str = "\x1b[33m";
const WHITE: &str = "\x1b[97m";
const RESET: &str = "\x1b[0m";

enum Frame {
    Update(String),
    Done(String),
}

pub struct ProgressBar {
    tx: Sender<Frame>,
    thread: Option<JoinHandle<()>>,
    substep_cnt: usize,
    last_substep: Instant,
}

impl ProgressBar {
    pub fn start(interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel();
        let thread = thread::spawn(move || render_loop(rx, interval));
        Self {
            tx,
            thread: Some(thread),
            substep_cnt: 0,
            // let the first substep paint immediately
            last_substep: Instant::now()
                .checked_sub(SUBSTEP_MIN_INTERVAL)
                .unwrap_or_else(Instant::now),
        }
    }

    pub fn substep_ignored(&mut self) {
        if let Some(glyph) = self.substep_glyph(GREY) {
            self.push(glyph);
        }
    }

    pub fn substep_completed(&mut self) {
        if let Some(glyph) = self.substep_glyph(GREEN) {
            self.push(glyph);
        }
    }

    pub fn step_completed(&mut self, status: StepStatus) {
        let mut update = erase(self.substep_cnt);
        self.substep_cnt = 0;
        update.push_str(step_glyph(status));
        self.push(update);
    }

    /// Final summary; joins the render thread.
    pub fn done(mut self, summary: &str) {
        let update = format!("{}{GREEN}]{RESET} {summary}\n", erase(self.substep_cnt));
        let _ = self.tx.send(Frame::Done(update));
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn substep_glyph(&mut self, color: &str) -> Option<String> {
        if self.last_substep.elapsed() < SUBSTEP_MIN_INTERVAL {
            return None;
        }
        let glyph = if self.substep_cnt == SUBBAR_WIDTH {
            self.substep_cnt = 0;
            format!("{}{color}.{RESET}", erase(SUBBAR_WIDTH))
        } else {
            format!("{color}.{RESET}")
        };
        self.substep_cnt += 1;
        self.last_substep = Instant::now();
        Some(glyph)
    }

    fn push(&self, update: String) {
        let _ = self.tx.send(Frame::Update(update));
    }
}

fn erase(n: usize) -> String {
    "\x08 \x08".repeat(n)
}

fn step_glyph(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Complete => "\x1b[32m#\x1b[0m",
        StepStatus::Skipped => "\x1b[90m#\x1b[0m",
        StepStatus::Partial => "\x1b[36m#\x1b[0m",
        StepStatus::Untracked => "\x1b[33m#\x1b[0m",
    }
}

fn render_loop(rx: Receiver<Frame>, interval: Duration) {
    let mut stderr = io::stderr();
    let _ = write!(stderr, "{GREEN}[{RESET}");
    let _ = stderr.flush();

    let mut pulses = 0usize;
    loop {
        match rx.recv_timeout(interval) {
            Ok(Frame::Update(update)) => {
                let _ = write!(stderr, "{}{}", erase(pulses), update);
                pulses = 0;
            }
            Ok(Frame::Done(update)) => {
                let _ = write!(stderr, "{}{}", erase(pulses), update);
                let _ = stderr.flush();
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                // liveness pulse, no control-flow meaning
                if pulses == MAX_PULSES {
                    let _ = write!(stderr, "{}", erase(pulses));
                    pulses = 0;
                } else {
                    let _ = write!(stderr, "{WHITE}.{RESET}");
                    pulses += 1;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
        let _ = stderr.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bar without a render thread; frames land in the returned receiver.
    fn detached() -> (ProgressBar, Receiver<Frame>) {
        let (tx, rx) = mpsc::channel();
        let bar = ProgressBar {
            tx,
            thread: None,
            substep_cnt: 0,
            last_substep: Instant::now()
                .checked_sub(SUBSTEP_MIN_INTERVAL)
                .unwrap_or_else(Instant::now),
        };
        (bar, rx)
    }

    fn force_stale(bar: &mut ProgressBar) {
        bar.last_substep = Instant::now()
            .checked_sub(SUBSTEP_MIN_INTERVAL + Duration::from_secs(1))
            .unwrap_or_else(Instant::now);
    }

    #[test]
    fn substeps_are_rate_limited() {
        let (mut bar, rx) = detached();
        bar.substep_completed();
        bar.substep_completed(); // within the same second, dropped
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sub_bar_wraps_at_width() {
        let (mut bar, rx) = detached();
        for _ in 0..SUBBAR_WIDTH {
            force_stale(&mut bar);
            bar.substep_completed();
        }
        for _ in 0..SUBBAR_WIDTH {
            match rx.try_recv().expect("glyph") {
                Frame::Update(update) => assert!(!update.contains('\x08')),
                Frame::Done(_) => panic!("unexpected done frame"),
            }
        }

        // the wrapping glyph erases the full sub-bar first
        force_stale(&mut bar);
        bar.substep_completed();
        match rx.try_recv().expect("glyph") {
            Frame::Update(update) => {
                assert_eq!(update.matches('\x08').count(), SUBBAR_WIDTH * 2);
            }
            Frame::Done(_) => panic!("unexpected done frame"),
        }
        assert_eq!(bar.substep_cnt, 1);
    }

    #[test]
    fn step_glyph_colors_track_status() {
        assert!(step_glyph(StepStatus::Complete).contains("[32m"));
        assert!(step_glyph(StepStatus::Skipped).contains("[90m"));
        assert!(step_glyph(StepStatus::Partial).contains("[36m"));
        assert!(step_glyph(StepStatus::Untracked).contains("[33m"));
    }

    #[test]
    fn step_completion_erases_the_sub_bar() {
        let (mut bar, rx) = detached();
        force_stale(&mut bar);
        bar.substep_completed();
        let _ = rx.try_recv();

        bar.step_completed(StepStatus::Complete);
        match rx.try_recv().expect("step glyph") {
            Frame::Update(update) => {
                assert!(update.starts_with("\x08 \x08"));
                assert!(update.ends_with("#\x1b[0m"));
            }
            Frame::Done(_) => panic!("unexpected done frame"),
        }
        assert_eq!(bar.substep_cnt, 0);
    }
}
