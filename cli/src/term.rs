//! Single-line transfer status on stderr, so stdout stays clean for URLs
//! and `--stdout` payloads.

use {
    crossterm::{
        cursor,
        style::{Color, ResetColor, SetForegroundColor},
        terminal,
        tty::IsTty,
        QueueableCommand,
    },
    kasta_sdk::progress::{NoProgress, Progress},
    once_cell::sync::Lazy,
    parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex},
    std::{
        fmt::Display,
        io::{Stderr, Write},
        sync::Arc,
    },
};

struct Term {
    stderr: Stderr,
    current_status: Option<String>,
}

fn term() -> ArcMutexGuard<RawMutex, Term> {
    static TERM: Lazy<Arc<Mutex<Term>>> = Lazy::new(|| {
        Arc::new(Mutex::new(Term {
            stderr: std::io::stderr(),
            current_status: None,
        }))
    });
    Mutex::lock_arc(&TERM)
}

pub fn set_status(status: impl Display) {
    term().set_status(status);
}

pub fn clear_status() {
    term().clear_status();
}

impl Term {
    fn set_status(&mut self, status: impl Display) {
        let status = status.to_string();
        if self.current_status.is_none() {
            self.stderr.queue(cursor::Hide).unwrap();
            self.stderr.queue(terminal::DisableLineWrap).unwrap();
        } else {
            self.stderr.queue(cursor::RestorePosition).unwrap();
            self.stderr
                .queue(terminal::Clear(terminal::ClearType::FromCursorDown))
                .unwrap();
        }
        self.stderr.queue(cursor::SavePosition).unwrap();
        self.stderr
            .queue(SetForegroundColor(Color::DarkGreen))
            .unwrap();
        self.stderr.write_all(status.as_bytes()).unwrap();
        self.stderr.queue(ResetColor).unwrap();
        self.stderr.queue(cursor::RestorePosition).unwrap();
        self.stderr.flush().unwrap();
        self.current_status = Some(status);
    }

    fn clear_status(&mut self) {
        if self.current_status.is_none() {
            return;
        }

        self.stderr.queue(cursor::RestorePosition).unwrap();
        self.stderr
            .queue(terminal::Clear(terminal::ClearType::FromCursorDown))
            .unwrap();
        self.stderr.queue(terminal::EnableLineWrap).unwrap();
        self.stderr.queue(cursor::Show).unwrap();
        self.stderr.flush().unwrap();

        self.current_status = None;
    }
}

const BAR_WIDTH: usize = 30;

struct TermProgress {
    label: String,
}

impl Progress for TermProgress {
    fn report(&self, current: u64, total: u64) {
        set_status(render_status(&self.label, current, total));
    }

    fn finish(&self) {
        clear_status();
    }
}

/// Returns a status-line progress sink for `label`, or a silent one when
/// stderr is not a terminal.
pub fn progress(label: impl Into<String>) -> Arc<dyn Progress> {
    if std::io::stderr().is_tty() {
        Arc::new(TermProgress {
            label: label.into(),
        })
    } else {
        Arc::new(NoProgress)
    }
}

fn render_status(label: &str, current: u64, total: u64) -> String {
    if total == 0 {
        return format!("{label}: {}", pretty_size(current));
    }
    let filled = (current as f64 / total as f64 * BAR_WIDTH as f64) as usize;
    let filled = filled.min(BAR_WIDTH);
    format!(
        "{label}: [{}{}] {} / {}",
        "=".repeat(filled),
        " ".repeat(BAR_WIDTH - filled),
        pretty_size(current),
        pretty_size(total),
    )
}

pub fn pretty_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{size} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
