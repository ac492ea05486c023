use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use ckan_core::Reporter;
use crossterm::QueueableCommand;
use crossterm::cursor::MoveToColumn;
use crossterm::style::Stylize;
use crossterm::terminal::{Clear, ClearType};

/// Prints to the terminal and asks questions on stdin.
#[derive(Debug, Default)]
pub struct ConsoleReporter {
    assume_yes: bool,
    /// A progress line is on screen without its newline.
    progress_open: Mutex<bool>,
}

impl ConsoleReporter {
    pub fn new(assume_yes: bool) -> Self {
        Self {
            assume_yes,
            progress_open: Mutex::new(false),
        }
    }

    fn end_progress(&self) {
        if let Ok(mut open) = self.progress_open.lock() {
            if *open {
                eprintln!();
                *open = false;
            }
        }
    }
}

impl Reporter for ConsoleReporter {
    fn info(&self, msg: &str) {
        self.end_progress();
        println!("  {msg}");
    }

    fn warning(&self, msg: &str) {
        self.end_progress();
        eprintln!("  {} {msg}", "warning:".yellow());
    }

    fn error(&self, msg: &str) {
        self.end_progress();
        eprintln!("  {} {msg}", "error:".red().bold());
    }

    fn progress(&self, msg: &str, percent: u8) {
        let Ok(mut open) = self.progress_open.lock() else {
            return;
        };
        let mut err = io::stderr().lock();
        if draw_progress(&mut err, msg, percent).is_ok() {
            *open = percent < 100;
        }
    }

    fn confirm(&self, question: &str) -> bool {
        self.end_progress();
        if self.assume_yes {
            println!("  {question} [y/N] y");
            return true;
        }
        print!("  {question} [y/N] ");
        if io::stdout().flush().is_err() {
            return false;
        }
        let mut input = String::new();
        match io::stdin().lock().read_line(&mut input) {
            Ok(_) => matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }

    fn downloads_completed(&self, succeeded: usize, failed: usize) {
        self.end_progress();
        if failed == 0 {
            println!("  Downloaded {succeeded} file(s)");
        } else {
            eprintln!("  Downloaded {succeeded} file(s), {failed} failed");
        }
    }
}

/// Redraw the progress line in place. A finished line gets its newline.
fn draw_progress<W: Write>(out: &mut W, msg: &str, percent: u8) -> io::Result<()> {
    out.queue(MoveToColumn(0))?.queue(Clear(ClearType::CurrentLine))?;
    write!(out, "  {msg} [{percent:>3}%]")?;
    if percent >= 100 {
        writeln!(out)?;
    }
    out.flush()
}
