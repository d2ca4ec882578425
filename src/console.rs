/// Operator-facing terminal output: notices, banners and forwarded child output.
///
/// Diagnostics go through `tracing`; this is only what the operator is meant to read.
use std::io::{IsTerminal, Write};

const CYAN: &str = "\x1b[36m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const BRIGHT_WHITE: &str = "\x1b[97m";
const RESET: &str = "\x1b[0m";

/// Erase scrollback, erase screen, home the cursor.
const CLEAR: &str = "\x1b[3J\x1b[2J\x1b[1J\x1b[H";

pub trait Console {
    fn clear(&self);
    fn notice(&self, msg: &str);
    fn warning(&self, msg: &str);
    fn error(&self, msg: &str);
    /// Delimits one run of the child from the next.
    fn banner(&self, msg: &str);
    fn child_stdout(&self, line: &str);
    fn child_stderr(&self, line: &str);
}

/// The real terminal.
#[derive(Debug, Clone)]
pub struct Terminal {
    color: bool,
}

impl Terminal {
    /// Color is used only when requested and stdout is a terminal.
    pub fn new(color: bool) -> Self {
        Self {
            color: color && std::io::stdout().is_terminal(),
        }
    }

    fn paint(&self, color: &str, msg: &str) -> String {
        if self.color {
            format!("{color}{msg}{RESET}")
        } else {
            msg.to_string()
        }
    }
}

impl Console for Terminal {
    fn clear(&self) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(CLEAR.as_bytes());
        let _ = out.flush();
    }

    fn notice(&self, msg: &str) {
        println!("{}", self.paint(CYAN, msg));
    }

    fn warning(&self, msg: &str) {
        eprintln!("{}", self.paint(YELLOW, msg));
    }

    fn error(&self, msg: &str) {
        eprintln!("{}", self.paint(RED, msg));
    }

    fn banner(&self, msg: &str) {
        println!("{}", self.paint(BRIGHT_WHITE, &format!("── {msg} ──")));
    }

    fn child_stdout(&self, line: &str) {
        println!("{line}");
    }

    fn child_stderr(&self, line: &str) {
        eprintln!("{line}");
    }
}

#[cfg(test)]
pub use recording::{Line, RecordingConsole};
