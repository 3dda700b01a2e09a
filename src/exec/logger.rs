//! Logger backends for run progress.
//!
//! Three presentations of the same state transitions: plain lines
//! (`--simple-log`, `--verbose`), CI group markers (`--github-actions`), and
//! an in-place table redraw on a TTY (the default).

use std::io::Write;
use std::sync::Mutex;
use std::time::Instant;

use crate::core::graph::NodeKey;

/// Terminal outcome of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Done,
    Failed,
    Restored,
    Cancelled,
}

/// Observer of scheduler state transitions.
///
/// `group_start`/`group_end` bracket a node's streamed output and are only
/// meaningful for backends that stream (CI groups).
pub trait ExecLogger: Send + Sync {
    fn run_started(&self, run_id: &str, total: usize);
    fn node_started(&self, key: &NodeKey);
    fn node_finished(&self, key: &NodeKey, outcome: NodeOutcome, duration_seconds: f64);
    fn group_start(&self, _key: &NodeKey) {}
    fn group_end(&self, _key: &NodeKey) {}
    /// Free-form line printed after execution (restored summary, totals).
    fn summary(&self, line: &str);
}

/// Minimal ANSI styling helper honoring `--no-color`.
#[derive(Debug, Clone, Copy)]
pub struct Style {
    pub enabled: bool,
}

impl Style {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    pub fn dim(&self, text: &str) -> String {
        self.paint("2", text)
    }

    pub fn cyan(&self, text: &str) -> String {
        self.paint("36", text)
    }

    pub fn green(&self, text: &str) -> String {
        self.paint("32", text)
    }

    pub fn red(&self, text: &str) -> String {
        self.paint("31", text)
    }

    pub fn yellow(&self, text: &str) -> String {
        self.paint("33", text)
    }
}

pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else {
        let minutes = (seconds / 60.0) as u64;
        format!("{minutes}m {:.0}s", seconds % 60.0)
    }
}

/// Plain line-oriented logger.
pub struct SimpleLogger {
    style: Style,
}

impl SimpleLogger {
    pub fn new(style: Style) -> Self {
        Self { style }
    }
}

impl ExecLogger for SimpleLogger {
    fn run_started(&self, run_id: &str, total: usize) {
        println!(
            "{} {} {}",
            self.style.dim("run"),
            self.style.cyan(run_id),
            self.style.dim(&format!("({total} action(s))"))
        );
    }

    fn node_started(&self, key: &NodeKey) {
        println!(
            "{} {}",
            self.style.dim("start:"),
            self.style.cyan(&key.label())
        );
    }

    fn node_finished(&self, key: &NodeKey, outcome: NodeOutcome, duration_seconds: f64) {
        let duration = format_duration(duration_seconds);
        match outcome {
            NodeOutcome::Done => println!(
                "{} {} {}",
                self.style.green("done:"),
                self.style.cyan(&key.label()),
                self.style.dim(&format!("({duration})"))
            ),
            NodeOutcome::Failed => println!(
                "{} {} {}",
                self.style.red("failed:"),
                self.style.cyan(&key.label()),
                self.style.dim(&format!("({duration})"))
            ),
            NodeOutcome::Restored => println!(
                "{} {} {}",
                self.style.green("done:"),
                self.style.cyan(&key.label()),
                self.style.dim(&format!("({duration}) (restored)"))
            ),
            NodeOutcome::Cancelled => println!(
                "{} {}",
                self.style.yellow("cancelled:"),
                self.style.cyan(&key.label())
            ),
        }
    }

    fn summary(&self, line: &str) {
        println!("{line}");
    }
}

/// GitHub Actions logger: wraps each node's streamed output in
/// `::group::<node-id>` / `::endgroup::` markers.
pub struct GithubLogger;

impl ExecLogger for GithubLogger {
    fn run_started(&self, run_id: &str, total: usize) {
        println!("run {run_id} ({total} action(s))");
    }

    fn node_started(&self, _key: &NodeKey) {
        // Group markers replace start lines.
    }

    fn node_finished(&self, key: &NodeKey, outcome: NodeOutcome, duration_seconds: f64) {
        let duration = format_duration(duration_seconds);
        match outcome {
            NodeOutcome::Done => println!("done: {} ({duration})", key.label()),
            NodeOutcome::Failed => println!("failed: {} ({duration})", key.label()),
            NodeOutcome::Restored => println!("done: {} ({duration}) (restored)", key.label()),
            NodeOutcome::Cancelled => println!("cancelled: {}", key.label()),
        }
    }

    fn group_start(&self, key: &NodeKey) {
        println!("::group::{}", key.dir_name());
        let _ = std::io::stdout().flush();
    }

    fn group_end(&self, _key: &NodeKey) {
        println!("::endgroup::");
        let _ = std::io::stdout().flush();
    }

    fn summary(&self, line: &str) {
        println!("{line}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowState {
    Pending,
    Running,
    Done,
    Failed,
    Restored,
    Cancelled,
}

struct TableState {
    rows: Vec<(NodeKey, RowState, Option<f64>)>,
    drawn_lines: usize,
    started: Instant,
}

/// Dynamic table logger: redraws one row per planned node in place.
///
/// Only sensible on a TTY; the engine falls back to [`SimpleLogger`]
/// elsewhere.
pub struct LiveTableLogger {
    style: Style,
    state: Mutex<TableState>,
}

impl LiveTableLogger {
    pub fn new(style: Style, order: &[NodeKey]) -> Self {
        Self {
            style,
            state: Mutex::new(TableState {
                rows: order
                    .iter()
                    .map(|k| (k.clone(), RowState::Pending, None))
                    .collect(),
                drawn_lines: 0,
                started: Instant::now(),
            }),
        }
    }

    fn redraw(&self, state: &mut TableState) {
        let mut out = std::io::stdout().lock();
        if state.drawn_lines > 0 {
            // Move the cursor back over the previous frame and clear it.
            let _ = write!(out, "\x1b[{}A\x1b[J", state.drawn_lines);
        }
        for (key, row_state, duration) in &state.rows {
            let status = match row_state {
                RowState::Pending => self.style.dim("·"),
                RowState::Running => self.style.yellow("▸"),
                RowState::Done => self.style.green("✓"),
                RowState::Failed => self.style.red("✗"),
                RowState::Restored => self.style.green("↻"),
                RowState::Cancelled => self.style.yellow("−"),
            };
            let timing = match duration {
                Some(seconds) => self.style.dim(&format!(" ({})", format_duration(*seconds))),
                None => String::new(),
            };
            let _ = writeln!(out, " {status} {}{timing}", key.label());
        }
        let elapsed = state.started.elapsed().as_secs_f64();
        let _ = writeln!(out, " {}", self.style.dim(&format!("elapsed {}", format_duration(elapsed))));
        state.drawn_lines = state.rows.len() + 1;
        let _ = out.flush();
    }

    fn update(&self, key: &NodeKey, new_state: RowState, duration: Option<f64>) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        // Promoted nodes were not in the plan order; append their row.
        if !state.rows.iter().any(|(k, _, _)| k == key) {
            state.rows.push((key.clone(), RowState::Pending, None));
        }
        for (k, row_state, row_duration) in &mut state.rows {
            if k == key {
                *row_state = new_state;
                *row_duration = duration;
            }
        }
        self.redraw(&mut state);
    }
}

impl ExecLogger for LiveTableLogger {
    fn run_started(&self, run_id: &str, _total: usize) {
        println!("{} {}", self.style.dim("run"), self.style.cyan(run_id));
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        self.redraw(&mut state);
    }

    fn node_started(&self, key: &NodeKey) {
        self.update(key, RowState::Running, None);
    }

    fn node_finished(&self, key: &NodeKey, outcome: NodeOutcome, duration_seconds: f64) {
        let row_state = match outcome {
            NodeOutcome::Done => RowState::Done,
            NodeOutcome::Failed => RowState::Failed,
            NodeOutcome::Restored => RowState::Restored,
            NodeOutcome::Cancelled => RowState::Cancelled,
        };
        self.update(key, row_state, Some(duration_seconds));
    }

    fn summary(&self, line: &str) {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_format_like_the_run_log() {
        assert_eq!(format_duration(1.25), "1.2s");
        assert_eq!(format_duration(59.94), "59.9s");
        assert_eq!(format_duration(75.0), "1m 15s");
    }

    #[test]
    fn disabled_style_emits_plain_text() {
        let style = Style::new(false);
        assert_eq!(style.red("x"), "x");
        assert_eq!(style.dim("y"), "y");
    }

    #[test]
    fn enabled_style_wraps_with_escape_codes() {
        let style = Style::new(true);
        assert_eq!(style.green("ok"), "\x1b[32mok\x1b[0m");
    }
}
