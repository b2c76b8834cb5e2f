//! Trajectory loop detection
//!
//! A pure state machine over the transcript: assistant messages update
//! the last-command state, user observations update streak counters and
//! yield a directive (warnings to inject, or an abort reason). The
//! detector never touches the filesystem; the driver feeds it the
//! current diff signature.

use std::sync::LazyLock;

use regex::Regex;

use crate::config::RunConfig;

/// Normalized commands are capped so pathological one-liners don't
/// bloat the comparison state.
const NORMALIZED_CMD_MAX: usize = 400;

/// How many recent commands the import-misuse probe looks at.
const IMPORT_PROBE_WINDOW: usize = 3;

static BASH_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```bash\s*\n(.*?)\n```").unwrap());
static RETURNCODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<returncode>(-?\d+)</returncode>").unwrap());
static INTEGER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d+\b").unwrap());

/// Commands that only read the tree; a long unbroken run of these
/// means the agent is searching instead of editing.
const SEARCH_COMMANDS: [&str; 4] = ["find", "grep", "rg", "ls"];

/// What the driver should do with the observation about to be appended.
#[derive(Debug, Clone, Default)]
pub struct Directive {
    /// `<warning>…</warning>` blocks to prepend to the observation.
    pub warnings: Vec<String>,
    /// Set when the trajectory should terminate (strict policy).
    pub abort: Option<String>,
}

impl Directive {
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty() && self.abort.is_none()
    }
}

/// Streak limits, lifted from the run configuration.
#[derive(Debug, Clone, Copy)]
pub struct LoopLimits {
    pub repeated_fail: u32,
    pub search_streak: u32,
    pub sed_fail: u32,
    pub no_diff_streak: u32,
}

impl LoopLimits {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            repeated_fail: config.repeated_fail_limit,
            search_streak: config.search_streak_limit,
            sed_fail: config.sed_fail_limit,
            no_diff_streak: config.no_diff_streak_limit,
        }
    }
}

/// Rolling per-run detection state.
pub struct LoopDetector {
    limits: LoopLimits,
    /// Host OS name; drives the macOS sed advisory.
    platform: &'static str,

    last_cmd: String,
    command_history: Vec<String>,
    failed_cmd_norm: String,
    failed_cmd_streak: u32,
    search_streak: u32,
    sed_fail_streak: u32,
    no_diff_streak: u32,
    seen_nonempty_diff: bool,
    prev_diff_sig: String,

    format_errors: u32,
    timeouts: u32,
    abort_reason: String,
}

impl LoopDetector {
    /// `initial_sig` is the workspace diff signature before the first
    /// agent step (normally `"EMPTY"`).
    pub fn new(limits: LoopLimits, initial_sig: String) -> Self {
        Self {
            limits,
            platform: std::env::consts::OS,
            last_cmd: String::new(),
            command_history: Vec::new(),
            failed_cmd_norm: String::new(),
            failed_cmd_streak: 0,
            search_streak: 0,
            sed_fail_streak: 0,
            no_diff_streak: 0,
            seen_nonempty_diff: false,
            prev_diff_sig: initial_sig,
            format_errors: 0,
            timeouts: 0,
            abort_reason: String::new(),
        }
    }

    #[cfg(test)]
    pub fn with_platform(mut self, platform: &'static str) -> Self {
        self.platform = platform;
        self
    }

    pub fn format_errors(&self) -> u32 {
        self.format_errors
    }

    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// First abort reason hit this run, empty if none.
    pub fn abort_reason(&self) -> &str {
        &self.abort_reason
    }

    /// Record the assistant's action command for the next observation.
    pub fn observe_assistant(&mut self, content: &str) {
        if let Some(caps) = BASH_BLOCK_RE.captures(content) {
            let cmd = caps[1].trim().to_string();
            self.last_cmd = cmd.clone();
            self.command_history.push(cmd);
        }
    }

    /// Process a user observation.
    ///
    /// Counters for format errors and command timeouts always update;
    /// streak detection only runs when `detect` is set (policy off
    /// disables it). The returned directive carries injected warnings
    /// and, at most once per run, an abort reason.
    pub fn observe_user(&mut self, content: &str, current_sig: &str, detect: bool) -> Directive {
        if content.contains("EXACTLY ONE action") {
            self.format_errors += 1;
            return Directive::default();
        }
        if content.contains("timed out") {
            self.timeouts += 1;
            return Directive::default();
        }
        if !detect {
            return Directive::default();
        }

        let rc = extract_return_code(content);
        let cmd = self.last_cmd.clone();
        let cmd_norm = normalize_command(&cmd);
        let base_cmd = base_command(&cmd);
        let mut warnings = Vec::new();
        let mut abort_reason = String::new();

        if rc != 0 && !cmd_norm.is_empty() {
            if self.failed_cmd_norm == cmd_norm {
                self.failed_cmd_streak += 1;
            } else {
                self.failed_cmd_norm = cmd_norm;
                self.failed_cmd_streak = 1;
            }
            if self.failed_cmd_streak >= self.limits.repeated_fail {
                abort_reason = format!(
                    "repeated_failing_command:{base_cmd} x{}",
                    self.failed_cmd_streak
                );
            }
        } else {
            self.failed_cmd_norm.clear();
            self.failed_cmd_streak = 0;
        }

        if SEARCH_COMMANDS.contains(&base_cmd.as_str()) {
            self.search_streak += 1;
        } else {
            self.search_streak = 0;
        }
        if self.search_streak >= self.limits.search_streak && abort_reason.is_empty() {
            abort_reason = format!("search_only_streak:{}", self.search_streak);
        }

        if cmd.contains("sed -i") && rc != 0 {
            self.sed_fail_streak += 1;
            if !cmd.contains("sed -i ''") && self.platform == "macos" {
                warnings.push(
                    "<warning>macOS sed requires `sed -i '' ...`. \
                     Prefer python-based edits if sed keeps failing.</warning>"
                        .to_string(),
                );
            }
            if self.sed_fail_streak >= self.limits.sed_fail && abort_reason.is_empty() {
                abort_reason = format!("sed_fail_streak:{}", self.sed_fail_streak);
            }
        } else {
            self.sed_fail_streak = 0;
        }

        if current_sig != "EMPTY" {
            self.seen_nonempty_diff = true;
        }
        if self.seen_nonempty_diff {
            if current_sig == self.prev_diff_sig {
                self.no_diff_streak += 1;
            } else {
                self.no_diff_streak = 0;
            }
            if self.no_diff_streak >= self.limits.no_diff_streak && abort_reason.is_empty() {
                abort_reason = format!("no_diff_streak:{}", self.no_diff_streak);
            }
        }
        self.prev_diff_sig = current_sig.to_string();

        let recent_imports = self
            .command_history
            .iter()
            .rev()
            .take(IMPORT_PROBE_WINDOW)
            .filter(|c| c.contains("python3 -c") && c.contains("import "))
            .count();
        if recent_imports >= 2 {
            warnings.push(
                "<warning>STOP importing package modules. Use source files directly \
                 (`cat`, `grep`, `nl`).</warning>"
                    .to_string(),
            );
        }

        let mut abort = None;
        if !abort_reason.is_empty() {
            if self.abort_reason.is_empty() {
                self.abort_reason = abort_reason.clone();
            }
            warnings.push(
                "<warning>Trajectory aborted due to repeated low-signal behavior. \
                 Submit and restart with a different strategy.</warning>"
                    .to_string(),
            );
            abort = Some(abort_reason);
        }

        Directive { warnings, abort }
    }
}

/// Collapse whitespace and mask integers so `sed -n '10,20p'` and
/// `sed -n '30,40p'` compare equal.
pub fn normalize_command(command: &str) -> String {
    if command.trim().is_empty() {
        return String::new();
    }
    let collapsed = command.split_whitespace().collect::<Vec<_>>().join(" ");
    let masked = INTEGER_RE.replace_all(&collapsed, "<N>").to_string();
    masked.chars().take(NORMALIZED_CMD_MAX).collect()
}

/// First token of the command, shell-quoting aware.
fn base_command(command: &str) -> String {
    shlex::split(command)
        .and_then(|parts| parts.into_iter().next())
        .or_else(|| command.split_whitespace().next().map(String::from))
        .unwrap_or_default()
}

/// `<returncode>N</returncode>` from an observation, default 0.
pub fn extract_return_code(observation: &str) -> i32 {
    RETURNCODE_RE
        .captures(observation)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}
