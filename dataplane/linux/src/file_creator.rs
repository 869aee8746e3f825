use crate::exec::{CommandRunner, ExecError};
use npm_dataplane_ipsets::{ApplyError, ErrorKind};
use once_cell::sync::Lazy;
use regex::Regex;

pub const DEFAULT_MAX_TRIES: u8 = 5;

/// `ipset restore` reports the first failing input line on stderr.
static LINE_FAILURE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Error in line (\d+):").expect("line-failure pattern compiles"));

/// How a matched line failure is recovered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Drop the failed line and keep going.
    Continue,
    /// Drop the failed line and every other line in its section.
    ContinueAndAbortSection,
}

/// Associates an stderr pattern with a recovery action for one line. The
/// optional callback fires when the pattern matches, letting callers collect
/// e.g. sets whose destroy was refused.
pub struct ErrorHandler {
    pattern: Regex,
    action: RecoveryAction,
    on_match: Option<Box<dyn FnMut() + Send>>,
}

/// A sequenced list of restore lines grouped into named sections.
///
/// The rendered file is piped to a command that is transactional up to the
/// first failing line: everything before it succeeds and stays applied. On a
/// reported line failure the already-applied prefix and the failing line are
/// excised (plus the failing line's whole section, per its handler) and the
/// remainder is re-run, up to a bounded number of tries. File-level failures
/// matching a registered pattern re-run the same file.
pub struct FileCreator {
    lines: Vec<Line>,
    max_tries: u8,
    tries: u8,
    file_level_patterns: Vec<Regex>,
}

struct Line {
    content: String,
    section: String,
    handlers: Vec<ErrorHandler>,
    omitted: bool,
}

// === impl ErrorHandler ===

impl ErrorHandler {
    pub fn new(pattern: Regex, action: RecoveryAction) -> Self {
        Self {
            pattern,
            action,
            on_match: None,
        }
    }

    pub fn with_callback(
        pattern: Regex,
        action: RecoveryAction,
        on_match: impl FnMut() + Send + 'static,
    ) -> Self {
        Self {
            pattern,
            action,
            on_match: Some(Box::new(on_match)),
        }
    }
}

// === impl FileCreator ===

impl FileCreator {
    pub fn new(max_tries: u8) -> Self {
        Self {
            lines: Vec::new(),
            max_tries: max_tries.max(1),
            tries: 0,
            file_level_patterns: Vec::new(),
        }
    }

    pub fn with_file_level_pattern(mut self, pattern: Regex) -> Self {
        self.file_level_patterns.push(pattern);
        self
    }

    pub fn add_line(&mut self, section: &str, handlers: Vec<ErrorHandler>, items: &[&str]) {
        self.lines.push(Line {
            content: items.join(" "),
            section: section.to_string(),
            handlers,
            omitted: false,
        });
    }

    /// Non-omitted lines remaining.
    pub fn num_lines(&self) -> usize {
        self.lines.iter().filter(|l| !l.omitted).count()
    }

    pub fn tries(&self) -> u8 {
        self.tries
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in self.lines.iter().filter(|l| !l.omitted) {
            out.push_str(&line.content);
            out.push('\n');
        }
        out
    }

    /// Pipes the rendered file to `program`, recovering from line failures
    /// until the file succeeds, nothing is left to run, or the tries are
    /// spent.
    pub fn run(
        &mut self,
        runner: &dyn CommandRunner,
        program: &str,
        args: &[&str],
    ) -> Result<(), ApplyError> {
        loop {
            let file = self.render();
            if file.is_empty() {
                tracing::debug!("every line was excised; nothing left to run");
                return Ok(());
            }

            self.tries += 1;
            let err = match runner.run(program, args, Some(file.as_bytes())) {
                Ok(_) => return Ok(()),
                Err(err) => err,
            };
            tracing::debug!(%program, tries = self.tries, %err, "restore failed");

            if self.tries >= self.max_tries {
                return Err(ApplyError::with_source(
                    ErrorKind::Fatal,
                    format!("{program} failed after {} tries", self.tries),
                    err,
                ));
            }
            match err {
                ExecError::Failed { stderr, .. } => self.recover(&stderr)?,
                err @ ExecError::Io { .. } => {
                    return Err(ApplyError::with_source(
                        ErrorKind::Fatal,
                        format!("failed to invoke {program}"),
                        err,
                    ));
                }
            }
        }
    }

    fn recover(&mut self, stderr: &str) -> Result<(), ApplyError> {
        if let Some(caps) = LINE_FAILURE.captures(stderr) {
            let line_num: usize = caps[1].parse().map_err(|_| {
                ApplyError::new(
                    ErrorKind::Fatal,
                    format!("unparseable failing line number: {stderr}"),
                )
            })?;
            return self.excise(line_num, stderr);
        }
        if self.file_level_patterns.iter().any(|p| p.is_match(stderr)) {
            tracing::info!(%stderr, "file-level failure; re-running");
            return Ok(());
        }
        Err(ApplyError::new(
            ErrorKind::Fatal,
            format!("unrecognized failure: {stderr}"),
        ))
    }

    /// Excises the `line_num`th non-omitted line and the already-applied
    /// prefix before it, then applies the first matching handler's action.
    fn excise(&mut self, line_num: usize, stderr: &str) -> Result<(), ApplyError> {
        let mut seen = 0;
        let mut failed_idx = None;
        for (idx, line) in self.lines.iter().enumerate() {
            if line.omitted {
                continue;
            }
            seen += 1;
            if seen == line_num {
                failed_idx = Some(idx);
                break;
            }
        }
        let Some(failed_idx) = failed_idx else {
            return Err(ApplyError::new(
                ErrorKind::Fatal,
                format!("stderr points past the end of the file: {stderr}"),
            ));
        };

        // Everything before the failing line was applied and must not re-run.
        for line in &mut self.lines[..failed_idx] {
            line.omitted = true;
        }

        let (action, section) = {
            let line = &mut self.lines[failed_idx];
            line.omitted = true;
            let mut chosen = None;
            for handler in &mut line.handlers {
                if handler.pattern.is_match(stderr) {
                    if let Some(on_match) = &mut handler.on_match {
                        on_match();
                    }
                    chosen = Some(handler.action);
                    break;
                }
            }
            let action = chosen.unwrap_or_else(|| {
                tracing::error!(line = %line.content, %stderr, "no handler matched; dropping the line");
                RecoveryAction::Continue
            });
            (action, line.section.clone())
        };

        if action == RecoveryAction::ContinueAndAbortSection {
            tracing::debug!(%section, "aborting section");
            for line in &mut self.lines {
                if line.section == section {
                    line.omitted = true;
                }
            }
        }
        Ok(())
    }
}
