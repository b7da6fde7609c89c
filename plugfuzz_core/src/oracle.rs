use crate::executor::ProcessOutcome;

/// Why an iteration counts as failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The target did not finish within the timeout and was killed.
    Hang,
    /// The target wrote to standard error.
    Stderr(String),
    /// The target exited with a negative status or was killed by a signal.
    NegativeStatus(i32),
    /// Both standard error output and a negative status.
    StderrAndNegativeStatus(String, i32),
}

/// A presumptive crash worth keeping the artifact for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugReport {
    /// What the target did wrong.
    pub kind: FailureKind,
    /// MD5 of the input, used to correlate log lines with retained artifacts.
    pub input_hash: String,
}

impl BugReport {
    /// One-line summary for the log, followed by the target's stderr if any.
    pub fn description(&self) -> String {
        match &self.kind {
            FailureKind::Hang => "target hanged".to_string(),
            FailureKind::Stderr(msg) => format!("target failed with message:\n{msg}"),
            FailureKind::NegativeStatus(code) => {
                format!("target failed with returning code: {code}")
            }
            FailureKind::StderrAndNegativeStatus(msg, code) => {
                format!("target failed with returning code: {code} and message:\n{msg}")
            }
        }
    }
}

/// An `Oracle` decides from a target run whether the input exposed a bug.
///
/// Oracles are shared by reference across iterations and hold no per-run state.
pub trait Oracle: Send + Sync {
    /// Classifies one target run.
    ///
    /// # Arguments
    /// * `input`: the bytes the target was fed. Only used to identify the
    ///   report, never re-run.
    /// * `outcome`: what the bounded wait on the target observed.
    ///
    /// # Returns
    /// `Some(BugReport)` if the run counts as failing and its artifact should
    /// be kept, `None` if it passed.
    fn examine(&self, input: &[u8], outcome: &ProcessOutcome) -> Option<BugReport>;
}

/// Flags hangs, any non-blank standard error output, and negative statuses.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrOrSignalOracle;

impl StderrOrSignalOracle {
    pub fn new() -> Self {
        StderrOrSignalOracle
    }
}

impl Oracle for StderrOrSignalOracle {
    fn examine(&self, input: &[u8], outcome: &ProcessOutcome) -> Option<BugReport> {
        let kind = match outcome {
            ProcessOutcome::TimedOut => FailureKind::Hang,
            ProcessOutcome::Completed(output) => {
                let stderr = output.stderr_lossy();
                let has_stderr = !stderr.trim().is_empty();
                let code = output.status_code();
                match (has_stderr, code < 0) {
                    (false, false) => return None,
                    (true, false) => FailureKind::Stderr(stderr),
                    (false, true) => FailureKind::NegativeStatus(code),
                    (true, true) => FailureKind::StderrAndNegativeStatus(stderr, code),
                }
            }
        };

        Some(BugReport {
            kind,
            input_hash: format!("{:x}", md5::compute(input)),
        })
    }
}
