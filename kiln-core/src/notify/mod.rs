//! Build notification capability.
//!
//! The build task talks back to the originating client exclusively through
//! [`BuildNotifier`]. The daemon implements it on top of its job registry;
//! injecting the trait here keeps the core free of any reference back to the
//! connection layer.

use std::sync::{Arc, Mutex};

/// Which logical stream a log chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Orchestrator-level messages that are not engine output.
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::System => "system",
        }
    }
}

/// Orchestrator phases, in transition order. Every transition is announced
/// to the client as a `build_status` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Queued,
    Preparing,
    FetchingSecrets,
    DownloadingResources,
    FetchingCodebases,
    RunningSteps,
    Building,
    Saving,
    GeneratingManifest,
    Success,
    Failure,
}

impl BuildPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::Queued => "queued",
            BuildPhase::Preparing => "preparing",
            BuildPhase::FetchingSecrets => "fetching_secrets",
            BuildPhase::DownloadingResources => "downloading_resources",
            BuildPhase::FetchingCodebases => "fetching_codebases",
            BuildPhase::RunningSteps => "running_steps",
            BuildPhase::Building => "building",
            BuildPhase::Saving => "saving",
            BuildPhase::GeneratingManifest => "generating_manifest",
            BuildPhase::Success => "success",
            BuildPhase::Failure => "failure",
        }
    }

    /// Terminal phases end the job; exactly one is ever emitted per job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildPhase::Success | BuildPhase::Failure)
    }
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability handed to the build task for streaming logs and status
/// transitions back to the originating client.
///
/// Implementations must be cheap and non-blocking: these methods are called
/// from inside the build hot path. Delivery is best-effort; a vanished
/// client makes them no-ops.
pub trait BuildNotifier: Send + Sync {
    fn notify_log(&self, build_id: &str, stream: LogStream, content: &str);

    fn notify_status(
        &self,
        build_id: &str,
        phase: BuildPhase,
        message: Option<&str>,
        artifact_ref: Option<&str>,
        duration_sec: Option<f64>,
    );
}

/// Notifier that drops everything. Used when a build runs without a client.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl BuildNotifier for NullNotifier {
    fn notify_log(&self, _build_id: &str, _stream: LogStream, _content: &str) {}

    fn notify_status(
        &self,
        _build_id: &str,
        _phase: BuildPhase,
        _message: Option<&str>,
        _artifact_ref: Option<&str>,
        _duration_sec: Option<f64>,
    ) {
    }
}

/// Log fan-out used inside a build: forwards every line to the notifier and
/// accumulates the full transcript for the build result.
pub struct BuildLogger {
    build_id: String,
    notifier: Arc<dyn BuildNotifier>,
    transcript: Mutex<String>,
}

impl BuildLogger {
    pub fn new(build_id: impl Into<String>, notifier: Arc<dyn BuildNotifier>) -> Self {
        Self { build_id: build_id.into(), notifier, transcript: Mutex::new(String::new()) }
    }

    /// Record a line on the given stream.
    pub fn line(&self, stream: LogStream, content: &str) {
        {
            let mut transcript = self.transcript.lock().expect("transcript lock poisoned");
            transcript.push_str(content);
            if !content.ends_with('\n') {
                transcript.push('\n');
            }
        }
        self.notifier.notify_log(&self.build_id, stream, content);
    }

    /// Record an orchestrator-level message.
    pub fn system(&self, content: &str) {
        self.line(LogStream::System, content);
    }

    /// Announce a non-terminal phase transition for this build.
    pub fn status(&self, phase: BuildPhase) {
        self.notifier.notify_status(&self.build_id, phase, None, None, None);
    }

    /// The accumulated transcript so far.
    pub fn transcript(&self) -> String {
        self.transcript.lock().expect("transcript lock poisoned").clone()
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingNotifier {
        logs: StdMutex<Vec<(String, String)>>,
    }

    impl BuildNotifier for RecordingNotifier {
        fn notify_log(&self, _build_id: &str, stream: LogStream, content: &str) {
            self.logs.lock().unwrap().push((stream.as_str().to_string(), content.to_string()));
        }

        fn notify_status(
            &self,
            _build_id: &str,
            _phase: BuildPhase,
            _message: Option<&str>,
            _artifact_ref: Option<&str>,
            _duration_sec: Option<f64>,
        ) {
        }
    }

    #[test]
    fn test_phase_strings() {
        assert_eq!(BuildPhase::FetchingCodebases.as_str(), "fetching_codebases");
        assert!(BuildPhase::Success.is_terminal());
        assert!(BuildPhase::Failure.is_terminal());
        assert!(!BuildPhase::Building.is_terminal());
    }

    #[test]
    fn test_logger_forwards_and_accumulates() {
        let notifier = Arc::new(RecordingNotifier::default());
        let logger = BuildLogger::new("b-1", notifier.clone());

        logger.system("Starting build");
        logger.line(LogStream::Stdout, "Step 1/2 : FROM alpine\n");

        let transcript = logger.transcript();
        assert!(transcript.contains("Starting build\n"));
        assert!(transcript.contains("Step 1/2"));

        let logs = notifier.logs.lock().unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].0, "system");
        assert_eq!(logs[1].0, "stdout");
    }
}
