//! Structured reporting of unexpected conditions.
//!
//! Conditions the engine can recover from (a malformed packet, a stale handshake reply,
//! an input range with a gap) are not errors, but they should not vanish silently either.
//! They are reported as [`Violation`] records to a [`ViolationObserver`]. By default the
//! record is logged through `tracing`; tests can install a [`CollectingObserver`] through
//! the session builder and assert on what was reported.
//!
//! ```
//! use resync_rollback::telemetry::{CollectingObserver, Violation, ViolationKind, ViolationObserver, ViolationSeverity};
//!
//! let observer = CollectingObserver::new();
//! observer.on_violation(&Violation::new(
//!     ViolationSeverity::Warning,
//!     ViolationKind::DeviceProtocol,
//!     "unexpected sync confirm",
//!     "device.rs:1",
//! ));
//! assert!(observer.has_violation(ViolationKind::DeviceProtocol));
//! ```

use crate::Frame;
use parking_lot::Mutex;
use std::sync::Arc;

/// Null and invalid frames serialize as `null` rather than `-1`.
#[allow(clippy::ref_option)]
fn serialize_frame<S: serde::Serializer>(
    frame: &Option<Frame>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use serde::Serialize as _;
    frame
        .filter(|f| f.is_valid())
        .map(Frame::as_i32)
        .serialize(serializer)
}

/// How bad a reported condition is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    /// Unexpected but harmless; the offending data was ignored.
    Warning,
    /// Behavior may be degraded.
    Error,
    /// An internal invariant broke; state may be corrupted.
    Critical,
}

impl ViolationSeverity {
    /// Label suitable for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The subsystem a violation was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ViolationKind {
    /// Input queue bookkeeping (gaps, stale frames, size mismatches).
    InputQueue,
    /// Snapshot ring (loading frames that are gone, unknown checksums).
    StateStorage,
    /// Handshake, liveness and message handling of a device.
    DeviceProtocol,
    /// Health-check comparisons.
    HealthCheck,
    /// Wire encoding or the bundled transports.
    Transport,
    /// Invalid parameter combinations.
    Configuration,
    /// A runtime invariant check failed.
    Invariant,
}

impl ViolationKind {
    /// Label suitable for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InputQueue => "input_queue",
            Self::StateStorage => "state_storage",
            Self::DeviceProtocol => "device_protocol",
            Self::HealthCheck => "health_check",
            Self::Transport => "transport",
            Self::Configuration => "configuration",
            Self::Invariant => "invariant",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded violation with its source location.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Violation {
    /// Severity of the condition.
    pub severity: ViolationSeverity,
    /// Subsystem that reported it.
    pub kind: ViolationKind,
    /// Human readable description.
    pub message: String,
    /// `file:line` of the report.
    pub location: &'static str,
    /// Frame the condition relates to, if any.
    #[serde(serialize_with = "serialize_frame")]
    pub frame: Option<Frame>,
}

impl Violation {
    /// Creates a violation record.
    #[must_use]
    pub fn new(
        severity: ViolationSeverity,
        kind: ViolationKind,
        message: impl Into<String>,
        location: &'static str,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            location,
            frame: None,
        }
    }

    /// Attaches the frame the condition relates to.
    #[must_use]
    pub fn with_frame(mut self, frame: Frame) -> Self {
        self.frame = Some(frame);
        self
    }

    /// Serializes the record as JSON.
    #[cfg(feature = "json")]
    #[must_use]
    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}/{}] {} (at {}",
            self.severity, self.kind, self.message, self.location
        )?;
        match self.frame {
            Some(frame) => write!(f, ", frame {})", frame),
            None => write!(f, ")"),
        }
    }
}

/// Receives violation records.
#[cfg(feature = "sync-send")]
pub trait ViolationObserver: Send + Sync {
    /// Called for every reported violation. Must be quick.
    fn on_violation(&self, violation: &Violation);
}

/// Receives violation records.
#[cfg(not(feature = "sync-send"))]
pub trait ViolationObserver {
    /// Called for every reported violation. Must be quick.
    fn on_violation(&self, violation: &Violation);
}

/// Logs violations through `tracing`: warnings with `warn!`, everything else with `error!`.
#[derive(Debug, Default, Clone)]
pub struct TracingObserver;

impl TracingObserver {
    /// Creates a tracing observer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl ViolationObserver for TracingObserver {
    fn on_violation(&self, violation: &Violation) {
        let kind = violation.kind.as_str();
        let frame = violation.frame.map(Frame::as_i32);
        if violation.severity == ViolationSeverity::Warning {
            tracing::warn!(
                kind,
                ?frame,
                location = violation.location,
                "{}",
                violation.message
            );
        } else {
            tracing::error!(
                kind,
                ?frame,
                severity = violation.severity.as_str(),
                location = violation.location,
                "{}",
                violation.message
            );
        }
    }
}

/// Stores every violation; meant for tests.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    violations: Mutex<Vec<Violation>>,
}

impl CollectingObserver {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of everything collected so far.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        self.violations.lock().clone()
    }

    /// Number of collected violations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.violations.lock().len()
    }

    /// Returns `true` if nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.violations.lock().is_empty()
    }

    /// Returns `true` if a violation of `kind` was collected.
    #[must_use]
    pub fn has_violation(&self, kind: ViolationKind) -> bool {
        self.violations.lock().iter().any(|v| v.kind == kind)
    }

    /// Forgets everything collected so far.
    pub fn clear(&self) {
        self.violations.lock().clear();
    }
}

impl ViolationObserver for CollectingObserver {
    fn on_violation(&self, violation: &Violation) {
        self.violations.lock().push(violation.clone());
    }
}

/// Sends `violation` to `observer`, or to [`TracingObserver`] when there is none.
pub fn report_to_observer(observer: Option<&Arc<dyn ViolationObserver>>, violation: &Violation) {
    if let Some(observer) = observer {
        observer.on_violation(violation);
    } else {
        TracingObserver.on_violation(violation);
    }
}

/// Reports a violation through [`TracingObserver`], recording the call site.
///
/// ```
/// use resync_rollback::{report_violation, telemetry::{ViolationKind, ViolationSeverity}};
///
/// report_violation!(ViolationSeverity::Warning, ViolationKind::InputQueue,
///     "dropped input for frame {}", 12);
/// ```
#[macro_export]
macro_rules! report_violation {
    ($severity:expr, $kind:expr, $($message:tt)+) => {
        $crate::telemetry::report_to_observer(
            None,
            &$crate::telemetry::Violation::new(
                $severity,
                $kind,
                ::std::format!($($message)+),
                concat!(file!(), ":", line!()),
            ),
        )
    };
}

/// Like [`report_violation!`], but sends to an `Option<Arc<dyn ViolationObserver>>`.
#[macro_export]
macro_rules! report_violation_to {
    ($observer:expr, $severity:expr, $kind:expr, $($message:tt)+) => {
        $crate::telemetry::report_to_observer(
            $observer.as_ref(),
            &$crate::telemetry::Violation::new(
                $severity,
                $kind,
                ::std::format!($($message)+),
                concat!(file!(), ":", line!()),
            ),
        )
    };
}

/// Result of a failed invariant check.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InvariantViolation {
    /// Type whose invariant broke.
    pub type_name: &'static str,
    /// The broken invariant.
    pub invariant: String,
    /// Diagnostic details.
    pub details: Option<String>,
}

impl InvariantViolation {
    /// Creates an invariant violation.
    #[must_use]
    pub fn new(type_name: &'static str, invariant: impl Into<String>) -> Self {
        Self {
            type_name,
            invariant: invariant.into(),
            details: None,
        }
    }

    /// Attaches details.
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.invariant)?;
        if let Some(details) = &self.details {
            write!(f, " ({})", details)?;
        }
        Ok(())
    }
}

/// Types with checkable internal invariants.
pub trait InvariantChecker {
    /// Returns the first broken invariant, if any.
    fn check_invariants(&self) -> Result<(), InvariantViolation>;
}

/// Checks invariants in debug builds (or with the `paranoid` feature) and reports failures.
#[macro_export]
#[cfg(any(debug_assertions, feature = "paranoid"))]
macro_rules! debug_check_invariants {
    ($expr:expr) => {{
        use $crate::telemetry::InvariantChecker as _;
        if let Err(violation) = $expr.check_invariants() {
            $crate::report_violation!(
                $crate::telemetry::ViolationSeverity::Critical,
                $crate::telemetry::ViolationKind::Invariant,
                "{}",
                violation
            );
        }
    }};
}

/// No-op outside debug builds.
#[macro_export]
#[cfg(not(any(debug_assertions, feature = "paranoid")))]
macro_rules! debug_check_invariants {
    ($expr:expr) => {{}};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(ViolationSeverity::Warning < ViolationSeverity::Error);
        assert!(ViolationSeverity::Error < ViolationSeverity::Critical);
    }

    #[test]
    fn display_includes_frame() {
        let violation = Violation::new(
            ViolationSeverity::Error,
            ViolationKind::StateStorage,
            "frame not retained",
            "state_storage.rs:10",
        );
        assert_eq!(
            violation.clone().with_frame(Frame::new(3)).to_string(),
            "[error/state_storage] frame not retained (at state_storage.rs:10, frame 3)"
        );
        assert_eq!(
            violation.to_string(),
            "[error/state_storage] frame not retained (at state_storage.rs:10)"
        );
    }

    #[test]
    fn collecting_observer_collects_and_clears() {
        let observer: Arc<dyn ViolationObserver> = Arc::new(CollectingObserver::new());
        let violation = Violation::new(
            ViolationSeverity::Warning,
            ViolationKind::Transport,
            "short packet",
            "codec.rs:1",
        );
        report_to_observer(Some(&observer), &violation);

        let collector = CollectingObserver::new();
        collector.on_violation(&violation);
        assert_eq!(collector.len(), 1);
        assert!(collector.has_violation(ViolationKind::Transport));
        assert!(!collector.has_violation(ViolationKind::HealthCheck));
        collector.clear();
        assert!(collector.is_empty());
    }

    #[test]
    fn report_violation_to_falls_back_to_tracing() {
        let observer: Option<Arc<dyn ViolationObserver>> = None;
        report_violation_to!(
            observer,
            ViolationSeverity::Warning,
            ViolationKind::InputQueue,
            "cursor moved backwards: {}",
            4
        );
    }

    #[test]
    fn invariant_violation_display() {
        let violation = InvariantViolation::new("StateStorage", "slot count changed")
            .with_details("len=3");
        assert_eq!(violation.to_string(), "StateStorage: slot count changed (len=3)");
    }

    #[test]
    fn serializes_null_frames_as_null() {
        let violation = Violation::new(
            ViolationSeverity::Warning,
            ViolationKind::InputQueue,
            "gap",
            "x.rs:1",
        )
        .with_frame(Frame::NULL);
        let json = serde_json::to_string(&violation).expect("serializable");
        assert!(json.contains(r#""frame":null"#));
    }
}
