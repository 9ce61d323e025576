//! Run one attempt and report how it ended.

use crate::{
    payload::Payload,
    racer::{self, Attempt, Racer, State, Step, Timeline},
    ring::{CompletionRecord, SubmissionId},
    transport::Transport,
    trap::FaultToken,
};
use serde::Serialize;
use std::{fmt, io};

/// Exit code of a run that reached a terminal race outcome (whatever it was).
pub const EXIT_OK: i32 = 0;

/// Exit code of a run that was aborted by an infrastructural failure.
pub const EXIT_ABORTED: i32 = 1;

/// Interpretation of a completion by the backend-specific caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// The malicious kind's effect occurred.
    Success,
    /// The backend rejected the request or applied the benign semantics.
    Blocked,
}

/// Decides what a completion record means.
pub trait Classifier {
    fn classify(&self, record: &CompletionRecord) -> Verdict;
}

impl<F: Fn(&CompletionRecord) -> Verdict> Classifier for F {
    fn classify(&self, record: &CompletionRecord) -> Verdict {
        self(record)
    }
}

/// Treats any non-negative result as success.
#[derive(Clone, Copy, Debug, Default)]
pub struct NonNegative;

impl Classifier for NonNegative {
    fn classify(&self, record: &CompletionRecord) -> Verdict {
        if record.is_success() {
            Verdict::Success
        } else {
            Verdict::Blocked
        }
    }
}

/// User-facing result of an attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Blocked,
    RaceNotTriggered,
    Aborted { step: Step, reason: String },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => f.write_str("success"),
            Outcome::Blocked => f.write_str("blocked"),
            Outcome::RaceNotTriggered => f.write_str("race not triggered"),
            Outcome::Aborted { step, reason } => write!(f, "aborted at {step}: {reason}"),
        }
    }
}

/// Structured summary of one attempt.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    #[serde(flatten)]
    pub outcome: Outcome,
    /// Terminal state reached by the racer.
    pub state: State,
    pub submission: Option<SubmissionId>,
    /// Result carried by the completion record, if one was collected.
    pub status: Option<i32>,
    pub fault: Option<FaultToken>,
    pub timeline: Timeline,
}

impl Report {
    pub fn from_attempt(attempt: &Attempt, classifier: &impl Classifier) -> Self {
        let outcome = match (attempt.state, &attempt.failure, &attempt.completion) {
            (State::Completed, _, Some(record)) => match classifier.classify(record) {
                Verdict::Success => Outcome::Success,
                Verdict::Blocked => Outcome::Blocked,
            },
            (State::NotTriggered, _, _) => Outcome::RaceNotTriggered,
            (_, Some(failure), _) => Outcome::Aborted {
                step: failure.step,
                reason: failure.error.to_string(),
            },
            (state, None, _) => Outcome::Aborted {
                step: Step::Complete,
                reason: format!("attempt ended in state {state}"),
            },
        };
        Self {
            outcome,
            state: attempt.state,
            submission: attempt.submission,
            status: attempt.completion.map(|record| record.result),
            fault: attempt.fault.clone(),
            timeline: attempt.timeline.clone(),
        }
    }

    /// Process exit code: zero whenever the race ran to a verdict, even an unfavorable one.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Aborted { .. } => EXIT_ABORTED,
            _ => EXIT_OK,
        }
    }
}

/// Render a completion result the way `strerror` would.
pub fn describe(result: i32) -> String {
    if result >= 0 {
        return result.to_string();
    }
    let message = io::Error::from_raw_os_error(-result).to_string();
    let message = message
        .split(" (os error")
        .next()
        .unwrap_or(message.as_str());
    format!("{result} ({message})")
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "outcome: {}", self.outcome)?;
        writeln!(f, "state: {}", self.state)?;
        if let Some(id) = self.submission {
            writeln!(f, "submission: {id}")?;
        }
        if let Some(fault) = &self.fault {
            writeln!(
                f,
                "fault: region={} offset={} len={}",
                fault.region, fault.offset, fault.len
            )?;
        }
        if let Some(window) = self.timeline.window_us {
            writeln!(f, "window: {window}us")?;
        }
        match self.status {
            Some(status) => write!(f, "result: {}", describe(status)),
            None => write!(f, "result: none"),
        }
    }
}

/// Runs exactly one race attempt and reports it.
pub struct Harness<T: Transport, C: Classifier = NonNegative> {
    racer: Racer<T>,
    classifier: C,
}

impl<T: Transport> Harness<T> {
    pub fn new(cfg: racer::Config, transport: T) -> Self {
        Self::with_classifier(cfg, transport, NonNegative)
    }
}

impl<T: Transport, C: Classifier> Harness<T, C> {
    pub fn with_classifier(cfg: racer::Config, transport: T, classifier: C) -> Self {
        Self {
            racer: Racer::new(cfg, transport),
            classifier,
        }
    }

    pub fn transport(&self) -> &T {
        self.racer.transport()
    }

    pub fn run(&self, payload: &Payload) -> Report {
        let attempt = self.racer.run(payload);
        Report::from_attempt(&attempt, &self.classifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use crate::{
        mocks::{self, Backend},
        ring::{Endpoint, Kind},
        Error,
    };
    use std::time::Duration;

    fn config() -> racer::Config {
        racer::Config {
            fault_timeout: Duration::from_secs(10),
            completion_timeout: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn payload() -> Payload {
        Payload::new(
            Kind::RECV,
            Kind::SEND,
            Endpoint(3),
            mocks::message(&[0u8; 32], 4096).unwrap(),
        )
    }

    #[test_traced]
    fn test_success_report() {
        let harness = Harness::new(config(), Backend::new(mocks::Config::default()));
        let report = harness.run(&payload());
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.state, State::Completed);
        assert_eq!(report.status, Some(32));
        assert_eq!(report.exit_code(), EXIT_OK);
        assert!(report.to_string().contains("result: 32"));
    }

    #[test_traced]
    fn test_blocked_report() {
        let backend = Backend::new(mocks::Config {
            double_fetch: false,
            ..Default::default()
        });
        let report = Harness::new(config(), backend).run(&payload());
        assert_eq!(report.outcome, Outcome::Blocked);
        assert_eq!(report.status, Some(-libc::EAGAIN));
        assert_eq!(report.exit_code(), EXIT_OK);
    }

    #[test_traced]
    fn test_custom_classifier() {
        // Only a full-length send counts
        let classifier = |record: &CompletionRecord| {
            if record.result == 4092 {
                Verdict::Success
            } else {
                Verdict::Blocked
            }
        };
        let harness = Harness::with_classifier(
            config(),
            Backend::new(mocks::Config::default()),
            classifier,
        );
        assert_eq!(harness.run(&payload()).outcome, Outcome::Blocked);
    }

    #[test_traced]
    fn test_aborted_report() {
        let cfg = racer::Config {
            arm_trap: false,
            ..config()
        };
        let report = Harness::new(cfg, Backend::new(mocks::Config::default())).run(&payload());
        assert!(matches!(
            report.outcome,
            Outcome::Aborted {
                step: Step::WaitForFault,
                ..
            }
        ));
        assert_eq!(report.exit_code(), EXIT_ABORTED);
        assert!(report.to_string().starts_with("outcome: aborted at wait_for_fault"));
    }

    #[test_traced]
    fn test_not_triggered_report() {
        let backend = Backend::new(mocks::Config {
            touch_auxiliary: false,
            ..Default::default()
        });
        let cfg = racer::Config {
            fault_timeout: Duration::from_millis(50),
            ..config()
        };
        let report = Harness::new(cfg, backend).run(&payload());
        assert_eq!(report.outcome, Outcome::RaceNotTriggered);
        assert_eq!(report.exit_code(), EXIT_OK);
    }

    #[test_traced]
    fn test_report_json() {
        let attempt = Attempt {
            state: State::Aborted,
            submission: None,
            fault: None,
            completion: None,
            failure: Some(racer::Failure {
                step: Step::Setup,
                error: Error::Allocation(0),
            }),
            timeline: Timeline::default(),
        };
        let report = Report::from_attempt(&attempt, &NonNegative);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "aborted");
        assert_eq!(json["step"], "setup");
        assert_eq!(json["reason"], "allocation failed: 0 bytes");
        assert_eq!(json["state"], "aborted");
        assert!(json["status"].is_null());
    }

    #[test_traced]
    fn test_describe() {
        assert_eq!(describe(32), "32");
        assert_eq!(describe(-libc::EPERM), "-1 (Operation not permitted)");
    }
}
