//! Ordered setup scripts run against a lab VM.
//!
//! Each step is a single command with its own expected exit code, timeout
//! and failure policy. Steps run strictly in `order`, one at a time, and
//! every transition is reported to an [`EventSink`].

use protocol::{
    parse_descriptors, EventKind, LabEvent, ProtocolError, SetupStepDescriptor, SetupSummary,
    StepReport,
};

use crate::events::EventSink;
use crate::exec::{CommandExecutor, CommandResult};
use crate::ssh::RemoteSession;

/// One command of a setup script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStep {
    pub order: i32,
    pub title: String,
    pub command: String,
    pub expected_exit_code: i32,
    pub timeout_seconds: i64,
    pub continue_on_failure: bool,
}

impl SetupStep {
    /// Parses a JSON array of step descriptors, sorted by `order`.
    ///
    /// Steps sharing an order keep their position in the array. An empty
    /// payload yields no steps.
    pub fn parse_list(json: &str) -> Result<Vec<SetupStep>, ProtocolError> {
        let mut steps = parse_descriptors(json)?
            .into_iter()
            .enumerate()
            .map(|(index, descriptor)| SetupStep::try_from_descriptor(index, descriptor))
            .collect::<Result<Vec<_>, _>>()?;
        steps.sort_by_key(|s| s.order);
        Ok(steps)
    }

    fn try_from_descriptor(
        index: usize,
        descriptor: SetupStepDescriptor,
    ) -> Result<Self, ProtocolError> {
        if descriptor.setup_command.trim().is_empty() {
            return Err(ProtocolError::InvalidStep {
                index,
                reason: "setupCommand is empty".to_string(),
            });
        }
        let title = if descriptor.title.trim().is_empty() {
            format!("Step {}", descriptor.step_order)
        } else {
            descriptor.title
        };
        Ok(Self {
            order: descriptor.step_order,
            title,
            command: descriptor.setup_command,
            expected_exit_code: descriptor.expected_exit_code,
            timeout_seconds: descriptor.timeout_seconds,
            continue_on_failure: descriptor.continue_on_failure,
        })
    }
}

/// How a setup run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStatus {
    /// Every step returned its expected exit code.
    Succeeded,
    /// Some steps failed, but all of them allowed the run to continue.
    PartialSuccess,
    /// A step failed without `continue_on_failure`; later steps never ran.
    Aborted,
}

/// Summary of a setup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupOutcome {
    pub executed: usize,
    pub total: usize,
    pub failed: usize,
    pub status: SetupStatus,
}

impl SetupOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == SetupStatus::Succeeded
    }

    /// True when every step was run, failed or not.
    pub fn completed(&self) -> bool {
        self.status != SetupStatus::Aborted
    }
}

/// Runs setup steps through a [`CommandExecutor`].
#[derive(Debug, Clone, Copy)]
pub struct SetupStepRunner {
    executor: CommandExecutor,
    display_limit: usize,
}

impl SetupStepRunner {
    pub fn new(executor: CommandExecutor, display_limit: usize) -> Self {
        Self {
            executor,
            display_limit,
        }
    }

    pub async fn run(
        &self,
        session: &dyn RemoteSession,
        steps: &[SetupStep],
        sink: &dyn EventSink,
    ) -> SetupOutcome {
        let mut ordered: Vec<&SetupStep> = steps.iter().collect();
        ordered.sort_by_key(|s| s.order);

        let total = ordered.len();
        let mut executed = 0;
        let mut failed = 0;
        let mut status = SetupStatus::Succeeded;

        sink.emit(LabEvent::info(format!("Starting setup: {} steps", total)));

        for (index, step) in ordered.into_iter().enumerate() {
            let number = index + 1;
            tracing::info!(step = number, total, title = %step.title, "Running setup step");

            sink.emit(
                LabEvent::new(
                    EventKind::StepStart,
                    format!("[{}/{}] Executing: {}", number, total, step.title),
                )
                .with_data(StepReport {
                    step_number: number as u32,
                    total_steps: total as u32,
                    title: step.title.clone(),
                    command: Some(step.command.clone()),
                    ..Default::default()
                }),
            );

            let result = match self
                .executor
                .execute(session, &step.command, step.timeout_seconds)
                .await
            {
                Ok(result) => result,
                Err(e) => CommandResult {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: e.to_string(),
                },
            };
            executed += 1;

            if result.exit_code == step.expected_exit_code {
                sink.emit(
                    LabEvent::new(
                        EventKind::StepSuccess,
                        format!("[{}/{}] Completed: {}", number, total, step.title),
                    )
                    .with_data(StepReport {
                        step_number: number as u32,
                        total_steps: total as u32,
                        title: step.title.clone(),
                        exit_code: Some(result.exit_code),
                        stdout: Some(result.display_stdout(self.display_limit)),
                        ..Default::default()
                    }),
                );
                continue;
            }

            failed += 1;
            tracing::warn!(
                step = number,
                exit_code = result.exit_code,
                expected = step.expected_exit_code,
                "Setup step failed"
            );
            sink.emit(
                LabEvent::new(
                    EventKind::StepFailed,
                    format!(
                        "[{}/{}] Failed: {} (exit code: {})",
                        number, total, step.title, result.exit_code
                    ),
                )
                .with_data(StepReport {
                    step_number: number as u32,
                    total_steps: total as u32,
                    title: step.title.clone(),
                    command: None,
                    exit_code: Some(result.exit_code),
                    expected_exit_code: Some(step.expected_exit_code),
                    stdout: Some(result.display_stdout(self.display_limit)),
                    stderr: Some(result.display_stderr(self.display_limit)),
                }),
            );

            if step.continue_on_failure {
                status = SetupStatus::PartialSuccess;
                sink.emit(LabEvent::warning(
                    "Continuing despite failure (continueOnFailure=true)",
                ));
            } else {
                status = SetupStatus::Aborted;
                // The caller reports the run's failure as the one error.
                sink.emit(LabEvent::warning("Setup aborted due to step failure"));
                break;
            }
        }

        sink.emit(
            LabEvent::new(
                EventKind::SetupComplete,
                format!("Setup completed: {}/{} steps executed", executed, total),
            )
            .with_data(SetupSummary {
                executed_steps: executed as u32,
                total_steps: total as u32,
                failed_steps: failed as u32,
            }),
        );

        SetupOutcome {
            executed,
            total,
            failed,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::testing::FakeSession;

    fn step(order: i32, command: &str, continue_on_failure: bool) -> SetupStep {
        SetupStep {
            order,
            title: format!("step {}", order),
            command: command.to_string(),
            expected_exit_code: 0,
            timeout_seconds: 10,
            continue_on_failure,
        }
    }

    fn runner() -> SetupStepRunner {
        SetupStepRunner::new(CommandExecutor::default(), 500)
    }

    #[test]
    fn test_parse_list_sorts_by_order() {
        let json = r#"[
            {"stepOrder": 2, "title": "second", "setupCommand": "echo b"},
            {"stepOrder": 1, "title": "first", "setupCommand": "echo a", "continueOnFailure": true}
        ]"#;
        let steps = SetupStep::parse_list(json).unwrap();
        assert_eq!(steps[0].title, "first");
        assert!(steps[0].continue_on_failure);
        assert_eq!(steps[1].title, "second");
        assert_eq!(steps[1].timeout_seconds, 300);
    }

    #[test]
    fn test_parse_list_rejects_empty_command() {
        let json = r#"[{"stepOrder": 1, "title": "nothing", "setupCommand": "  "}]"#;
        let err = SetupStep::parse_list(json).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidStep { index: 0, .. }));
    }

    #[test]
    fn test_parse_list_empty_payloads() {
        assert!(SetupStep::parse_list("").unwrap().is_empty());
        assert!(SetupStep::parse_list("[]").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let session = FakeSession::new();
        let sink = RecordingSink::new();
        let steps = vec![step(1, "echo a", false), step(2, "echo b", false)];

        let outcome = runner().run(session.as_ref(), &steps, &sink).await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.executed, 2);
        assert_eq!(
            sink.kinds(),
            vec![
                "info",
                "step_start",
                "step_success",
                "step_start",
                "step_success",
                "setup_complete"
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_steps() {
        let session = FakeSession::new();
        let sink = RecordingSink::new();
        let steps = vec![
            step(1, "echo a", false),
            step(2, "exit 1", false),
            step(3, "echo c", false),
        ];

        let outcome = runner().run(session.as_ref(), &steps, &sink).await;

        assert_eq!(outcome.status, SetupStatus::Aborted);
        assert!(!outcome.succeeded());
        assert!(!outcome.completed());
        assert_eq!(outcome.executed, 2);
        assert_eq!(session.commands(), vec!["echo a", "exit 1"]);
        assert!(!sink.kinds().contains(&"error"));
        assert_eq!(
            sink.kinds(),
            vec![
                "info",
                "step_start",
                "step_success",
                "step_start",
                "step_failed",
                "warning",
                "setup_complete"
            ]
        );
    }

    #[tokio::test]
    async fn test_continue_on_failure_is_partial_success() {
        let session = FakeSession::new();
        let sink = RecordingSink::new();
        let steps = vec![
            step(1, "echo a", false),
            step(2, "exit 1", true),
            step(3, "echo c", false),
        ];

        let outcome = runner().run(session.as_ref(), &steps, &sink).await;

        assert_eq!(outcome.status, SetupStatus::PartialSuccess);
        assert!(outcome.completed());
        assert!(!outcome.succeeded());
        assert_eq!((outcome.executed, outcome.failed), (3, 1));
        assert_eq!(session.commands(), vec!["echo a", "exit 1", "echo c"]);
        assert!(sink.kinds().contains(&"warning"));
    }

    #[tokio::test]
    async fn test_expected_nonzero_exit_is_success() {
        let session = FakeSession::new();
        let sink = RecordingSink::new();
        let mut exits_two = step(1, "exit 2", false);
        exits_two.expected_exit_code = 2;
        let mut wrong = step(2, "exit 0", false);
        wrong.expected_exit_code = 1;

        let outcome = runner().run(session.as_ref(), &[exits_two, wrong], &sink).await;

        assert_eq!(outcome.failed, 1);
        let kinds = sink.kinds();
        assert_eq!(kinds[2], "step_success");
        assert_eq!(kinds[4], "step_failed");
    }

    #[tokio::test]
    async fn test_runs_in_order_regardless_of_input_order() {
        let session = FakeSession::new();
        let steps = vec![step(3, "echo c", false), step(1, "echo a", false)];
        runner()
            .run(session.as_ref(), &steps, &RecordingSink::new())
            .await;
        assert_eq!(session.commands(), vec!["echo a", "echo c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let session = FakeSession::new();
        let sink = RecordingSink::new();
        let mut slow = step(1, "hang", false);
        slow.timeout_seconds = 1;

        let outcome = runner().run(session.as_ref(), &[slow], &sink).await;

        assert_eq!(outcome.status, SetupStatus::Aborted);
        let failed = &sink.events()[2];
        let report: StepReport = serde_json::from_value(failed.data.clone().unwrap()).unwrap();
        assert_eq!(report.exit_code, Some(-1));
        assert!(report.stderr.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_summary_payload() {
        let session = FakeSession::new();
        let sink = RecordingSink::new();
        runner()
            .run(session.as_ref(), &[step(1, "echo a", false)], &sink)
            .await;

        let summary = sink.events().last().cloned().unwrap();
        let payload: SetupSummary = serde_json::from_value(summary.data.unwrap()).unwrap();
        assert_eq!(payload.executed_steps, 1);
        assert_eq!(payload.total_steps, 1);
    }
}
