use async_trait::async_trait;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::annotate::Annotator;
use crate::artifacts::ArtifactStore;
use crate::decide::ActionOracle;
use crate::detect::TextDetector;
use crate::error::AgentError;
use crate::executor::{Executor, ScriptExecutor, VisualExecutor};
use crate::history::{Decision, ExecutionOutcome, History, HistoryEntry};
use crate::judge::{CompletionJudge, JudgeVerdict};
use crate::oracle::Oracle;
use crate::perception::{Perceiver, Snapshot, Strategy, StructuralPerceiver, VisualPerceiver};
use crate::prune::HtmlPruner;
use crate::surface::Surface;

// ========================= Reports =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The start URL could not be opened.
    Navigation,
    /// Capture or detection failed outright.
    Perception,
    /// Perception worked but saw nothing.
    EmptyPerception,
    NoTarget,
    Parse,
    Oracle,
}

impl AbortReason {
    /// Anything the decision step raises besides a bad reply came from the oracle call.
    fn from_decision_error(err: &AgentError) -> Self {
        match err {
            AgentError::NoTarget { .. } => AbortReason::NoTarget,
            AgentError::Parse(_) => AbortReason::Parse,
            _ => AbortReason::Oracle,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { cycles: usize },
    Exhausted { cycles: usize },
    Aborted {
        cycles: usize,
        reason: AbortReason,
        detail: String,
    },
}

impl Outcome {
    pub fn cycles(&self) -> usize {
        match self {
            Outcome::Success { cycles }
            | Outcome::Exhausted { cycles }
            | Outcome::Aborted { cycles, .. } => *cycles,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success { cycles } => write!(f, "done after {cycles} cycle(s)"),
            Outcome::Exhausted { cycles } => write!(f, "gave up after {cycles} cycle(s)"),
            Outcome::Aborted {
                cycles,
                reason,
                detail,
            } => write!(f, "aborted after {cycles} cycle(s): {reason:?} ({detail})"),
        }
    }
}

/// One completed cycle: what was decided, what happened, what the judge said.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub cycle: usize,
    pub decision: Decision,
    pub outcome: ExecutionOutcome,
    pub verdict: JudgeVerdict,
    pub elapsed_ms: u128,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GoalReport {
    pub run_id: String,
    pub goal: String,
    pub outcome: Outcome,
    pub cycles: usize,
    pub history: History,
    pub steps: Vec<StepLog>,
    pub elapsed_ms: u128,
}

// ========================= Transcript =========================

/// Observer of goal progress. Failures here never affect the run.
#[async_trait]
pub trait Transcript: Send + Sync {
    async fn goal_started(&self, run_id: &str, goal: &str) -> Result<(), AgentError>;
    async fn step(&self, run_id: &str, step: &StepLog) -> Result<(), AgentError>;
    async fn goal_finished(&self, report: &GoalReport) -> Result<(), AgentError>;
}

pub struct NullTranscript;

#[async_trait]
impl Transcript for NullTranscript {
    async fn goal_started(&self, _run_id: &str, _goal: &str) -> Result<(), AgentError> {
        Ok(())
    }
    async fn step(&self, _run_id: &str, _step: &StepLog) -> Result<(), AgentError> {
        Ok(())
    }
    async fn goal_finished(&self, _report: &GoalReport) -> Result<(), AgentError> {
        Ok(())
    }
}

// ========================= Agent Core =========================

#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Retry ceiling: cycles per goal before giving up.
    pub max_cycles: usize,
    pub settle_after_action: Duration,
    pub settle_before_typing: Duration,
    /// Visual strategy only: press Enter after typed text.
    pub submit_typed_text: bool,
    pub decision_temperature: f32,
    pub judge_temperature: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::visual()
    }
}

impl AgentConfig {
    pub fn visual() -> Self {
        Self {
            max_cycles: 10,
            settle_after_action: Duration::from_millis(1500),
            settle_before_typing: Duration::from_millis(500),
            submit_typed_text: true,
            decision_temperature: 0.0,
            judge_temperature: 0.0,
        }
    }

    pub fn structural() -> Self {
        Self {
            settle_after_action: Duration::from_secs(2),
            ..Self::visual()
        }
    }
}

/// Drives one goal at a time through perceive, decide, act and verify.
/// The surface is owned here and handed to every collaborator by reference.
pub struct Agent<S, O>
where
    S: Surface,
    O: Oracle,
{
    surface: S,
    oracle: O,
    perceiver: Box<dyn Perceiver>,
    executor: Box<dyn Executor>,
    decider: ActionOracle,
    judge: CompletionJudge,
    transcript: Box<dyn Transcript>,
    cfg: AgentConfig,
}

impl<S, O> Agent<S, O>
where
    S: Surface,
    O: Oracle,
{
    pub fn new(
        surface: S,
        oracle: O,
        perceiver: Box<dyn Perceiver>,
        executor: Box<dyn Executor>,
        cfg: AgentConfig,
    ) -> Self {
        let strategy = perceiver.strategy();
        Self {
            surface,
            oracle,
            perceiver,
            executor,
            decider: ActionOracle::new(strategy, cfg.decision_temperature),
            judge: CompletionJudge::new(strategy, cfg.judge_temperature),
            transcript: Box::new(NullTranscript),
            cfg,
        }
    }

    /// Screenshot, text detection, pixel clicks.
    pub fn visual<D: TextDetector + 'static>(
        surface: S,
        oracle: O,
        detector: D,
        artifacts: Arc<dyn ArtifactStore>,
        cfg: AgentConfig,
    ) -> Self {
        let perceiver = VisualPerceiver::new(detector)
            .with_annotator(Annotator::discover())
            .with_artifacts(artifacts);
        let executor = VisualExecutor {
            settle_before_typing: cfg.settle_before_typing,
            submit_typed_text: cfg.submit_typed_text,
            ..VisualExecutor::default()
        };
        Self::new(surface, oracle, Box::new(perceiver), Box::new(executor), cfg)
    }

    /// Pruned markup, oracle-written instructions.
    pub fn structural(
        surface: S,
        oracle: O,
        artifacts: Arc<dyn ArtifactStore>,
        cfg: AgentConfig,
    ) -> Self {
        let perceiver = StructuralPerceiver::new(HtmlPruner::default()).with_artifacts(artifacts);
        Self::new(surface, oracle, Box::new(perceiver), Box::new(ScriptExecutor), cfg)
    }

    pub fn with_transcript<T: Transcript + 'static>(mut self, transcript: T) -> Self {
        self.transcript = Box::new(transcript);
        self
    }

    pub fn strategy(&self) -> Strategy {
        self.perceiver.strategy()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    async fn perceive(&self) -> Result<Snapshot, AgentError> {
        self.perceiver.perceive(&self.surface).await
    }

    /// Pursue one goal with fresh history and a fresh retry counter.
    /// Every failure ends up in the returned report's `outcome`.
    pub async fn run_goal(&self, goal: &str, start_url: Option<&str>) -> GoalReport {
        let run_id = nanoid!();
        let start = Instant::now();
        let mut history = History::new();
        let mut steps: Vec<StepLog> = Vec::new();
        let mut advice: Option<String> = None;

        info!(run_id = %run_id, goal, strategy = ?self.strategy(), "goal started");
        if let Err(e) = self.transcript.goal_started(&run_id, goal).await {
            warn!("transcript: {}", e);
        }

        if let Some(url) = start_url {
            if let Err(e) = self.surface.navigate(url).await {
                let outcome = aborted(0, AbortReason::Navigation, &e);
                return self.finish(run_id, goal, start, outcome, history, steps).await;
            }
        }

        for cycle in 1..=self.cfg.max_cycles {
            let done_cycles = cycle - 1;

            let snapshot = match self.perceive().await {
                Ok(s) if s.is_empty() => {
                    warn!(cycle, "nothing perceived");
                    let outcome = Outcome::Aborted {
                        cycles: done_cycles,
                        reason: AbortReason::EmptyPerception,
                        detail: "no elements".into(),
                    };
                    return self.finish(run_id, goal, start, outcome, history, steps).await;
                }
                Ok(s) => s,
                Err(e) => {
                    warn!(cycle, error = %e, "perception failed");
                    let outcome = aborted(done_cycles, AbortReason::Perception, &e);
                    return self.finish(run_id, goal, start, outcome, history, steps).await;
                }
            };
            info!(cycle, elements = snapshot.len(), "perceived");

            let decision = match self
                .decider
                .decide(&self.oracle, goal, &snapshot, &history, advice.as_deref())
                .await
            {
                Ok(d) => d,
                Err(e) => {
                    warn!(cycle, error = %e, "no usable decision");
                    let outcome = aborted(done_cycles, AbortReason::from_decision_error(&e), &e);
                    return self.finish(run_id, goal, start, outcome, history, steps).await;
                }
            };

            let outcome = self
                .executor
                .execute(&self.surface, &decision.action, &snapshot)
                .await;
            info!(cycle, action = %decision.action, outcome = %outcome, "executed");
            history.push(HistoryEntry {
                decision: decision.clone(),
                outcome: Some(outcome.clone()),
            });

            sleep(self.cfg.settle_after_action).await;

            let fresh = match self.perceive().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(cycle, error = %e, "re-perception failed, judging blind");
                    Snapshot::empty()
                }
            };
            let verdict = self
                .judge
                .judge(&self.oracle, goal, &history, &decision, &fresh)
                .await;

            let step = StepLog {
                cycle,
                decision,
                outcome,
                verdict: verdict.clone(),
                elapsed_ms: start.elapsed().as_millis(),
            };
            if let Err(e) = self.transcript.step(&run_id, &step).await {
                warn!("transcript: {}", e);
            }
            steps.push(step);

            if verdict.done {
                let outcome = Outcome::Success { cycles: cycle };
                return self.finish(run_id, goal, start, outcome, history, steps).await;
            }
            info!(cycle, advice = ?verdict.advice, "not done yet");
            advice = verdict.advice;
        }

        let outcome = Outcome::Exhausted {
            cycles: self.cfg.max_cycles,
        };
        self.finish(run_id, goal, start, outcome, history, steps).await
    }

    async fn finish(
        &self,
        run_id: String,
        goal: &str,
        start: Instant,
        outcome: Outcome,
        history: History,
        steps: Vec<StepLog>,
    ) -> GoalReport {
        let report = GoalReport {
            run_id,
            goal: goal.to_string(),
            cycles: outcome.cycles(),
            outcome,
            history,
            steps,
            elapsed_ms: start.elapsed().as_millis(),
        };
        if let Err(e) = self.transcript.goal_finished(&report).await {
            warn!("transcript: {}", e);
        }
        info!(run_id = %report.run_id, outcome = %report.outcome, "goal finished");
        report
    }
}

fn aborted(cycles: usize, reason: AbortReason, err: &AgentError) -> Outcome {
    Outcome::Aborted {
        cycles,
        reason,
        detail: err.to_string(),
    }
}
