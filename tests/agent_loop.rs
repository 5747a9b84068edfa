use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use surface_agent::executor::{Executor, ScriptExecutor, VisualExecutor};
use surface_agent::perception::{BoundingBox, Perceiver};
use surface_agent::{
    AbortReason, Action, Agent, AgentConfig, AgentError, ExecutionOutcome, Key, Outcome, Snapshot,
    Strategy, Surface,
};

// ========================= Fakes =========================

#[derive(Clone, Debug, PartialEq)]
enum Call {
    Navigate(String),
    Evaluate,
    InsertText(String),
    Press(Key),
}

/// Answers every `evaluate` with `true` and records what it was asked to do.
#[derive(Default)]
struct RecordingSurface {
    calls: Mutex<Vec<Call>>,
}

impl RecordingSurface {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Surface for RecordingSurface {
    async fn navigate(&self, url: &str) -> Result<(), AgentError> {
        self.calls.lock().unwrap().push(Call::Navigate(url.into()));
        Ok(())
    }
    async fn screenshot(&self) -> Result<Vec<u8>, AgentError> {
        Ok(Vec::new())
    }
    async fn markup(&self) -> Result<String, AgentError> {
        Ok(String::new())
    }
    async fn evaluate(&self, _script: &str) -> Result<Value, AgentError> {
        self.calls.lock().unwrap().push(Call::Evaluate);
        Ok(json!(true))
    }
    async fn insert_text(&self, text: &str) -> Result<(), AgentError> {
        self.calls.lock().unwrap().push(Call::InsertText(text.into()));
        Ok(())
    }
    async fn press_key(&self, key: Key) -> Result<(), AgentError> {
        self.calls.lock().unwrap().push(Call::Press(key));
        Ok(())
    }
}

/// Queued snapshots first, then the fallback forever.
struct FakePerceiver {
    strategy: Strategy,
    queued: Mutex<VecDeque<Snapshot>>,
    fallback: Snapshot,
}

impl FakePerceiver {
    fn always(strategy: Strategy, snapshot: Snapshot) -> Self {
        Self {
            strategy,
            queued: Mutex::new(VecDeque::new()),
            fallback: snapshot,
        }
    }

    fn first(mut self, snapshot: Snapshot) -> Self {
        self.queued.get_mut().unwrap().push_back(snapshot);
        self
    }
}

#[async_trait]
impl Perceiver for FakePerceiver {
    fn strategy(&self) -> Strategy {
        self.strategy
    }
    async fn perceive(&self, _surface: &dyn Surface) -> Result<Snapshot, AgentError> {
        let next = self.queued.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Judge prompts get the queued verdicts (then `DONE: NO`); every other prompt
/// gets the fixed decision reply.
struct RuleOracle {
    decision: String,
    verdicts: Mutex<VecDeque<Result<String, AgentError>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl RuleOracle {
    fn new(decision: &str, verdicts: &[&str]) -> (Self, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let oracle = Self {
            decision: decision.into(),
            verdicts: Mutex::new(verdicts.iter().map(|v| Ok(v.to_string())).collect()),
            log: log.clone(),
        };
        (oracle, log)
    }
}

fn is_judge_prompt(prompt: &str) -> bool {
    prompt.contains("DONE: YES or NO")
}

#[async_trait]
impl surface_agent::oracle::Oracle for RuleOracle {
    async fn generate(&self, prompt: &str, _temperature: f32) -> Result<String, AgentError> {
        self.log.lock().unwrap().push(prompt.to_string());
        if is_judge_prompt(prompt) {
            self.verdicts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("DONE: NO\nADVICE: keep going".into()))
        } else {
            Ok(self.decision.clone())
        }
    }
}

struct CountingExecutor {
    inner: Box<dyn Executor>,
    count: Arc<AtomicUsize>,
}

#[async_trait]
impl Executor for CountingExecutor {
    async fn execute(
        &self,
        surface: &dyn Surface,
        action: &Action,
        snapshot: &Snapshot,
    ) -> ExecutionOutcome {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(surface, action, snapshot).await
    }
}

// ========================= Helpers =========================

fn config(max_cycles: usize) -> AgentConfig {
    AgentConfig {
        max_cycles,
        settle_after_action: Duration::ZERO,
        settle_before_typing: Duration::ZERO,
        ..AgentConfig::visual()
    }
}

fn bbox(x1: i64, y1: i64, x2: i64, y2: i64) -> BoundingBox {
    BoundingBox { x1, y1, x2, y2 }
}

fn search_page() -> Snapshot {
    Snapshot::visual(vec![
        ("Search box".to_string(), bbox(100, 40, 500, 70), 0.98),
        ("Images".to_string(), bbox(520, 40, 580, 70), 0.91),
        ("Sign in".to_string(), bbox(600, 40, 660, 70), 0.95),
    ])
}

fn visual_agent(
    perceiver: FakePerceiver,
    oracle: RuleOracle,
    max_cycles: usize,
) -> (Agent<RecordingSurface, RuleOracle>, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let executor = CountingExecutor {
        inner: Box::new(VisualExecutor {
            settle_before_typing: Duration::ZERO,
            show_marker: false,
            ..VisualExecutor::default()
        }),
        count: count.clone(),
    };
    let agent = Agent::new(
        RecordingSurface::default(),
        oracle,
        Box::new(perceiver),
        Box::new(executor),
        config(max_cycles),
    );
    (agent, count)
}

const CLICK_FIRST: &str = "ACTION: click\nINDEX: 0\nTEXT:\nREASON: first element";

// ========================= Scenarios =========================

#[tokio::test]
async fn never_done_runs_exactly_the_ceiling() {
    let (oracle, log) = RuleOracle::new(CLICK_FIRST, &[]);
    let perceiver = FakePerceiver::always(Strategy::Visual, search_page());
    let (agent, executed) = visual_agent(perceiver, oracle, 4);

    let report = agent.run_goal("find the weather", None).await;

    assert_eq!(report.outcome, Outcome::Exhausted { cycles: 4 });
    assert_eq!(report.history.len(), 4);
    assert_eq!(report.steps.len(), 4);
    assert_eq!(executed.load(Ordering::SeqCst), 4);
    let prompts = log.lock().unwrap().clone();
    assert_eq!(prompts.len(), 8);
    assert_eq!(prompts.iter().filter(|p| is_judge_prompt(p)).count(), 4);
}

#[tokio::test]
async fn done_on_the_kth_verdict_succeeds_after_k_cycles() {
    let (oracle, _log) = RuleOracle::new(CLICK_FIRST, &["DONE: NO", "DONE: NO", "DONE: YES"]);
    let perceiver = FakePerceiver::always(Strategy::Visual, search_page());
    let (agent, executed) = visual_agent(perceiver, oracle, 10);

    let report = agent.run_goal("open images", None).await;

    assert_eq!(report.outcome, Outcome::Success { cycles: 3 });
    assert_eq!(report.cycles, 3);
    assert_eq!(report.history.len(), 3);
    assert_eq!(executed.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn search_for_cats() {
    let decision = "ACTION: type\nINDEX: 0\nTEXT: cats\nREASON: index 0 is the search field";
    let (oracle, log) = RuleOracle::new(decision, &["DONE: YES\nADVICE: none"]);
    let results = Snapshot::visual(vec![
        ("Results for cats".to_string(), bbox(100, 100, 400, 130), 0.97),
    ]);
    let perceiver = FakePerceiver::always(Strategy::Visual, results).first(search_page());
    let (agent, _) = visual_agent(perceiver, oracle, 10);

    let report = agent.run_goal("search for cats", None).await;

    assert_eq!(report.outcome, Outcome::Success { cycles: 1 });
    let entry = &report.history.entries()[0];
    assert_eq!(entry.decision.action, Action::Type { index: 0, text: "cats".into() });
    assert_eq!(entry.decision.target.as_deref(), Some("Search box"));
    assert_eq!(entry.outcome, Some(ExecutionOutcome::Applied));
    assert_eq!(
        agent.surface().calls(),
        vec![
            Call::Evaluate,
            Call::Evaluate,
            Call::InsertText("cats".into()),
            Call::Press(Key::Enter),
        ]
    );

    let prompts = log.lock().unwrap().clone();
    assert!(prompts[0].contains("0. 'Search box' at [100, 40, 500, 70]"));
    assert!(prompts[1].contains("Results for cats"));
}

#[tokio::test]
async fn empty_first_perception_aborts_without_oracle_calls() {
    let (oracle, log) = RuleOracle::new(CLICK_FIRST, &[]);
    let perceiver = FakePerceiver::always(Strategy::Visual, search_page()).first(Snapshot::empty());
    let (agent, executed) = visual_agent(perceiver, oracle, 10);

    let report = agent.run_goal("anything", None).await;

    assert!(matches!(
        report.outcome,
        Outcome::Aborted { cycles: 0, reason: AbortReason::EmptyPerception, .. }
    ));
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(executed.load(Ordering::SeqCst), 0);
    assert!(report.history.is_empty());
}

#[tokio::test]
async fn out_of_range_index_executes_nothing() {
    let (oracle, log) = RuleOracle::new("ACTION: click\nINDEX: 5", &[]);
    let perceiver = FakePerceiver::always(Strategy::Visual, search_page());
    let (agent, executed) = visual_agent(perceiver, oracle, 10);

    let report = agent.run_goal("click the sixth thing", None).await;

    match &report.outcome {
        Outcome::Aborted { cycles, reason, detail } => {
            assert_eq!(*cycles, 0);
            assert_eq!(*reason, AbortReason::NoTarget);
            assert!(detail.contains('5'), "{detail}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(executed.load(Ordering::SeqCst), 0);
    assert!(agent.surface().calls().is_empty());
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unparseable_decision_aborts() {
    let (oracle, _log) = RuleOracle::new("I would click the search box.", &[]);
    let perceiver = FakePerceiver::always(Strategy::Visual, search_page());
    let (agent, executed) = visual_agent(perceiver, oracle, 10);

    let report = agent.run_goal("search", None).await;

    assert!(matches!(
        report.outcome,
        Outcome::Aborted { reason: AbortReason::Parse, .. }
    ));
    assert_eq!(executed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn judge_failure_spends_the_cycle() {
    let (oracle, _log) = RuleOracle::new(CLICK_FIRST, &[]);
    oracle
        .verdicts
        .lock()
        .unwrap()
        .push_back(Err(AgentError::Oracle("timeout".into())));
    let perceiver = FakePerceiver::always(Strategy::Visual, search_page());
    let (agent, _) = visual_agent(perceiver, oracle, 2);

    let report = agent.run_goal("g", None).await;

    assert_eq!(report.outcome, Outcome::Exhausted { cycles: 2 });
    assert!(!report.steps[0].verdict.done);
}

#[tokio::test]
async fn each_goal_starts_with_fresh_history() {
    let (oracle, log) = RuleOracle::new(CLICK_FIRST, &[]);
    let perceiver = FakePerceiver::always(Strategy::Visual, search_page());
    let (agent, _) = visual_agent(perceiver, oracle, 2);

    let first = agent.run_goal("first goal", None).await;
    assert_eq!(first.history.len(), 2);
    let before = log.lock().unwrap().len();

    let second = agent.run_goal("second goal", None).await;
    assert_eq!(second.history.len(), 2);
    assert_ne!(first.run_id, second.run_id);

    let prompts = log.lock().unwrap().clone();
    let opening = &prompts[before];
    assert!(opening.contains("User's goal: second goal"));
    assert!(opening.contains("Past steps:\nNone yet"));
}

#[tokio::test]
async fn start_url_is_opened_before_perceiving() {
    let (oracle, _log) = RuleOracle::new(CLICK_FIRST, &["DONE: YES"]);
    let perceiver = FakePerceiver::always(Strategy::Visual, search_page());
    let (agent, _) = visual_agent(perceiver, oracle, 3);

    agent.run_goal("g", Some("https://example.com")).await;

    assert_eq!(agent.surface().calls()[0], Call::Navigate("https://example.com".into()));
}

#[tokio::test]
async fn structural_goal_runs_instructions() {
    let page = Snapshot::structural(
        "<form>\n<input name=\"q\">\n<button>Search</button>\n</form>".into(),
        vec![("button".to_string(), "Search".to_string())],
    );
    let decision = "REASON: fill in the search form\n```actions\ntype name q \"cats\"\npress Enter\n```";
    let (oracle, log) = RuleOracle::new(decision, &["DONE: YES"]);
    let perceiver = FakePerceiver::always(Strategy::Structural, page);
    let cfg = AgentConfig {
        settle_after_action: Duration::ZERO,
        ..AgentConfig::structural()
    };
    let agent = Agent::new(
        RecordingSurface::default(),
        oracle,
        Box::new(perceiver),
        Box::new(ScriptExecutor),
        cfg,
    );

    let report = agent.run_goal("search for cats", None).await;

    assert_eq!(report.outcome, Outcome::Success { cycles: 1 });
    assert_eq!(
        agent.surface().calls(),
        vec![Call::Evaluate, Call::InsertText("cats".into()), Call::Press(Key::Enter)]
    );
    let entry = &report.history.entries()[0];
    assert!(matches!(entry.decision.action, Action::Script { .. }));
    assert_eq!(entry.decision.rationale.as_deref(), Some("fill in the search form"));
    assert!(log.lock().unwrap()[0].contains("<input name=\"q\">"));
}

#[tokio::test]
async fn bad_instruction_body_is_no_effect_not_abort() {
    let page = Snapshot::structural("<p>hi</p>".into(), Vec::new());
    let (oracle, _log) = RuleOracle::new("```python\ndriver.get('x')\n```", &["DONE: NO", "DONE: YES"]);
    let perceiver = FakePerceiver::always(Strategy::Structural, page);
    let cfg = AgentConfig {
        settle_after_action: Duration::ZERO,
        ..AgentConfig::structural()
    };
    let agent = Agent::new(
        RecordingSurface::default(),
        oracle,
        Box::new(perceiver),
        Box::new(ScriptExecutor),
        cfg,
    );

    let report = agent.run_goal("g", None).await;

    assert_eq!(report.outcome, Outcome::Success { cycles: 2 });
    assert!(matches!(
        report.history.entries()[0].outcome,
        Some(ExecutionOutcome::NoEffect { .. })
    ));
    assert!(agent.surface().calls().is_empty());
}

#[tokio::test]
async fn empty_fenced_reply_spends_the_cycle_without_aborting() {
    let page = Snapshot::structural("<p>hi</p>".into(), Vec::new());
    let (oracle, log) = RuleOracle::new("REASON: unsure\n```actions\n```", &[]);
    let perceiver = FakePerceiver::always(Strategy::Structural, page);
    let cfg = AgentConfig {
        max_cycles: 2,
        settle_after_action: Duration::ZERO,
        ..AgentConfig::structural()
    };
    let agent = Agent::new(
        RecordingSurface::default(),
        oracle,
        Box::new(perceiver),
        Box::new(ScriptExecutor),
        cfg,
    );

    let report = agent.run_goal("g", None).await;

    assert_eq!(report.outcome, Outcome::Exhausted { cycles: 2 });
    match &report.history.entries()[0].outcome {
        Some(ExecutionOutcome::NoEffect { reason }) => assert_eq!(reason, "no instructions"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(log.lock().unwrap().iter().filter(|p| is_judge_prompt(p)).count(), 2);
}
