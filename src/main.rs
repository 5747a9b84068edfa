use anyhow::Result;
use async_trait::async_trait;
use std::env;
use std::sync::Arc;
use surface_agent::agent::{GoalReport, StepLog, Transcript};
use surface_agent::artifacts::{ArtifactStore, DiskArtifacts};
use surface_agent::detect::{DetectorConfig, HttpTextDetector};
use surface_agent::oracle::{OracleClient, OracleConfig};
use surface_agent::{Agent, AgentConfig, AgentError, Browser, BrowserConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Prints each cycle to the terminal as it happens.
struct ConsoleTranscript;

#[async_trait]
impl Transcript for ConsoleTranscript {
    async fn goal_started(&self, run_id: &str, goal: &str) -> Result<(), AgentError> {
        println!("Goal [{run_id}]: {goal}");
        Ok(())
    }

    async fn step(&self, _run_id: &str, step: &StepLog) -> Result<(), AgentError> {
        println!("\nAttempt {}:", step.cycle);
        if let Some(reason) = &step.decision.rationale {
            println!("  reason:  {reason}");
        }
        match &step.decision.target {
            Some(target) => println!("  action:  {} '{}'", step.decision.action, target),
            None => println!("  action:  {}", step.decision.action),
        }
        println!("  result:  {}", step.outcome);
        let verdict = if step.verdict.done { "done" } else { "not done" };
        match &step.verdict.advice {
            Some(advice) => println!("  judge:   {verdict} ({advice})"),
            None => println!("  judge:   {verdict}"),
        }
        Ok(())
    }

    async fn goal_finished(&self, report: &GoalReport) -> Result<(), AgentError> {
        println!("\n{} in {} ms: {}", report.goal, report.elapsed_ms, report.outcome);
        Ok(())
    }
}

/// Blank input means "stay where we are"; bare hosts get `https://`.
fn normalize_url(input: &str) -> Option<String> {
    let url = input.trim();
    if url.is_empty() {
        None
    } else if url.starts_with("http") {
        Some(url.to_string())
    } else {
        Some(format!("https://{url}"))
    }
}

async fn prompt(text: &str) -> Result<()> {
    let mut out = tokio::io::stdout();
    out.write_all(text.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let browser = match env::var("CHROME_WS_URL") {
        Ok(ws) if !ws.trim().is_empty() => Browser::connect(&ws).await?,
        _ => Browser::launch(BrowserConfig::default()).await?,
    };
    let oracle = OracleClient::new(OracleConfig::default())?;
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(DiskArtifacts::new(
        env::var("AGENT_ARTIFACTS_DIR").unwrap_or_else(|_| ".".into()),
    ));

    let agent = match env::var("AGENT_STRATEGY").as_deref().map(str::trim) {
        Ok(s) if s.eq_ignore_ascii_case("visual") => {
            let detector = HttpTextDetector::new(DetectorConfig::default());
            Agent::visual(browser, oracle, detector, artifacts, AgentConfig::visual())
        }
        _ => Agent::structural(browser, oracle, artifacts, AgentConfig::structural()),
    }
    .with_transcript(ConsoleTranscript);
    println!("Strategy: {:?}", agent.strategy());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    prompt("Start URL (blank to stay on the current page): ").await?;
    if let Some(url) = lines.next_line().await?.as_deref().and_then(normalize_url) {
        match agent.surface().goto(&url).await {
            Ok(()) => println!("Opened {}", agent.surface().url().await.unwrap_or(url)),
            Err(e) => warn!("could not open {}: {:#}", url, e),
        }
    }

    loop {
        prompt("\nWhat should I do? ('exit' to quit): ").await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let goal = line.trim();
        if goal.is_empty() {
            continue;
        }
        if goal.eq_ignore_ascii_case("exit") {
            break;
        }
        let report = agent.run_goal(goal, None).await;
        if !report.outcome.is_success() {
            println!("Could not complete the goal. You can rephrase it or try another.");
        }
    }

    Ok(())
}
