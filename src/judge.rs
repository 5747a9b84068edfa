use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::decide::limitations;
use crate::history::{Decision, History};
use crate::oracle::Oracle;
use crate::perception::{Snapshot, Strategy};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub done: bool,
    pub advice: Option<String>,
}

/// Asks the oracle whether the goal is reached, looking at a fresh snapshot.
#[derive(Clone, Debug)]
pub struct CompletionJudge {
    strategy: Strategy,
    temperature: f32,
}

impl CompletionJudge {
    pub fn new(strategy: Strategy, temperature: f32) -> Self {
        Self {
            strategy,
            temperature,
        }
    }

    /// An unreachable judge counts as "not done": the cycle is spent, the goal is not lost.
    pub async fn judge(
        &self,
        oracle: &dyn Oracle,
        goal: &str,
        history: &History,
        last: &Decision,
        snapshot: &Snapshot,
    ) -> JudgeVerdict {
        let prompt = self.render_prompt(goal, history, last, snapshot);
        match oracle.generate(&prompt, self.temperature).await {
            Ok(raw) => {
                debug!(reply = %raw.trim(), "judge reply");
                let verdict = parse_verdict(&raw);
                info!(done = verdict.done, advice = ?verdict.advice, "judged");
                verdict
            }
            Err(e) => {
                warn!(error = %e, "judge unavailable, treating as not done");
                JudgeVerdict {
                    done: false,
                    advice: None,
                }
            }
        }
    }

    pub fn render_prompt(
        &self,
        goal: &str,
        history: &History,
        last: &Decision,
        snapshot: &Snapshot,
    ) -> String {
        let text = snapshot.visible_text();
        let view = if !text.trim().is_empty() {
            text
        } else {
            snapshot
                .markup()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or("(nothing perceived)")
                .to_string()
        };
        let surface = match self.strategy {
            Strategy::Visual => "text detected on the current screen",
            Strategy::Structural => "visible text of the current page",
        };
        format!(
            "You are checking whether a browser automation goal has been reached.

User's goal: {goal}

{limits}

Steps taken so far:
{history}

Last action: {action}
Why it was chosen: {rationale}

This is the {surface}:
{view}

Has the goal been completed? It has if one of these is true:
- The page contains the expected elements or changes.
- A user looking at the page can see the expected elements or changes.
- A user can read the change made by the last action as completing the goal.

Respond in this exact format:
DONE: YES or NO
ADVICE: if NO, one sentence on what to do next
",
            limits = limitations(self.strategy),
            history = history.render(),
            action = last.action,
            rationale = last.rationale.as_deref().unwrap_or("(none given)"),
        )
    }
}

/// Only a line equal to `DONE: YES` (trimmed, any case) means done.
pub fn parse_verdict(raw: &str) -> JudgeVerdict {
    let done = raw
        .lines()
        .any(|l| l.trim().eq_ignore_ascii_case("DONE: YES"));
    let advice = raw
        .lines()
        .map(str::trim)
        .find_map(|l| {
            l.get(..7)
                .filter(|head| head.eq_ignore_ascii_case("ADVICE:"))
                .map(|_| l[7..].trim().to_string())
        })
        .or_else(|| Some(raw.trim().to_string()))
        .filter(|a| !a.is_empty());
    JudgeVerdict { done, advice }
}
