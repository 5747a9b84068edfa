use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::history::{Action, Decision, History};
use crate::oracle::Oracle;
use crate::perception::{Snapshot, Strategy};
use crate::script::INSTRUCTION_HELP;

pub const VISUAL_LIMITATIONS: &str = "System limitations:
- You only see text detected on a screenshot and its pixel box, not the page structure or meaning.
- Typing into a field is submitted automatically with Enter.
- Text in non-Latin scripts may be missing or unreadable.
- If there is no obvious target, prefer clearing a field, going back, or returning to a known starting page.";

pub const STRUCTURAL_LIMITATIONS: &str = "System limitations:
- You only see a pruned copy of the page markup: scripts, styles, hidden nodes, ids and classes are removed.
- Only the listed instructions exist; typing does not submit unless you press Enter or submit.
- Text in non-Latin scripts may be unreadable.
- If there is no obvious target, prefer clearing a field, going back, or navigating to a known entry point.";

pub fn limitations(strategy: Strategy) -> &'static str {
    match strategy {
        Strategy::Visual => VISUAL_LIMITATIONS,
        Strategy::Structural => STRUCTURAL_LIMITATIONS,
    }
}

/// Renders decision requests, calls the oracle once, parses its reply.
#[derive(Clone, Debug)]
pub struct ActionOracle {
    strategy: Strategy,
    temperature: f32,
}

impl ActionOracle {
    pub fn new(strategy: Strategy, temperature: f32) -> Self {
        Self {
            strategy,
            temperature,
        }
    }

    pub async fn decide(
        &self,
        oracle: &dyn Oracle,
        goal: &str,
        snapshot: &Snapshot,
        history: &History,
        advice: Option<&str>,
    ) -> Result<Decision, AgentError> {
        let prompt = self.render_prompt(goal, snapshot, history, advice);
        let raw = oracle.generate(&prompt, self.temperature).await?;
        debug!(reply = %raw.trim(), "decision reply");
        let decision = self.parse(&raw, snapshot)?;
        info!(action = %decision.action, target = ?decision.target, "decided");
        Ok(decision)
    }

    pub fn render_prompt(
        &self,
        goal: &str,
        snapshot: &Snapshot,
        history: &History,
        advice: Option<&str>,
    ) -> String {
        let advice_text = advice
            .filter(|a| !a.trim().is_empty())
            .map(|a| format!("\nJudge's latest advice: {}\n", a.trim()))
            .unwrap_or_default();
        match self.strategy {
            Strategy::Visual => format!(
                "You are controlling a browser screen using pixel coordinates and detected text boxes.

User's goal: {goal}

{VISUAL_LIMITATIONS}

Past steps:
{history}
{advice_text}
Here are the visible text elements:
{elements}

Decide which element (if any) should be clicked or typed into.
If typing is needed, also provide the text.

Respond in this exact format:
ACTION: click or type
INDEX: index of the element, or none
TEXT: text to type (leave blank when clicking)
REASON: one sentence on why

Example:
ACTION: type
INDEX: 2
TEXT: python tutorial
REASON: index 2 is the search field
",
                history = history.render(),
                elements = render_elements(snapshot),
            ),
            Strategy::Structural => format!(
                "You are controlling a web browser through a small instruction language.

User's goal: {goal}

{STRUCTURAL_LIMITATIONS}

Past steps:
{history}
{advice_text}
This is the current cleaned HTML:
{markup}

{INSTRUCTION_HELP}

Reply with one line `REASON: <why>` followed by exactly one fenced block holding the
instructions for the next step, nothing else:
```actions
<instructions>
```
",
                history = history.render(),
                markup = snapshot.markup().unwrap_or(""),
            ),
        }
    }

    pub fn parse(&self, raw: &str, snapshot: &Snapshot) -> Result<Decision, AgentError> {
        match self.strategy {
            Strategy::Visual => parse_visual(raw, snapshot),
            Strategy::Structural => Ok(parse_structural(raw)),
        }
    }
}

/// `<index>. '<text>' at [x1, y1, x2, y2]`, one line per element.
pub fn render_elements(snapshot: &Snapshot) -> String {
    snapshot
        .elements()
        .iter()
        .map(|el| match el.bbox() {
            Some(b) => format!("{}. '{}' at {}", el.index, el.text, b),
            None => format!("{}. '{}'", el.index, el.text),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Default)]
struct Fields {
    action: Option<String>,
    index: Option<String>,
    text: Option<String>,
    reason: Option<String>,
}

fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let head = line.get(..key.len())?;
    if head.eq_ignore_ascii_case(key) {
        Some(line[key.len()..].trim())
    } else {
        None
    }
}

fn set_once(slot: &mut Option<String>, key: &str, value: &str) -> Result<(), AgentError> {
    match slot {
        Some(prev) if prev != value => Err(AgentError::Parse(format!(
            "conflicting {key} values '{prev}' and '{value}'"
        ))),
        _ => {
            *slot = Some(value.to_string());
            Ok(())
        }
    }
}

/// Strict `ACTION:` / `INDEX:` / `TEXT:` / `REASON:` grammar. Other lines are ignored.
pub fn parse_visual(raw: &str, snapshot: &Snapshot) -> Result<Decision, AgentError> {
    let mut f = Fields::default();
    for line in raw.lines() {
        let line = line
            .trim_start_matches(|c: char| c == '*' || c == '-' || c.is_whitespace())
            .trim_end();
        if let Some(v) = field(line, "ACTION:") {
            set_once(&mut f.action, "ACTION", v)?;
        } else if let Some(v) = field(line, "INDEX:") {
            set_once(&mut f.index, "INDEX", v)?;
        } else if let Some(v) = field(line, "TEXT:") {
            set_once(&mut f.text, "TEXT", v)?;
        } else if let Some(v) = field(line, "REASON:") {
            set_once(&mut f.reason, "REASON", v)?;
        }
    }

    let verb = f
        .action
        .ok_or_else(|| AgentError::Parse("missing ACTION".into()))?
        .to_ascii_lowercase();
    let index_text = f
        .index
        .ok_or_else(|| AgentError::Parse("missing INDEX".into()))?;
    let index = match index_text.to_ascii_lowercase().as_str() {
        "" | "none" | "n/a" | "null" => {
            return Err(AgentError::NoTarget {
                index: None,
                len: snapshot.len(),
            })
        }
        s => s
            .parse::<i64>()
            .map_err(|_| AgentError::Parse(format!("INDEX is not a number: '{index_text}'")))?,
    };
    let element = snapshot.get(index)?;
    let index = element.index;

    let action = match verb.as_str() {
        "click" => Action::Click { index },
        "type" => {
            let text = f
                .text
                .filter(|t| !t.is_empty())
                .ok_or_else(|| AgentError::Parse("type without TEXT".into()))?;
            Action::Type { index, text }
        }
        other => return Err(AgentError::Parse(format!("unknown ACTION '{other}'"))),
    };

    Ok(Decision {
        action,
        target: Some(element.text.clone()),
        rationale: f.reason.filter(|r| !r.is_empty()),
    })
}

/// First fenced block wins. A fence with nothing usable falls back to the
/// reply's own lines; an empty body still becomes a (no-op) script so the
/// cycle reaches verification.
pub fn parse_structural(raw: &str) -> Decision {
    let (fenced, outside) = match raw.find("```") {
        Some(open) => {
            let after = &raw[open + 3..];
            let (inner, tail) = match after.find("```") {
                Some(close) => (&after[..close], &after[close + 3..]),
                None => (after, ""),
            };
            (fenced_body(inner), format!("{}\n{}", &raw[..open], tail))
        }
        None => (String::new(), raw.to_string()),
    };

    let rationale = outside
        .lines()
        .find_map(|l| field(l.trim(), "REASON:"))
        .filter(|r| !r.is_empty())
        .map(str::to_string);

    let instructions = if fenced.is_empty() {
        unfenced(raw)
    } else {
        fenced
    };
    if instructions.is_empty() {
        warn!("reply holds no instructions");
    }
    Decision {
        action: Action::Script { instructions },
        target: None,
        rationale,
    }
}

/// Text between fences. A first line of a single word (```actions) is the
/// info string; a one-line block (```back```) is all body.
fn fenced_body(inner: &str) -> String {
    let body = match inner.split_once('\n') {
        Some((info, rest)) if !info.trim().contains(char::is_whitespace) => rest,
        _ => inner,
    };
    body.trim().to_string()
}

/// The raw reply without `REASON:` lines and fence markers.
fn unfenced(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .filter(|l| field(l, "REASON:").is_none() && !l.starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
