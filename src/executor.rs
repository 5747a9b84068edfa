use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::AgentError;
use crate::history::{Action, ExecutionOutcome};
use crate::perception::Snapshot;
use crate::script::{parse_script, Instruction, Locator};
use crate::surface::{Key, Surface};

/// Carries out a decided action on the live surface. Failures never escape:
/// they come back as `NoEffect` and the cycle still goes on to verification.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        surface: &dyn Surface,
        action: &Action,
        snapshot: &Snapshot,
    ) -> ExecutionOutcome;
}

fn settle(result: Result<(), AgentError>, action: &Action) -> ExecutionOutcome {
    match result {
        Ok(()) => {
            info!(action = %action, "action applied");
            ExecutionOutcome::Applied
        }
        Err(e) => {
            warn!(action = %action, error = %e, "action had no effect");
            let reason = match e {
                AgentError::Action(msg) => msg,
                other => other.to_string(),
            };
            ExecutionOutcome::NoEffect { reason }
        }
    }
}

fn truthy(v: &Value) -> bool {
    v.as_bool().unwrap_or(false)
}

// ========================= Visual =========================

#[derive(Clone, Debug)]
pub struct VisualExecutor {
    pub settle_before_typing: Duration,
    pub submit_typed_text: bool,
    pub show_marker: bool,
}

impl Default for VisualExecutor {
    fn default() -> Self {
        Self {
            settle_before_typing: Duration::from_millis(500),
            submit_typed_text: true,
            show_marker: true,
        }
    }
}

/// Resolve the topmost element at a viewport point, focus it and dispatch a
/// bubbling, cancelable click. Evaluates to whether anything was there.
pub fn click_at_js(x: i64, y: i64, marker: bool) -> String {
    format!(
        r#"(() => {{
  const x = {x}, y = {y};
  const el = document.elementFromPoint(x, y);
  if (!el) return false;
  if ({marker} && document.body) {{
    const dot = document.createElement('div');
    Object.assign(dot.style, {{
      position: 'fixed', left: (x - 10) + 'px', top: (y - 10) + 'px',
      width: '20px', height: '20px', borderRadius: '50%',
      backgroundColor: 'rgba(0, 150, 255, 0.6)', boxShadow: '0 0 10px rgba(0, 150, 255, 0.8)',
      zIndex: 2147483647, pointerEvents: 'none',
      transition: 'transform 0.4s ease-out, opacity 0.4s ease-out'
    }});
    document.body.appendChild(dot);
    setTimeout(() => {{ dot.style.transform = 'scale(3)'; dot.style.opacity = '0'; }}, 10);
    setTimeout(() => dot.remove(), 500);
  }}
  if (typeof el.focus === 'function') el.focus();
  el.dispatchEvent(new MouseEvent('click', {{
    view: window, bubbles: true, cancelable: true, clientX: x, clientY: y
  }}));
  return true;
}})()"#
    )
}

/// Empty the focused field. Evaluates to false when nothing editable has focus.
pub const CLEAR_FOCUSED_JS: &str = r#"(() => {
  const el = document.activeElement;
  if (!el || el === document.body) return false;
  if ((el.tagName === 'INPUT' || el.tagName === 'TEXTAREA') && !el.readOnly && !el.disabled) {
    el.value = '';
    el.dispatchEvent(new Event('input', { bubbles: true }));
    return true;
  }
  if (el.isContentEditable) {
    el.textContent = '';
    return true;
  }
  return false;
})()"#;

impl VisualExecutor {
    async fn click(&self, surface: &dyn Surface, x: i64, y: i64) -> Result<(), AgentError> {
        let hit = surface
            .evaluate(&click_at_js(x, y, self.show_marker))
            .await
            .map_err(|e| AgentError::Action(e.to_string()))?;
        if !truthy(&hit) {
            return Err(AgentError::Action(format!("nothing clickable at ({x}, {y})")));
        }
        Ok(())
    }

    async fn run(
        &self,
        surface: &dyn Surface,
        action: &Action,
        snapshot: &Snapshot,
    ) -> Result<(), AgentError> {
        let (index, text) = match action {
            Action::Click { index } => (*index, None),
            Action::Type { index, text } => (*index, Some(text.as_str())),
            Action::Script { .. } => {
                return Err(AgentError::Action("scripts need the structural strategy".into()))
            }
        };
        let element = snapshot.get(index as i64)?;
        let bbox = element
            .bbox()
            .ok_or_else(|| AgentError::Action(format!("element #{index} has no box")))?;
        let (x, y) = bbox.center();
        info!(index, x, y, text = %element.text, "dispatching click");
        self.click(surface, x, y).await?;

        let Some(text) = text else {
            return Ok(());
        };
        sleep(self.settle_before_typing).await;
        let editable = surface
            .evaluate(CLEAR_FOCUSED_JS)
            .await
            .map_err(|e| AgentError::Action(e.to_string()))?;
        if !truthy(&editable) {
            return Err(AgentError::Action(format!(
                "no editable element focused after clicking ({x}, {y})"
            )));
        }
        surface
            .insert_text(text)
            .await
            .map_err(|e| AgentError::Action(e.to_string()))?;
        if self.submit_typed_text {
            surface
                .press_key(Key::Enter)
                .await
                .map_err(|e| AgentError::Action(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for VisualExecutor {
    async fn execute(
        &self,
        surface: &dyn Surface,
        action: &Action,
        snapshot: &Snapshot,
    ) -> ExecutionOutcome {
        settle(self.run(surface, action, snapshot).await, action)
    }
}

// ========================= Structural =========================

/// Runs oracle-authored instruction bodies. Only the verbs of the instruction
/// language are reachable; the body never gets a handle of its own.
#[derive(Clone, Debug, Default)]
pub struct ScriptExecutor;

fn with_element(locator: &Locator, body: &str) -> String {
    format!(
        "(() => {{ const el = {}; if (!el) return false; {} }})()",
        locator.resolver_js(),
        body
    )
}

impl ScriptExecutor {
    async fn eval_found(
        &self,
        surface: &dyn Surface,
        locator: &Locator,
        script: String,
    ) -> Result<(), AgentError> {
        let v = surface
            .evaluate(&script)
            .await
            .map_err(|e| AgentError::Action(e.to_string()))?;
        if truthy(&v) {
            Ok(())
        } else {
            Err(AgentError::Action(format!("no element for {locator}")))
        }
    }

    async fn step(&self, surface: &dyn Surface, instruction: &Instruction) -> Result<(), AgentError> {
        let act = |e: AgentError| AgentError::Action(e.to_string());
        match instruction {
            Instruction::Navigate { url } => surface.navigate(url).await.map_err(act),
            Instruction::Click { target } => {
                let js = with_element(
                    target,
                    "el.scrollIntoView({block: 'center'}); if (el.focus) el.focus(); el.click(); return true;",
                );
                self.eval_found(surface, target, js).await
            }
            Instruction::Type { target, text } => {
                let js = with_element(
                    target,
                    "el.scrollIntoView({block: 'center'}); el.focus(); \
                     if ('value' in el) { el.value = ''; el.dispatchEvent(new Event('input', {bubbles: true})); } \
                     else if (el.isContentEditable) { el.textContent = ''; } \
                     return document.activeElement === el;",
                );
                self.eval_found(surface, target, js).await?;
                surface.insert_text(text).await.map_err(act)
            }
            Instruction::Clear { target } => {
                let js = with_element(
                    target,
                    "if (!('value' in el)) return false; el.value = ''; \
                     el.dispatchEvent(new Event('input', {bubbles: true})); return true;",
                );
                self.eval_found(surface, target, js).await
            }
            Instruction::Submit { target } => {
                let js = with_element(
                    target,
                    "const form = el.tagName === 'FORM' ? el : el.form; if (!form) return false; \
                     if (form.requestSubmit) form.requestSubmit(); else form.submit(); return true;",
                );
                self.eval_found(surface, target, js).await
            }
            Instruction::Press { key } => surface.press_key(*key).await.map_err(act),
            Instruction::Scroll { dx, dy } => surface
                .evaluate(&format!("window.scrollBy({dx}, {dy}); true"))
                .await
                .map(|_| ())
                .map_err(act),
            Instruction::Wait { ms } => {
                sleep(Duration::from_millis(*ms)).await;
                Ok(())
            }
            Instruction::Back => surface
                .evaluate("history.back(); true")
                .await
                .map(|_| ())
                .map_err(act),
        }
    }

    async fn run(&self, surface: &dyn Surface, action: &Action) -> Result<(), AgentError> {
        let Action::Script { instructions } = action else {
            return Err(AgentError::Action("pixel actions need the visual strategy".into()));
        };
        let program = parse_script(instructions)?;
        if program.is_empty() {
            return Err(AgentError::Action("no instructions".into()));
        }
        for (n, instruction) in program.iter().enumerate() {
            self.step(surface, instruction)
                .await
                .map_err(|e| AgentError::Action(format!("instruction {} {:?}: {}", n + 1, instruction, e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for ScriptExecutor {
    async fn execute(
        &self,
        surface: &dyn Surface,
        action: &Action,
        _snapshot: &Snapshot,
    ) -> ExecutionOutcome {
        settle(self.run(surface, action).await, action)
    }
}
