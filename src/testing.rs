//! In-crate fakes for unit tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::AgentError;
use crate::oracle::Oracle;
use crate::surface::{Key, Surface};

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Navigate(String),
    Screenshot,
    Markup,
    Evaluate(String),
    InsertText(String),
    Press(Key),
}

/// Records every call; `evaluate` answers from a queue, then `Value::Null`.
#[derive(Default)]
pub struct FakeSurface {
    markup: String,
    evals: Mutex<VecDeque<Result<Value, AgentError>>>,
    pub calls: Mutex<Vec<Call>>,
}

impl FakeSurface {
    pub fn with_markup(mut self, markup: &str) -> Self {
        self.markup = markup.to_string();
        self
    }

    pub fn with_eval(self, v: Value) -> Self {
        self.evals.lock().unwrap().push_back(Ok(v));
        self
    }

    pub fn with_eval_error(self, err: AgentError) -> Self {
        self.evals.lock().unwrap().push_back(Err(err));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Surface for FakeSurface {
    async fn navigate(&self, url: &str) -> Result<(), AgentError> {
        self.record(Call::Navigate(url.to_string()));
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, AgentError> {
        self.record(Call::Screenshot);
        Ok(vec![0x89, b'P', b'N', b'G'])
    }

    async fn markup(&self) -> Result<String, AgentError> {
        self.record(Call::Markup);
        Ok(self.markup.clone())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, AgentError> {
        self.record(Call::Evaluate(script.to_string()));
        self.evals.lock().unwrap().pop_front().unwrap_or(Ok(Value::Null))
    }

    async fn insert_text(&self, text: &str) -> Result<(), AgentError> {
        self.record(Call::InsertText(text.to_string()));
        Ok(())
    }

    async fn press_key(&self, key: Key) -> Result<(), AgentError> {
        self.record(Call::Press(key));
        Ok(())
    }
}

/// Replays canned completions in order and keeps every prompt it was sent.
#[derive(Default)]
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Result<String, AgentError>>>,
    pub prompts: Mutex<Vec<(String, f32)>>,
}

impl ScriptedOracle {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(err: AgentError) -> Self {
        Self {
            replies: Mutex::new(VecDeque::from([Err(err)])),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn generate(&self, prompt: &str, temperature: f32) -> Result<String, AgentError> {
        self.prompts.lock().unwrap().push((prompt.to_string(), temperature));
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AgentError::Oracle("script exhausted".into())))
    }
}
