use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::env;
use std::str::FromStr;
use tracing::debug;

use crate::error::AgentError;

/// A stateless text-completion service. Every call carries its full context.
#[async_trait]
pub trait Oracle: Send + Sync {
    async fn generate(&self, prompt: &str, temperature: f32) -> Result<String, AgentError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Provider {
    /// Google `models/{model}:generateContent`.
    Gemini,
    /// OpenAI Responses API.
    OpenAi,
}

impl FromStr for Provider {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(Provider::Gemini),
            "openai" => Ok(Provider::OpenAi),
            other => Err(AgentError::Oracle(format!("unknown provider '{other}'"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OracleConfig {
    pub provider: Provider,  // env ORACLE_PROVIDER
    pub api_base: String,    // e.g. "https://generativelanguage.googleapis.com/v1beta"
    pub api_key: String,     // env GEMINI_API_KEY / OPENAI_API_KEY
    pub model: String,       // e.g. "gemini-2.0-flash"
}

impl Default for OracleConfig {
    fn default() -> Self {
        let provider = env::var("ORACLE_PROVIDER")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(Provider::Gemini);
        Self::for_provider(provider)
    }
}

impl OracleConfig {
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::Gemini => Self {
                provider,
                api_base: env::var("GEMINI_BASE_URL")
                    .unwrap_or_else(|_| "https://generativelanguage.googleapis.com/v1beta".into()),
                api_key: env::var("GEMINI_API_KEY").unwrap_or_default(),
                model: env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".into()),
            },
            Provider::OpenAi => Self {
                provider,
                api_base: env::var("OPENAI_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".into()),
                api_key: env::var("OPENAI_API_KEY").unwrap_or_default(),
                model: env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            },
        }
    }
}

#[derive(Clone)]
pub struct OracleClient {
    http: Client,
    cfg: OracleConfig,
}

impl OracleClient {
    pub fn new(cfg: OracleConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            match cfg.provider {
                Provider::Gemini => bail!("GEMINI_API_KEY missing"),
                Provider::OpenAi => bail!("OPENAI_API_KEY missing"),
            }
        }
        Ok(Self {
            http: Client::new(),
            cfg,
        })
    }

    async fn complete(&self, prompt: &str, temperature: f32) -> Result<String> {
        let req = match self.cfg.provider {
            Provider::Gemini => self
                .http
                .post(format!(
                    "{}/models/{}:generateContent",
                    self.cfg.api_base, self.cfg.model
                ))
                .header("x-goog-api-key", &self.cfg.api_key)
                .json(&json!({
                    "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
                    "generationConfig": { "temperature": temperature }
                })),
            Provider::OpenAi => self
                .http
                .post(format!("{}/responses", self.cfg.api_base))
                .bearer_auth(&self.cfg.api_key)
                .json(&json!({
                    "model": self.cfg.model,
                    "input": prompt,
                    "temperature": temperature
                })),
        };

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("oracle error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse oracle response JSON")?;
        match self.cfg.provider {
            Provider::Gemini => Self::parse_gemini(&v),
            Provider::OpenAi => Self::parse_responses(&v),
        }
    }

    fn parse_gemini(v: &Value) -> Result<String> {
        let parts = v
            .pointer("/candidates/0/content/parts")
            .and_then(|x| x.as_array());
        let Some(parts) = parts else {
            if let Some(reason) = v.pointer("/promptFeedback/blockReason").and_then(|x| x.as_str()) {
                bail!("prompt blocked: {}", reason);
            }
            bail!("no candidates in response");
        };
        let text: String = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect();
        Ok(text)
    }

    // The Responses API returns: { id, output: [ {type: "message", content: [...]}, ... ] }
    fn parse_responses(v: &Value) -> Result<String> {
        if let Some(text) = v.get("output_text").and_then(|x| x.as_str()) {
            return Ok(text.to_string());
        }
        let outputs = v
            .get("output")
            .and_then(|x| x.as_array())
            .context("missing output")?;
        let mut text = String::new();
        for o in outputs {
            if o.get("type").and_then(|x| x.as_str()) != Some("message") {
                continue;
            }
            for c in o.get("content").and_then(|x| x.as_array()).into_iter().flatten() {
                if c.get("type").and_then(|x| x.as_str()) == Some("output_text") {
                    if let Some(t) = c.get("text").and_then(|x| x.as_str()) {
                        text.push_str(t);
                    }
                }
            }
        }
        if text.is_empty() {
            bail!("no message text in response");
        }
        Ok(text)
    }
}

#[async_trait]
impl Oracle for OracleClient {
    async fn generate(&self, prompt: &str, temperature: f32) -> Result<String, AgentError> {
        debug!(provider = ?self.cfg.provider, chars = prompt.len(), temperature, "oracle request");
        self.complete(prompt, temperature)
            .await
            .map_err(|e| AgentError::Oracle(format!("{:#}", e)))
    }
}
