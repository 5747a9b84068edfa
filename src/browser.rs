use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, InsertTextParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::{Page, ScreenshotParamsBuilder};
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use tracing::debug;

use crate::error::AgentError;
use crate::surface::{Key, Surface};

pub const DESKTOP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Clone, Debug)]
pub struct BrowserConfig {
    pub headless: bool,
    pub user_agent: Option<String>, // env BROWSER_USER_AGENT, desktop Chrome otherwise
    pub viewport: (i64, i64),
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            user_agent: Some(user_agent_or_desktop(std::env::var("BROWSER_USER_AGENT").ok())),
            viewport: (1280, 800),
        }
    }
}

fn user_agent_or_desktop(configured: Option<String>) -> String {
    configured
        .map(|ua| ua.trim().to_string())
        .filter(|ua| !ua.is_empty())
        .unwrap_or_else(|| DESKTOP_USER_AGENT.to_string())
}

/// Screenshot pixels equal CSS pixels at scale factor 1, so detected boxes
/// line up with `elementFromPoint` coordinates.
fn device_metrics((width, height): (i64, i64)) -> Result<SetDeviceMetricsOverrideParams> {
    SetDeviceMetricsOverrideParams::builder()
        .width(width)
        .height(height)
        .device_scale_factor(1.0)
        .mobile(false)
        .build()
        .map_err(|e| anyhow!(e))
}

/// A single Chromium page. This is the only capability the agent has on the
/// live surface, so it is created once and lent out by reference.
pub struct Browser {
    page: Page,
    viewport: (i64, i64),
    _browser: OxideBrowser,
}

impl Browser {
    pub async fn launch(cfg: BrowserConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        // Unique profile per run avoids the ProcessSingleton lock when restarting quickly.
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut profile_dir: PathBuf = std::env::temp_dir();
        profile_dir.push(format!("surface-agent-profile-{}-{}", std::process::id(), ts));
        let _ = std::fs::create_dir_all(&profile_dir);
        builder = builder
            .user_data_dir(profile_dir)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-infobars")
            .arg("--disable-extensions");
        let bcfg = builder.build().map_err(|e| anyhow!(e))?;
        let (browser, mut handler) = OxideBrowser::launch(bcfg).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = cfg.user_agent {
            page.set_user_agent(ua).await?;
        }
        let this = Self {
            page,
            viewport: cfg.viewport,
            _browser: browser,
        };
        this.pin_viewport().await;
        Ok(this)
    }

    /// Attach to an already running browser over its DevTools websocket.
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (browser, mut handler) = OxideBrowser::connect(ws_url).await?;
        tokio::spawn(async move { while let Some(_ev) = handler.next().await {} });
        let page = match browser.pages().await?.into_iter().next() {
            Some(page) => page,
            None => browser.new_page("about:blank").await?,
        };
        let this = Self {
            page,
            viewport: BrowserConfig::default().viewport,
            _browser: browser,
        };
        this.pin_viewport().await;
        Ok(this)
    }

    // Ensure a non-zero viewport to avoid screenshot 0-width errors.
    async fn pin_viewport(&self) {
        match device_metrics(self.viewport) {
            Ok(params) => {
                if let Err(e) = self.page.execute(params).await {
                    debug!("viewport not pinned: {}", e);
                }
            }
            Err(e) => debug!("viewport not pinned: {}", e),
        }
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        Ok(())
    }

    pub async fn url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    pub async fn content(&self) -> Result<String> {
        Ok(self.page.content().await?)
    }

    pub async fn eval(&self, script: &str) -> Result<Value> {
        let params = EvaluateParams::builder()
            .expression(script)
            .return_by_value(true)
            .await_promise(true)
            .build()
            .map_err(|e| anyhow!(e))?;
        let resp = self.page.execute(params).await?;
        if let Some(ex) = &resp.result.exception_details {
            let detail = ex
                .exception
                .as_ref()
                .and_then(|obj| obj.description.clone())
                .unwrap_or_else(|| ex.text.clone());
            bail!("script threw: {detail}");
        }
        Ok(resp.result.result.value.clone().unwrap_or(Value::Null))
    }

    pub async fn type_text(&self, text: &str) -> Result<()> {
        self.page
            .execute(InsertTextParams {
                text: text.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn keypress(&self, key: Key) -> Result<()> {
        for kind in [DispatchKeyEventType::KeyDown, DispatchKeyEventType::KeyUp] {
            let mut builder = DispatchKeyEventParams::builder()
                .r#type(kind.clone())
                .key(key.name())
                .code(key.code())
                .windows_virtual_key_code(key.virtual_key_code())
                .native_virtual_key_code(key.virtual_key_code());
            if let (DispatchKeyEventType::KeyDown, Some(text)) = (&kind, key.text()) {
                builder = builder.text(text);
            }
            let params = builder.build().map_err(|e| anyhow!(e))?;
            self.page.execute(params).await?;
        }
        Ok(())
    }

    pub async fn screenshot_png(&self) -> Result<Vec<u8>> {
        let take = || async {
            self.page
                .screenshot(ScreenshotParamsBuilder::default().full_page(false).build())
                .await
        };
        match take().await {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("0 width") || msg.contains("0 height") {
                    // Force viewport and retry once
                    self.pin_viewport().await;
                    sleep(Duration::from_millis(50)).await;
                    return Ok(take().await?);
                }
                Err(anyhow!(e))
            }
        }
    }
}

#[async_trait]
impl Surface for Browser {
    async fn navigate(&self, url: &str) -> Result<(), AgentError> {
        debug!(url, "navigate");
        self.goto(url).await.map_err(AgentError::surface)
    }

    async fn screenshot(&self) -> Result<Vec<u8>, AgentError> {
        self.screenshot_png().await.map_err(AgentError::surface)
    }

    async fn markup(&self) -> Result<String, AgentError> {
        self.content().await.map_err(AgentError::surface)
    }

    async fn evaluate(&self, script: &str) -> Result<Value, AgentError> {
        self.eval(script).await.map_err(AgentError::surface)
    }

    async fn insert_text(&self, text: &str) -> Result<(), AgentError> {
        self.type_text(text).await.map_err(AgentError::surface)
    }

    async fn press_key(&self, key: Key) -> Result<(), AgentError> {
        self.keypress(key).await.map_err(AgentError::surface)
    }
}
