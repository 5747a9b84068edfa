use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::AgentError;

/// The live session the agent drives. One handle is created per process and
/// lent to perception and execution for every cycle.
#[async_trait]
pub trait Surface: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), AgentError>;
    /// PNG of the current viewport.
    async fn screenshot(&self) -> Result<Vec<u8>, AgentError>;
    /// Full serialized document markup.
    async fn markup(&self) -> Result<String, AgentError>;
    /// Evaluate a script in the page and return its JSON result.
    async fn evaluate(&self, script: &str) -> Result<Value, AgentError>;
    /// Insert text at the currently focused element.
    async fn insert_text(&self, text: &str) -> Result<(), AgentError>;
    async fn press_key(&self, key: Key) -> Result<(), AgentError>;
}

/// Key constants available to typed input and to oracle-authored instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Key {
    Enter,
    Tab,
    Escape,
    Backspace,
    Delete,
    Space,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    PageUp,
    PageDown,
    Home,
    End,
}

impl Key {
    pub const ALL: [Key; 14] = [
        Key::Enter,
        Key::Tab,
        Key::Escape,
        Key::Backspace,
        Key::Delete,
        Key::Space,
        Key::ArrowUp,
        Key::ArrowDown,
        Key::ArrowLeft,
        Key::ArrowRight,
        Key::PageUp,
        Key::PageDown,
        Key::Home,
        Key::End,
    ];

    /// DOM `KeyboardEvent.key` value.
    pub fn name(self) -> &'static str {
        match self {
            Key::Enter => "Enter",
            Key::Tab => "Tab",
            Key::Escape => "Escape",
            Key::Backspace => "Backspace",
            Key::Delete => "Delete",
            Key::Space => " ",
            Key::ArrowUp => "ArrowUp",
            Key::ArrowDown => "ArrowDown",
            Key::ArrowLeft => "ArrowLeft",
            Key::ArrowRight => "ArrowRight",
            Key::PageUp => "PageUp",
            Key::PageDown => "PageDown",
            Key::Home => "Home",
            Key::End => "End",
        }
    }

    /// DOM `KeyboardEvent.code` value.
    pub fn code(self) -> &'static str {
        match self {
            Key::Space => "Space",
            other => other.name(),
        }
    }

    pub fn virtual_key_code(self) -> i64 {
        match self {
            Key::Backspace => 8,
            Key::Tab => 9,
            Key::Enter => 13,
            Key::Escape => 27,
            Key::Space => 32,
            Key::PageUp => 33,
            Key::PageDown => 34,
            Key::End => 35,
            Key::Home => 36,
            Key::ArrowLeft => 37,
            Key::ArrowUp => 38,
            Key::ArrowRight => 39,
            Key::ArrowDown => 40,
            Key::Delete => 46,
        }
    }

    /// Text the key produces when pressed, if any.
    pub fn text(self) -> Option<&'static str> {
        match self {
            Key::Enter => Some("\r"),
            Key::Space => Some(" "),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Key {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Key::ALL
            .iter()
            .copied()
            .find(|k| k.code().eq_ignore_ascii_case(wanted))
            .or_else(|| match wanted.to_ascii_lowercase().as_str() {
                "return" => Some(Key::Enter),
                "esc" => Some(Key::Escape),
                "up" => Some(Key::ArrowUp),
                "down" => Some(Key::ArrowDown),
                "left" => Some(Key::ArrowLeft),
                "right" => Some(Key::ArrowRight),
                _ => None,
            })
            .ok_or_else(|| AgentError::Parse(format!("unknown key '{wanted}'")))
    }
}
