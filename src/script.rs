//! The instruction language the structural strategy lets the oracle speak.
//!
//! One instruction per line. Blank lines and `#` comments are ignored.
//! Arguments are whitespace separated; quote them with `"..."` or `'...'`
//! (backslash escapes the next character) when they contain spaces.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AgentError;
use crate::surface::Key;

pub const MAX_WAIT_MS: u64 = 10_000;

/// Reference card embedded in the decision prompt.
pub const INSTRUCTION_HELP: &str = r#"Instructions (one per line, quote arguments containing spaces):
  navigate <url>
  click <locator>
  type <locator> "<text>"        (clears the field first, does not submit)
  clear <locator>
  submit <locator>               (submits the element's form)
  press <key>                    (Enter, Tab, Escape, Backspace, Delete, Space,
                                  ArrowUp, ArrowDown, ArrowLeft, ArrowRight,
                                  PageUp, PageDown, Home, End)
  scroll <dx> <dy>
  wait <milliseconds>            (at most 10000)
  back
A <locator> is a strategy followed by a value:
  id <id> | name <name> | css "<selector>" | xpath "<expression>"
  link "<link text>" | text "<exact visible text>" | tag <tag> | class <class>"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum By {
    Id,
    Name,
    Css,
    Xpath,
    Link,
    Text,
    Tag,
    Class,
}

impl By {
    fn parse(word: &str) -> Option<Self> {
        Some(match word.to_ascii_lowercase().as_str() {
            "id" => By::Id,
            "name" => By::Name,
            "css" | "selector" => By::Css,
            "xpath" => By::Xpath,
            "link" | "link_text" => By::Link,
            "text" => By::Text,
            "tag" => By::Tag,
            "class" => By::Class,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub by: By,
    pub value: String,
}

impl Locator {
    /// A script expression evaluating to the located element or `null`.
    pub fn resolver_js(&self) -> String {
        let v = serde_json::Value::String(self.value.clone()).to_string();
        match self.by {
            By::Id => format!("document.getElementById({v})"),
            By::Name => format!("(document.getElementsByName({v})[0] || null)"),
            By::Css => format!("document.querySelector({v})"),
            By::Xpath => format!(
                "document.evaluate({v}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue"
            ),
            By::Link => format!(
                "(() => {{ const links = Array.from(document.querySelectorAll('a')); \
                 return links.find(a => a.textContent.trim() === {v}) \
                 || links.find(a => a.textContent.includes({v})) || null; }})()"
            ),
            By::Text => format!(
                "(Array.from(document.querySelectorAll('body *')).filter(e => e.textContent.trim() === {v}).pop() || null)"
            ),
            By::Tag => format!("(document.getElementsByTagName({v})[0] || null)"),
            By::Class => format!("(document.getElementsByClassName({v})[0] || null)"),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:?}", self.by, self.value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Instruction {
    Navigate { url: String },
    Click { target: Locator },
    Type { target: Locator, text: String },
    Clear { target: Locator },
    Submit { target: Locator },
    Press { key: Key },
    Scroll { dx: i64, dy: i64 },
    Wait { ms: u64 },
    Back,
}

/// Parse a whole instruction body. Nothing runs unless everything parses.
pub fn parse_script(body: &str) -> Result<Vec<Instruction>, AgentError> {
    let mut out = Vec::new();
    for (n, raw) in body.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let instruction = parse_line(line)
            .map_err(|msg| AgentError::Parse(format!("line {}: {}: `{}`", n + 1, msg, line)))?;
        out.push(instruction);
    }
    Ok(out)
}

fn parse_line(line: &str) -> Result<Instruction, String> {
    let tokens = tokenize(line)?;
    let (verb, args) = tokens.split_first().ok_or("empty line")?;
    let instruction = match verb.to_ascii_lowercase().as_str() {
        "navigate" | "goto" => {
            let [url] = exact::<1>(args)?;
            Instruction::Navigate { url }
        }
        "click" => Instruction::Click {
            target: locator(args, 0)?,
        },
        "type" => {
            let target = locator(args, 1)?;
            Instruction::Type {
                target,
                text: args[2].clone(),
            }
        }
        "clear" => Instruction::Clear {
            target: locator(args, 0)?,
        },
        "submit" => Instruction::Submit {
            target: locator(args, 0)?,
        },
        "press" => {
            let [key] = exact::<1>(args)?;
            Instruction::Press {
                key: key.parse().map_err(|e: AgentError| e.to_string())?,
            }
        }
        "scroll" => {
            let [dx, dy] = exact::<2>(args)?;
            Instruction::Scroll {
                dx: dx.parse().map_err(|_| format!("bad dx '{dx}'"))?,
                dy: dy.parse().map_err(|_| format!("bad dy '{dy}'"))?,
            }
        }
        "wait" => {
            let [ms] = exact::<1>(args)?;
            let ms: u64 = ms.parse().map_err(|_| format!("bad duration '{ms}'"))?;
            Instruction::Wait {
                ms: ms.min(MAX_WAIT_MS),
            }
        }
        "back" => {
            exact::<0>(args)?;
            Instruction::Back
        }
        other => return Err(format!("unknown instruction '{other}'")),
    };
    Ok(instruction)
}

fn exact<const N: usize>(args: &[String]) -> Result<[String; N], String> {
    <[String; N]>::try_from(args.to_vec())
        .map_err(|_| format!("expected {} argument(s), got {}", N, args.len()))
}

/// A locator followed by exactly `extra` more arguments.
fn locator(args: &[String], extra: usize) -> Result<Locator, String> {
    if args.len() != 2 + extra {
        return Err(format!(
            "expected a locator and {} more argument(s), got {} argument(s)",
            extra,
            args.len()
        ));
    }
    let by = By::parse(&args[0]).ok_or_else(|| format!("unknown locator strategy '{}'", args[0]))?;
    Ok(Locator {
        by,
        value: args[1].clone(),
    })
}

fn tokenize(line: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        // `# note` is a comment, `#login` is a selector.
        if c == '#' {
            let mut look = chars.clone();
            look.next();
            if look.peek().map_or(true, |n| n.is_whitespace()) {
                break;
            }
        }
        let mut token = String::new();
        if c == '"' || c == '\'' {
            let quote = c;
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some('n') => token.push('\n'),
                        Some(esc) => token.push(esc),
                        None => return Err("dangling escape".into()),
                    },
                    c if c == quote => {
                        closed = true;
                        break;
                    }
                    c => token.push(c),
                }
            }
            if !closed {
                return Err("unterminated quote".into());
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}
