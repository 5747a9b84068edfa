use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::annotate::Annotator;
use crate::artifacts::{self, ArtifactStore, NullArtifacts};
use crate::detect::TextDetector;
use crate::error::AgentError;
use crate::prune::MarkupPruner;
use crate::surface::Surface;

/// Detections at or below this confidence are discarded.
pub const MIN_CONFIDENCE: f64 = 0.5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Screenshot plus text detection; actions target pixel coordinates.
    Visual,
    /// Pruned markup; actions are instruction scripts.
    Structural,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i64,
    pub y1: i64,
    pub x2: i64,
    pub y2: i64,
}

impl BoundingBox {
    /// Axis-aligned hull of a detection polygon. `None` for an empty polygon
    /// or one with non-finite coordinates.
    pub fn from_polygon(points: &[(f64, f64)]) -> Option<Self> {
        if points.is_empty() || points.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return None;
        }
        let (mut x1, mut y1) = (f64::MAX, f64::MAX);
        let (mut x2, mut y2) = (f64::MIN, f64::MIN);
        for &(x, y) in points {
            x1 = x1.min(x);
            y1 = y1.min(y);
            x2 = x2.max(x);
            y2 = y2.max(y);
        }
        Some(Self {
            x1: x1 as i64,
            y1: y1 as i64,
            x2: x2 as i64,
            y2: y2 as i64,
        })
    }

    pub fn center(&self) -> (i64, i64) {
        ((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}, {}, {}]", self.x1, self.y1, self.x2, self.y2)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Geometry {
    Box(BoundingBox),
    Node { tag: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub index: usize,
    pub text: String,
    pub geometry: Geometry,
    pub confidence: Option<f64>,
}

impl Element {
    pub fn bbox(&self) -> Option<&BoundingBox> {
        match &self.geometry {
            Geometry::Box(b) => Some(b),
            Geometry::Node { .. } => None,
        }
    }
}

/// What one perception pass saw. Element indices are their positions, so an
/// index is valid exactly when it is below `len()`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    elements: Vec<Element>,
    markup: Option<String>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn visual(regions: impl IntoIterator<Item = (String, BoundingBox, f64)>) -> Self {
        let elements = regions
            .into_iter()
            .enumerate()
            .map(|(index, (text, bbox, confidence))| Element {
                index,
                text,
                geometry: Geometry::Box(bbox),
                confidence: Some(confidence),
            })
            .collect();
        Self {
            elements,
            markup: None,
        }
    }

    pub fn structural(markup: String, texts: impl IntoIterator<Item = (String, String)>) -> Self {
        let elements = texts
            .into_iter()
            .enumerate()
            .map(|(index, (tag, text))| Element {
                index,
                text,
                geometry: Geometry::Node { tag },
                confidence: None,
            })
            .collect();
        Self {
            elements,
            markup: Some(markup),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty() && self.markup.as_deref().map_or(true, |m| m.trim().is_empty())
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn markup(&self) -> Option<&str> {
        self.markup.as_deref()
    }

    /// Resolve an oracle-chosen index. Anything outside `[0, len)` is `NoTarget`.
    pub fn get(&self, index: i64) -> Result<&Element, AgentError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.elements.get(i))
            .ok_or(AgentError::NoTarget {
                index: Some(index),
                len: self.elements.len(),
            })
    }

    /// Flattened visible text, one element per line.
    pub fn visible_text(&self) -> String {
        self.elements
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[async_trait]
pub trait Perceiver: Send + Sync {
    fn strategy(&self) -> Strategy;
    async fn perceive(&self, surface: &dyn Surface) -> Result<Snapshot, AgentError>;
}

// ========================= Visual =========================

pub struct VisualPerceiver<D: TextDetector> {
    detector: D,
    min_confidence: f64,
    annotator: Option<Annotator>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl<D: TextDetector> VisualPerceiver<D> {
    pub fn new(detector: D) -> Self {
        Self {
            detector,
            min_confidence: MIN_CONFIDENCE,
            annotator: None,
            artifacts: Arc::new(NullArtifacts),
        }
    }

    pub fn with_annotator(mut self, annotator: Annotator) -> Self {
        if !annotator.has_font() {
            warn!("no font found for drawing boxes; annotation will be skipped");
        }
        self.annotator = Some(annotator);
        self
    }

    pub fn with_artifacts(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = store;
        self
    }

    async fn annotate(&self, png: &[u8], snapshot: &Snapshot) {
        let Some(annotator) = &self.annotator else {
            return;
        };
        match annotator.render(png, snapshot.elements()) {
            Ok(Some(bytes)) => {
                if let Err(e) = self.artifacts.save(artifacts::DRAWING, &bytes).await {
                    warn!("annotation not saved: {}", e);
                }
            }
            Ok(None) => debug!("annotation skipped: no font"),
            Err(e) => warn!("annotation failed: {}", e),
        }
    }
}

#[async_trait]
impl<D: TextDetector> Perceiver for VisualPerceiver<D> {
    fn strategy(&self) -> Strategy {
        Strategy::Visual
    }

    async fn perceive(&self, surface: &dyn Surface) -> Result<Snapshot, AgentError> {
        let png = surface
            .screenshot()
            .await
            .map_err(|e| AgentError::Perception(format!("capture: {}", e)))?;
        if let Err(e) = self.artifacts.save(artifacts::SCREEN, &png).await {
            warn!("capture not saved: {}", e);
        }

        let detections = self.detector.detect(&png).await?;
        let total = detections.len();
        let mut kept = Vec::with_capacity(total);
        for d in detections {
            if d.confidence <= self.min_confidence {
                continue;
            }
            match BoundingBox::from_polygon(&d.polygon) {
                Some(bbox) => kept.push((d.text, bbox, d.confidence)),
                None => warn!(text = %d.text, "skipping region with unusable geometry"),
            }
        }
        let snapshot = Snapshot::visual(kept);
        debug!(detected = total, kept = snapshot.len(), "visual perception");

        self.annotate(&png, &snapshot).await;
        Ok(snapshot)
    }
}

// ========================= Structural =========================

const VISIBLE_TEXT_JS: &str = r#"
(() => {
  const out = [];
  const root = document.body || document.documentElement;
  if (!root) return out;
  const skip = new Set(['SCRIPT', 'STYLE', 'NOSCRIPT', 'TEMPLATE']);
  const walker = document.createTreeWalker(root, NodeFilter.SHOW_ELEMENT);
  for (let el = walker.currentNode; el; el = walker.nextNode()) {
    if (skip.has(el.tagName)) continue;
    const own = Array.from(el.childNodes)
      .filter(n => n.nodeType === Node.TEXT_NODE)
      .map(n => n.textContent)
      .join(' ')
      .replace(/\s+/g, ' ')
      .trim();
    if (!own) continue;
    const style = window.getComputedStyle(el);
    const rendered = el.getClientRects().length > 0
      && style.visibility !== 'hidden'
      && style.display !== 'none'
      && parseFloat(style.opacity || '1') > 0;
    if (rendered) out.push({ tag: el.tagName.toLowerCase(), text: own });
  }
  return out;
})()
"#;

pub struct StructuralPerceiver<P: MarkupPruner> {
    pruner: P,
    artifacts: Arc<dyn ArtifactStore>,
}

impl<P: MarkupPruner> StructuralPerceiver<P> {
    pub fn new(pruner: P) -> Self {
        Self {
            pruner,
            artifacts: Arc::new(NullArtifacts),
        }
    }

    pub fn with_artifacts(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = store;
        self
    }

    fn parse_visible_texts(v: Value) -> Vec<(String, String)> {
        let Value::Array(items) = v else {
            return Vec::new();
        };
        items
            .into_iter()
            .filter_map(|item| {
                let text = item.get("text")?.as_str()?.trim().to_string();
                if text.is_empty() {
                    return None;
                }
                let tag = item
                    .get("tag")
                    .and_then(|t| t.as_str())
                    .unwrap_or("")
                    .to_string();
                Some((tag, text))
            })
            .collect()
    }
}

#[async_trait]
impl<P: MarkupPruner> Perceiver for StructuralPerceiver<P> {
    fn strategy(&self) -> Strategy {
        Strategy::Structural
    }

    async fn perceive(&self, surface: &dyn Surface) -> Result<Snapshot, AgentError> {
        let raw = surface
            .markup()
            .await
            .map_err(|e| AgentError::Perception(format!("markup: {}", e)))?;
        if let Err(e) = self.artifacts.save(artifacts::RAW_HTML, raw.as_bytes()).await {
            warn!("raw markup not saved: {}", e);
        }
        let pruned = self.pruner.prune(&raw);
        if let Err(e) = self.artifacts.save(artifacts::PRUNED_HTML, pruned.as_bytes()).await {
            warn!("pruned markup not saved: {}", e);
        }

        let texts = match surface.evaluate(VISIBLE_TEXT_JS).await {
            Ok(v) => Self::parse_visible_texts(v),
            Err(e) => {
                warn!("visible text listing unavailable: {}", e);
                Vec::new()
            }
        };
        debug!(raw = raw.len(), pruned = pruned.len(), texts = texts.len(), "structural perception");
        Ok(Snapshot::structural(pruned, texts))
    }
}
