use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use tracing::warn;

use crate::error::AgentError;

/// One text region found in an image, in detection order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Polygon vertices in image pixels.
    pub polygon: Vec<(f64, f64)>,
    pub text: String,
    pub confidence: f64,
}

#[async_trait]
pub trait TextDetector: Send + Sync {
    async fn detect(&self, png: &[u8]) -> Result<Vec<Detection>, AgentError>;
}

#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub endpoint: String, // env OCR_ENDPOINT
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            endpoint: env::var("OCR_ENDPOINT")
                .unwrap_or_else(|_| "http://127.0.0.1:8866/ocr".into()),
        }
    }
}

/// Talks to an OCR service that accepts `{"image": <base64 png>}` and answers
/// with a list of regions, either as objects
/// `{"box": [[x, y], ...], "text": "..", "confidence": 0.9}` or as
/// PaddleOCR-style `[[[x, y], ...], ["text", 0.9]]` tuples, optionally nested
/// one level per page and optionally wrapped in `{"detections": [...]}`.
#[derive(Clone)]
pub struct HttpTextDetector {
    http: Client,
    cfg: DetectorConfig,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireRegion {
    Object {
        #[serde(rename = "box", alias = "polygon", alias = "points")]
        r#box: Vec<(f64, f64)>,
        text: String,
        #[serde(alias = "score")]
        confidence: f64,
    },
    Tuple(Vec<(f64, f64)>, (String, f64)),
}

impl From<WireRegion> for Detection {
    fn from(region: WireRegion) -> Self {
        match region {
            WireRegion::Object { r#box, text, confidence } => Detection {
                polygon: r#box,
                text,
                confidence,
            },
            WireRegion::Tuple(polygon, (text, confidence)) => Detection {
                polygon,
                text,
                confidence,
            },
        }
    }
}

impl HttpTextDetector {
    pub fn new(cfg: DetectorConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }

    /// Decode regions one at a time so a malformed region only loses itself.
    pub fn parse_regions(v: Value) -> Result<Vec<Detection>, AgentError> {
        let items = match v {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("detections") {
                Some(Value::Array(items)) => items,
                _ => return Err(AgentError::Detection("missing detections array".into())),
            },
            Value::Null => Vec::new(),
            other => {
                return Err(AgentError::Detection(format!(
                    "unexpected detector payload: {other}"
                )))
            }
        };

        let mut out = Vec::with_capacity(items.len());
        for item in items {
            // A page-level list of regions is flattened one level.
            if nesting(&item) >= 4 {
                if let Value::Array(regions) = item {
                    out.extend(regions.into_iter().filter_map(Self::decode_region));
                }
                continue;
            }
            if let Some(d) = Self::decode_region(item) {
                out.push(d);
            }
        }
        Ok(out)
    }

    fn decode_region(v: Value) -> Option<Detection> {
        match serde_json::from_value::<WireRegion>(v) {
            Ok(region) => Some(region.into()),
            Err(e) => {
                warn!("skipping undecodable text region: {}", e);
                None
            }
        }
    }
}

// page -> region -> polygon -> point -> coordinate
fn nesting(v: &Value) -> usize {
    match v {
        Value::Array(items) => 1 + items.first().map_or(0, nesting),
        _ => 0,
    }
}

#[async_trait]
impl TextDetector for HttpTextDetector {
    async fn detect(&self, png: &[u8]) -> Result<Vec<Detection>, AgentError> {
        let resp = self
            .http
            .post(&self.cfg.endpoint)
            .json(&json!({ "image": STANDARD.encode(png) }))
            .send()
            .await
            .map_err(|e| AgentError::Detection(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| AgentError::Detection(e.to_string()))?;
        if !status.is_success() {
            return Err(AgentError::Detection(format!("detector error {}: {}", status, text)));
        }
        let v: Value = serde_json::from_str(&text)
            .map_err(|e| AgentError::Detection(format!("detector JSON: {}", e)))?;
        Self::parse_regions(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_regions_decode() {
        let v = json!({
            "detections": [
                {"box": [[0, 0], [100, 0], [100, 20], [0, 20]], "text": "Search box", "confidence": 0.97},
                {"polygon": [[5, 30], [60, 30], [60, 44], [5, 44]], "text": "Images", "score": 0.8}
            ]
        });
        let out = HttpTextDetector::parse_regions(v).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "Search box");
        assert_eq!(out[1].confidence, 0.8);
        assert_eq!(out[1].polygon[2], (60.0, 44.0));
    }

    #[test]
    fn paddle_pages_are_flattened() {
        let v = json!([[
            [[[1.0, 2.0], [30.0, 2.0], [30.0, 12.0], [1.0, 12.0]], ["Sign in", 0.93]],
            [[[40.0, 2.0], [90.0, 2.0], [90.0, 12.0], [40.0, 12.0]], ["Help", 0.41]]
        ]]);
        let out = HttpTextDetector::parse_regions(v).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "Sign in");
        assert_eq!(out[1].confidence, 0.41);
    }

    #[test]
    fn malformed_region_is_skipped_not_fatal() {
        let v = json!([
            {"box": [[0, 0], [10, 10]], "text": "ok", "confidence": 0.9},
            {"box": "garbage", "text": 3},
            {"box": [[0, 0], [10, 10]], "text": "also ok", "confidence": 0.6}
        ]);
        let out = HttpTextDetector::parse_regions(v).unwrap();
        let texts: Vec<_> = out.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(texts, vec!["ok", "also ok"]);
    }

    #[test]
    fn null_payload_means_nothing_detected() {
        assert!(HttpTextDetector::parse_regions(Value::Null).unwrap().is_empty());
        assert!(HttpTextDetector::parse_regions(json!("nope")).is_err());
    }
}
