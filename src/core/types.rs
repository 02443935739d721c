//! Core data types for the positioning relay

use serde::{Deserialize, Deserializer, Serialize};

/// Fixed anchor with a known position in the site's local frame (meters)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorPosition {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

impl AnchorPosition {
    pub fn new(id: impl Into<String>, x: f64, y: f64) -> Self {
        Self { id: id.into(), x, y }
    }

    /// Euclidean distance from this anchor to a point
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        ((self.x - x).powi(2) + (self.y - y).powi(2)).sqrt()
    }
}

/// One anchor-to-tag range measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeLink {
    /// Reporting anchor. Older anchor firmware sends this as `A`.
    #[serde(rename = "anchorId", alias = "A")]
    pub anchor_id: String,
    /// Measured range in meters. Older firmware sends this as `R`, sometimes quoted.
    #[serde(alias = "R", deserialize_with = "number_or_string")]
    pub distance: f64,
}

impl RangeLink {
    pub fn new(anchor_id: impl Into<String>, distance: f64) -> Self {
        Self {
            anchor_id: anchor_id.into(),
            distance,
        }
    }
}

/// One decoded record of range measurements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementFrame {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub links: Vec<RangeLink>,
    /// `links` exactly as received, relayed to clients untouched
    #[serde(skip)]
    raw_links: Option<serde_json::Value>,
}

impl MeasurementFrame {
    pub fn new(links: Vec<RangeLink>) -> Self {
        Self { links, raw_links: None }
    }

    /// Attach the wire form of the links this frame was decoded from
    pub fn with_raw_links(mut self, raw: serde_json::Value) -> Self {
        self.raw_links = Some(raw);
        self
    }

    pub fn raw_links(&self) -> Option<&serde_json::Value> {
        self.raw_links.as_ref()
    }

    /// Links as clients see them: the received array if known, else the typed links
    pub fn links_payload(&self) -> serde_json::Result<serde_json::Value> {
        match &self.raw_links {
            Some(raw) => Ok(raw.clone()),
            None => serde_json::to_value(&self.links),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Tag position estimate for a single frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TagPosition {
    Solved {
        x: f64,
        y: f64,
        /// RMS error of the range equations at the estimate (meters)
        residual: f64,
    },
    /// Too few usable links, or the anchor geometry is degenerate
    Unsolved,
}

impl TagPosition {
    pub fn is_solved(&self) -> bool {
        matches!(self, TagPosition::Solved { .. })
    }

    /// Coordinates of a solved estimate
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match *self {
            TagPosition::Solved { x, y, .. } => Some((x, y)),
            TagPosition::Unsolved => None,
        }
    }
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(value) => Ok(value),
        Raw::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("distance is not a number: {:?}", text))),
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<RangeLink>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<RangeLink>>::deserialize(deserializer)?.unwrap_or_default())
}
