//! Per-page layout descriptors accepted at the pipeline boundary.
//!
//! Layout payloads arrive as JSON and are validated once, here, into a tagged
//! union. Downstream code never inspects raw shapes.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Conversion factor for pixel-equivalent units (CSS reference pixel at 96dpi).
pub const MM_PER_PX: f64 = 25.4 / 96.0;

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("page dimensions must be positive, got {width_mm}x{height_mm}mm")]
    InvalidDimensions { width_mm: f64, height_mm: f64 },
    #[error("text item has empty content")]
    EmptyText,
    #[error("image item has empty source")]
    EmptySource,
}

/// One printable page: physical size plus absolutely positioned items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageLayout {
    pub width_mm: f64,
    pub height_mm: f64,
    #[serde(default)]
    pub items: Vec<LayoutItem>,
}

impl PageLayout {
    /// Boundary validation; rejects layouts the renderer cannot express.
    pub fn validate(&self) -> Result<(), LayoutError> {
        if !(self.width_mm.is_finite() && self.height_mm.is_finite())
            || self.width_mm <= 0.0
            || self.height_mm <= 0.0
        {
            return Err(LayoutError::InvalidDimensions {
                width_mm: self.width_mm,
                height_mm: self.height_mm,
            });
        }
        for item in &self.items {
            match item {
                LayoutItem::Image(image) if image.source.is_empty() => {
                    return Err(LayoutError::EmptySource);
                }
                LayoutItem::Text(text) if text.content.is_empty() => {
                    return Err(LayoutError::EmptyText);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// A positioned page item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayoutItem {
    Image(ImageItem),
    Text(TextItem),
}

/// An image placed on the page. `source` is a remote URL, a content-addressed
/// `ipfs://` reference, or an inline `data:` URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageItem {
    pub source: String,
    pub x_mm: f64,
    pub y_mm: f64,
    pub width_mm: f64,
    pub height_mm: f64,
}

/// A text run. When `letter` overrides are present the run is emitted one
/// character at a time with independent sizing and positioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextItem {
    pub content: String,
    pub font_size_mm: f64,
    pub x_mm: f64,
    pub y_mm: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub letter: Option<PerLetter>,
}

/// Per-character overrides for a text run. Vectors shorter than the character
/// count fall back to the item defaults for the remaining characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerLetter {
    /// Font size per character.
    #[serde(default)]
    pub sizes: Vec<f64>,
    /// Vertical offset per character, relative to the item baseline.
    #[serde(default)]
    pub offsets: Vec<f64>,
    /// Horizontal advance applied after each character; a character's left
    /// edge is the cumulative sum of the preceding deltas.
    #[serde(default)]
    pub spacing: Vec<f64>,
    /// Unit the override values are expressed in.
    #[serde(default)]
    pub unit: LetterUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LetterUnit {
    #[default]
    Mm,
    Px,
}

impl LetterUnit {
    /// Normalize a value in this unit to millimeters.
    pub fn to_mm(self, value: f64) -> f64 {
        match self {
            LetterUnit::Mm => value,
            LetterUnit::Px => value * MM_PER_PX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_layout_items() {
        let raw = serde_json::json!({
            "width_mm": 210.0,
            "height_mm": 297.0,
            "items": [
                {"kind": "image", "source": "ipfs://bafytest", "x_mm": 10.0,
                 "y_mm": 20.0, "width_mm": 50.0, "height_mm": 30.0},
                {"kind": "text", "content": "Hello", "font_size_mm": 4.0,
                 "x_mm": 5.0, "y_mm": 5.0,
                 "letter": {"sizes": [4.0, 5.0], "offsets": [0.0, 1.0],
                            "spacing": [3.0, 3.5], "unit": "px"}}
            ]
        });

        let layout: PageLayout = serde_json::from_value(raw).expect("layout parses");
        assert_eq!(layout.items.len(), 2);
        match &layout.items[1] {
            LayoutItem::Text(text) => {
                let letter = text.letter.as_ref().expect("per-letter overrides");
                assert_eq!(letter.unit, LetterUnit::Px);
                assert_eq!(letter.spacing, vec![3.0, 3.5]);
            }
            other => panic!("expected text item, got {other:?}"),
        }
        layout.validate().expect("layout is valid");
    }

    #[test]
    fn rejects_unknown_item_kind() {
        let raw = serde_json::json!({
            "width_mm": 210.0,
            "height_mm": 297.0,
            "items": [{"kind": "video", "source": "x"}]
        });
        assert!(serde_json::from_value::<PageLayout>(raw).is_err());
    }

    #[test]
    fn rejects_non_positive_dimensions() {
        let layout = PageLayout {
            width_mm: 0.0,
            height_mm: 297.0,
            items: Vec::new(),
        };
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn px_values_normalize_to_mm() {
        let normalized = LetterUnit::Px.to_mm(96.0);
        assert!((normalized - 25.4).abs() < 1e-9);
        assert_eq!(LetterUnit::Mm.to_mm(12.5), 12.5);
    }
}
