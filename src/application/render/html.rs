//! Layout-to-markup generation.
//!
//! The physical page size is expressed through an `@page` rule in millimeters
//! so the exported PDF dimensions come from the markup, not from whatever
//! viewport the engine happens to rasterize with.

use std::collections::HashMap;
use std::fmt::Write;

use crate::domain::layout::{ImageItem, LayoutItem, PageLayout, TextItem};

/// Build the standalone HTML document for one page. `resolved_sources` maps
/// image sources that required resolution (content-addressed references) to
/// inline data URIs; sources absent from the map are emitted as-is.
pub fn page_markup(layout: &PageLayout, resolved_sources: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(1024);
    let _ = write!(
        out,
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><style>\
         @page{{size:{w}mm {h}mm;margin:0;}}\
         html,body{{margin:0;padding:0;width:{w}mm;height:{h}mm;}}\
         body{{position:relative;overflow:hidden;}}\
         .item{{position:absolute;white-space:pre;line-height:1;}}\
         img.item{{object-fit:contain;}}\
         </style></head><body>",
        w = fmt_mm(layout.width_mm),
        h = fmt_mm(layout.height_mm),
    );

    for item in &layout.items {
        match item {
            LayoutItem::Image(image) => push_image(&mut out, image, resolved_sources),
            LayoutItem::Text(text) => push_text(&mut out, text),
        }
    }

    out.push_str("</body></html>");
    out
}

fn push_image(out: &mut String, image: &ImageItem, resolved: &HashMap<String, String>) {
    let source = resolved
        .get(&image.source)
        .map(String::as_str)
        .unwrap_or(&image.source);
    let _ = write!(
        out,
        "<img class=\"item\" src=\"{src}\" style=\"left:{x}mm;top:{y}mm;width:{w}mm;height:{h}mm\">",
        src = escape_attr(source),
        x = fmt_mm(image.x_mm),
        y = fmt_mm(image.y_mm),
        w = fmt_mm(image.width_mm),
        h = fmt_mm(image.height_mm),
    );
}

fn push_text(out: &mut String, text: &TextItem) {
    match &text.letter {
        None => {
            let _ = write!(
                out,
                "<div class=\"item\" style=\"left:{x}mm;top:{y}mm;font-size:{size}mm\">{content}</div>",
                x = fmt_mm(text.x_mm),
                y = fmt_mm(text.y_mm),
                size = fmt_mm(text.font_size_mm),
                content = escape_text(&text.content),
            );
        }
        Some(letter) => {
            // Per-letter run: each character becomes its own positioned span.
            // The left edge advances by the cumulative sum of the preceding
            // spacing deltas; sizes and vertical offsets apply per character.
            let mut advance_mm = 0.0f64;
            for (index, ch) in text.content.chars().enumerate() {
                let size_mm = letter
                    .sizes
                    .get(index)
                    .map(|&value| letter.unit.to_mm(value))
                    .unwrap_or(text.font_size_mm);
                let offset_mm = letter
                    .offsets
                    .get(index)
                    .map(|&value| letter.unit.to_mm(value))
                    .unwrap_or(0.0);

                let mut rendered = String::new();
                rendered.push(ch);
                let _ = write!(
                    out,
                    "<span class=\"item\" style=\"left:{x}mm;top:{y}mm;font-size:{size}mm\">{content}</span>",
                    x = fmt_mm(text.x_mm + advance_mm),
                    y = fmt_mm(text.y_mm + offset_mm),
                    size = fmt_mm(size_mm),
                    content = escape_text(&rendered),
                );

                advance_mm += letter
                    .spacing
                    .get(index)
                    .map(|&value| letter.unit.to_mm(value))
                    .unwrap_or(0.0);
            }
        }
    }
}

/// Format a millimeter value without trailing noise (`12mm`, `12.35mm`).
fn fmt_mm(value: f64) -> String {
    if (value - value.round()).abs() < 1e-9 {
        format!("{}", value.round() as i64)
    } else {
        let formatted = format!("{value:.4}");
        formatted.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::layout::{LetterUnit, PerLetter};

    fn empty_sources() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn page_rule_uses_millimeter_dimensions() {
        let layout = PageLayout {
            width_mm: 210.0,
            height_mm: 297.0,
            items: Vec::new(),
        };
        let markup = page_markup(&layout, &empty_sources());
        assert!(markup.contains("@page{size:210mm 297mm;margin:0;}"));
    }

    #[test]
    fn uniform_text_is_one_block() {
        let layout = PageLayout {
            width_mm: 100.0,
            height_mm: 100.0,
            items: vec![LayoutItem::Text(TextItem {
                content: "A & B".into(),
                font_size_mm: 4.5,
                x_mm: 10.0,
                y_mm: 20.0,
                letter: None,
            })],
        };
        let markup = page_markup(&layout, &empty_sources());
        assert!(markup.contains("left:10mm;top:20mm;font-size:4.5mm"));
        assert!(markup.contains("A &amp; B"));
        assert!(!markup.contains("<span"));
    }

    #[test]
    fn per_letter_offsets_accumulate_spacing() {
        let layout = PageLayout {
            width_mm: 100.0,
            height_mm: 100.0,
            items: vec![LayoutItem::Text(TextItem {
                content: "abc".into(),
                font_size_mm: 4.0,
                x_mm: 10.0,
                y_mm: 20.0,
                letter: Some(PerLetter {
                    sizes: vec![4.0, 6.0, 8.0],
                    offsets: vec![0.0, 1.0, 2.0],
                    spacing: vec![3.0, 5.0, 7.0],
                    unit: LetterUnit::Mm,
                }),
            })],
        };
        let markup = page_markup(&layout, &empty_sources());
        // First letter at the item origin, following letters advanced by the
        // cumulative spacing of their predecessors.
        assert!(markup.contains("left:10mm;top:20mm;font-size:4mm\">a"));
        assert!(markup.contains("left:13mm;top:21mm;font-size:6mm\">b"));
        assert!(markup.contains("left:18mm;top:22mm;font-size:8mm\">c"));
    }

    #[test]
    fn per_letter_px_values_are_normalized() {
        let layout = PageLayout {
            width_mm: 100.0,
            height_mm: 100.0,
            items: vec![LayoutItem::Text(TextItem {
                content: "ab".into(),
                font_size_mm: 4.0,
                x_mm: 0.0,
                y_mm: 0.0,
                letter: Some(PerLetter {
                    sizes: vec![96.0, 96.0],
                    offsets: Vec::new(),
                    spacing: vec![96.0],
                    unit: LetterUnit::Px,
                }),
            })],
        };
        let markup = page_markup(&layout, &empty_sources());
        // 96px == 25.4mm at the CSS reference resolution.
        assert!(markup.contains("font-size:25.4mm\">a"));
        assert!(markup.contains("left:25.4mm;top:0mm;font-size:25.4mm\">b"));
    }

    #[test]
    fn short_override_vectors_fall_back_to_item_defaults() {
        let layout = PageLayout {
            width_mm: 100.0,
            height_mm: 100.0,
            items: vec![LayoutItem::Text(TextItem {
                content: "xy".into(),
                font_size_mm: 5.0,
                x_mm: 0.0,
                y_mm: 0.0,
                letter: Some(PerLetter {
                    sizes: vec![7.0],
                    offsets: Vec::new(),
                    spacing: Vec::new(),
                    unit: LetterUnit::Mm,
                }),
            })],
        };
        let markup = page_markup(&layout, &empty_sources());
        assert!(markup.contains("font-size:7mm\">x"));
        assert!(markup.contains("font-size:5mm\">y"));
    }

    #[test]
    fn resolved_image_sources_replace_the_original() {
        let layout = PageLayout {
            width_mm: 100.0,
            height_mm: 100.0,
            items: vec![LayoutItem::Image(ImageItem {
                source: "ipfs://bafytest".into(),
                x_mm: 0.0,
                y_mm: 0.0,
                width_mm: 40.0,
                height_mm: 40.0,
            })],
        };
        let mut resolved = HashMap::new();
        resolved.insert(
            "ipfs://bafytest".to_string(),
            "data:image/png;base64,AAAA".to_string(),
        );
        let markup = page_markup(&layout, &resolved);
        assert!(markup.contains("src=\"data:image/png;base64,AAAA\""));
        assert!(!markup.contains("ipfs://"));
    }
}
