// Plan response parsing and caption sanitation

use serde::Deserialize;

use crate::core::errors::GenerationError;
use crate::core::types::CaptionPair;

#[derive(Debug, Deserialize)]
struct PlanEntry {
    caption_local: String,
    #[serde(default)]
    caption_alt: String,
}

/// ASCII characters that never belong in a sticker caption
const STRIPPED_ASCII: &[char] = &[
    '#', '*', '~', '^', '|', '<', '>', '@', '$', '%', '&', '=', '+', '_', '`', '\\', '"', '[', ']',
    '{', '}',
];

fn is_symbol_or_emoji(c: char) -> bool {
    if STRIPPED_ASCII.contains(&c) {
        return true;
    }
    matches!(
        c as u32,
        0x200D                 // zero width joiner
        | 0x20E3               // combining keycap
        | 0xFE0E..=0xFE0F      // variation selectors
        | 0x2190..=0x21FF      // arrows
        | 0x2300..=0x23FF      // misc technical
        | 0x25A0..=0x25FF      // geometric shapes
        | 0x2600..=0x27BF      // misc symbols, dingbats
        | 0x2B00..=0x2BFF      // misc symbols and arrows
        | 0xE000..=0xF8FF      // private use
        | 0x1F000..=0x1FAFF    // emoji blocks
        | 0xE0020..=0xE007F    // tag characters
    )
}

/// Strip emoji and symbol characters, collapse whitespace and trim.
pub fn sanitize_caption(raw: &str) -> String {
    raw.chars()
        .filter(|c| !is_symbol_or_emoji(*c))
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sanitize captions, drop empty ones and keep at most `count`.
pub fn sanitize_plan(pairs: Vec<CaptionPair>, count: usize) -> Result<Vec<CaptionPair>, GenerationError> {
    let plan: Vec<CaptionPair> = pairs
        .into_iter()
        .filter_map(|pair| {
            let caption_local = sanitize_caption(&pair.caption_local);
            if caption_local.is_empty() {
                return None;
            }
            Some(CaptionPair {
                caption_local,
                caption_alt: sanitize_caption(&pair.caption_alt),
            })
        })
        .take(count)
        .collect();

    if plan.is_empty() {
        return Err(GenerationError::PlanParseError(
            "response contained no usable captions".to_string(),
        ));
    }
    Ok(plan)
}

/// Locate the JSON array in model text, which may be wrapped in a code fence
/// or surrounded by prose.
fn extract_json_array(text: &str) -> &str {
    let mut body = text.trim();
    if let Some(fenced) = body.strip_prefix("```") {
        // drop the language tag line and the closing fence
        body = fenced.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
        body = body.trim_end().trim_end_matches("```").trim();
    }
    match (body.find('['), body.rfind(']')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => body,
    }
}

/// Extract and validate the structured plan from a generateContent response.
pub fn parse_plan_response(
    response: &serde_json::Value,
    count: usize,
) -> Result<Vec<CaptionPair>, GenerationError> {
    if let Some(reason) = response["promptFeedback"]["blockReason"].as_str() {
        return Err(GenerationError::SafetyBlocked {
            reason: reason.to_string(),
        });
    }

    let text = response["candidates"][0]["content"]["parts"]
        .as_array()
        .and_then(|parts| parts.iter().find_map(|part| part["text"].as_str()))
        .ok_or_else(|| GenerationError::PlanParseError("response has no text part".to_string()))?;

    let entries: Vec<PlanEntry> = serde_json::from_str(extract_json_array(text))
        .map_err(|e| GenerationError::PlanParseError(format!("invalid plan JSON: {}", e)))?;

    let pairs = entries
        .into_iter()
        .map(|entry| CaptionPair {
            caption_local: entry.caption_local,
            caption_alt: entry.caption_alt,
        })
        .collect();

    sanitize_plan(pairs, count)
}
