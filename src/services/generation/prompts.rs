// Prompt text for the image and planning calls

use serde_json::json;

/// Quadrant names in reading order
pub const QUADRANTS: [&str; 4] = ["top-left", "top-right", "bottom-left", "bottom-right"];

/// Stand-in poses used when a grid batch has fewer than four captions
pub const PLACEHOLDER_EMOTIONS: [&str; 4] = ["happy", "waving hello", "thumbs up", "surprised"];

/// Emotional spread the planner is asked to cover
pub const PLAN_CATEGORIES: &[&str] = &[
    "happy",
    "sad",
    "angry",
    "affectionate",
    "greeting",
    "farewell",
    "surprised",
    "amused",
    "thankful",
    "apologetic",
    "encouraging",
    "tired",
];

const COMMON_RULES: &str = "Use a solid pure white background. \
Do NOT draw any text, letters, speech bubbles or captions anywhere in the image. \
Keep the whole character inside the frame with some empty space around it.";

fn style_clause(style_prompt: &str) -> String {
    let style = style_prompt.trim();
    if style.is_empty() {
        String::new()
    } else {
        format!(" Art style: {}.", style)
    }
}

fn subject_clause(has_reference: bool) -> &'static str {
    if has_reference {
        " Draw the same character as in the attached reference image, keeping its colors and distinctive features."
    } else {
        " Draw a cute, expressive mascot character."
    }
}

/// Prompt for one sticker expressing `caption`.
pub fn single_image_prompt(caption: &str, style_prompt: &str, has_reference: bool) -> String {
    format!(
        "Create a single sticker illustration, square 1:1 aspect ratio.{}{} \
         The character's pose and facial expression must convey the meaning of: \"{}\". {}",
        subject_clause(has_reference),
        style_clause(style_prompt),
        caption.trim(),
        COMMON_RULES
    )
}

/// Prompt for a 2x2 sheet, one pose per quadrant in caption order.
///
/// Captions beyond four are ignored; missing slots get placeholder emotions.
pub fn grid_image_prompt(captions: &[String], style_prompt: &str, has_reference: bool) -> String {
    let mut quadrants = String::new();
    for (slot, name) in QUADRANTS.iter().enumerate() {
        let meaning = captions
            .get(slot)
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .unwrap_or(PLACEHOLDER_EMOTIONS[slot]);
        quadrants.push_str(&format!("\n- {}: \"{}\"", name, meaning));
    }

    format!(
        "Create one square 1:1 image divided into a 2x2 arrangement of four sticker poses \
         of the same character, one pose per quadrant.{}{} \
         The character must look identical in all four quadrants; only pose and expression change. \
         Each quadrant conveys the meaning below:{}\n\
         Do NOT draw grid lines, borders or separators between the quadrants. {}",
        subject_clause(has_reference),
        style_clause(style_prompt),
        quadrants,
        COMMON_RULES
    )
}

/// Prompt for the caption plan.
pub fn plan_prompt(count: usize, context: &str, primary_language: &str, alternate_language: &str) -> String {
    let context = context.trim();
    let context = if context.is_empty() {
        "everyday chat with friends"
    } else {
        context
    };

    format!(
        "Plan a set of exactly {count} chat sticker captions for this usage context: \"{context}\". \
         Cover a spread of common emotional categories ({categories}, ...) without repeating one \
         until the others are used. Each caption is short (at most 8 characters in {primary} or \
         4 words in {alternate}) and natural for casual messaging. \
         For each sticker return 'caption_local' in {primary} and 'caption_alt', the same meaning in {alternate}. \
         Captions must not contain emoji, symbols or quotation marks.",
        count = count,
        context = context,
        categories = PLAN_CATEGORIES.join(", "),
        primary = primary_language,
        alternate = alternate_language,
    )
}

/// Structured-output schema for the plan: an ordered array of caption pairs
pub fn plan_response_schema() -> serde_json::Value {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "properties": {
                "caption_local": {"type": "string"},
                "caption_alt": {"type": "string"}
            },
            "required": ["caption_local", "caption_alt"]
        }
    })
}
