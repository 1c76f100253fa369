// Style catalog: maps a style id to the prompt modifier sent with every request

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::errors::ConfigError;

/// One selectable sticker style
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleEntry {
    pub id: String,
    pub name: String,
    pub prompt_modifier: String,
}

/// Ordered, injectable set of styles
#[derive(Debug, Clone, Serialize)]
pub struct StyleCatalog {
    styles: Vec<StyleEntry>,
}

impl StyleCatalog {
    pub fn new(styles: Vec<StyleEntry>) -> Self {
        Self { styles }
    }

    /// Load a catalog from a JSON array of `{id, name, prompt_modifier}`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::StylesFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let styles: Vec<StyleEntry> =
            serde_json::from_str(&data).map_err(|e| ConfigError::StylesFile {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(styles))
    }

    pub fn builtin() -> Self {
        let entry = |id: &str, name: &str, modifier: &str| StyleEntry {
            id: id.to_string(),
            name: name.to_string(),
            prompt_modifier: modifier.to_string(),
        };

        Self::new(vec![
            entry(
                "chibi",
                "Chibi",
                "cute chibi style, big head and small body, thick clean outlines, flat pastel colors",
            ),
            entry(
                "anime",
                "Anime",
                "Japanese anime style, cel shading, expressive eyes, vibrant colors",
            ),
            entry(
                "watercolor",
                "Watercolor",
                "soft hand-painted watercolor style, gentle color bleeding, paper texture",
            ),
            entry(
                "pixel",
                "Pixel Art",
                "16-bit pixel art style, crisp pixels, limited palette",
            ),
            entry(
                "3d",
                "3D Render",
                "glossy 3D cartoon render, soft studio lighting, rounded shapes",
            ),
            entry("plain", "Plain", ""),
        ])
    }

    /// Resolve a style id to its prompt modifier. An empty id means no modifier.
    pub fn resolve(&self, id: &str) -> Option<&str> {
        if id.trim().is_empty() {
            return Some("");
        }
        self.styles
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.prompt_modifier.as_str())
    }

    pub fn styles(&self) -> &[StyleEntry] {
        &self.styles
    }
}

impl Default for StyleCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolve_known_and_unknown() {
        let catalog = StyleCatalog::builtin();
        assert!(catalog.resolve("chibi").unwrap().contains("chibi"));
        assert_eq!(catalog.resolve(""), Some(""));
        assert_eq!(catalog.resolve("plain"), Some(""));
        assert!(catalog.resolve("does-not-exist").is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id": "ink", "name": "Ink", "prompt_modifier": "black ink brush strokes"}}]"#
        )
        .unwrap();

        let catalog = StyleCatalog::from_file(file.path()).unwrap();
        assert_eq!(catalog.styles().len(), 1);
        assert_eq!(catalog.resolve("ink"), Some("black ink brush strokes"));
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            StyleCatalog::from_file(file.path()),
            Err(ConfigError::StylesFile { .. })
        ));
    }
}
