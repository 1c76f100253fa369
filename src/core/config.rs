use crate::core::errors::ConfigError;
use crate::core::styles::StyleCatalog;
use crate::core::types::Strategy;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Generation API configuration.
///
/// The API key is deliberately not validated here; the generation client
/// checks it when it is constructed.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    /// Ordered candidate models: primary first, then fallbacks
    pub image_models: Vec<String>,
    pub plan_model: String,
    pub timeout: Duration,
    pub primary_language: String,
    pub alternate_language: String,
    /// Attempts per candidate model before falling back to the next one
    pub attempts_per_model: u32,
    /// Wait between attempts on one model is `attempt * backoff_step + backoff_base`
    pub backoff_step: Duration,
    pub backoff_base: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            image_models: vec![
                "gemini-2.5-flash-image".to_string(),
                "gemini-2.0-flash-preview-image-generation".to_string(),
            ],
            plan_model: "gemini-2.5-flash".to_string(),
            timeout: Duration::from_secs(90),
            primary_language: "Traditional Chinese".to_string(),
            alternate_language: "English".to_string(),
            attempts_per_model: 3,
            backoff_step: Duration::from_secs(5),
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// Pacing and retry budgets for the three batching strategies
#[derive(Debug, Clone)]
pub struct PacingConfig {
    pub serial_max_attempts: u32,
    pub serial_cooldown: Duration,
    pub serial_item_delay: Duration,

    pub grid_batch_size: usize,
    pub grid_batch_delay: Duration,
    pub grid_quota_pause: Duration,

    pub parallel_batch_size: usize,
    pub parallel_max_attempts: u32,
    pub parallel_backoff: Duration,
    pub parallel_batch_delay: Duration,
    /// Plans larger than this use `parallel_large_batch_delay` between batches
    pub parallel_large_plan_threshold: usize,
    pub parallel_large_batch_delay: Duration,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            serial_max_attempts: 3,
            serial_cooldown: Duration::from_secs(15),
            serial_item_delay: Duration::from_secs(5),
            grid_batch_size: 4,
            grid_batch_delay: Duration::from_secs(10),
            grid_quota_pause: Duration::from_secs(10),
            parallel_batch_size: 3,
            parallel_max_attempts: 3,
            parallel_backoff: Duration::from_secs(15),
            parallel_batch_delay: Duration::from_secs(5),
            parallel_large_plan_threshold: 8,
            parallel_large_batch_delay: Duration::from_secs(12),
        }
    }
}

impl PacingConfig {
    /// Delay between small-parallel batches, scaled to the plan size
    pub fn parallel_delay_for(&self, plan_len: usize) -> Duration {
        if plan_len > self.parallel_large_plan_threshold {
            self.parallel_large_batch_delay
        } else {
            self.parallel_batch_delay
        }
    }
}

/// Local compositing configuration
#[derive(Debug, Clone)]
pub struct CompositorConfig {
    pub canvas_size: u32,
    pub padding: u32,
    /// Pixels with R, G and B all strictly above this become transparent
    pub background_threshold: u8,
    pub max_font_size: f32,
    pub min_font_size: f32,
    pub font_step: f32,
    /// Horizontal margin the caption must fit within
    pub text_margin: u32,
    pub bottom_margin: u32,
    pub max_rotation_degrees: f32,
    pub stroke_width: i32,
    pub fill_color: [u8; 4],
    pub shadow_offset: i32,
    pub shadow_blur: f32,
    pub fonts_dir: String,
    pub font_family: Option<String>,
    pub upload_max_dimension: u32,
    pub upload_jpeg_quality: u8,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            canvas_size: 320,
            padding: 20,
            background_threshold: 240,
            max_font_size: 56.0,
            min_font_size: 20.0,
            font_step: 4.0,
            text_margin: 16,
            bottom_margin: 14,
            max_rotation_degrees: 4.0,
            stroke_width: 6,
            fill_color: [52, 52, 52, 255],
            shadow_offset: 3,
            shadow_blur: 2.5,
            fonts_dir: "fonts".to_string(),
            font_family: None,
            upload_max_dimension: 800,
            upload_jpeg_quality: 85,
        }
    }
}

/// Output bundle configuration
#[derive(Debug, Clone)]
pub struct PackagingConfig {
    pub output_dir: String,
    pub main_size: (u32, u32),
    pub tab_size: (u32, u32),
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            output_dir: "output".to_string(),
            main_size: (240, 240),
            tab_size: (96, 74),
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub api: ApiConfig,
    pub pacing: PacingConfig,
    pub compositor: CompositorConfig,
    pub packaging: PackagingConfig,
    pub default_strategy: Strategy,
    pub styles_file: Option<String>,
}

impl Config {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let config = Self::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_env() -> Result<Self, ConfigError> {
        let api_defaults = ApiConfig::default();
        let pacing_defaults = PacingConfig::default();
        let compositor_defaults = CompositorConfig::default();
        let packaging_defaults = PackagingConfig::default();

        let api_key = env::var("GEMINI_API_KEY")
            .or_else(|_| env::var("API_KEY"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        // Ordered candidate list (comma-separated)
        let image_models = env::var("IMAGE_MODELS")
            .ok()
            .map(|models| {
                models
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or(api_defaults.image_models);

        let log_level = env::var("LOG_LEVEL")
            .ok()
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let default_strategy = match env::var("GENERATION_STRATEGY") {
            Ok(s) => Strategy::from_str(&s)?,
            Err(_) => Strategy::Grid,
        };

        let fill_color = env::var("CAPTION_FILL_COLOR")
            .ok()
            .and_then(|s| parse_hex_color(&s))
            .unwrap_or(compositor_defaults.fill_color);

        Ok(Self {
            server: ServerConfig {
                port: parse_env("SERVER_PORT", 1420),
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                log_level,
            },
            api: ApiConfig {
                api_key,
                base_url: env::var("API_BASE_URL").unwrap_or(api_defaults.base_url),
                image_models,
                plan_model: env::var("PLAN_MODEL").unwrap_or(api_defaults.plan_model),
                timeout: Duration::from_secs(parse_env("API_TIMEOUT_SECONDS", 90)),
                primary_language: env::var("PRIMARY_LANGUAGE")
                    .unwrap_or(api_defaults.primary_language),
                alternate_language: env::var("ALTERNATE_LANGUAGE")
                    .unwrap_or(api_defaults.alternate_language),
                attempts_per_model: parse_env("ATTEMPTS_PER_MODEL", api_defaults.attempts_per_model),
                backoff_step: api_defaults.backoff_step,
                backoff_base: api_defaults.backoff_base,
            },
            pacing: PacingConfig {
                serial_max_attempts: parse_env(
                    "SERIAL_MAX_ATTEMPTS",
                    pacing_defaults.serial_max_attempts,
                ),
                serial_cooldown: parse_secs("SERIAL_COOLDOWN_SECONDS", pacing_defaults.serial_cooldown),
                serial_item_delay: parse_secs(
                    "SERIAL_ITEM_DELAY_SECONDS",
                    pacing_defaults.serial_item_delay,
                ),
                grid_batch_size: parse_env("GRID_BATCH_SIZE", pacing_defaults.grid_batch_size),
                grid_batch_delay: parse_secs(
                    "GRID_BATCH_DELAY_SECONDS",
                    pacing_defaults.grid_batch_delay,
                ),
                grid_quota_pause: parse_secs(
                    "GRID_QUOTA_PAUSE_SECONDS",
                    pacing_defaults.grid_quota_pause,
                ),
                parallel_batch_size: parse_env(
                    "PARALLEL_BATCH_SIZE",
                    pacing_defaults.parallel_batch_size,
                ),
                parallel_max_attempts: parse_env(
                    "PARALLEL_MAX_ATTEMPTS",
                    pacing_defaults.parallel_max_attempts,
                ),
                parallel_backoff: parse_secs(
                    "PARALLEL_BACKOFF_SECONDS",
                    pacing_defaults.parallel_backoff,
                ),
                parallel_batch_delay: parse_secs(
                    "PARALLEL_BATCH_DELAY_SECONDS",
                    pacing_defaults.parallel_batch_delay,
                ),
                parallel_large_plan_threshold: pacing_defaults.parallel_large_plan_threshold,
                parallel_large_batch_delay: parse_secs(
                    "PARALLEL_LARGE_BATCH_DELAY_SECONDS",
                    pacing_defaults.parallel_large_batch_delay,
                ),
            },
            compositor: CompositorConfig {
                canvas_size: parse_env("CANVAS_SIZE", compositor_defaults.canvas_size),
                background_threshold: parse_env(
                    "BACKGROUND_THRESHOLD",
                    compositor_defaults.background_threshold,
                ),
                max_font_size: parse_env("MAX_FONT_SIZE", compositor_defaults.max_font_size),
                min_font_size: parse_env("MIN_FONT_SIZE", compositor_defaults.min_font_size),
                fill_color,
                fonts_dir: env::var("FONTS_DIR").unwrap_or(compositor_defaults.fonts_dir.clone()),
                font_family: env::var("CAPTION_FONT_FAMILY").ok().filter(|s| !s.is_empty()),
                upload_max_dimension: parse_env(
                    "UPLOAD_MAX_DIMENSION",
                    compositor_defaults.upload_max_dimension,
                ),
                ..compositor_defaults
            },
            packaging: PackagingConfig {
                output_dir: env::var("OUTPUT_DIR").unwrap_or(packaging_defaults.output_dir),
                ..packaging_defaults
            },
            default_strategy,
            styles_file: env::var("STYLES_FILE").ok().filter(|s| !s.is_empty()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.image_models.is_empty() {
            return Err(ConfigError::NoImageModels);
        }
        if self.api.attempts_per_model == 0 {
            return Err(ConfigError::InvalidAttempts("ATTEMPTS_PER_MODEL"));
        }

        let pacing = &self.pacing;
        if !(1..=4).contains(&pacing.grid_batch_size) {
            return Err(ConfigError::InvalidGridBatchSize(pacing.grid_batch_size));
        }
        if pacing.parallel_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize(pacing.parallel_batch_size));
        }
        if pacing.serial_max_attempts == 0 {
            return Err(ConfigError::InvalidAttempts("SERIAL_MAX_ATTEMPTS"));
        }
        if pacing.parallel_max_attempts == 0 {
            return Err(ConfigError::InvalidAttempts("PARALLEL_MAX_ATTEMPTS"));
        }

        let compositor = &self.compositor;
        if compositor.canvas_size == 0 || compositor.padding * 2 >= compositor.canvas_size {
            return Err(ConfigError::InvalidCompositorConfig(format!(
                "canvas_size {} too small for padding {}",
                compositor.canvas_size, compositor.padding
            )));
        }
        if compositor.min_font_size <= 0.0 || compositor.min_font_size > compositor.max_font_size {
            return Err(ConfigError::InvalidCompositorConfig(format!(
                "font size range {}..{} is invalid",
                compositor.min_font_size, compositor.max_font_size
            )));
        }
        if compositor.font_step <= 0.0 {
            return Err(ConfigError::InvalidCompositorConfig(
                "font_step must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Style catalog from `STYLES_FILE`, or the built-in one
    pub fn style_catalog(&self) -> Result<StyleCatalog, ConfigError> {
        match &self.styles_file {
            Some(path) => StyleCatalog::from_file(path),
            None => Ok(StyleCatalog::builtin()),
        }
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }
}

fn parse_env<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|s| *s >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(default)
}

/// Parse `#rrggbb` or `#rrggbbaa`
pub fn parse_hex_color(s: &str) -> Option<[u8; 4]> {
    let hex = s.trim().trim_start_matches('#');
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    match hex.len() {
        6 => Some([channel(0)?, channel(2)?, channel(4)?, 255]),
        8 => Some([channel(0)?, channel(2)?, channel(4)?, channel(6)?]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server: ServerConfig {
                port: 1420,
                host: "127.0.0.1".to_string(),
                log_level: Level::INFO,
            },
            api: ApiConfig::default(),
            pacing: PacingConfig::default(),
            compositor: CompositorConfig::default(),
            packaging: PackagingConfig::default(),
            default_strategy: Strategy::Grid,
            styles_file: None,
        }
    }

    #[test]
    fn test_defaults_validate() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_grid_batch_size_bounds() {
        let mut config = base_config();
        config.pacing.grid_batch_size = 5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidGridBatchSize(5))
        ));
    }

    #[test]
    fn test_empty_model_list_rejected() {
        let mut config = base_config();
        config.api.image_models.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoImageModels)));
    }

    #[test]
    fn test_parallel_delay_scales_with_plan() {
        let pacing = PacingConfig::default();
        assert_eq!(pacing.parallel_delay_for(6), pacing.parallel_batch_delay);
        assert_eq!(pacing.parallel_delay_for(16), pacing.parallel_large_batch_delay);
    }

    #[test]
    fn test_parse_hex_color() {
        assert_eq!(parse_hex_color("#ff0080"), Some([255, 0, 128, 255]));
        assert_eq!(parse_hex_color("00000080"), Some([0, 0, 0, 128]));
        assert_eq!(parse_hex_color("#abc"), None);
        assert_eq!(parse_hex_color("#zzzzzz"), None);
    }
}
