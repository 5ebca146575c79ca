//! Configuration for avatar streaming sessions and the frame compositor

use crate::error::AvatarError;
use serde::{Deserialize, Serialize};
use url::Url;

/// Avatar streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AvatarStreamConfig {
    /// Token issuance endpoint (POST, returns `data.token`)
    pub token_endpoint: String,

    /// Base URL of the streaming provider REST API
    pub api_base_url: String,

    /// Avatar identity requested from the provider
    pub avatar_id: String,

    /// Voice identity (provider default voice when unset)
    pub voice_id: Option<String>,

    /// Rendering quality
    pub quality: AvatarQuality,

    /// Task type used by `speak()` unless overridden per call
    pub default_task_type: TaskType,

    /// Start a session from `speak()` when none is active
    pub auto_initialize_on_speak: bool,

    /// Timeout applied to every token and provider REST request
    pub request_timeout_secs: u64,

    /// Capacity of the broadcast channel behind `EventBus::subscribe`
    pub event_buffer_size: usize,

    /// Frame compositor settings
    pub compositor: CompositorConfig,
}

impl Default for AvatarStreamConfig {
    fn default() -> Self {
        Self {
            token_endpoint: "http://localhost:5678/webhook/avatar-token".to_string(),
            api_base_url: "https://api.heygen.com".to_string(),
            avatar_id: "default".to_string(),
            voice_id: None,
            quality: AvatarQuality::Medium,
            default_task_type: TaskType::Repeat,
            auto_initialize_on_speak: true,
            request_timeout_secs: 30,
            event_buffer_size: 256,
            compositor: CompositorConfig::default(),
        }
    }
}

/// Frame compositor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CompositorConfig {
    /// Presentation refresh rate driving the per-frame loop (1-240)
    pub refresh_rate_hz: u32,

    /// Backdrop classification thresholds
    pub chroma_key: ChromaKey,
}

impl Default for CompositorConfig {
    fn default() -> Self {
        Self {
            refresh_rate_hz: 60,
            chroma_key: ChromaKey::default(),
        }
    }
}

/// Solid green backdrop thresholds.
///
/// A pixel is backdrop when green is strictly above `green_min` while red and
/// blue are both strictly below their maxima.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChromaKey {
    pub green_min: u8,
    pub red_max: u8,
    pub blue_max: u8,
}

impl Default for ChromaKey {
    fn default() -> Self {
        Self {
            green_min: 90,
            red_max: 90,
            blue_max: 90,
        }
    }
}

impl ChromaKey {
    #[inline]
    pub fn is_backdrop(&self, r: u8, g: u8, b: u8) -> bool {
        g > self.green_min && r < self.red_max && b < self.blue_max
    }
}

/// Provider rendering quality
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AvatarQuality {
    Low,
    #[default]
    Medium,
    High,
}

impl AvatarQuality {
    /// Parse a quality name; anything unrecognised falls back to medium
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "low" => AvatarQuality::Low,
            "high" => AvatarQuality::High,
            _ => AvatarQuality::Medium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AvatarQuality::Low => "low",
            AvatarQuality::Medium => "medium",
            AvatarQuality::High => "high",
        }
    }
}

/// What the provider does with the text of a speak request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Speak the text verbatim
    #[default]
    Repeat,
    /// Treat the text as a conversational turn and speak the provider's reply
    Talk,
}

impl TaskType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "repeat" => Some(TaskType::Repeat),
            "talk" => Some(TaskType::Talk),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Repeat => "repeat",
            TaskType::Talk => "talk",
        }
    }
}

/// Speak requests are always acknowledged synchronously
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    #[default]
    Sync,
}

/// Voice emotion applied to a single speak request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VoiceEmotion {
    Excited,
    Serious,
    Friendly,
    Soothing,
    Broadcaster,
}

impl VoiceEmotion {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "excited" => Some(VoiceEmotion::Excited),
            "serious" => Some(VoiceEmotion::Serious),
            "friendly" => Some(VoiceEmotion::Friendly),
            "soothing" => Some(VoiceEmotion::Soothing),
            "broadcaster" => Some(VoiceEmotion::Broadcaster),
            _ => None,
        }
    }
}

impl AvatarStreamConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        validate_http_url("token_endpoint", &self.token_endpoint)?;
        validate_http_url("api_base_url", &self.api_base_url)?;

        validate_identity("avatar_id", &self.avatar_id)?;
        if let Some(ref voice_id) = self.voice_id {
            validate_identity("voice_id", voice_id)?;
        }

        if self.request_timeout_secs == 0 || self.request_timeout_secs > 600 {
            return Err("Request timeout must be between 1 and 600 seconds".to_string());
        }

        if self.event_buffer_size == 0 {
            return Err("Event buffer size must be greater than 0".to_string());
        }

        if self.compositor.refresh_rate_hz == 0 || self.compositor.refresh_rate_hz > 240 {
            return Err("Compositor refresh rate must be between 1 and 240 Hz".to_string());
        }

        Ok(())
    }

    /// Load configuration from a JSON, TOML or YAML file
    pub fn from_file(path: &str) -> Result<Self, AvatarError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AvatarError::Config(format!("Failed to read {}: {}", path, e)))?;
        Self::from_str(&content)
    }

    /// Load configuration from a string, trying JSON, then TOML, then YAML
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, AvatarError> {
        if let Ok(config) = serde_json::from_str::<AvatarStreamConfig>(content) {
            return Ok(config);
        }

        if let Ok(config) = toml::from_str::<AvatarStreamConfig>(content) {
            return Ok(config);
        }

        if let Ok(config) = serde_yaml::from_str::<AvatarStreamConfig>(content) {
            return Ok(config);
        }

        Err(AvatarError::Config("Unknown configuration format".to_string()))
    }

    /// Defaults overlaid with `PRESENCE_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay `PRESENCE_*` environment variables onto this configuration
    pub fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var("PRESENCE_TOKEN_ENDPOINT") {
            self.token_endpoint = endpoint;
        }

        if let Ok(base_url) = std::env::var("PRESENCE_API_BASE_URL") {
            self.api_base_url = base_url;
        }

        if let Ok(avatar_id) = std::env::var("PRESENCE_AVATAR_ID") {
            self.avatar_id = avatar_id;
        }

        if let Ok(voice_id) = std::env::var("PRESENCE_VOICE_ID") {
            self.voice_id = if voice_id.is_empty() { None } else { Some(voice_id) };
        }

        if let Ok(quality) = std::env::var("PRESENCE_QUALITY") {
            self.quality = AvatarQuality::from_name(&quality);
        }

        if let Ok(task_type) = std::env::var("PRESENCE_TASK_TYPE") {
            match TaskType::from_name(&task_type) {
                Some(task_type) => self.default_task_type = task_type,
                None => tracing::warn!("Ignoring unknown PRESENCE_TASK_TYPE: {}", task_type),
            }
        }

        if let Ok(timeout) = std::env::var("PRESENCE_REQUEST_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.request_timeout_secs = secs;
            }
        }
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}

fn validate_http_url(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() || value.len() > 2048 {
        return Err(format!("{} must be between 1 and 2048 characters", field));
    }
    let url = Url::parse(value).map_err(|e| format!("{} is not a valid URL: {}", field, e))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(format!("{} must use http or https, got {}", field, other)),
    }
}

fn validate_identity(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{} cannot be empty", field));
    }
    if value.len() > 256 {
        return Err(format!("{} too long (max 256 chars)", field));
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(format!("{} contains invalid characters", field));
    }
    Ok(())
}
