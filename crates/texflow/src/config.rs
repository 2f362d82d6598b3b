use std::env;

use serde::Deserialize;

use crate::device::{DeviceCapabilities, TimerQueryVersion};

pub const ENV_DELAYED_STORAGE: &str = "TEXFLOW_DELAYED_STORAGE";
pub const ENV_ASYNC_READBACK: &str = "TEXFLOW_ASYNC_READBACK";
pub const ENV_TIMER_QUERY_VERSION: &str = "TEXFLOW_TIMER_QUERY_VERSION";
pub const ENV_MAX_TEXTURE_SIZE: &str = "TEXFLOW_MAX_TEXTURE_SIZE";

/// Backend tunables.
///
/// The `Option` fields override what the device advertises. An override can
/// only narrow a capability: asking for async readback on a device without it
/// leaves it off.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Keep host buffers on `write` and upload lazily on first use. When set,
    /// reading a tensor back also releases its device texture.
    pub delayed_storage: bool,
    pub async_readback: Option<bool>,
    pub timer_query: Option<TimerQueryVersion>,
    pub max_texture_size: Option<usize>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            delayed_storage: true,
            async_readback: None,
            timer_query: None,
            max_texture_size: None,
        }
    }
}

impl BackendConfig {
    /// Defaults with any `TEXFLOW_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = env_value(ENV_DELAYED_STORAGE) {
            config.delayed_storage = parse_bool(&value);
        }
        if let Some(value) = env_value(ENV_ASYNC_READBACK) {
            config.async_readback = Some(parse_bool(&value));
        }
        if let Some(value) = env_value(ENV_TIMER_QUERY_VERSION) {
            config.timer_query = parse_timer_query(&value);
        }
        if let Some(value) = env_value(ENV_MAX_TEXTURE_SIZE) {
            match value.trim().parse::<usize>() {
                Ok(size) if size > 0 => config.max_texture_size = Some(size),
                _ => tracing::warn!(
                    value = %value,
                    "ignoring invalid {ENV_MAX_TEXTURE_SIZE}"
                ),
            }
        }
        config
    }

    pub fn with_delayed_storage(mut self, enabled: bool) -> Self {
        self.delayed_storage = enabled;
        self
    }

    pub fn with_async_readback(mut self, enabled: bool) -> Self {
        self.async_readback = Some(enabled);
        self
    }

    pub fn with_timer_query(mut self, version: TimerQueryVersion) -> Self {
        self.timer_query = Some(version);
        self
    }

    pub fn with_max_texture_size(mut self, size: usize) -> Self {
        self.max_texture_size = Some(size);
        self
    }

    /// Applies the overrides to what the device reports.
    pub fn effective_capabilities(&self, device: DeviceCapabilities) -> DeviceCapabilities {
        let mut caps = device;
        if let Some(enabled) = self.async_readback {
            caps.async_readback &= enabled;
        }
        if let Some(version) = self.timer_query {
            caps.timer_query = caps.timer_query.min(version);
        }
        if let Some(size) = self.max_texture_size {
            caps.max_texture_size = caps.max_texture_size.min(size);
        }
        caps
    }
}

fn env_value(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn parse_timer_query(value: &str) -> Option<TimerQueryVersion> {
    match value.trim() {
        "0" => Some(TimerQueryVersion::None),
        "1" => Some(TimerQueryVersion::V1),
        "2" => Some(TimerQueryVersion::V2),
        other => {
            tracing::warn!(value = other, "ignoring invalid {ENV_TIMER_QUERY_VERSION}");
            None
        }
    }
}
