//! Configuration for the vdiso agent.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vdiso_core::display::config::{MAX_DPI, MAX_EDGE, MIN_DPI};
use vdiso_core::{FocusConfig, OutputConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Which platform backend to talk to.
    pub platform: PlatformConfig,
    /// Virtual display geometry.
    pub display: DisplayConfig,
    /// Capture timing.
    pub capture: CaptureConfig,
    /// Keyboard focus arbitration.
    pub focus: FocusSettings,
    /// Input injection.
    pub input: InputConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Loopback,
    Shell,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub backend: Backend,
    /// Program used by the shell backend (`<program> -c <command>`).
    pub shell_program: String,
    /// Platform level reported by the shell backend.
    pub shell_platform_level: u32,
    /// Frames per second the loopback display produces.
    pub loopback_frame_rate: u32,
    pub loopback_platform_level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// Clamped to 72..=640.
    pub dpi: u32,
    /// 0 lets the platform choose.
    pub refresh_rate: f32,
    pub rotates_with_content: bool,
    pub producer_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub timeout_ms: u64,
    /// Longest wait for a non-black frame.
    pub settle_wait_ms: u64,
    pub settle_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusSettings {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub force_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Minimum spacing of pre-injection focus corrections.
    pub focus_interval_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Optional log file path. If empty, logs to stderr.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Loopback,
            shell_program: "sh".into(),
            shell_platform_level: 34,
            loopback_frame_rate: 30,
            loopback_platform_level: 34,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        let out = OutputConfig::default();
        Self {
            name: out.name,
            width: out.width,
            height: out.height,
            dpi: out.dpi,
            refresh_rate: out.refresh_rate,
            rotates_with_content: out.rotates_with_content,
            producer_timeout_ms: out.producer_timeout.as_millis() as u64,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 800,
            settle_wait_ms: 1500,
            settle_poll_ms: 80,
        }
    }
}

impl Default for FocusSettings {
    fn default() -> Self {
        let focus = FocusConfig::default();
        Self {
            enabled: true,
            poll_interval_ms: focus.poll_interval.as_millis() as u64,
            force_interval_ms: focus.force_interval.as_millis() as u64,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            focus_interval_ms: vdiso_core::input::injector::DEFAULT_FOCUS_INTERVAL.as_millis() as u64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: String::new(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl AgentConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Display settings as an `OutputConfig`, clamped into accepted ranges.
    pub fn to_output_config(&self) -> OutputConfig {
        let d = &self.display;
        OutputConfig {
            name: d.name.clone(),
            width: d.width.clamp(1, MAX_EDGE),
            height: d.height.clamp(1, MAX_EDGE),
            dpi: d.dpi.clamp(MIN_DPI, MAX_DPI),
            refresh_rate: d.refresh_rate.max(0.0),
            rotates_with_content: d.rotates_with_content,
            producer_timeout: Duration::from_millis(d.producer_timeout_ms.max(100)),
        }
    }

    pub fn to_focus_config(&self) -> FocusConfig {
        FocusConfig {
            poll_interval: Duration::from_millis(self.focus.poll_interval_ms.max(20)),
            force_interval: Duration::from_millis(self.focus.force_interval_ms.max(10)),
        }
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture.timeout_ms)
    }

    pub fn settle_wait(&self) -> Duration {
        Duration::from_millis(self.capture.settle_wait_ms)
    }

    pub fn settle_poll(&self) -> Duration {
        Duration::from_millis(self.capture.settle_poll_ms.max(1))
    }

    pub fn focus_interval(&self) -> Duration {
        Duration::from_millis(self.input.focus_interval_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&AgentConfig::default()).unwrap();
        assert!(text.contains("backend = \"loopback\""));
        assert!(text.contains("poll_interval_ms = 220"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: AgentConfig = toml::from_str("[display]\nwidth = 720\n").unwrap();
        assert_eq!(cfg.display.width, 720);
        assert_eq!(cfg.display.height, 1920);
        assert_eq!(cfg.focus.force_interval_ms, 90);
    }

    #[test]
    fn to_output_config_clamps() {
        let mut cfg = AgentConfig::default();
        cfg.display.dpi = 2000;
        cfg.display.width = 100_000;
        let out = cfg.to_output_config();
        assert_eq!(out.dpi, 640);
        assert_eq!(out.width, 8192);
        assert!(out.validate().is_ok());

        cfg.display.dpi = 10;
        assert_eq!(cfg.to_output_config().dpi, 72);
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = AgentConfig::load(Path::new("/nonexistent/vdiso-agent.toml"));
        assert_eq!(cfg.platform.backend, Backend::Loopback);
    }
}
