//! Virtual output configuration and flag composition.

use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::VdError;
use crate::platform::OutputToken;
use crate::relay::queue::ProducerEndpoint;

/// Accepted density range.
pub const MIN_DPI: u32 = 72;
pub const MAX_DPI: u32 = 640;

/// Largest accepted edge in pixels.
pub const MAX_EDGE: u32 = 8192;

bitflags! {
    /// Virtual display flag bits understood by the platform.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OutputFlags: u32 {
        const PUBLIC                     = 1 << 0;
        const OWN_CONTENT_ONLY           = 1 << 3;
        const SUPPORTS_TOUCH             = 1 << 6;
        const ROTATES_WITH_CONTENT       = 1 << 7;
        const DESTROY_CONTENT_ON_REMOVAL = 1 << 8;
        const TRUSTED                    = 1 << 10;
        const OWN_DISPLAY_GROUP          = 1 << 11;
        const ALWAYS_UNLOCKED            = 1 << 12;
        const TOUCH_FEEDBACK_DISABLED    = 1 << 13;
        const OWN_FOCUS                  = 1 << 14;
        const DEVICE_DISPLAY_GROUP       = 1 << 15;
    }
}

/// Flags granted per minimum platform level. Every row at or below the
/// running level applies.
pub const FLAG_TABLE: &[(u32, OutputFlags)] = &[
    (
        0,
        OutputFlags::PUBLIC
            .union(OutputFlags::OWN_CONTENT_ONLY)
            .union(OutputFlags::SUPPORTS_TOUCH)
            .union(OutputFlags::DESTROY_CONTENT_ON_REMOVAL),
    ),
    (
        33,
        OutputFlags::TRUSTED
            .union(OutputFlags::OWN_DISPLAY_GROUP)
            .union(OutputFlags::ALWAYS_UNLOCKED)
            .union(OutputFlags::TOUCH_FEEDBACK_DISABLED),
    ),
    (
        34,
        OutputFlags::OWN_FOCUS.union(OutputFlags::DEVICE_DISPLAY_GROUP),
    ),
];

/// Compose the flag set for `level`.
pub fn flags_for_level(level: u32, rotates_with_content: bool) -> OutputFlags {
    let mut flags = FLAG_TABLE
        .iter()
        .filter(|(min, _)| level >= *min)
        .fold(OutputFlags::empty(), |acc, (_, f)| acc | *f);
    if rotates_with_content {
        flags |= OutputFlags::ROTATES_WITH_CONTENT;
    }
    flags
}

// ── OutputConfig ─────────────────────────────────────────────────

/// What the caller asks for when starting a virtual output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    /// `0.0` lets the platform choose.
    pub refresh_rate: f32,
    pub rotates_with_content: bool,
    /// How long `start` waits for the relay's producer endpoint.
    #[serde(with = "millis")]
    pub producer_timeout: Duration,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            name: "vdiso-virtual".into(),
            width: 1080,
            height: 1920,
            dpi: 440,
            refresh_rate: 0.0,
            rotates_with_content: false,
            producer_timeout: Duration::from_millis(1500),
        }
    }
}

impl OutputConfig {
    /// Reject sizes the relay cannot allocate.
    pub fn validate(&self) -> Result<(), VdError> {
        if self.width == 0 || self.height == 0 || self.width > MAX_EDGE || self.height > MAX_EDGE {
            return Err(VdError::InvalidConfig(format!(
                "size {}x{} outside 1..={MAX_EDGE}",
                self.width, self.height
            )));
        }
        if self.name.trim().is_empty() {
            return Err(VdError::InvalidConfig("empty display name".into()));
        }
        Ok(())
    }

    /// Density clamped into the accepted range.
    pub fn clamped_dpi(&self) -> u32 {
        self.dpi.clamp(MIN_DPI, MAX_DPI)
    }

    /// Build the creation request for platform `level`.
    pub fn to_spec(
        &self,
        level: u32,
        token: OutputToken,
        surface: Option<ProducerEndpoint>,
    ) -> VirtualOutputSpec {
        VirtualOutputSpec {
            name: self.name.clone(),
            width: self.width,
            height: self.height,
            dpi: self.clamped_dpi(),
            refresh_rate: self.refresh_rate,
            flags: flags_for_level(level, self.rotates_with_content),
            unique_id: format!("{}:{}", self.name, token.0),
            surface,
        }
    }
}

// ── VirtualOutputSpec ────────────────────────────────────────────

/// Creation request as handed to the platform.
#[derive(Debug, Clone)]
pub struct VirtualOutputSpec {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub refresh_rate: f32,
    pub flags: OutputFlags,
    pub unique_id: String,
    pub surface: Option<ProducerEndpoint>,
}

impl VirtualOutputSpec {
    /// Same request with `flags` removed.
    pub fn without(&self, flags: OutputFlags) -> Self {
        Self {
            flags: self.flags - flags,
            ..self.clone()
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_flags_on_old_platforms() {
        let f = flags_for_level(30, false);
        assert!(f.contains(
            OutputFlags::PUBLIC
                | OutputFlags::OWN_CONTENT_ONLY
                | OutputFlags::SUPPORTS_TOUCH
                | OutputFlags::DESTROY_CONTENT_ON_REMOVAL
        ));
        assert!(!f.contains(OutputFlags::TRUSTED));
        assert!(!f.contains(OutputFlags::ROTATES_WITH_CONTENT));
    }

    #[test]
    fn newer_levels_accumulate_rows() {
        let f33 = flags_for_level(33, false);
        assert!(f33.contains(OutputFlags::TRUSTED | OutputFlags::ALWAYS_UNLOCKED));
        assert!(!f33.contains(OutputFlags::OWN_FOCUS));

        let f34 = flags_for_level(34, true);
        assert!(f34.contains(f33));
        assert!(f34.contains(OutputFlags::OWN_FOCUS | OutputFlags::ROTATES_WITH_CONTENT));
        assert_eq!(f34.bits() & 0xFFFF_0000, 0);
    }

    #[test]
    fn dpi_is_clamped_and_size_validated() {
        let mut cfg = OutputConfig {
            dpi: 2000,
            ..Default::default()
        };
        assert_eq!(cfg.clamped_dpi(), MAX_DPI);
        cfg.dpi = 10;
        assert_eq!(cfg.to_spec(34, OutputToken(1), None).dpi, MIN_DPI);

        cfg.width = 0;
        assert!(matches!(cfg.validate(), Err(VdError::InvalidConfig(_))));
    }

    #[test]
    fn without_drops_only_named_bits() {
        let spec = OutputConfig::default().to_spec(34, OutputToken(7), None);
        let relaxed = spec.without(OutputFlags::TRUSTED);
        assert!(!relaxed.flags.contains(OutputFlags::TRUSTED));
        assert_eq!(relaxed.flags | OutputFlags::TRUSTED, spec.flags);
        assert_eq!(relaxed.unique_id, "vdiso-virtual:7");
    }
}
