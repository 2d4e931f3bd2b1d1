//! Parser for window-state dumps.
//!
//! Looks for an input-method window block on the target display. A block
//! starts at an IME window header and ends at the next non-IME window
//! header. Evidence accumulates line by line; the keyboard is `active`
//! once one block shows all three of:
//!
//! - a surface (`mHasSurface=true` / `hasSurface=true`),
//! - the target display (`displayId=N`, `mDisplayId=N`, `displayId N`),
//! - a view visibility other than gone (`mViewVisibility=8`); absent
//!   visibility counts as visible.
//!
//! Anything unparseable is treated as "not active".

use crate::types::DisplayId;

/// `mViewVisibility` value meaning the view is gone.
const VISIBILITY_GONE: i64 = 8;

const TITLE_LIMIT: usize = 160;

/// Outcome of one window-state sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImeSample {
    pub active: bool,
    /// Human-readable evidence for logs and observers.
    pub detail: String,
}

impl ImeSample {
    fn inactive(detail: impl Into<String>) -> Self {
        Self {
            active: false,
            detail: detail.into(),
        }
    }
}

fn is_window_header(line: &str) -> bool {
    line.contains("Window{") || line.starts_with("Window #")
}

fn is_ime_header(line: &str) -> bool {
    if !is_window_header(line) {
        return false;
    }
    let lower = line.to_lowercase();
    lower.contains("inputmethod") || lower.contains("input method")
}

/// Whether `key` followed by exactly `id` (and no further digit) occurs.
fn has_number_after(line: &str, key: &str, id: i32) -> bool {
    let wanted = id.to_string();
    line.match_indices(key).any(|(idx, _)| {
        let rest = &line[idx + key.len()..];
        rest.strip_prefix(wanted.as_str())
            .is_some_and(|tail| !tail.starts_with(|c: char| c.is_ascii_digit()))
    })
}

fn matches_display(line: &str, display: DisplayId) -> bool {
    let id = display.get();
    has_number_after(line, "displayId=", id)
        || has_number_after(line, "mDisplayId=", id)
        || has_number_after(line, "displayId ", id)
}

/// Integer after `key`: decimal (optionally negative) or `0x` hex.
fn parse_int_after(line: &str, key: &str) -> Option<i64> {
    let idx = line.find(key)?;
    let rest = line[idx + key.len()..].trim_start_matches(' ');

    if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        let digits: String = hex.chars().take_while(char::is_ascii_hexdigit).collect();
        return i64::from_str_radix(&digits, 16).ok();
    }

    let digits: String = rest
        .chars()
        .take_while(|c| *c == '-' || c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[derive(Default)]
struct Block {
    title: String,
    has_surface: bool,
    visibility: Option<i64>,
    display_matched: bool,
}

impl Block {
    fn active(&self) -> bool {
        self.has_surface && self.display_matched && self.visibility != Some(VISIBILITY_GONE)
    }

    fn describe(&self) -> String {
        format!(
            "title={} surface={} display={} viewVis={:?}",
            self.title, self.has_surface, self.display_matched, self.visibility
        )
    }
}

/// Sample `text` for an active input-method window on `display`.
pub fn parse_ime_state(text: &str, display: DisplayId) -> ImeSample {
    if text.trim().is_empty() {
        return ImeSample::inactive("empty window state");
    }

    let mut block: Option<Block> = None;
    // Most recently closed IME block, kept for the detail.
    let mut closed: Option<Block> = None;
    for raw in text.lines() {
        let line = raw.trim();
        if is_ime_header(line) {
            if let Some(prev) = block.take() {
                closed = Some(prev);
            }
            block = Some(Block {
                title: line.chars().take(TITLE_LIMIT).collect(),
                ..Default::default()
            });
        } else if block.is_some() && is_window_header(line) {
            closed = block.take();
        }

        let Some(b) = block.as_mut() else {
            continue;
        };
        if line.contains("mHasSurface=true") || line.contains("hasSurface=true") {
            b.has_surface = true;
        }
        if let Some(v) = parse_int_after(line, "mViewVisibility=") {
            b.visibility = Some(v);
        }
        if matches_display(line, display) {
            b.display_matched = true;
        }
        if b.active() {
            return ImeSample {
                active: true,
                detail: b.describe(),
            };
        }
    }

    match block.or(closed) {
        Some(b) => ImeSample::inactive(b.describe()),
        None => ImeSample::inactive("no input method window on target display"),
    }
}
