//! Requested permission scopes

use std::collections::BTreeSet;

use crate::config::{MeetingMode, Settings};

/// Scopes needed to create standalone online meetings.
pub const DIRECT_MEETING_SCOPES: &[&str] = &["OnlineMeetings.ReadWrite", "offline_access", "openid", "profile"];

/// Scopes needed to create calendar events carrying a Teams meeting.
pub const CALENDAR_EVENT_SCOPES: &[&str] = &["Calendars.ReadWrite", "offline_access", "openid", "profile"];

impl MeetingMode {
    pub fn default_scopes(self) -> &'static [&'static str] {
        match self {
            MeetingMode::Direct => DIRECT_MEETING_SCOPES,
            MeetingMode::Calendar => CALENDAR_EVENT_SCOPES,
        }
    }
}

/// Canonical form of a scope set: sorted, deduplicated, single-space joined.
pub fn normalize_scopes(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalized scopes that apply to the given settings.
///
/// An explicit `scopes` value overrides the meeting mode's default list.
pub fn requested_scopes(settings: &Settings) -> String {
    if settings.scopes.trim().is_empty() {
        normalize_scopes(&settings.meeting_mode.default_scopes().join(" "))
    } else {
        normalize_scopes(&settings.scopes)
    }
}
