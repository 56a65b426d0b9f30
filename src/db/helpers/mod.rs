use std::collections::BTreeSet;
use std::convert::TryFrom;

use anyhow::{anyhow, Context, Result};

use crate::db::models::{FrontRearHint, SessionSource};

pub fn to_i64(value: usize) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

pub fn to_usize(value: i64, field: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

pub fn encode_camera_ids(ids: &BTreeSet<String>) -> Result<String> {
    serde_json::to_string(ids).context("failed to encode camera ids")
}

/// Decodes a stored camera id set. Accepts the JSON array form and the older
/// comma-joined form; anything else decodes to the empty set.
pub fn decode_camera_ids(raw: Option<&str>) -> BTreeSet<String> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return BTreeSet::new();
    };

    if raw.starts_with('[') {
        return serde_json::from_str::<BTreeSet<String>>(raw).unwrap_or_default();
    }

    raw.split(',')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_hint(value: Option<&str>) -> FrontRearHint {
    match value.map(str::trim) {
        Some(raw) if raw.eq_ignore_ascii_case("FRONT") => FrontRearHint::Front,
        Some(raw) if raw.eq_ignore_ascii_case("REAR") => FrontRearHint::Rear,
        _ => FrontRearHint::Unknown,
    }
}

pub fn parse_source(value: Option<&str>) -> SessionSource {
    match value.map(str::trim) {
        Some(raw) if raw.eq_ignore_ascii_case("HEURISTIC") => SessionSource::Heuristic,
        _ => SessionSource::Availability,
    }
}
