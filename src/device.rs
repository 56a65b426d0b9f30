use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sysinfo::System;

static CURRENT: OnceLock<DeviceInfo> = OnceLock::new();

/// Environment metadata stamped onto each session when it is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub model: String,
    pub api_level: i32,
}

impl DeviceInfo {
    pub fn new(model: impl Into<String>, api_level: i32) -> Self {
        Self {
            model: model.into(),
            api_level,
        }
    }

    /// Probed once per process; later calls return the cached value.
    pub fn current() -> &'static DeviceInfo {
        CURRENT.get_or_init(Self::probe)
    }

    fn probe() -> Self {
        let host = System::host_name().unwrap_or_else(|| "unknown".into());
        let os = System::long_os_version()
            .or_else(System::name)
            .unwrap_or_else(|| "unknown".into());
        let api_level = System::os_version()
            .as_deref()
            .and_then(leading_number)
            .unwrap_or(0);

        // no commas: the model lands in CSV exports
        let model = format!("{host} ({os})").replace(',', " ");
        Self { model, api_level }
    }
}

fn leading_number(version: &str) -> Option<i32> {
    let digits: String = version
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
