//! Command handlers.

pub mod check;
pub mod run;

use serde::Serialize;
use tabled::Tabled;

// ── Shared row types ────────────────────────────────────────────────

/// One device as reported by `run` and `check`.
#[derive(Debug, Clone, Serialize, Tabled)]
pub struct DeviceRow {
    #[tabled(rename = "Host")]
    pub host: String,
    #[tabled(rename = "Device")]
    pub device: String,
    #[tabled(rename = "Policy")]
    pub policy: String,
    #[tabled(rename = "Result")]
    pub result: String,
    #[tabled(rename = "Detail")]
    pub detail: String,
}

impl DeviceRow {
    pub fn id(&self) -> String {
        format!("{}.{}", self.host, self.device)
    }
}
