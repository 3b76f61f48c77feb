//! Version information for cradle.

/// Cradle version from Cargo.toml
pub const CRADLE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by the health route.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VersionInfo {
    pub cradle: &'static str,
    /// Wire protocol revision of the envelope format.
    pub protocol: u32,
}

pub const PROTOCOL_VERSION: u32 = 1;

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            cradle: CRADLE_VERSION,
            protocol: PROTOCOL_VERSION,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }
}
