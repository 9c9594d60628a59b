///
/// Engine Configuration
///
/// Read from a TOML table; every key is optional:
///
/// ```toml
/// fast_path = true        # direct dispatch for main-like signatures
/// lazy_stubs = true       # compile callees on first call
/// discard_stubs = true    # drop synthesized call stubs after use
/// opt_level = "speed"     # none | speed | speed_and_size
/// verify = false          # run the Cranelift verifier
/// ```
///

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    pub fn as_flag(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub fast_path: bool,
    pub lazy_stubs: bool,
    /// Removes each synthesized call stub from the module and the address
    /// cache after its call. The stub's machine code and its (now empty)
    /// function slot are kept until the engine is dropped, so every call
    /// through the stub path grows the engine by one small allocation.
    pub discard_stubs: bool,
    pub opt_level: OptLevel,
    pub verify: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fast_path: true,
            lazy_stubs: true,
            discard_stubs: true,
            opt_level: OptLevel::Speed,
            verify: false,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }
}
