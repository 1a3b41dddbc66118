// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! CLI argument parsing for per-crate debug flags
//!
//! Supports flags like `--debug-flexcem-session` or `--debug-all` to turn on
//! debug output for individual crates.

use std::collections::BTreeSet;
use std::env;

use crate::KNOWN_CRATES;

/// Set of crates with debug logging enabled
///
/// # Example
/// ```rust
/// use flexcem_observability::CrateDebugFlags;
///
/// let flags = CrateDebugFlags::from_args(vec!["--debug-flexcem-session".to_string()]);
/// assert!(flags.is_enabled("flexcem-session"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CrateDebugFlags {
    enabled_crates: BTreeSet<String>,
}

impl CrateDebugFlags {
    /// Parse debug flags from command-line arguments
    ///
    /// Arguments not starting with `--debug-` are ignored, so the full
    /// `std::env::args()` list can be passed in.
    pub fn from_args<I>(args: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let mut flags = CrateDebugFlags::default();

        for arg in args {
            if arg == "--debug-all" {
                flags.enable_all();
                continue;
            }

            if let Some(crate_name) = arg.strip_prefix("--debug-") {
                flags.enable(crate_name);
            }
        }

        flags
    }

    /// Add the crates listed in a `FLEXCEM_DEBUG`-style value
    ///
    /// Accepts `all` or a comma-separated list of crate names.
    pub fn merge_env_value(&mut self, value: &str) {
        if value.trim() == "all" {
            self.enable_all();
            return;
        }
        for crate_name in value.split(',') {
            let crate_name = crate_name.trim();
            if !crate_name.is_empty() {
                self.enable(crate_name);
            }
        }
    }

    pub fn enable(&mut self, crate_name: &str) {
        self.enabled_crates.insert(crate_name.to_string());
    }

    fn enable_all(&mut self) {
        for crate_name in KNOWN_CRATES {
            self.enable(crate_name);
        }
    }

    /// Check if debug is enabled for a specific crate
    pub fn is_enabled(&self, crate_name: &str) -> bool {
        self.enabled_crates.contains(crate_name)
    }

    /// Check if debug is enabled for any crate
    pub fn any_enabled(&self) -> bool {
        !self.enabled_crates.is_empty()
    }

    /// Build an `EnvFilter` directive string
    ///
    /// Tracing targets use the Rust module path, so crate names are written
    /// with underscores. `default_level` applies to everything not listed.
    pub fn to_filter_string(&self, default_level: &str) -> String {
        let mut filters: Vec<String> = self
            .enabled_crates
            .iter()
            .map(|crate_name| format!("{}=debug", crate_name.replace('-', "_")))
            .collect();
        filters.push(default_level.to_string());
        filters.join(",")
    }
}

/// Parse debug flags from the process arguments and `FLEXCEM_DEBUG`
pub fn parse_debug_flags() -> CrateDebugFlags {
    let mut flags = CrateDebugFlags::from_args(env::args());

    if let Ok(env_var) = env::var("FLEXCEM_DEBUG") {
        flags.merge_env_value(&env_var);
    }

    flags
}

/// Generate help text for debug flags
pub fn debug_flags_help() -> String {
    format!(
        r#"Debug Flags:
  --debug-all                    Enable debug logging for all crates
  --debug-{{crate-name}}          Enable debug logging for specific crate

Available crates:
  {}

Environment Variable:
  FLEXCEM_DEBUG={{crate-name}}[,{{crate-name}}]  Enable debug for crates (comma-separated)
  FLEXCEM_DEBUG=all                               Enable debug for all crates
"#,
        KNOWN_CRATES.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_crate_flag() {
        let flags = CrateDebugFlags::from_args(vec![
            "cem_server".to_string(),
            "--debug-flexcem-session".to_string(),
        ]);
        assert!(flags.is_enabled("flexcem-session"));
        assert!(!flags.is_enabled("flexcem-protocol"));
    }

    #[test]
    fn test_debug_all() {
        let flags = CrateDebugFlags::from_args(vec!["--debug-all".to_string()]);
        for crate_name in KNOWN_CRATES {
            assert!(flags.is_enabled(crate_name), "{} should be enabled", crate_name);
        }
    }

    #[test]
    fn test_env_value_merge() {
        let mut flags = CrateDebugFlags::default();
        flags.merge_env_value("flexcem-protocol, flexcem-transports,");
        assert!(flags.is_enabled("flexcem-protocol"));
        assert!(flags.is_enabled("flexcem-transports"));
        assert!(!flags.is_enabled("flexcem-session"));
    }

    #[test]
    fn test_filter_string_uses_module_paths() {
        let flags = CrateDebugFlags::from_args(vec!["--debug-flexcem-session".to_string()]);
        assert_eq!(flags.to_filter_string("warn"), "flexcem_session=debug,warn");
    }

    #[test]
    fn test_filter_string_without_flags() {
        let flags = CrateDebugFlags::default();
        assert!(!flags.any_enabled());
        assert_eq!(flags.to_filter_string("info"), "info");
    }
}
