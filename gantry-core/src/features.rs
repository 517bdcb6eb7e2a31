//! Feature flags
//!
//! Known flags with their defaults. Per-runner configuration may override any
//! of them; unknown flag names resolve to their configured value or false.

use std::collections::HashMap;

pub const SECRET_RESOLUTION_FAILS_IF_MISSING: &str = "FF_SECRET_RESOLUTION_FAILS_IF_MISSING";
pub const SKIP_NOOP_BUILD_STAGES: &str = "FF_SKIP_NOOP_BUILD_STAGES";
pub const USE_DIRECT_DOWNLOAD: &str = "FF_USE_DIRECT_DOWNLOAD";
pub const NON_FATAL_SETUP_FAILURES: &str = "FF_NON_FATAL_SETUP_FAILURES";

/// A known feature flag
#[derive(Debug, Clone, Copy)]
pub struct FeatureFlag {
    pub name: &'static str,
    pub default_value: bool,
    pub deprecated: bool,
    pub description: &'static str,
}

// REMEMBER to update the documentation after adding or removing a flag.
static FLAGS: &[FeatureFlag] = &[
    FeatureFlag {
        name: SECRET_RESOLUTION_FAILS_IF_MISSING,
        default_value: false,
        deprecated: false,
        description: "When set to true, a declared secret that cannot be found by its \
                      provider fails the job instead of being skipped",
    },
    FeatureFlag {
        name: SKIP_NOOP_BUILD_STAGES,
        default_value: true,
        deprecated: false,
        description: "When set to false all build stages are executed even if running \
                      them has no effect",
    },
    FeatureFlag {
        name: USE_DIRECT_DOWNLOAD,
        default_value: true,
        deprecated: false,
        description: "When set to true the runner tries to direct-download artifacts \
                      on the first attempt instead of proxying through the coordinator",
    },
    FeatureFlag {
        name: NON_FATAL_SETUP_FAILURES,
        default_value: false,
        deprecated: false,
        description: "When set to true, failures in the get-sources, cache-restore and \
                      artifact-download stages are reported as script failures instead \
                      of system failures",
    },
];

/// All known flags.
pub fn flags() -> &'static [FeatureFlag] {
    FLAGS
}

/// Default value of a flag; false for unknown names.
pub fn default_value(name: &str) -> bool {
    FLAGS
        .iter()
        .find(|f| f.name == name)
        .map(|f| f.default_value)
        .unwrap_or(false)
}

/// Resolve a flag against overrides, falling back to the default.
pub fn is_on(overrides: &HashMap<String, bool>, name: &str) -> bool {
    overrides
        .get(name)
        .copied()
        .unwrap_or_else(|| default_value(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert!(!default_value(SECRET_RESOLUTION_FAILS_IF_MISSING));
        assert!(default_value(SKIP_NOOP_BUILD_STAGES));
        assert!(default_value(USE_DIRECT_DOWNLOAD));
        assert!(!default_value("FF_UNKNOWN"));
    }

    #[test]
    fn test_override_wins() {
        let mut overrides = HashMap::new();
        overrides.insert(SKIP_NOOP_BUILD_STAGES.to_string(), false);
        assert!(!is_on(&overrides, SKIP_NOOP_BUILD_STAGES));
        assert!(is_on(&HashMap::new(), SKIP_NOOP_BUILD_STAGES));
    }
}
