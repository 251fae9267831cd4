use crate::env;

/// Execution options for a [`Runtime`](super::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Check SSA def-before-use on every lowered program before it runs.
    pub verify_programs: bool,
    /// Dump each lowered program as JSON at `trace` level.
    pub trace_programs: bool,
    /// Name of the entry function in generated programs.
    pub entry_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            verify_programs: cfg!(debug_assertions),
            trace_programs: false,
            entry_name: "main".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `LAZYGRAD_VERIFY_PROGRAMS` and `LAZYGRAD_TRACE_PROGRAMS`.
    pub fn from_env() -> Self {
        Self::default().with_overrides(
            env::verify_programs_override(),
            env::trace_programs_override(),
        )
    }

    fn with_overrides(mut self, verify: Option<bool>, trace: Option<bool>) -> Self {
        if let Some(verify) = verify {
            self.verify_programs = verify;
        }
        if let Some(trace) = trace {
            self.trace_programs = trace;
        }
        self
    }

    pub fn with_verify_programs(mut self, enabled: bool) -> Self {
        self.verify_programs = enabled;
        self
    }

    pub fn with_trace_programs(mut self, enabled: bool) -> Self {
        self.trace_programs = enabled;
        self
    }

    pub fn with_entry_name(mut self, name: impl Into<String>) -> Self {
        self.entry_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_setters_override_defaults() {
        let config = RuntimeConfig::new()
            .with_verify_programs(true)
            .with_trace_programs(true)
            .with_entry_name("forward");
        assert!(config.verify_programs);
        assert!(config.trace_programs);
        assert_eq!(config.entry_name, "forward");
        assert_eq!(RuntimeConfig::default().entry_name, "main");
    }

    #[test]
    fn overrides_replace_only_the_flags_they_carry() {
        let defaults = RuntimeConfig::default();
        assert_eq!(defaults.clone().with_overrides(None, None), defaults);

        let config = defaults.clone().with_overrides(Some(!defaults.verify_programs), Some(true));
        assert_eq!(config.verify_programs, !defaults.verify_programs);
        assert!(config.trace_programs);
        assert_eq!(config.entry_name, "main");

        let config = defaults.clone().with_overrides(None, Some(false));
        assert_eq!(config.verify_programs, defaults.verify_programs);
        assert!(!config.trace_programs);
    }

    #[test]
    fn from_env_matches_the_process_environment() {
        let expected = RuntimeConfig::default().with_overrides(
            env::verify_programs_override(),
            env::trace_programs_override(),
        );
        assert_eq!(RuntimeConfig::from_env(), expected);
        if std::env::var_os("LAZYGRAD_VERIFY_PROGRAMS").is_none()
            && std::env::var_os("LAZYGRAD_TRACE_PROGRAMS").is_none()
        {
            assert_eq!(RuntimeConfig::from_env(), RuntimeConfig::default());
        }
    }
}
