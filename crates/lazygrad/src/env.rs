use std::env;
use std::sync::OnceLock;

static LAZYGRAD_VERIFY_PROGRAMS: OnceLock<Option<bool>> = OnceLock::new();
static LAZYGRAD_TRACE_PROGRAMS: OnceLock<Option<bool>> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// An unset or blank variable means "no override".
fn flag_value(value: Option<&str>) -> Option<bool> {
    value
        .filter(|value| !value.trim().is_empty())
        .map(parse_bool)
}

fn read_flag(name: &str) -> Option<bool> {
    flag_value(env::var(name).ok().as_deref())
}

pub(crate) fn verify_programs_override() -> Option<bool> {
    *LAZYGRAD_VERIFY_PROGRAMS.get_or_init(|| read_flag("LAZYGRAD_VERIFY_PROGRAMS"))
}

pub(crate) fn trace_programs_override() -> Option<bool> {
    *LAZYGRAD_TRACE_PROGRAMS.get_or_init(|| read_flag("LAZYGRAD_TRACE_PROGRAMS"))
}

#[cfg(test)]
mod tests {
    use super::{flag_value, parse_bool};

    #[test]
    fn parses_common_truthy_spellings() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }

    #[test]
    fn blank_or_unset_values_do_not_override() {
        assert_eq!(flag_value(None), None);
        assert_eq!(flag_value(Some("  ")), None);
        assert_eq!(flag_value(Some("on")), Some(true));
        assert_eq!(flag_value(Some("0")), Some(false));
    }
}
