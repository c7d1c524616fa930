/// Centralized environment-variable parsing helpers.
///
/// Every `FBMIRROR_*` toggle and tuning knob goes through these helpers so
/// the truthy/falsey parsing logic lives in exactly one place.

/// Returns `true` when the environment variable is set to a truthy value
/// (`1`, `true`, `yes`, or `on`, case-insensitive, trimmed).
#[inline]
pub(crate) fn env_var_truthy(var_name: &str) -> bool {
    std::env::var(var_name)
        .map(|raw| is_truthy(&raw))
        .unwrap_or(false)
}

/// Tri-state variant of [`env_var_truthy`]: `None` when unset, so callers can
/// keep their own default.
#[inline]
pub(crate) fn env_var_bool(var_name: &str) -> Option<bool> {
    std::env::var(var_name).ok().map(|raw| is_truthy(&raw))
}

fn is_truthy(raw: &str) -> bool {
    let normalized = raw.trim().to_ascii_lowercase();
    normalized == "1" || normalized == "true" || normalized == "yes" || normalized == "on"
}

/// Parses the environment variable as a `u64`, returning `Some` only when
/// the value is a valid positive (> 0) integer.
#[inline]
pub(crate) fn env_var_positive_u64(var_name: &str) -> Option<u64> {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

/// Same as [`env_var_positive_u64`] for fractional knobs.
#[inline]
pub(crate) fn env_var_positive_f64(var_name: &str) -> Option<f64> {
    std::env::var(var_name)
        .ok()
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
}

/// Reads the environment variable as a lowercase keyword. Unset or empty
/// values yield `None`; matching against the accepted set is up to the caller.
#[inline]
pub(crate) fn env_var_choice(var_name: &str) -> Option<String> {
    std::env::var(var_name)
        .ok()
        .map(|raw| raw.trim().to_ascii_lowercase().replace('_', "-"))
        .filter(|value| !value.is_empty())
}

/// Declares a cached boolean feature flag backed by a `OnceLock<bool>`.
///
/// # Variants
///
/// `enabled_unless(fn_name, "ENV_VAR")` returns `true` unless the env var
/// is truthy (the feature is on by default, disabled by the env var).
///
/// `enabled_when(fn_name, "ENV_VAR")` returns `true` only when the env var
/// is truthy (the feature is off by default, enabled by the env var).
macro_rules! define_env_flag {
    (enabled_unless($fn_name:ident, $var:expr)) => {
        #[inline]
        fn $fn_name() -> bool {
            static VALUE: ::std::sync::OnceLock<bool> = ::std::sync::OnceLock::new();
            *VALUE.get_or_init(|| !$crate::env_config::env_var_truthy($var))
        }
    };
    (enabled_when($fn_name:ident, $var:expr)) => {
        #[inline]
        fn $fn_name() -> bool {
            static VALUE: ::std::sync::OnceLock<bool> = ::std::sync::OnceLock::new();
            *VALUE.get_or_init(|| $crate::env_config::env_var_truthy($var))
        }
    };
}

pub(crate) use define_env_flag;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_parsing_accepts_common_spellings() {
        for raw in ["1", "true", " YES ", "On"] {
            assert!(is_truthy(raw), "{raw:?} should be truthy");
        }
        for raw in ["0", "false", "off", ""] {
            assert!(!is_truthy(raw), "{raw:?} should be falsey");
        }
    }

    #[test]
    fn unset_variables_fall_back() {
        let var = "FBMIRROR_TEST_SURELY_UNSET_9F2C";
        assert!(!env_var_truthy(var));
        assert_eq!(env_var_bool(var), None);
        assert_eq!(env_var_positive_u64(var), None);
        assert_eq!(env_var_positive_f64(var), None);
        assert_eq!(env_var_choice(var), None);
    }
}
