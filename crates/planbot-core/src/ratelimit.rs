//! Rate-limit classification for driver call results.
//!
//! Rate-limited invocations fail before meaningful tokens are consumed, so
//! besides the provider's own wording we treat a cheap, short failure as a
//! probable rate limit.

use crate::driver::CallResult;

/// Error substrings (matched case-insensitively) that identify a rate limit.
const RATE_LIMIT_MARKERS: &[&str] = &["hit your limit", "usage limit", "rate limit"];

/// Cost below which a failure looks like it never ran.
const CHEAP_CALL_USD: f64 = 0.01;

/// Output length below which a failure looks like it never ran.
const SHORT_OUTPUT_LEN: usize = 500;

/// Classify a driver call result as rate-limited or not.
pub fn is_rate_limit(result: &CallResult) -> bool {
    if let Some(error) = &result.error {
        let lower = error.to_lowercase();
        if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
            return true;
        }
    }

    !result.success
        && result.error.is_some()
        && result.cost_usd.unwrap_or(0.0) < CHEAP_CALL_USD
        && result.output_len() < SHORT_OUTPUT_LEN
}

/// Whether a fallback-model retry is worth attempting: only when the current
/// model differs from the fallback. `None` counts as distinct from any
/// named model.
pub fn should_fallback(current: Option<&str>, fallback: Option<&str>) -> bool {
    match (current, fallback) {
        (Some(c), Some(f)) => c != f,
        (None, None) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(error: &str, cost_usd: Option<f64>, output: Option<&str>) -> CallResult {
        CallResult {
            success: false,
            output: output.map(str::to_string),
            session_id: None,
            cost_usd,
            error: Some(error.to_string()),
        }
    }

    #[test]
    fn marker_substrings_classify_regardless_of_cost() {
        for marker in ["You hit your limit", "USAGE LIMIT reached", "Rate Limit exceeded"] {
            let result = failed(marker, Some(3.50), Some(&"x".repeat(2000)));
            assert!(is_rate_limit(&result), "{marker} should classify");
        }
    }

    #[test]
    fn cheap_short_failure_is_heuristic_rate_limit() {
        let result = failed("connection reset", Some(0.001), Some("partial"));
        assert!(is_rate_limit(&result));
    }

    #[test]
    fn missing_cost_counts_as_zero() {
        let result = failed("overloaded", None, None);
        assert!(is_rate_limit(&result));
    }

    #[test]
    fn expensive_failure_is_not_rate_limit() {
        let result = failed("compile error in worker", Some(0.75), Some("out"));
        assert!(!is_rate_limit(&result));
    }

    #[test]
    fn long_output_failure_is_not_rate_limit() {
        let result = failed("tests failed", Some(0.0), Some(&"y".repeat(600)));
        assert!(!is_rate_limit(&result));
    }

    #[test]
    fn success_is_never_rate_limit() {
        let result = CallResult {
            success: true,
            output: Some("done".into()),
            session_id: None,
            cost_usd: Some(0.0),
            error: None,
        };
        assert!(!is_rate_limit(&result));
    }

    #[test]
    fn failure_without_error_text_is_not_rate_limit() {
        let result = CallResult {
            success: false,
            output: None,
            session_id: None,
            cost_usd: None,
            error: None,
        };
        assert!(!is_rate_limit(&result));
    }

    #[test]
    fn fallback_only_when_models_differ() {
        assert!(should_fallback(Some("opus"), Some("sonnet")));
        assert!(!should_fallback(Some("sonnet"), Some("sonnet")));
        // Case-sensitive on purpose.
        assert!(should_fallback(Some("Sonnet"), Some("sonnet")));
        assert!(should_fallback(None, Some("sonnet")));
        assert!(should_fallback(Some("opus"), None));
        assert!(!should_fallback(None, None));
    }
}
