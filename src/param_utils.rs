use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstitutionReason {
    NonFinite,
    BelowMinimum,
    AboveMaximum,
    Rounded,
    UnknownCode,
}

/// A raw parameter value that was replaced while building typed config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSubstitution {
    pub key: String,
    pub raw: f64,
    pub applied: f64,
    pub reason: SubstitutionReason,
}

/// Clamp a raw parameter value to bounds with a finite check
pub fn clamp_f64(value: f64, default: f64, min: f64, max: f64) -> f64 {
    if !value.is_finite() {
        return default;
    }
    value.clamp(min, max)
}

pub fn coerce_binary_param(value: f64, default: f64) -> f64 {
    if !value.is_finite() {
        return default;
    }

    if value >= 0.5 {
        1.0
    } else {
        0.0
    }
}

/// Get a finite parameter value, returns None if not found or not finite
pub fn finite_param(params: &HashMap<String, f64>, key: &str) -> Option<f64> {
    params.get(key).copied().filter(|v| v.is_finite())
}

/// Get a parameter rounded to an i32, returns None if not found or not finite
pub fn rounded_param(params: &HashMap<String, f64>, key: &str) -> Option<i32> {
    finite_param(params, key).map(|v| v.round() as i32)
}

/// Reads typed values out of a loose parameter map and remembers every value it
/// had to replace.
pub struct ParamReader<'a> {
    params: &'a HashMap<String, f64>,
    substitutions: Vec<ParamSubstitution>,
}

impl<'a> ParamReader<'a> {
    pub fn new(params: &'a HashMap<String, f64>) -> Self {
        Self {
            params,
            substitutions: Vec::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    fn record(&mut self, key: &str, raw: f64, applied: f64, reason: SubstitutionReason) {
        self.substitutions.push(ParamSubstitution {
            key: key.to_string(),
            raw,
            applied,
            reason,
        });
    }

    pub fn f64_clamped(&mut self, key: &str, default: f64, min: f64, max: f64) -> f64 {
        let Some(raw) = self.params.get(key).copied() else {
            return default;
        };
        if !raw.is_finite() {
            self.record(key, raw, default, SubstitutionReason::NonFinite);
            return default;
        }
        let applied = clamp_f64(raw, default, min, max);
        if applied > raw {
            self.record(key, raw, applied, SubstitutionReason::BelowMinimum);
        } else if applied < raw {
            self.record(key, raw, applied, SubstitutionReason::AboveMaximum);
        }
        applied
    }

    /// Absent keys yield `None`; present keys are clamped like `f64_clamped`.
    pub fn optional_f64_clamped(&mut self, key: &str, min: f64, max: f64) -> Option<f64> {
        let raw = self.params.get(key).copied()?;
        if !raw.is_finite() {
            self.record(key, raw, f64::NAN, SubstitutionReason::NonFinite);
            return None;
        }
        Some(self.f64_clamped(key, raw, min, max))
    }

    pub fn usize_clamped(&mut self, key: &str, default: usize, min: usize, max: usize) -> usize {
        let Some(raw) = self.params.get(key).copied() else {
            return default;
        };
        if !raw.is_finite() {
            self.record(key, raw, default as f64, SubstitutionReason::NonFinite);
            return default;
        }
        let rounded = raw.round();
        let applied = rounded.clamp(min as f64, max as f64);
        if applied > rounded {
            self.record(key, raw, applied, SubstitutionReason::BelowMinimum);
        } else if applied < rounded {
            self.record(key, raw, applied, SubstitutionReason::AboveMaximum);
        } else if (rounded - raw).abs() > f64::EPSILON {
            self.record(key, raw, applied, SubstitutionReason::Rounded);
        }
        applied as usize
    }

    pub fn flag(&mut self, key: &str, default: bool) -> bool {
        let fallback = if default { 1.0 } else { 0.0 };
        let Some(raw) = self.params.get(key).copied() else {
            return default;
        };
        let applied = coerce_binary_param(raw, fallback);
        if !raw.is_finite() {
            self.record(key, raw, applied, SubstitutionReason::NonFinite);
        } else if applied != raw {
            self.record(key, raw, applied, SubstitutionReason::Rounded);
        }
        applied >= 0.5
    }

    /// Integer code for enum-like parameters; codes outside `valid` fall back to `default`.
    pub fn code(&mut self, key: &str, default: i32, valid: &[i32]) -> i32 {
        let Some(raw) = self.params.get(key).copied() else {
            return default;
        };
        match rounded_param(self.params, key) {
            Some(code) if valid.contains(&code) => code,
            Some(_) => {
                self.record(key, raw, default as f64, SubstitutionReason::UnknownCode);
                default
            }
            None => {
                self.record(key, raw, default as f64, SubstitutionReason::NonFinite);
                default
            }
        }
    }

    pub fn into_substitutions(self) -> Vec<ParamSubstitution> {
        self.substitutions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn clamped_values_are_recorded() {
        let raw = params(&[("a", 5.0), ("b", -1.0), ("c", 0.5)]);
        let mut reader = ParamReader::new(&raw);
        assert_eq!(reader.f64_clamped("a", 0.1, 0.0, 1.0), 1.0);
        assert_eq!(reader.f64_clamped("b", 0.1, 0.0, 1.0), 0.0);
        assert_eq!(reader.f64_clamped("c", 0.1, 0.0, 1.0), 0.5);
        assert_eq!(reader.f64_clamped("missing", 0.1, 0.0, 1.0), 0.1);

        let subs = reader.into_substitutions();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].reason, SubstitutionReason::AboveMaximum);
        assert_eq!(subs[1].reason, SubstitutionReason::BelowMinimum);
    }

    #[test]
    fn non_finite_values_fall_back_to_default() {
        let raw = params(&[("a", f64::NAN), ("n", f64::INFINITY)]);
        let mut reader = ParamReader::new(&raw);
        assert_eq!(reader.f64_clamped("a", 0.3, 0.0, 1.0), 0.3);
        assert_eq!(reader.usize_clamped("n", 7, 1, 10), 7);
        let subs = reader.into_substitutions();
        assert!(subs
            .iter()
            .all(|s| s.reason == SubstitutionReason::NonFinite));
    }

    #[test]
    fn usize_rounding_is_recorded() {
        let raw = params(&[("p", 19.6)]);
        let mut reader = ParamReader::new(&raw);
        assert_eq!(reader.usize_clamped("p", 20, 10, 250), 20);
        assert_eq!(
            reader.into_substitutions()[0].reason,
            SubstitutionReason::Rounded
        );
    }

    #[test]
    fn flags_and_codes() {
        let raw = params(&[("f", 0.7), ("g", 0.0), ("mode", 7.0)]);
        let mut reader = ParamReader::new(&raw);
        assert!(reader.flag("f", false));
        assert!(!reader.flag("g", true));
        assert!(reader.flag("absent", true));
        assert_eq!(reader.code("mode", 0, &[0, 1, 2]), 0);
        let subs = reader.into_substitutions();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[1].reason, SubstitutionReason::UnknownCode);
    }

    #[test]
    fn coerce_binary_param_thresholds_at_half() {
        assert_eq!(coerce_binary_param(0.49, 1.0), 0.0);
        assert_eq!(coerce_binary_param(0.5, 0.0), 1.0);
        assert_eq!(coerce_binary_param(f64::NAN, 1.0), 1.0);
    }
}
