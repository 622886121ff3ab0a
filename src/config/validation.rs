//! Config key checking: unknown keys are reported with "did you mean?"
//! suggestions before serde sees the file.
//!
//! Serde silently ignores unknown fields, so a misspelt `anomaly_treshold`
//! would otherwise leave the default in place without a trace. The raw TOML
//! is walked first and every dotted key path compared against the known set.
//! Unknown keys only ever produce warnings.

use std::collections::HashSet;

/// A non-fatal config warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    /// Dotted key path, e.g. `detector.buff_size`
    pub field: String,
    pub message: String,
    pub suggestion: Option<String>,
}

impl std::fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)?;
        match &self.suggestion {
            Some(s) => write!(f, " (did you mean '{s}'?)"),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Known Config Keys
// ============================================================================

/// Every valid dotted key path of `MonitorConfig`.
///
/// Kept by hand in step with `monitor_config.rs`.
pub fn known_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        // [detector]
        "detector",
        "detector.buff_size",
        "detector.window_size",
        "detector.anomaly_threshold",
        "detector.max_median_frequency",
        "detector.save_all",
        "detector.dedupe_anomalies",
        "detector.timestamp_source",
        "detector.start_string",
        "detector.ignore_header_lines",
        // [storage]
        "storage",
        "storage.root_dir",
        "storage.min_free_mb",
        "storage.dispatch_capacity",
        // [user]
        "user",
        "user.name",
        "user.latitude",
        "user.longitude",
        // [remote]
        "remote",
        "remote.endpoint",
        "remote.user_name",
        "remote.password",
        "remote.initial_backoff_secs",
        "remote.max_backoff_secs",
        "remote.max_attempts",
        "remote.jitter",
        "remote.queue_capacity",
        "remote.queue_file",
        "remote.timeout_secs",
        // [logging]
        "logging",
        "logging.level",
        "logging.progress_interval",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// Key Walking
// ============================================================================

/// Collect the dotted path of every key in a TOML document, tables included.
///
/// `{ a = { b = 1 } }` yields `["a", "a.b"]`.
pub fn walk_toml_keys(value: &toml::Value, prefix: &str) -> Vec<String> {
    let Some(table) = value.as_table() else {
        return Vec::new();
    };
    let mut keys = Vec::with_capacity(table.len());
    for (key, child) in table {
        let path = match prefix {
            "" => key.clone(),
            p => format!("{p}.{key}"),
        };
        if child.is_table() {
            let nested = walk_toml_keys(child, &path);
            keys.push(path);
            keys.extend(nested);
        } else {
            keys.push(path);
        }
    }
    keys
}

// ============================================================================
// Suggestions
// ============================================================================

/// Maximum edit distance for a known key to be offered as a correction.
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Levenshtein edit distance, counted in characters.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.iter().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = diagonal + usize::from(ca != cb);
            diagonal = row[j + 1];
            row[j + 1] = substitution.min(row[j] + 1).min(row[j + 1] + 1);
        }
    }

    row[b.len()]
}

/// Closest known key within [`MAX_SUGGESTION_DISTANCE`] edits, if any.
pub fn suggest_correction(unknown: &str, known: &HashSet<&str>) -> Option<String> {
    known
        .iter()
        .map(|k| (edit_distance(unknown, k), *k))
        .filter(|(d, _)| *d <= MAX_SUGGESTION_DISTANCE)
        // tie-break on the key itself so the answer does not depend on hash order
        .min()
        .map(|(_, k)| k.to_string())
}

// ============================================================================
// Entry Point
// ============================================================================

/// Warnings for every unknown key in `raw_toml`.
///
/// Syntax errors yield no warnings here; serde reports them afterwards.
pub fn validate_unknown_keys(raw_toml: &str) -> Vec<ValidationWarning> {
    let Ok(value) = raw_toml.parse::<toml::Value>() else {
        return Vec::new();
    };

    let known = known_config_keys();
    walk_toml_keys(&value, "")
        .into_iter()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| ValidationWarning {
            suggestion: suggest_correction(&key, &known),
            message: format!("Unknown config key '{key}'"),
            field: key,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_distance() {
        assert_eq!(edit_distance("window", "window"), 0);
        assert_eq!(edit_distance("treshold", "threshold"), 1);
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("abc", ""), 3);
        assert_eq!(edit_distance("kitten", "sitting"), 3);
    }

    #[test]
    fn test_walk_nested_tables() {
        let value: toml::Value = r#"
            top = 1
            [detector]
            buff_size = 10
        "#
        .parse()
        .unwrap();
        let keys = walk_toml_keys(&value, "");
        assert!(keys.contains(&"top".to_string()));
        assert!(keys.contains(&"detector".to_string()));
        assert!(keys.contains(&"detector.buff_size".to_string()));
    }

    #[test]
    fn test_typo_gets_suggestion() {
        let warnings = validate_unknown_keys(
            r#"
[detector]
anomaly_treshold = 3.0
"#,
        );
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field, "detector.anomaly_treshold");
        assert_eq!(
            warnings[0].suggestion.as_deref(),
            Some("detector.anomaly_threshold")
        );
        assert!(warnings[0].to_string().contains("did you mean"));
    }

    #[test]
    fn test_valid_file_has_no_warnings() {
        let warnings = validate_unknown_keys(
            r#"
[detector]
buff_size = 10
window_size = 3

[user]
name = "alice"
latitude = 52.2
longitude = 0.12

[remote]
endpoint = "https://dav.example.org/muon"
"#,
        );
        assert!(warnings.is_empty(), "{warnings:?}");
    }

    #[test]
    fn test_unrelated_key_has_no_suggestion() {
        let warnings = validate_unknown_keys("completely_unrelated_garbage = 1");
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].suggestion.is_none());
    }

    #[test]
    fn test_syntax_error_yields_nothing() {
        assert!(validate_unknown_keys("[detector").is_empty());
    }
}
