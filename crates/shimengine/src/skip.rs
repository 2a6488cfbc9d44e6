//! Skip policy (spec.md §6 "Skip policy"): statements that should execute as no-ops
//! regardless of which connection they arrived on.

use shimcore::config::Config;

/// First list: statements matching a startup pattern are no-ops (transaction control,
/// savepoints, vacuum, pragma, analyze of internal tables, attach/detach, load-extension, ICU
/// collation registration).
const STARTUP_PATTERNS: &[&str] = &[
    "BEGIN",
    "COMMIT",
    "ROLLBACK",
    "SAVEPOINT",
    "RELEASE",
    "VACUUM",
    "PRAGMA",
    "ANALYZE sqlite_",
    "ATTACH DATABASE",
    "ATTACH ",
    "DETACH DATABASE",
    "DETACH ",
    "SELECT load_extension",
    "icu_load_collation",
];

fn starts_with_ci(sql: &str, pattern: &str) -> bool {
    let trimmed = sql.trim_start();
    trimmed.len() >= pattern.len() && trimmed[..pattern.len()].eq_ignore_ascii_case(pattern)
}

fn contains_ci(sql: &str, pattern: &str) -> bool {
    sql.to_ascii_lowercase().contains(&pattern.to_ascii_lowercase())
}

/// True if `sql` matches a startup pattern and should be replaced with a placeholder
/// statement before even reaching the embedded prepare.
pub fn matches_startup_pattern(sql: &str) -> bool {
    STARTUP_PATTERNS.iter().any(|p| starts_with_ci(sql, p))
}

/// True if `sql` references internal metadata or an unsupported extension and should be
/// forced to no-op regardless of its shape.
pub fn matches_skip_substring(sql: &str, config: &Config) -> bool {
    config.skip_substrings().iter().any(|s| contains_ci(sql, s))
}

/// Either check trips the statement into no-op handling.
pub fn is_skip(sql: &str, config: &Config) -> bool {
    matches_startup_pattern(sql) || matches_skip_substring(sql, config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_is_a_startup_pattern() {
        assert!(matches_startup_pattern("BEGIN IMMEDIATE"));
        assert!(matches_startup_pattern("  begin transaction"));
    }

    #[test]
    fn pragma_is_a_startup_pattern() {
        assert!(matches_startup_pattern("PRAGMA journal_mode=WAL"));
    }

    #[test]
    fn ordinary_select_is_not_skipped() {
        let config = Config::default();
        assert!(!is_skip("SELECT * FROM users", &config));
    }

    #[test]
    fn sqlite_master_reference_is_skipped_via_substring_list() {
        let config = Config::default();
        assert!(is_skip("SELECT * FROM sqlite_master", &config));
    }

    #[test]
    fn fts_metadata_reference_is_skipped() {
        let config = Config::default();
        assert!(is_skip("SELECT * FROM fts4_metadata_titles_icu", &config));
    }
}
