//! Redirect policy (spec.md §6 "Redirect policy"): a database is redirected iff its
//! filesystem path contains one of the configured substrings.

use shimcore::config::Config;

pub fn should_redirect(path: &str, config: &Config) -> bool {
    config.redirect_patterns.iter().any(|pattern| path.contains(pattern.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pattern_matches() {
        let config = Config::default();
        assert!(should_redirect("/var/data/app__redirect__.db", &config));
    }

    #[test]
    fn unrelated_path_does_not_redirect() {
        let config = Config::default();
        assert!(!should_redirect("/var/data/cache.db", &config));
    }

    #[test]
    fn custom_pattern_list_is_honored() {
        let config = Config { redirect_patterns: vec!["tenant_".to_string()], ..Config::default() };
        assert!(should_redirect("/data/tenant_42.db", &config));
        assert!(!should_redirect("/data/local.db", &config));
    }
}
