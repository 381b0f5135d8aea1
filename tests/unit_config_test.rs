// tests/unit_config_test.rs

#[cfg(test)]
mod unit_config_test {
    use pageveil::config::ReportingConfig;
    use pageveil::core::scheduler::JobConfig;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ReportingConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.allowed_country_codes.contains(&"de".to_string()));
    }

    #[test]
    fn test_load_from_toml() {
        let file = write_config(
            r#"
            ALLOWED_COUNTRY_CODES = ["de", "fr"]
            PATTERNS_URL = "https://rules.example.org/patterns.json"
            CONFIG_URL = "https://rules.example.org/config.json"

            [browser]
            browser = "Firefox"
            version = "122"
            os = "Linux"
            language = "en-US"

            [jobs.send-message]
            priority = 42
            cooldownInMs = 5000
            "#,
        );
        let config = ReportingConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.allowed_country_codes, vec!["de", "fr"]);
        assert_eq!(config.browser.browser, "Firefox");

        let resolved =
            config.job_config_for("send-message", JobConfig::default());
        assert_eq!(resolved.priority, 42);
        assert_eq!(resolved.cooldown_in_ms, 5000);
        // Untouched knobs keep their defaults.
        assert_eq!(resolved.max_jobs_total, JobConfig::default().max_jobs_total);
    }

    #[test]
    fn test_unknown_top_level_keys_are_rejected() {
        let file = write_config(r#"SURPRISE_KNOB = true"#);
        assert!(ReportingConfig::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_unknown_job_config_keys_are_rejected() {
        let file = write_config(
            r#"
            [jobs.send-message]
            priority = 1
            retryForever = true
            "#,
        );
        assert!(ReportingConfig::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_non_https_pattern_url_is_rejected() {
        let file = write_config(r#"PATTERNS_URL = "http://insecure.example.org/p.json""#);
        assert!(ReportingConfig::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_empty_urls_disable_downloads() {
        let file = write_config(
            r#"
            PATTERNS_URL = ""
            CONFIG_URL = ""
            "#,
        );
        assert!(ReportingConfig::from_file(file.path().to_str().unwrap()).is_ok());
    }
}
