use super::*;
use serial_test::serial;
use std::io::Write;

fn write_yaml(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
    let path = dir.path().join(format!("{name}.yaml"));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    // Sources are added without the extension, as with the built-in paths
    dir.path().join(name).to_string_lossy().into_owned()
}

fn clear_env() {
    std::env::remove_var(CONFIG_FILE_ENV);
    std::env::remove_var("HR__SERVER__PORT");
    std::env::remove_var("HR__LOGGING__JSON_FORMAT");
}

mod load_config_tests {
    use super::*;

    /// Verify that missing optional files yield the defaults.
    #[test]
    #[serial]
    fn test_missing_files_use_defaults() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("absent").to_string_lossy().into_owned();

        let config = load_config(&[&absent]).unwrap();

        assert_eq!(config.server.port, 8080);
        assert!(config.tenants.is_empty());
    }

    /// Verify that later files override earlier ones field by field.
    #[test]
    #[serial]
    fn test_later_file_overrides_earlier() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let system = write_yaml(
            &dir,
            "system",
            "server:\n  port: 7000\n  host: 127.0.0.1\nlogging:\n  level: debug\n",
        );
        let local = write_yaml(&dir, "local", "server:\n  port: 7001\n");

        let config = load_config(&[&system, &local]).unwrap();

        assert_eq!(config.server.port, 7001);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.logging.level, "debug");
    }

    /// Verify that environment variables win over files.
    #[test]
    #[serial]
    fn test_environment_overrides_files() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let local = write_yaml(&dir, "local", "server:\n  port: 7001\n");
        std::env::set_var("HR__SERVER__PORT", "9191");
        std::env::set_var("HR__LOGGING__JSON_FORMAT", "true");

        let config = load_config(&[&local]);
        clear_env();

        let config = config.unwrap();
        assert_eq!(config.server.port, 9191);
        assert!(config.logging.json_format);
    }

    /// Verify that the explicit file must exist once named.
    #[test]
    #[serial]
    fn test_explicit_file_is_required() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope").to_string_lossy().into_owned();
        std::env::set_var(CONFIG_FILE_ENV, &missing);

        let result = load_config(&[]);
        clear_env();

        assert!(result.is_err());
    }

    /// Verify that providers and tenants load from the explicit file.
    #[test]
    #[serial]
    fn test_explicit_file_with_providers_and_tenants() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let explicit = write_yaml(
            &dir,
            "explicit",
            r#"
providers:
  telephony:
    secret:
      type: literal
      value: tel-secret
tenants:
  - id: acme-dental
    phone_numbers: ["+15559876543"]
"#,
        );
        std::env::set_var(CONFIG_FILE_ENV, &explicit);

        let result = load_config(&[]);
        clear_env();

        let config = result.unwrap();
        assert!(config.providers.telephony.is_some());
        assert_eq!(config.tenants.len(), 1);
        assert!(config.validate().is_ok());
    }

    /// Verify that a value of the wrong type is a hard error.
    #[test]
    #[serial]
    fn test_malformed_value_fails() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let bad = write_yaml(&dir, "bad", "server:\n  port: not-a-number\n");

        assert!(load_config(&[&bad]).is_err());
    }
}

mod logging_tests {
    use super::*;

    #[test]
    fn test_default_filter_uses_configured_level() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            json_format: false,
        };

        let filter = default_filter(&logging);

        assert!(filter.contains("hook_reconciler_api=debug"));
        assert!(filter.contains("hook_reconciler_core=debug"));
        assert!(EnvFilter::try_new(&filter).is_ok());
    }
}
