use devcaddy::Settings;
use std::env;
use tempfile::TempDir;

#[test]
fn test_env_overrides_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("devcaddy.json");
    std::fs::write(&path, r#"{ "debounce_ms": 50, "logging": { "default": "warn" } }"#).unwrap();

    unsafe {
        // Double underscore separates nested levels
        env::set_var("DEVCADDY_DEBOUNCE_MS", "25");
        env::set_var("DEVCADDY_LOGGING__DEFAULT", "debug");
    }

    let settings = Settings::load_from(&path);

    unsafe {
        env::remove_var("DEVCADDY_DEBOUNCE_MS");
        env::remove_var("DEVCADDY_LOGGING__DEFAULT");
    }

    let settings = settings.unwrap();
    assert_eq!(settings.debounce_ms, 25);
    assert_eq!(settings.logging.default, "debug");
}
