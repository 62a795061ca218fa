use bd_domain::config::Config;

#[test]
fn default_port_and_base_dir() {
    let config = Config::default();
    assert_eq!(config.server.port, 3456);
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.base_dir, "BROWSER-CLI");
}

#[test]
fn default_viewport_is_2560x1440_windowed() {
    let config = Config::default();
    assert_eq!(config.browser.viewport.width, 2560);
    assert_eq!(config.browser.viewport.height, 1440);
    assert!(!config.browser.headless);
}

#[test]
fn partial_toml_keeps_remaining_defaults() {
    let toml_str = r#"
[browser]
headless = true

[server]
port = 4000
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert!(config.browser.headless);
    assert_eq!(config.server.port, 4000);
    assert_eq!(config.browser.viewport.width, 2560);
    assert_eq!(config.capture.console_capacity, 100);
}

#[test]
fn plugin_defaults() {
    let config = Config::default();
    assert_eq!(config.plugins.invoke_timeout_sec, 30);
    assert_eq!(config.plugins.roots, vec!["plugins".to_string()]);
}

#[test]
fn load_missing_file_falls_back_to_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let config = Config::load(tmp.path()).unwrap();
    assert_eq!(config.server.port, 3456);
}

#[test]
fn load_reads_browserd_toml() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(
        tmp.path().join("browserd.toml"),
        "[server]\nport = 4010\n\n[browser]\nheadless = true\n",
    )
    .unwrap();
    let config = Config::load(tmp.path()).unwrap();
    assert_eq!(config.server.port, 4010);
    assert!(config.browser.headless);
}

#[test]
fn load_rejects_malformed_toml() {
    let tmp = tempfile::tempdir().unwrap();
    std::fs::write(tmp.path().join("browserd.toml"), "not = [valid").unwrap();
    assert!(Config::load(tmp.path()).is_err());
}

#[test]
fn zero_viewport_is_a_validation_error() {
    let toml_str = r#"
[browser.viewport]
width = 0
height = 1440
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    let issues = config.validate();
    assert!(issues
        .iter()
        .any(|i| i.field == "browser.viewport"));
}
