//! Config loading, TOML parsing, and env var override tests.

use std::io::Write;

use fieldpipe::Config;

#[test]
fn missing_files_fall_back_to_defaults() {
    let config = Config::from_file("/nonexistent/config.toml").unwrap();
    assert!(config.optimizer.enabled);
    assert!(config.optimizer.enable_common_subexpression);
    assert!(!config.optimizer.verbose_kernel_merging);
}

#[test]
fn toml_file_overrides_defaults() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[optimizer]
verbose_optimizer = true
project_frame_merging = false
enable_reshape_removal = false

[logging]
level = "debug"
"#
    )
    .unwrap();

    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    assert!(config.optimizer.verbose_optimizer);
    assert!(!config.optimizer.project_frame_merging);
    assert!(!config.optimizer.enable_reshape_removal);
    // Untouched flags keep their defaults
    assert!(config.optimizer.back_project_frame_merging);
    assert!(config.optimizer.enabled);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn partial_sections_are_accepted() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[optimizer]\ntiled_convolve_enable = true").unwrap();

    let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
    assert!(config.optimizer.tiled_convolve_enable);
    assert_eq!(config.logging.format, "text");
}

#[test]
fn logging_initializes_from_config() {
    let config = Config::default();
    fieldpipe::config::init_logging(&config.logging);
    // A second call must not panic
    fieldpipe::config::init_logging(&config.logging);
}

#[test]
fn config_round_trips_through_toml() {
    let config = Config::default();
    let rendered = toml::to_string(&config).unwrap();
    let parsed: Config = toml::from_str(&rendered).unwrap();
    assert_eq!(
        parsed.optimizer.filter_adjoint_merging,
        config.optimizer.filter_adjoint_merging
    );
    assert_eq!(parsed.logging.level, config.logging.level);
}
