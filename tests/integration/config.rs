//! Configuration files on disk

use picvm::cache::MissCounting;
use picvm::util::config::{load_config, parse_config, save_config, ConfigError, PicvmConfig};
use tempfile::TempDir;

#[test]
fn test_missing_file_gives_defaults() {
    let dir = TempDir::new().unwrap();
    let config = load_config(dir.path().join("picvm.toml")).unwrap();
    assert_eq!(config, PicvmConfig::default());
    assert_eq!(config.cache.megamorphic_threshold, 3);
    assert_eq!(config.cache.miss_counting, MissCounting::All);
}

#[test]
fn test_save_then_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("picvm.toml");

    let mut config = PicvmConfig::default();
    config.cache.megamorphic_threshold = 6;
    config.cache.miss_counting = MissCounting::Saturated;
    config.cache.arena_regions_per_site = 0.5;
    config.engine.max_call_depth = 64;
    save_config(&config, &path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("miss_counting = \"saturated\""));
    assert_eq!(load_config(&path).unwrap(), config);
}

#[test]
fn test_partial_file_keeps_other_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("picvm.toml");
    std::fs::write(&path, "[cache]\nenabled = false\n").unwrap();

    let config = load_config(&path).unwrap();
    assert!(!config.cache.enabled);
    assert!(!config.cache.policy().enabled);
    assert_eq!(config.cache.megamorphic_threshold, 3);
    assert_eq!(config.engine, PicvmConfig::default().engine);
}

#[test]
fn test_bad_files_are_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("picvm.toml");
    std::fs::write(&path, "[cache\n").unwrap();
    assert!(matches!(load_config(&path), Err(ConfigError::ParseError(_))));

    let err = parse_config("[cache]\narena_regions_per_site = -1.0\n").unwrap_err();
    assert!(err.to_string().starts_with("Invalid config"));

    // a directory cannot be read as a file
    assert!(matches!(load_config(dir.path()), Err(ConfigError::IoError(_))));
}
