use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;
use vedrfolnir::{ExecutionType, SettingsHandle, ThrottlerError, ThrottlerSettings};

fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn load_explicit_path() {
    let file = config_file(
        r#"
        random_task_cache_timeout_secs = 5
        periodical_task_cache_timeout_secs = 120
        max_retry_count = 4
        min_operation_spacing_ms = 250
        remaining_reads_header = "x-remaining"
        "#,
    );

    let settings = ThrottlerSettings::load(Some(file.path())).unwrap();
    assert_eq!(
        settings.default_cache_timeout(ExecutionType::Random),
        Duration::from_secs(5)
    );
    assert_eq!(
        settings.default_cache_timeout(ExecutionType::Periodical),
        Duration::from_secs(120)
    );
    assert_eq!(settings.max_retry_count, 4);
    assert_eq!(settings.min_operation_spacing_duration(), Duration::from_millis(250));
    assert_eq!(settings.remaining_reads_header, "x-remaining");
}

#[test]
fn load_partial_file_keeps_defaults() {
    let file = config_file("aggressive_throttling_limit_percent = 80\n");

    let settings = ThrottlerSettings::load(Some(file.path())).unwrap();
    let defaults = ThrottlerSettings::default();
    assert_eq!(settings.aggressive_throttling_limit_percent, 80);
    assert_eq!(settings.scheduler_period_duration(), defaults.scheduler_period_duration());
    assert_eq!(settings.deferral_bucket_size, defaults.deferral_bucket_size);
    assert_eq!(settings.max_task_lifetime_duration(), Duration::from_secs(30 * 60));
}

#[test]
fn load_empty_file_is_default() {
    let file = config_file("");
    let settings = ThrottlerSettings::load(Some(file.path())).unwrap();
    assert_eq!(settings, ThrottlerSettings::default());
}

#[test]
fn load_missing_explicit_path_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("throttler.toml");

    let err = ThrottlerSettings::load(Some(&missing)).unwrap_err();
    match err {
        ThrottlerError::Configuration(msg) => assert!(msg.contains("not found"), "{msg}"),
        other => panic!("expected Configuration error, got {other:?}"),
    }
}

#[test]
fn load_malformed_file_names_the_path() {
    let file = config_file("max_retry_count = [1, 2]\n");

    let err = ThrottlerSettings::load(Some(file.path())).unwrap_err();
    match err {
        ThrottlerError::Configuration(msg) => {
            let file_name = file.path().file_name().unwrap().to_string_lossy();
            assert!(msg.contains(file_name.as_ref()), "{msg}");
        }
        other => panic!("expected Configuration error, got {other:?}"),
    }
}

#[test]
fn loaded_settings_can_be_swapped_at_runtime() {
    let handle = SettingsHandle::new(ThrottlerSettings::default());
    let file = config_file("max_retry_count = 2\nrefresh_on_cache_hit = true\n");

    handle.replace(ThrottlerSettings::load(Some(file.path())).unwrap());
    assert_eq!(handle.read(|s| s.max_retry_count), 2);
    assert!(handle.read(|s| s.refresh_on_cache_hit));
}

#[test]
fn load_rejects_zero_scheduler_period() {
    let file = config_file("scheduler_period_ms = 0\n");

    let err = ThrottlerSettings::load(Some(file.path())).unwrap_err();
    match err {
        ThrottlerError::Configuration(msg) => {
            assert!(msg.contains("scheduler_period_ms"), "{msg}");
            let file_name = file.path().file_name().unwrap().to_string_lossy();
            assert!(msg.contains(file_name.as_ref()), "{msg}");
        }
        other => panic!("expected Configuration error, got {other:?}"),
    }
}
