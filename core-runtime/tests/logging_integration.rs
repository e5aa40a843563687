//! Integration tests for logging system

use core_runtime::logging::{init_logging, strip_path, LogFormat, LogLevel, LoggingConfig};
use core_runtime::Error;

#[test]
fn test_second_initialization_is_rejected() {
    // Only this test installs a global subscriber in this binary
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn);

    init_logging(config.clone()).expect("first initialization succeeds");
    tracing::warn!(repository = "demo", "logging initialized");

    let err = init_logging(config).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_path_stripping() {
    assert_eq!(strip_path("/srv/repos/backend/src/handlers/auth.rs"), "auth.rs");
    assert_eq!(strip_path("D:\\work\\repo\\build.gradle"), "build.gradle");
}

#[test]
fn test_config_chaining() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Pretty)
        .with_level(LogLevel::Trace)
        .with_filter("core_sync=trace,sqlx=warn")
        .with_thread_info(true);

    assert_eq!(config.format, LogFormat::Pretty);
    assert_eq!(config.level, LogLevel::Trace);
    assert_eq!(config.filter.as_deref(), Some("core_sync=trace,sqlx=warn"));
    assert!(config.display_thread_info);
}
