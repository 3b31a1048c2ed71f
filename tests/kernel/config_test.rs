/*!
 * Configuration Tests
 * Environment overlay and presets
 */

use ntweb_kernel::{KernelConfig, KernelError};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::time::Duration;

const VARS: [&str; 4] = [
    "NTWEB_SYSTEM_DIR",
    "NTWEB_REQUEST_TIMEOUT_MS",
    "NTWEB_MAX_PROCESSES",
    "NTWEB_TRACE_JSON",
];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_defaults_without_environment() {
    clear_env();
    let config = KernelConfig::from_env().unwrap();
    assert_eq!(config, KernelConfig::default());
    assert_eq!(config.system_dir, "C:/Windows/System32");
    assert_eq!(config.request_timeout, Duration::from_secs(30));
}

#[test]
#[serial]
fn test_environment_overrides() {
    clear_env();
    std::env::set_var("NTWEB_SYSTEM_DIR", "D:/Sys");
    std::env::set_var("NTWEB_REQUEST_TIMEOUT_MS", "1500");
    std::env::set_var("NTWEB_MAX_PROCESSES", "4");
    std::env::set_var("NTWEB_TRACE_JSON", "true");

    let config = KernelConfig::from_env().unwrap();
    clear_env();

    assert_eq!(config.system_dir, "D:/Sys");
    assert_eq!(config.request_timeout, Duration::from_millis(1500));
    assert_eq!(config.max_processes, 4);
    assert!(config.trace_json);
}

#[test]
#[serial]
fn test_invalid_number_is_configuration_error() {
    clear_env();
    std::env::set_var("NTWEB_MAX_PROCESSES", "lots");
    let err = KernelConfig::from_env().unwrap_err();
    clear_env();
    assert!(matches!(err, KernelError::Configuration(msg) if msg.contains("NTWEB_MAX_PROCESSES")));
}

#[test]
fn test_presets_only_change_timeouts() {
    let aggressive = KernelConfig::aggressive();
    assert!(aggressive.request_timeout < KernelConfig::default().request_timeout);
    assert_eq!(aggressive.max_processes, KernelConfig::default().max_processes);
    assert!(KernelConfig::relaxed().request_timeout > KernelConfig::default().request_timeout);
}

#[test]
fn test_config_deserializes_with_defaults() {
    let config: KernelConfig = serde_json::from_str(r#"{"request_timeout": 250, "max_processes": 8}"#).unwrap();
    assert_eq!(config.request_timeout, Duration::from_millis(250));
    assert_eq!(config.max_processes, 8);
    assert_eq!(config.root_dir, "C:/Windows");
}
