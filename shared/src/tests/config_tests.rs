//! Tests for configuration loading and validation

use crate::config::Settings;
use crate::defaults::DEFAULT_AUTHKEY;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_defaults_are_valid() {
    let settings = Settings::default();
    assert!(settings.validate().is_ok());
    assert_eq!(settings.server.port, 50001);
    assert_eq!(settings.server.bind, "localhost");
    assert_eq!(settings.server.auth, DEFAULT_AUTHKEY);
    assert_eq!(settings.autoscale.policy, "fixed");
}

#[test]
fn test_load_explicit_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[server]
bundlesize = 4
eager = true

[submit]
bundlewait = 1
"#
    )
    .unwrap();

    let settings = Settings::load(Some(file.path())).unwrap();
    assert_eq!(settings.server.bundlesize, 4);
    assert!(settings.server.eager);
    assert_eq!(settings.submit.bundlewait, 1);
    // Unset options keep their compiled defaults.
    assert_eq!(settings.server.queuesize, 100);
}

#[test]
fn test_environment_overrides_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[client]
heartrate = 30
"#
    )
    .unwrap();

    std::env::set_var("HYPERSHELL_CLIENT_HEARTRATE", "3");
    let settings = Settings::load(Some(file.path())).unwrap();
    std::env::remove_var("HYPERSHELL_CLIENT_HEARTRATE");

    assert_eq!(settings.client.heartrate, 3);
}

#[test]
fn test_nested_environment_path() {
    std::env::set_var("HYPERSHELL_AUTOSCALE_SIZE_MAX", "9");
    let settings = Settings::load(None).unwrap();
    std::env::remove_var("HYPERSHELL_AUTOSCALE_SIZE_MAX");

    assert_eq!(settings.autoscale.size.max, 9);
}

#[test]
fn test_deferred_env_expansion() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[server]
auth_env = "TEST_HYPERSHELL_SECRET"
"#
    )
    .unwrap();

    std::env::set_var("TEST_HYPERSHELL_SECRET", "from-environment");
    let settings = Settings::load(Some(file.path())).unwrap();
    std::env::remove_var("TEST_HYPERSHELL_SECRET");

    assert_eq!(settings.server.auth, "from-environment");
}

#[test]
fn test_deferred_eval_expansion() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[server]
auth_eval = "echo evaluated-secret"
"#
    )
    .unwrap();

    let settings = Settings::load(Some(file.path())).unwrap();
    assert_eq!(settings.server.auth, "evaluated-secret");
}

#[test]
fn test_default_auth_rejected_on_nonlocal_bind() {
    let mut settings = Settings::default();
    settings.server.bind = "0.0.0.0".to_string();
    assert!(settings.validate().is_err());

    settings.server.auth = "a-real-secret".to_string();
    assert!(settings.validate().is_ok());
}

#[test]
fn test_unknown_option_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[server]
bundlezise = 4
"#
    )
    .unwrap();

    assert!(Settings::load(Some(file.path())).is_err());
}

#[test]
fn test_invalid_policy_rejected() {
    let mut settings = Settings::default();
    settings.autoscale.policy = "chaotic".to_string();
    assert!(settings.validate().is_err());
}

#[test]
fn test_size_bounds_rejected_when_inverted() {
    let mut settings = Settings::default();
    settings.autoscale.size.min = 5;
    settings.autoscale.size.max = 2;
    assert!(settings.validate().is_err());
}

#[test]
fn test_zero_bundlesize_rejected() {
    let mut settings = Settings::default();
    settings.server.bundlesize = 0;
    assert!(settings.validate().is_err());
}
