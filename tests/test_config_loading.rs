//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error
//! handling. We test observable outcomes, not implementation details of
//! TOML parsing.

use std::io::Write;
use tempfile::NamedTempFile;
use tracklink::config::{ConfigError, TrackerConfig};

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
broker_url = "mqtts://broker.example.com:8883"
client_id_prefix = "fleet-app"
namespace = "fleet"
keepalive_secs = 30
connect_timeout_secs = 10

[reconnect]
base_delay_secs = 2
max_delay_secs = 30
max_attempts = 5

[commands]
confirm_timeout_ms = 3000

[telemetry]
batch_size = 25
flush_interval_secs = 2

[service]
heartbeat_interval_secs = 120
"#
    )
    .unwrap();

    let config = TrackerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.broker_url, "mqtts://broker.example.com:8883");
    assert_eq!(config.mqtt.client_id_prefix, "fleet-app");
    assert_eq!(config.mqtt.namespace, "fleet");
    assert_eq!(config.mqtt.keepalive_secs, 30);
    assert_eq!(config.mqtt.connect_timeout_secs, 10);
    assert_eq!(config.reconnect.base_delay_secs, 2);
    assert_eq!(config.reconnect.max_delay_secs, 30);
    assert_eq!(config.reconnect.max_attempts, 5);
    assert_eq!(config.commands.confirm_timeout_ms, 3000);
    assert_eq!(config.telemetry.batch_size, 25);
    assert_eq!(config.telemetry.flush_interval_secs, 2);
    assert_eq!(config.service.heartbeat_interval_secs, 120);
}

#[test]
fn test_config_applies_defaults_for_empty_file() {
    let temp_file = NamedTempFile::new().unwrap();

    let config = TrackerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.broker_url, "mqtt://broker.hivemq.com:1883");
    assert_eq!(config.mqtt.client_id_prefix, "tracker-app");
    assert_eq!(config.mqtt.namespace, "devices");
    assert_eq!(config.mqtt.keepalive_secs, 60);
    assert_eq!(config.mqtt.connect_timeout_secs, 30);
    assert_eq!(config.reconnect.base_delay_secs, 5);
    assert_eq!(config.reconnect.max_delay_secs, 60);
    assert_eq!(config.reconnect.max_attempts, 10);
    assert_eq!(config.commands.confirm_timeout_ms, 5000);
    assert_eq!(config.telemetry.batch_size, 50);
    assert_eq!(config.telemetry.flush_interval_secs, 5);
    assert_eq!(config.service.heartbeat_interval_secs, 60);
}

#[test]
fn test_config_applies_defaults_for_missing_sections() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
"#
    )
    .unwrap();

    let config = TrackerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.broker_url, "mqtt://localhost:1883");
    // Unspecified mqtt fields and whole sections fall back to defaults
    assert_eq!(config.mqtt.client_id_prefix, "tracker-app");
    assert_eq!(config.reconnect.max_attempts, 10);
    assert_eq!(config.telemetry.batch_size, 50);
}

#[test]
fn test_config_loads_credential_env_names() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
broker_url = "mqtt://localhost:1883"
username_env = "FLEET_MQTT_USER"
password_env = "FLEET_MQTT_PASS"
"#
    )
    .unwrap();

    let config = TrackerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(
        config.mqtt.username_env,
        Some("FLEET_MQTT_USER".to_string())
    );
    assert_eq!(
        config.mqtt.password_env,
        Some("FLEET_MQTT_PASS".to_string())
    );
}

#[test]
fn test_config_returns_error_for_invalid_toml_syntax() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt
broker_url = "mqtt://localhost:1883"
"#
    )
    .unwrap();

    let result = TrackerConfig::load_from_file(temp_file.path());

    assert!(result.is_err());
    match result {
        Err(ConfigError::TomlParse(_)) => {}
        _ => panic!("Expected TomlParse error for invalid TOML syntax"),
    }
}

#[test]
fn test_config_returns_error_when_file_not_found() {
    use std::path::Path;

    let result = TrackerConfig::load_from_file(Path::new("/nonexistent/tracker.toml"));

    assert!(result.is_err());
    match result {
        Err(ConfigError::FileRead(_)) => {}
        _ => panic!("Expected FileRead error for nonexistent file"),
    }
}

#[test]
fn test_config_rejects_unparseable_broker_url() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
broker_url = "not a url at all"
"#
    )
    .unwrap();

    let result = TrackerConfig::load_from_file(temp_file.path());

    assert!(result.is_err());
    match result {
        Err(ConfigError::InvalidConfig(msg)) => {
            assert!(msg.contains("broker URL"), "unexpected message: {msg}")
        }
        _ => panic!("Expected InvalidConfig error for unparseable broker URL"),
    }
}

#[test]
fn test_config_rejects_unsupported_broker_scheme() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
broker_url = "http://broker.example.com:1883"
"#
    )
    .unwrap();

    let result = TrackerConfig::load_from_file(temp_file.path());

    assert!(result.is_err());
    match result {
        Err(ConfigError::InvalidConfig(msg)) => {
            assert!(msg.contains("scheme"), "unexpected message: {msg}")
        }
        _ => panic!("Expected InvalidConfig error for unsupported scheme"),
    }
}

#[test]
fn test_config_accepts_supported_broker_schemes() {
    for broker_url in [
        "mqtt://localhost:1883",
        "mqtts://broker.example.com:8883",
        "tcp://192.168.1.1:1883",
        "ssl://broker.example.com:8883",
    ] {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[mqtt]
broker_url = "{broker_url}"
"#
        )
        .unwrap();

        let config = TrackerConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.mqtt.broker_url, broker_url);
    }
}

#[test]
fn test_config_rejects_invalid_client_id_prefix() {
    for prefix in ["", "tracker app", "tracker/app", "tracker#app"] {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[mqtt]
client_id_prefix = "{prefix}"
"#
        )
        .unwrap();

        let result = TrackerConfig::load_from_file(temp_file.path());

        assert!(result.is_err(), "prefix '{prefix}' should be rejected");
        match result {
            Err(ConfigError::InvalidConfig(msg)) => {
                assert!(msg.contains("client ID prefix"), "unexpected message: {msg}")
            }
            _ => panic!("Expected InvalidConfig error for prefix '{prefix}'"),
        }
    }
}

#[test]
fn test_config_accepts_client_id_prefix_with_allowed_chars() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
client_id_prefix = "fleet-app_v2.test"
"#
    )
    .unwrap();

    let config = TrackerConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.client_id_prefix, "fleet-app_v2.test");
}

#[test]
fn test_config_rejects_namespace_with_topic_metacharacters() {
    for namespace in ["", "devices/fleet", "devices+", "devices#"] {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[mqtt]
namespace = "{namespace}"
"#
        )
        .unwrap();

        let result = TrackerConfig::load_from_file(temp_file.path());

        assert!(result.is_err(), "namespace '{namespace}' should be rejected");
        match result {
            Err(ConfigError::InvalidConfig(msg)) => {
                assert!(msg.contains("namespace"), "unexpected message: {msg}")
            }
            _ => panic!("Expected InvalidConfig error for namespace '{namespace}'"),
        }
    }
}

#[test]
fn test_config_rejects_zero_reconnect_base_delay() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[reconnect]
base_delay_secs = 0
"#
    )
    .unwrap();

    let result = TrackerConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_base_delay_above_max_delay() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[reconnect]
base_delay_secs = 120
max_delay_secs = 60
"#
    )
    .unwrap();

    let result = TrackerConfig::load_from_file(temp_file.path());

    assert!(result.is_err());
    match result {
        Err(ConfigError::InvalidConfig(msg)) => {
            assert!(
                msg.contains("base_delay_secs"),
                "unexpected message: {msg}"
            )
        }
        _ => panic!("Expected InvalidConfig error for base delay above max"),
    }
}

#[test]
fn test_config_rejects_zero_reconnect_attempts() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[reconnect]
max_attempts = 0
"#
    )
    .unwrap();

    let result = TrackerConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_zero_confirm_timeout() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[commands]
confirm_timeout_ms = 0
"#
    )
    .unwrap();

    let result = TrackerConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_zero_batch_size() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[telemetry]
batch_size = 0
"#
    )
    .unwrap();

    let result = TrackerConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_zero_flush_interval() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[telemetry]
flush_interval_secs = 0
"#
    )
    .unwrap();

    let result = TrackerConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_resolve_credentials_reads_configured_env_vars() {
    std::env::set_var("TRACKLINK_TEST_USER", "fleet_user");
    std::env::set_var("TRACKLINK_TEST_PASS", "fleet_pass");

    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
username_env = "TRACKLINK_TEST_USER"
password_env = "TRACKLINK_TEST_PASS"
"#
    )
    .unwrap();

    let config = TrackerConfig::load_from_file(temp_file.path()).unwrap();
    let credentials = config.mqtt.resolve_credentials().unwrap();

    assert_eq!(
        credentials,
        Some(("fleet_user".to_string(), "fleet_pass".to_string()))
    );

    std::env::remove_var("TRACKLINK_TEST_USER");
    std::env::remove_var("TRACKLINK_TEST_PASS");
}

#[test]
fn test_resolve_credentials_errors_when_configured_env_var_missing() {
    std::env::remove_var("TRACKLINK_MISSING_USER");

    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
username_env = "TRACKLINK_MISSING_USER"
"#
    )
    .unwrap();

    let config = TrackerConfig::load_from_file(temp_file.path()).unwrap();
    let result = config.mqtt.resolve_credentials();

    assert!(result.is_err());
    match result {
        Err(ConfigError::EnvVarNotFound(var)) => {
            assert_eq!(var, "TRACKLINK_MISSING_USER");
        }
        _ => panic!("Expected EnvVarNotFound error"),
    }
}
