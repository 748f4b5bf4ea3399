//! Configuration tests
//!
//! Tests for configuration loading, environment overrides and validation.

use crawlgate::config::{BackendConfig, ConfigError, GatewayConfig, LedgerBackend};
use serial_test::serial;
use std::io::Write;
use tempfile::NamedTempFile;

const ENV_VARS: &[&str] = &[
    "CRAWLGATE_BIND_ADDRESS",
    "CRAWLGATE_MAX_CONCURRENT_SESSIONS",
    "CRAWLGATE_LEASE_TTL_MS",
    "CRAWLGATE_LEDGER",
    "CRAWLGATE_REDIS_URL",
    "CRAWLGATE_BACKENDS",
    "CRAWLGATE_DEFAULT_PROXY",
    "CRAWLGATE_PROXY_ROTATION_ENABLED",
    "CRAWLGATE_ROTATION_STATE_FILE",
    "CRAWLGATE_INTAKE_ENABLED",
];

fn clear_env() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

// ============================================================================
// File Loading Tests
// ============================================================================

#[test]
fn test_load_full_file() {
    let file = write_config(
        r#"
        [server]
        bind_address = "127.0.0.1:9000"
        admin_api_key = "secret"

        [admission]
        max_concurrent_sessions = 8
        lease_ttl_ms = 120000
        browser_task_types = ["rendered"]

        [ledger]
        backend = "redis"
        redis_url = "redis://ledger:6379"

        [[backends]]
        id = "scrapyd-1"
        url = "http://scrapyd-1:6800"

        [[backends]]
        id = "scrapyd-2"
        url = "http://scrapyd-2:6800"
        username = "crawler"
        password = "pw"

        [rotation]
        proxy_rotation_enabled = true
        proxies = ["http://p1:3128", "http://p2:3128"]
        state_file = "/var/lib/crawlgate/rotation.json"
        healthCheckInterval = 30000
        health_check_url = "http://check.local/ip"

        [[rotation.identities]]
        value = "Mozilla/5.0 (X11; Linux x86_64)"
        device_class = "desktop"
        browser_family = "firefox"

        [intake]
        enabled = true
        queue_name = "tasks"
        workers = 4
        "#,
    );

    let config = GatewayConfig::from_file(file.path()).unwrap();
    assert!(config.validate().is_ok());

    assert_eq!(config.server.bind_address.port(), 9000);
    assert_eq!(config.server.admin_api_key.as_deref(), Some("secret"));
    assert_eq!(config.admission.max_concurrent_sessions, 8);
    assert_eq!(config.admission.browser_task_types, vec!["rendered"]);
    assert_eq!(config.ledger.backend, LedgerBackend::Redis);
    assert_eq!(config.backends.len(), 2);
    assert_eq!(config.backends[1].username.as_deref(), Some("crawler"));
    assert_eq!(config.rotation.proxies.len(), 2);
    assert_eq!(config.rotation.identities[0].browser_family, "firefox");
    assert_eq!(
        config.rotation.state_file.as_deref(),
        Some(std::path::Path::new("/var/lib/crawlgate/rotation.json"))
    );
    assert_eq!(config.rotation.health_check_interval().as_secs(), 30);
    assert_eq!(config.rotation.health_check_timeout_ms, 5_000);
    assert_eq!(config.intake.workers, 4);
    assert_eq!(config.intake_redis_url(), "redis://ledger:6379");

    // Unset sections keep their defaults
    assert_eq!(config.probe.failure_threshold, 3);
    assert_eq!(config.logging.format, "text");
}

#[test]
fn test_example_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("crawlgate.example.toml");
    let config = GatewayConfig::from_file(&path).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.backends.len(), 2);
    assert_eq!(config.admission.browser_task_types, vec!["rendered_listing"]);
    assert!(!config.intake.enabled);
}

#[test]
fn test_missing_file() {
    let err = GatewayConfig::from_file(std::path::Path::new("/nonexistent/crawlgate.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_parse_error_names_file() {
    let file = write_config("[admission\nmax = ");
    let err = GatewayConfig::from_file(file.path()).unwrap_err();
    match err {
        ConfigError::Parse { path, .. } => assert_eq!(path, file.path().display().to_string()),
        other => panic!("unexpected {other:?}"),
    }
}

// ============================================================================
// Validation Tests
// ============================================================================

#[test]
fn test_validation_failures() {
    let base = || {
        let mut config = GatewayConfig::default();
        config.backends.push(BackendConfig::new("a", "http://a:6800"));
        config
    };
    assert!(base().validate().is_ok());

    let mut bad_url = base();
    bad_url.backends.push(BackendConfig::new("b", "not a url"));
    assert!(bad_url.validate().is_err());

    let mut zero_ttl = base();
    zero_ttl.admission.lease_ttl_ms = 0;
    assert!(zero_ttl.validate().is_err());

    let mut no_workers = base();
    no_workers.intake.enabled = true;
    no_workers.intake.workers = 0;
    assert!(no_workers.validate().is_err());

    // Leases of running jobs would lapse between two status polls
    let mut slow_poll = base();
    slow_poll.admission.lease_ttl_ms = 1_000;
    slow_poll.probe.job_poll_interval_ms = 10_000;
    assert!(slow_poll.validate().is_err());

    let mut tight_poll = base();
    tight_poll.admission.lease_ttl_ms = 20_000;
    tight_poll.probe.job_poll_interval_ms = 10_000;
    assert!(tight_poll.validate().is_ok());

    let mut bad_check_url = base();
    bad_check_url.rotation.health_check_url = "nowhere".to_string();
    assert!(bad_check_url.validate().is_err());

    // Only checked while the proxy health check runs
    let mut checks_off = base();
    checks_off.rotation.health_check_interval_ms = 0;
    checks_off.rotation.health_check_url = "nowhere".to_string();
    assert!(checks_off.validate().is_ok());

    let mut bad_format = base();
    bad_format.logging.format = "xml".to_string();
    assert!(bad_format.validate().is_err());
}

// ============================================================================
// Environment Override Tests
// ============================================================================

#[test]
#[serial]
fn test_env_overrides_file_values() {
    clear_env();
    let file = write_config(
        r#"
        [admission]
        max_concurrent_sessions = 2

        [[backends]]
        id = "file"
        url = "http://file:6800"
        "#,
    );
    std::env::set_var("CRAWLGATE_MAX_CONCURRENT_SESSIONS", "10");
    std::env::set_var("CRAWLGATE_LEDGER", "Redis");
    std::env::set_var("CRAWLGATE_BACKENDS", "east=http://east:6800,west=http://west:6800");
    std::env::set_var("CRAWLGATE_PROXY_ROTATION_ENABLED", "true");

    let mut config = GatewayConfig::from_file(file.path()).unwrap();
    config.apply_env().unwrap();
    clear_env();

    assert_eq!(config.admission.max_concurrent_sessions, 10);
    assert_eq!(config.ledger.backend, LedgerBackend::Redis);
    let ids: Vec<&str> = config.backends.iter().map(|b| b.id.as_str()).collect();
    assert_eq!(ids, vec!["east", "west"]);
    assert!(config.rotation.proxy_rotation_enabled);
}

#[test]
#[serial]
fn test_invalid_env_value() {
    clear_env();
    std::env::set_var("CRAWLGATE_LEASE_TTL_MS", "soon");
    let result = GatewayConfig::from_env();
    clear_env();

    match result {
        Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, "CRAWLGATE_LEASE_TTL_MS"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
#[serial]
fn test_unknown_ledger_backend() {
    clear_env();
    std::env::set_var("CRAWLGATE_LEDGER", "etcd");
    let result = GatewayConfig::from_env();
    clear_env();
    assert!(result.is_err());
}

#[test]
#[serial]
fn test_blank_env_is_ignored() {
    clear_env();
    std::env::set_var("CRAWLGATE_REDIS_URL", "  ");
    let config = GatewayConfig::from_env().unwrap();
    clear_env();
    assert_eq!(config.ledger.redis_url, "redis://127.0.0.1:6379");
}
