//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use session_gateway::config::{
    ClusterConfig, InnerPairConfig, KeepaliveConfig, LoggingConfig, ProxyConfig,
    MIN_RING_CAPACITY,
};
use session_gateway::error::GatewayError;
use session_gateway::protocol::messages::LinkType;
use session_gateway::utils::compression::CompressionKind;
use std::io::Write;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_configs_validate() {
    let errors = ProxyConfig::default().validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert!(ClusterConfig::default().validate().is_empty());
    assert!(InnerPairConfig::default().validate().is_empty());
}

#[test]
fn test_zero_session_threads() {
    let config = ProxyConfig::default_with_overrides(|c| c.session_thread_num = 0);
    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("session_thread_num must be greater than 0")));
}

#[test]
fn test_too_many_session_threads() {
    let config = ProxyConfig::default_with_overrides(|c| c.session_thread_num = 1000);
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("session_thread_num too large")));
}

#[test]
fn test_short_tick_interval() {
    let config = ProxyConfig::default_with_overrides(|c| {
        c.keepalive.tick_interval = Duration::from_millis(1);
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Tick interval too short")));
}

#[test]
fn test_tick_longer_than_precision() {
    let keepalive = KeepaliveConfig {
        tick_interval: Duration::from_secs(5),
        ..KeepaliveConfig::default()
    };
    assert!(keepalive
        .validate()
        .iter()
        .any(|e| e.contains("Tick interval too long")));
}

#[test]
fn test_send_delay_must_leave_room() {
    let keepalive = KeepaliveConfig {
        tick_interval: Duration::from_millis(100),
        keep_alive_timeout: Duration::from_secs(2),
        max_send_delay: Duration::from_secs(2),
    };
    assert!(keepalive
        .validate()
        .iter()
        .any(|e| e.contains("must be shorter than the keep-alive timeout")));
    assert_eq!(keepalive.send_deadline(), Duration::ZERO);
}

#[test]
fn test_short_keep_alive_timeout() {
    let config = ProxyConfig::default_with_overrides(|c| {
        c.keepalive.keep_alive_timeout = Duration::from_millis(500);
        c.keepalive.max_send_delay = Duration::from_millis(100);
    });
    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Keep-alive timeout too short")));
}

#[test]
fn test_validate_strict_lists_every_error() {
    let config = ProxyConfig::default_with_overrides(|c| {
        c.session_thread_num = 0;
        c.logging.app_name = String::new();
    });
    match config.validate_strict() {
        Err(GatewayError::ConfigError(message)) => {
            assert!(message.contains("session_thread_num"));
            assert!(message.contains("Application name cannot be empty"));
        }
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn test_proxy_config_from_json() {
    let config = ProxyConfig::from_json(
        r#"{
            "listened_port": 7000,
            "session_thread_num": 8,
            "tick_interval": 50,
            "keep_alive_timeout": 10000,
            "max_send_delay": 1500,
            "compression": "zstd"
        }"#,
    )
    .expect("valid json");

    assert_eq!(config.listened_port, 7000);
    assert_eq!(config.session_thread_num, 8);
    assert_eq!(config.keepalive.tick_interval, Duration::from_millis(50));
    assert_eq!(config.keepalive.keep_alive_timeout, Duration::from_secs(10));
    assert_eq!(config.keepalive.max_send_delay, Duration::from_millis(1500));
    assert_eq!(config.compression, CompressionKind::Zstd);
    assert_eq!(config.keepalive.ticks_per_check(), 20);
    assert!(config.validate().is_empty());
}

#[test]
fn test_proxy_config_from_file() {
    let path = std::env::temp_dir().join(format!(
        "session-gateway-config-{}.json",
        std::process::id()
    ));
    {
        let mut file = std::fs::File::create(&path).expect("create temp config");
        file.write_all(
            br#"{"listened_port":9001,"session_thread_num":2,"tick_interval":100,"keep_alive_timeout":30000}"#,
        )
        .expect("write temp config");
    }
    let config = ProxyConfig::from_file(&path).expect("load config");
    std::fs::remove_file(&path).ok();

    assert_eq!(config.listened_port, 9001);
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_missing_config_file() {
    let err = ProxyConfig::from_file("/nonexistent/proxy_config.json").unwrap_err();
    assert!(matches!(err, GatewayError::ConfigError(ref m) if m.contains("Failed to read")));
}

#[test]
fn test_cluster_config_from_json() {
    let config = ClusterConfig::from_json(
        r#"{
            "proxy_ip": "10.0.0.5",
            "proxy_port": 9000,
            "sid": 3,
            "area_id": 1,
            "platform": "android",
            "tick_interval": 100,
            "keep_alive_timeout": 30000
        }"#,
    )
    .expect("valid json");

    assert_eq!(config.link_type, LinkType::ActiveGameServer);
    assert!(config.ring_capacity >= MIN_RING_CAPACITY);
    assert!(config.validate().is_empty());
}

#[test]
fn test_cluster_config_rejections() {
    let mut config = ClusterConfig {
        proxy_ip: "not-an-ip".to_string(),
        ..ClusterConfig::default()
    };
    config.platform = String::new();
    config.link_type = LinkType::ClientProxy;
    config.ring_capacity = 1024;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid proxy_ip")));
    assert!(errors.iter().any(|e| e.contains("platform cannot be empty")));
    assert!(errors.iter().any(|e| e.contains("not a server link type")));
    assert!(errors.iter().any(|e| e.contains("ring_capacity too small")));
}

#[test]
fn test_cluster_platform_too_long() {
    let config = ClusterConfig {
        platform: "x".repeat(300),
        ..ClusterConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("platform too long")));
}

#[test]
fn test_inner_pair_acceptor_ignores_peer_address() {
    let config = InnerPairConfig {
        ip: "garbage".to_string(),
        port: 0,
        is_connector: false,
        ..InnerPairConfig::default()
    };
    assert!(config.validate().is_empty());

    let connector = InnerPairConfig {
        is_connector: true,
        ..config
    };
    let errors = connector.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid peer ip")));
    assert!(errors.iter().any(|e| e.contains("port cannot be 0")));
}

#[test]
fn test_logging_no_output() {
    let config = LoggingConfig {
        log_to_console: false,
        log_to_file: false,
        ..LoggingConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_logging_file_without_path() {
    let config = LoggingConfig {
        log_to_file: true,
        log_file_path: None,
        ..LoggingConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_logging_level_from_json() {
    let config = ProxyConfig::from_json(
        r#"{
            "listened_port": 9000,
            "session_thread_num": 1,
            "tick_interval": 100,
            "keep_alive_timeout": 30000,
            "logging": {
                "app_name": "gw",
                "log_level": "debug",
                "log_to_console": true,
                "log_to_file": false,
                "log_file_path": null,
                "json_format": true
            }
        }"#,
    )
    .expect("valid json");
    assert_eq!(config.logging.log_level, Level::DEBUG);
    assert!(config.logging.json_format);
}
