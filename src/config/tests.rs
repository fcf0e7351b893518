use super::*;

#[test]
fn test_defaults() {
    let config = ProberConfig::default();
    assert_eq!(config.proxy.protocol, ProxyProtocol::Socks5);
    assert!(config.proxy.target.is_empty());
    assert!(!config.proxy.share);
    assert_eq!(config.proxy.socket_count, 8);
    assert_eq!(config.proxy.fetch_interval, 5);
    assert!(config.proxy.tls_verify);
    assert!(!config.requires_upgrade());
}

#[test]
fn test_parse_vendor_style_json() {
    // The deployed file carries commentary keys (`#available_protocols`)
    // which must be ignored.
    let raw = r##"{
        "client_version": 12,
        "proxy": {
            "#available_protocols": ["socks5", "http/https"],
            "protocol": 1,
            "target": "http://vendor.example/api/extract?num=50",
            "count_target": "http://vendor.example/api/count",
            "username": "acct",
            "password": "secret",
            "share": true,
            "socket_count": 120,
            "per_fetch": 50,
            "fetch_interval": 7
        }
    }"##;

    let config: ProberConfig = serde_json::from_str(raw).unwrap();
    assert_eq!(config.proxy.protocol, ProxyProtocol::HttpHttps);
    assert_eq!(config.proxy.socket_count, 120);
    assert_eq!(config.proxy.fetch_interval, 7);
    assert!(config.proxy.share);
    assert_eq!(config.proxy.username, "acct");
    // tls_verify was not in the file: verification defaults on.
    assert!(config.proxy.tls_verify);
    assert!(config.validate().is_ok());
}

#[test]
fn test_unknown_protocol_rejected() {
    let raw = r#"{ "proxy": { "protocol": 7 } }"#;
    assert!(serde_json::from_str::<ProberConfig>(raw).is_err());
}

#[test]
fn test_validate_rejects_zero_sockets() {
    let mut config = ProberConfig::default();
    config.proxy.socket_count = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_validate_rejects_zero_interval() {
    let mut config = ProberConfig::default();
    config.proxy.fetch_interval = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_requires_upgrade() {
    let mut config = ProberConfig::default();
    config.client_version = MINIMUM_CLIENT_VERSION - 1;
    assert!(config.requires_upgrade());
}
