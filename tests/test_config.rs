/// Test environment configuration
use std::collections::HashMap;
use std::path::PathBuf;

use waf_rule_miner::config::{parse_flag, RuleGenConfig};

fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn test_default_config() {
    let config = RuleGenConfig::from_lookup(lookup(&[])).unwrap();

    println!("Default configuration: {:?}", config);

    assert_eq!(config, RuleGenConfig::default());
    assert_eq!(config.batch_size, 5000);
    assert_eq!(config.window_hours, 24);
    assert_eq!(config.max_windows_per_run, 1);
    assert_eq!(config.n_clusters, 10);
    assert_eq!(config.base_rule_id, 200_000);
    assert!(!config.include_body_in_repr);
    assert_eq!(
        config.exporter().path(),
        PathBuf::from("/rules/REQUEST-999-AUTO.conf")
    );
}

#[test]
fn test_custom_config() {
    let config = RuleGenConfig::from_lookup(lookup(&[
        ("RULEGEN_DB_PATH", "/var/lib/rulegen/store.db"),
        ("BATCH_SIZE", "200"),
        ("WINDOW_HOURS", "6"),
        ("MAX_WINDOWS_PER_RUN", "4"),
        ("N_CLUSTERS", " 3 "),
        ("BASE_RULE_ID", "900000"),
        ("INCLUDE_BODY_IN_REPR", "Yes"),
        ("RULE_OUTPUT_DIR", "/tmp/rules"),
    ]))
    .unwrap();

    assert_eq!(config.db_path, PathBuf::from("/var/lib/rulegen/store.db"));
    assert_eq!(config.n_clusters, 3);

    let pipeline = config.pipeline_config();
    assert_eq!(pipeline.n_clusters, 3);
    assert_eq!(pipeline.base_rule_id, 900_000);
    assert!(pipeline.include_body);

    let settings = config.run_settings();
    assert_eq!(settings.batch_size, 200);
    assert_eq!(settings.max_windows_per_run, 4);
    assert_eq!(settings.default_window_hours, 6);
}

#[test]
fn test_invalid_numbers_are_errors() {
    let err = RuleGenConfig::from_lookup(lookup(&[("BATCH_SIZE", "lots")])).unwrap_err();
    assert!(err.to_string().contains("BATCH_SIZE"));

    assert!(RuleGenConfig::from_lookup(lookup(&[("WINDOW_HOURS", "-1")])).is_err());
    assert!(RuleGenConfig::from_lookup(lookup(&[("MAX_WINDOWS_PER_RUN", "0")])).is_err());
    assert!(RuleGenConfig::from_lookup(lookup(&[("BATCH_SIZE", "0")])).is_err());
}

#[test]
fn test_body_flag_values() {
    for raw in ["1", "true", "TRUE", "yes", "y", " Y "] {
        assert!(parse_flag(raw), "{} should enable", raw);
    }
    for raw in ["0", "false", "no", "", "on"] {
        assert!(!parse_flag(raw), "{} should disable", raw);
    }
}
