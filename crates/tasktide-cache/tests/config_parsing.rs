use std::time::Duration;
use std::{env, fs};

use tasktide_cache::config::loader::load_config;
use tasktide_cache::{Codec, WarmingMode};

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("tasktide.toml");

    let toml_content = r#"
[redis]
enabled = true
url = "redis://cache.internal:6379"
pool_size = 4
operation_timeout_ms = 1500
key_prefix = "app:cache:"

[local_cache]
backfill_ttl_secs = 120
codec = "message_pack"

[circuit_breaker]
max_failures = 2
timeout_ms = 500
half_open_max_calls = 1

[warming]
mode = "integrated"
batch_size = 25
concurrent_jobs = 6
warmup_interval_secs = 60
max_tries = 5
queue_prefix = "app:jobs"

[logging]
level = "debug"
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert!(cfg.redis.enabled);
    assert_eq!(cfg.redis.pool_size, 4);
    assert_eq!(cfg.redis.operation_timeout(), Duration::from_millis(1500));
    assert_eq!(cfg.redis.pattern_timeout(), Duration::from_secs(10));
    assert_eq!(cfg.local_cache.codec, Codec::MessagePack);
    assert_eq!(cfg.circuit_breaker.max_failures, 2);
    assert_eq!(cfg.warming.mode, WarmingMode::Integrated);
    assert_eq!(cfg.warming.batch_size, 25);
    assert_eq!(cfg.warming.max_tries, 5);
    assert_eq!(cfg.logging.level.to_ascii_lowercase(), "debug");

    // 2) Env override should win over file
    unsafe {
        env::set_var("TASKTIDE__WARMING__BATCH_SIZE", "40");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.warming.batch_size, 40);
    unsafe {
        env::remove_var("TASKTIDE__WARMING__BATCH_SIZE");
    }

    // 3) Cache keys sharing the job queue namespace are rejected
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
[redis]
key_prefix = "shared"

[warming]
queue_prefix = "shared"
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.contains("must differ"));

    // 4) Missing file falls back to defaults
    let missing = dir.path().join("missing.toml");
    let cfg = load_config(missing.to_str()).expect("defaults should load");
    assert_eq!(cfg.warming.mode, WarmingMode::Auto);
    assert!(!cfg.redis.enabled);
}
