use std::time::Duration;

use replcube::config::{Config, ConfigError, EXAMPLE_CONFIG, PolicyPreset};
use replcube::{ExecutionPipeline, ExecutionRequest, SecurityPolicy, codes};

use super::FIXTURES_PATH;

fn fixture(name: &str) -> String {
    format!("{FIXTURES_PATH}/configs/{name}")
}

#[test]
fn test_load_valid_full_config() {
    let config = Config::from_file(fixture("valid_full.toml")).expect("Failed to load config");

    assert_eq!(config.policy.preset, PolicyPreset::Production);
    assert_eq!(config.sessions.ttl_secs, 300);
    assert_eq!(config.isolation.max_concurrent_units, 4);
    assert_eq!(config.isolation.max_output_bytes, 256);

    let policy = config.security_policy();
    assert_eq!(policy.execution_timeout(), Duration::from_secs(2));
    assert_eq!(policy.max_memory_bytes(), 1024 * 1024 * 1024);
    assert!(policy.forbidden_apis().contains("Contoso.Json.Unsafe"));
    assert!(policy.forbidden_apis().contains("Process.Start"));
    assert!(policy.blocked_libraries().contains("Fabrikam.Admin"));
}

#[test]
fn test_load_valid_minimal_config() {
    let config = Config::from_file(fixture("valid_minimal.toml")).expect("Failed to load config");
    assert_eq!(config.security_policy(), SecurityPolicy::permissive());
    assert_eq!(config.sessions, Config::empty().sessions);
}

#[test]
fn test_load_invalid_configs() {
    for name in ["invalid_zero_ttl.toml", "invalid_zero_units.toml"] {
        let result = Config::from_file(fixture(name));
        assert!(matches!(result, Err(ConfigError::Invalid(_))), "{name}");
    }
    assert!(matches!(
        Config::from_file(fixture("invalid_preset.toml")),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_example_config_is_the_default() {
    let parsed = Config::parse_toml(EXAMPLE_CONFIG).unwrap();
    assert_eq!(parsed, Config::default());
    assert_eq!(parsed.security_policy(), SecurityPolicy::production());
}

#[tokio::test]
async fn test_pipeline_from_config_applies_policy() {
    let config = Config::from_file(fixture("valid_full.toml")).unwrap();
    let pipeline = ExecutionPipeline::from_config(&config);

    assert_eq!(pipeline.domain().stats().capacity, 4);
    assert_eq!(pipeline.settings().max_output_bytes, 256);

    let result = pipeline
        .execute(ExecutionRequest::new("var x = Contoso.Json.Unsafe.Parse(1);"))
        .await;
    assert!(result.has_error(codes::FORBIDDEN_API));

    let loud = pipeline
        .execute(ExecutionRequest::new(
            "var i = 0;\nConsole.WriteLine(\"0123456789012345678901234567890123456789012345678901234567890123456789\");\nConsole.WriteLine(\"0123456789012345678901234567890123456789012345678901234567890123456789\");\nConsole.WriteLine(\"0123456789012345678901234567890123456789012345678901234567890123456789\");\nConsole.WriteLine(\"0123456789012345678901234567890123456789012345678901234567890123456789\");",
        ))
        .await;
    assert!(loud.is_success(), "{:?}", loud.errors);
    assert!(loud.output.ends_with("[output truncated]"));
}
