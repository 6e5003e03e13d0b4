use std::path::PathBuf;

use mcprobe::agents::fixtures::load_fixture_tools;
use mcprobe::config::{CliOverrides, Component};
use mcprobe::{FileConfig, ScenarioParser};

fn scenarios_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("scenarios")
}

// Every scenario shipped in the repo must parse and validate.
#[test]
fn shipped_scenarios_are_valid() {
    let loaded = ScenarioParser::parse_directory(scenarios_dir()).expect("scenarios parse");
    let names: Vec<&str> = loaded.iter().map(|item| item.scenario.name.as_str()).collect();
    assert!(names.contains(&"Current weather lookup"));
    assert!(names.contains(&"Ambiguous city"));

    let ambiguous = loaded
        .iter()
        .find(|item| item.scenario.name == "Ambiguous city")
        .expect("ambiguous city scenario");
    assert!(ambiguous.scenario.judge_override().is_some());
}

#[tokio::test]
async fn shipped_fixture_tools_answer_known_cities() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join("weather_tools.yaml");
    let registry = load_fixture_tools(&path)
        .expect("fixture file loads");
    assert_eq!(registry.len(), 2);

    let weather = registry
        .invoke("get_weather", &serde_json::json!({ "city": "Oslo", "units": "metric" }))
        .await
        .expect("Oslo has a fixture");
    assert_eq!(weather["temp_c"], 12);

    assert!(registry
        .invoke("get_weather", &serde_json::json!({ "city": "Atlantis" }))
        .await
        .is_err());
}

// Placeholders on numeric fields resolve to numbers, not strings.
#[test]
fn example_config_loads_with_defaults() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("mcprobe.yaml.example");
    let content = std::fs::read_to_string(&path).expect("example config exists");
    let config = FileConfig::from_yaml_str(&content, &path, &|_: &str| None::<String>)
        .expect("example config parses");

    let user = config.resolve_llm(Component::SyntheticUser, &CliOverrides::default());
    assert_eq!(user.provider, "ollama");
    assert_eq!(user.context_size, Some(65536));
    assert!((user.temperature - 0.3).abs() < 1e-6);
    assert_eq!(config.orchestrator.timeout_seconds, Some(120.0));
    assert!(config.mcp_server.is_none());
}
