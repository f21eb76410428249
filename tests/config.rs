//! Config precedence: command-line values override file values, and
//! positional arguments survive in order.

use rook::config::{load_file, parse_settings, OptionSet};
use rook::{ActorSystemConfig, ConfigValue, SchedulerPolicy};

#[test]
fn cli_overrides_file_values() {
    let mut settings = parse_settings("foo.bar = \"hello\"\n").unwrap();
    let cli = OptionSet::new()
        .parse(vec!["--foo.bar=test".to_string()])
        .unwrap();
    settings.merge(cli.settings);
    assert_eq!(
        settings.get("foo.bar").and_then(ConfigValue::as_str),
        Some("test")
    );
}

#[test]
fn positionals_survive_mixed_with_options() {
    let cli = OptionSet::new()
        .parse(
            ["input.txt", "--foo.bar=1", "output.txt", "--x.y=2", "last"]
                .iter()
                .map(|s| s.to_string()),
        )
        .unwrap();
    assert_eq!(cli.remainder, vec!["input.txt", "output.txt", "last"]);
}

#[test]
fn file_plus_cli_yield_a_runtime_config() {
    let mut settings = parse_settings(
        "scheduler {\n  policy = \"sharing\"\n  max-threads = 2\n}\n",
    )
    .unwrap();
    let cli = OptionSet::new()
        .parse(vec![
            "--scheduler.policy=\"stealing\"".to_string(),
            "--scheduler.max-throughput=9".to_string(),
        ])
        .unwrap();
    settings.merge(cli.settings);
    let config = ActorSystemConfig::from_settings(&settings).unwrap();
    assert_eq!(config.scheduler.policy, SchedulerPolicy::Stealing);
    assert_eq!(config.scheduler.max_threads, 2);
    assert_eq!(config.scheduler.max_throughput, 9);
}

#[test]
fn config_files_load_from_disk() {
    let dir = std::env::temp_dir().join(format!("rook-config-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("app.conf");
    std::fs::write(&path, "app {\n  name = \"demo\"\n  retries = 3\n}\n").unwrap();
    let settings = load_file(&path).unwrap();
    assert_eq!(
        settings.get("app.name").and_then(ConfigValue::as_str),
        Some("demo")
    );
    assert_eq!(settings.get("app.retries"), Some(&ConfigValue::Integer(3)));
    std::fs::remove_dir_all(&dir).ok();
}
