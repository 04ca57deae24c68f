//! Tests for config module

use std::io::Write;

use feedwire::config::{Config, StorageBackend};
use feedwire::delivery::DeliveryMode;
use tempfile::NamedTempFile;

const SAMPLE: &str = r#"
[cycle]
batch_size = 50
parallel_batches = 3
hours_until_fail = 12.0
refresh_rate_minutes = 15.0
batch_timeout_secs = 120

[[schedules]]
name = "youtube"
refresh_rate_minutes = 30.0
keywords = ["youtube.com"]

[[schedules]]
name = "hourly"
refresh_rate_minutes = 60.0
subscription_ids = ["sub-1", "sub-2"]

[fast_tier]
refresh_rate_minutes = 2.0
guild_ids = ["guild-vip"]

[rate_limits]
standard_per_minute = 20
supporter_per_minute = 60

[delivery]
mode = "brokered"
broker_url = "http://broker.internal:8080"
shard_ids = [0, 2]
shard_count = 4

[storage]
backend = "file"
data_dir = "/var/lib/feedwire"

[debug]
urls = ["https://feeds.example.com/watched.xml"]

[logging]
level = "debug"
format = "json"
"#;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_config_file() {
    let file = write_config(SAMPLE);
    let config = Config::from_file(file.path()).unwrap();

    assert!(config.validate().is_ok());
    assert_eq!(config.cycle.batch_size, 50);
    assert_eq!(config.cycle.batch_timeout_secs, Some(120));
    assert_eq!(config.delivery.mode, DeliveryMode::Brokered);
    assert_eq!(config.storage.backend, StorageBackend::File);
    assert_eq!(config.logging.format, "json");
    assert!(config.debug.urls.contains("https://feeds.example.com/watched.xml"));

    let schedules = config.schedule_set().unwrap();
    let names: Vec<_> = schedules.all().into_iter().map(|s| s.name).collect();
    assert_eq!(names.len(), 4);
    assert!(names.contains(&"supporter".to_string()));
    assert!(names.contains(&"hourly".to_string()));

    assert!(config.supporter_guilds().contains("guild-vip"));
    let settings = config.cycle_settings(0);
    assert_eq!(settings.parallel_batches, 3);
}

#[test]
fn test_missing_file_is_an_error() {
    let result = Config::from_file(std::path::Path::new("/nonexistent/feedwire.toml"));
    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("Failed to read config file"));
}

#[test]
fn test_invalid_toml_is_an_error() {
    let file = write_config("[cycle\nbatch_size = ");
    assert!(Config::from_file(file.path()).is_err());
}

#[test]
fn test_custom_schedule_sharing_rate_fails_validation() {
    let file = write_config(
        r#"
        [[schedules]]
        name = "a"
        refresh_rate_minutes = 30.0
        keywords = ["a.com"]

        [[schedules]]
        name = "b"
        refresh_rate_minutes = 30.0
        keywords = ["b.com"]
        "#,
    );
    let config = Config::from_file(file.path()).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_shard_out_of_range_fails_validation() {
    let file = write_config(
        r#"
        [delivery]
        shard_ids = [4]
        shard_count = 4
        "#,
    );
    let config = Config::from_file(file.path()).unwrap();
    assert!(config.validate().is_err());
}
