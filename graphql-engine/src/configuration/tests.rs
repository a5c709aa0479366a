use std::time::Duration;

use pretty_assertions::assert_eq;

use super::*;

#[test]
fn empty_yaml_uses_defaults() {
    let configuration: Configuration = "{}".parse().unwrap();
    assert_eq!(configuration, Configuration::default());
    assert!(configuration.fetch.single_flight);
    assert!(configuration.subscription.enable_deduplication);
    assert_eq!(configuration.subscription.idle_stream, IdleStreamPolicy::Keep);
}

#[test]
fn full_yaml_is_parsed() {
    let configuration: Configuration = r#"
fetch:
  single_flight: false
  buffer_pool_max_size: 16
  buffer_pool_wait_timeout: 250ms
subscription:
  enable_deduplication: false
  queue_capacity: 8
  idle_stream: evict
"#
    .parse()
    .unwrap();

    assert_eq!(
        configuration,
        Configuration {
            fetch: FetchConfig {
                single_flight: false,
                buffer_pool_max_size: 16,
                buffer_pool_wait_timeout: Some(Duration::from_millis(250)),
            },
            subscription: SubscriptionConfig {
                enable_deduplication: false,
                queue_capacity: 8,
                idle_stream: IdleStreamPolicy::Evict,
            },
        }
    );
}

#[test]
fn unknown_fields_are_rejected() {
    let err = "fetch:\n  singleflight: true\n"
        .parse::<Configuration>()
        .unwrap_err();
    assert!(matches!(err, ConfigurationError::DeserializeConfigError(_)));
}

#[test]
fn zero_queue_capacity_is_invalid() {
    let err = "subscription:\n  queue_capacity: 0\n"
        .parse::<Configuration>()
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "bad configuration for subscription: queue_capacity must be greater than 0"
    );
}

#[test]
fn schema_lists_top_level_sections() {
    let schema = Configuration::json_schema();
    let properties = schema["properties"].as_object().unwrap();
    assert!(properties.contains_key("fetch"));
    assert!(properties.contains_key("subscription"));
}
