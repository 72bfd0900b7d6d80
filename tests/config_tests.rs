/// Configuration tests
///
/// Session factory configuration and mapping validation at build time.
/// Run with: cargo test --test config_tests

mod common;

use common::*;
use rustmemorm::{Entity, GenerationStrategy, OrmError, SessionConfig, SessionFactory};

#[test]
fn test_factory_from_json_configuration() {
    let config = SessionConfig::from_json(
        r#"{
            "name": "billing",
            "default_allocation_size": 25,
            "query_cache_capacity": 16,
            "log_statements": true
        }"#,
    )
    .unwrap();
    let factory = factory_with(config, database());

    assert_eq!(factory.config().name, "billing");
    assert!(factory.config().log_statements);
    assert!(factory.config().flush_on_query);
    assert_eq!(factory.mappings().count(), 5);

    // orders_seq has no explicit allocation size
    let generator = factory.generators().generator("orders_seq", 25).unwrap();
    assert_eq!(generator.allocation_size(), 25);
}

#[test]
fn test_invalid_configuration_is_rejected_at_build() {
    let result = SessionFactory::builder()
        .config(SessionConfig::new(" "))
        .register::<Tag>()
        .build(database());
    assert!(matches!(result, Err(OrmError::Configuration(_))));

    let result = SessionFactory::builder()
        .config(SessionConfig::new("zero").query_cache_capacity(0))
        .register::<Tag>()
        .build(database());
    assert!(matches!(result, Err(OrmError::Configuration(_))));

    assert!(matches!(
        SessionConfig::from_json(r#"{"name": 7}"#),
        Err(OrmError::Configuration(_))
    ));
}

#[test]
fn test_unmapped_association_target_is_rejected() {
    let result = SessionFactory::builder().register::<Order>().build(database());
    assert!(matches!(result, Err(OrmError::Mapping(_))));

    let result = SessionFactory::builder().register::<Customer>().build(database());
    assert!(matches!(result, Err(OrmError::Mapping(_))));

    let result = SessionFactory::builder()
        .register::<Customer>()
        .register::<Order>()
        .build(database());
    assert!(result.is_ok());
}

#[test]
fn test_registering_twice_is_harmless() {
    let factory = SessionFactory::builder()
        .register::<Tag>()
        .register::<Tag>()
        .build(database())
        .unwrap();
    assert_eq!(factory.mappings().count(), 1);
}

#[test]
fn test_derived_mappings() {
    let customer = Customer::mapping();
    assert_eq!(customer.entity_name(), "Customer");
    assert_eq!(customer.table_name(), "customers");
    assert_eq!(
        customer.id().strategy(),
        &GenerationStrategy::Sequence {
            name: "customer_seq".into(),
            allocation_size: Some(10),
        }
    );
    assert_eq!(customer.field("name").unwrap().column_name(), Some("full_name"));
    assert!(customer.field("orders").unwrap().column_name().is_none());

    let order = Order::mapping();
    assert_eq!(order.field("customer").unwrap().column_name(), Some("customer_id"));
    assert!(order.field("display").is_none());

    assert_eq!(Tag::mapping().id().column_name(), "code");
    assert_eq!(Tag::mapping().id().strategy(), &GenerationStrategy::Assigned);
}

