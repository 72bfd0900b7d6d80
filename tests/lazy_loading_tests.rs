/// Lazy loading tests
///
/// Proxies returned by `get_reference` and by many-to-one associations, and
/// one-to-many collections loaded on first access.
/// Run with: cargo test --test lazy_loading_tests

mod common;

use common::*;
use rustmemorm::{OrmError, Ref, SessionFactory, Value};

/// A customer with two orders; returns (customer id, order ids).
fn seed_customer_with_orders(factory: &SessionFactory) -> (i64, Vec<i64>) {
    let session = factory.open_session().unwrap();
    let customer = Ref::new(Customer::new("Ada"));
    session.persist(&customer).unwrap();
    let mut order_ids = Vec::new();
    for total in [10.0, 25.5] {
        let order = Ref::new(Order::new(total, &customer));
        session.persist(&order).unwrap();
        order_ids.push(order.read(|o| o.id).unwrap());
    }
    session.flush().unwrap();
    (customer.read(|c| c.id).unwrap(), order_ids)
}

#[test]
fn test_proxy_loads_once_on_first_access() {
    let (db, factory) = setup();
    let id = seed_customer(&factory, "Ada");

    let session = factory.open_session().unwrap();
    db.reset_stats();
    let proxy = session.get_reference::<Customer>(id).unwrap();

    assert_eq!(proxy.id(), Some(Value::Integer(id)));
    assert!(!proxy.is_initialized());
    assert_eq!(db.stats().selects, 0);

    assert_eq!(proxy.read(|c| c.name.clone()).unwrap(), "Ada");
    assert!(proxy.is_initialized());
    assert_eq!(db.stats().selects, 1);

    proxy.read(|c| c.version).unwrap();
    proxy.write(|c| c.email = Some("ada@example.com".into())).unwrap();
    let found = session.find::<Customer>(id).unwrap().unwrap();
    assert!(found.ptr_eq(&proxy));
    assert_eq!(db.stats().selects, 1);

    session.flush().unwrap();
    assert_eq!(db.stats().updates, 1);
}

#[test]
fn test_reference_of_managed_entity_is_the_instance() {
    let (db, factory) = setup();
    let id = seed_customer(&factory, "Ada");

    let session = factory.open_session().unwrap();
    let loaded = session.find::<Customer>(id).unwrap().unwrap();
    db.reset_stats();
    let reference = session.get_reference::<Customer>(id).unwrap();
    assert!(reference.ptr_eq(&loaded));
    assert!(reference.is_initialized());
    assert_eq!(db.stats().selects, 0);
}

#[test]
fn test_proxy_for_missing_row_fails() {
    let (_db, factory) = setup();
    let session = factory.open_session().unwrap();
    let proxy = session.get_reference::<Customer>(404i64).unwrap();

    assert!(matches!(proxy.read(|c| c.id), Err(OrmError::LazyLoading(_))));
    assert!(matches!(proxy.read(|c| c.id), Err(OrmError::LazyLoading(_))));
    assert!(!proxy.is_initialized());
}

#[test]
fn test_proxy_outliving_its_session_fails_fast() {
    let (db, factory) = setup();
    let id = seed_customer(&factory, "Ada");

    let session = factory.open_session().unwrap();
    let proxy = session.get_reference::<Customer>(id).unwrap();
    session.close().unwrap();

    db.reset_stats();
    assert!(matches!(proxy.read(|c| c.id), Err(OrmError::LazyLoading(_))));
    assert_eq!(db.stats().selects, 0);
    assert_eq!(proxy.id(), Some(Value::Integer(id)));
}

#[test]
fn test_unlinked_proxy_fails_fast() {
    let (_db, factory) = setup();
    let id = seed_customer(&factory, "Ada");

    let session = factory.open_session().unwrap();
    let proxy = session.get_reference::<Customer>(id).unwrap();
    proxy.unlink();
    assert!(matches!(proxy.read(|c| c.id), Err(OrmError::LazyLoading(_))));
}

#[test]
fn test_proxy_initialized_from_entity() {
    let (db, factory) = setup();
    let session = factory.open_session().unwrap();
    let proxy = session.get_reference::<Tag>("red").unwrap();

    let wrong = Tag {
        code: "blue".into(),
        label: "Blue".into(),
    };
    assert!(matches!(proxy.initialize(wrong), Err(OrmError::IllegalState(_))));

    proxy
        .initialize(Tag {
            code: "red".into(),
            label: "Red".into(),
        })
        .unwrap();
    assert_eq!(proxy.read(|t| t.label.clone()).unwrap(), "Red");
    assert_eq!(db.stats().selects, 0);
}

#[test]
fn test_many_to_one_association_is_a_proxy() {
    let (db, factory) = setup();
    let (customer_id, order_ids) = seed_customer_with_orders(&factory);

    let session = factory.open_session().unwrap();
    db.reset_stats();
    let order = session.find::<Order>(order_ids[0]).unwrap().unwrap();
    let customer = order.read(|o| o.customer.clone()).unwrap();
    assert_eq!(db.stats().selects, 1);
    assert!(!customer.is_initialized());
    assert_eq!(customer.id(), Some(Value::Integer(customer_id)));

    assert_eq!(customer.read(|c| c.name.clone()).unwrap(), "Ada");
    assert_eq!(db.stats().selects, 2);

    let second = session.find::<Order>(order_ids[1]).unwrap().unwrap();
    assert!(second.read(|o| o.customer.ptr_eq(&customer)).unwrap());
    assert_eq!(db.stats().selects, 3);
}

#[test]
fn test_transient_fields_start_from_default() {
    let (_db, factory) = setup();
    let (_customer_id, order_ids) = seed_customer_with_orders(&factory);

    let session = factory.open_session().unwrap();
    let order = session.find::<Order>(order_ids[1]).unwrap().unwrap();
    assert_eq!(order.read(|o| (o.total, o.display.clone())).unwrap(), (25.5, String::new()));
}

#[test]
fn test_collection_loads_on_first_access() {
    let (db, factory) = setup();
    let (customer_id, order_ids) = seed_customer_with_orders(&factory);

    let session = factory.open_session().unwrap();
    db.reset_stats();
    let customer = session.find::<Customer>(customer_id).unwrap().unwrap();
    let orders = customer.read(|c| c.orders.clone()).unwrap();
    assert!(!orders.is_initialized());
    assert_eq!(db.stats().selects, 1);

    assert_eq!(orders.len().unwrap(), 2);
    assert!(orders.is_initialized());
    assert_eq!(db.stats().selects, 2);

    let ids: Vec<i64> = orders
        .to_vec()
        .unwrap()
        .iter()
        .map(|o| o.read(|o| o.id).unwrap())
        .collect();
    assert_eq!(ids, order_ids);
    assert_eq!(db.stats().selects, 2);

    let first = orders.get(0).unwrap().unwrap();
    assert!(first.read(|o| o.customer.ptr_eq(&customer)).unwrap());
    let found = session.find::<Order>(order_ids[0]).unwrap().unwrap();
    assert!(found.ptr_eq(&first));
    assert_eq!(db.stats().selects, 2);
}

#[test]
fn test_collection_mutation_materializes_first() {
    let (db, factory) = setup();
    let (customer_id, _order_ids) = seed_customer_with_orders(&factory);

    let session = factory.open_session().unwrap();
    let customer = session.find::<Customer>(customer_id).unwrap().unwrap();
    let orders = customer.read(|c| c.orders.clone()).unwrap();

    let extra = Ref::new(Order::new(99.0, &customer));
    session.persist(&extra).unwrap();
    orders.push(extra.clone()).unwrap();

    assert_eq!(orders.len().unwrap(), 3);
    assert!(orders.contains(&extra).unwrap());
    session.flush().unwrap();
    assert_eq!(db.row_count("orders").unwrap(), 3);
}

#[test]
fn test_collection_after_close_fails() {
    let (_db, factory) = setup();
    let (customer_id, _order_ids) = seed_customer_with_orders(&factory);

    let session = factory.open_session().unwrap();
    let customer = session.find::<Customer>(customer_id).unwrap().unwrap();
    let orders = customer.read(|c| c.orders.clone()).unwrap();
    session.close().unwrap();

    assert!(matches!(orders.len(), Err(OrmError::LazyLoading(_))));
}
