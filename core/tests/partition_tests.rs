// tests/partition_tests.rs
mod common;

use common::*;
use rowflow::pipeline::partition::{stable_hash, PartitionMap, PartitionTarget};
use rowflow::{FlowError, PartitionSpec, Row, Schema, Value, ValueType};
use serial_test::serial;
use std::sync::Arc;

fn keyed_row(key: Value) -> Row {
  let schema = Arc::new(Schema::empty().field("id", ValueType::Integer).field("key", ValueType::String));
  Row::new(schema, vec![Value::Integer(0), key])
}

#[test]
#[serial]
fn test_modulo_partitioning_uses_absolute_integer_value() {
  setup_tracing();
  let map = PartitionMap::new(PartitionSpec::modulo("id", 3));
  let schema = id_schema();
  assert_eq!(map.target(&id_row(&schema, 7)).unwrap(), PartitionTarget::One(1));
  assert_eq!(map.target(&id_row(&schema, -7)).unwrap(), PartitionTarget::One(1));
  assert_eq!(map.target(&id_row(&schema, 9)).unwrap(), PartitionTarget::One(0));
}

#[test]
#[serial]
fn test_modulo_parses_strings_and_sends_nulls_to_first_partition() {
  setup_tracing();
  let map = PartitionMap::new(PartitionSpec::modulo("key", 4));
  assert_eq!(map.target(&keyed_row(Value::String(" 10 ".into()))).unwrap(), PartitionTarget::One(2));
  assert_eq!(map.target(&keyed_row(Value::Null)).unwrap(), PartitionTarget::One(0));
  assert_eq!(map.target(&keyed_row(Value::String("abc".into()))).unwrap(), PartitionTarget::One(0));
}

#[test]
#[serial]
fn test_hash_partitioning_is_stable_for_equal_keys() {
  setup_tracing();
  let first = PartitionMap::new(PartitionSpec::hash("key", 5));
  let second = PartitionMap::new(PartitionSpec::hash("key", 5));
  for key in ["alpha", "beta", "gamma", "delta", ""] {
    let a = first.target(&keyed_row(Value::String(key.into()))).unwrap();
    let b = second.target(&keyed_row(Value::String(key.into()))).unwrap();
    assert_eq!(a, b, "key {:?} must always land on the same partition", key);
    match a {
      PartitionTarget::One(p) => assert!(p < 5),
      PartitionTarget::All => panic!("hash partitioning never mirrors"),
    }
  }
}

#[test]
#[serial]
fn test_stable_hash_distinguishes_types() {
  setup_tracing();
  assert_eq!(stable_hash(&Value::Integer(1)), stable_hash(&Value::Integer(1)));
  assert_ne!(stable_hash(&Value::Integer(1)), stable_hash(&Value::Timestamp(1)));
  assert_ne!(stable_hash(&Value::String("1".into())), stable_hash(&Value::Integer(1)));
}

#[test]
#[serial]
fn test_mirror_targets_every_partition() {
  setup_tracing();
  let map = PartitionMap::new(PartitionSpec::mirror(3));
  assert_eq!(map.target(&id_row(&id_schema(), 42)).unwrap(), PartitionTarget::All);
}

#[test]
#[serial]
fn test_missing_key_field_is_a_partition_error() {
  setup_tracing();
  let map = PartitionMap::new(PartitionSpec::hash("customer", 2));
  let err = map.target(&id_row(&id_schema(), 1)).unwrap_err();
  assert!(matches!(err, FlowError::PartitionKey { ref field } if field == "customer"), "got {:?}", err);
}
