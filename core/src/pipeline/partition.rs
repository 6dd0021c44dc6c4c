// rowflow/src/pipeline/partition.rs

//! Partitioning of rows over the copies of a partitioned stage.
//!
//! A `PartitionMap` is a pure function of the key value and the partition count,
//! so every producer copy (and every remote node) routes a given key to the same
//! partition for the whole run.

use crate::core::row::Row;
use crate::core::value::Value;
use crate::error::{FlowError, FlowResult};
use serde::{Deserialize, Serialize};

/// Declares a stage as partition-aware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSpec {
  pub method: PartitionMethod,
  /// Number of partitions; the stage is instantiated once per partition.
  pub partitions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PartitionMethod {
  /// `|integer value of field| mod partitions`. Strings are parsed as integers,
  /// nulls and unparsable values go to partition 0.
  Modulo { field: String },
  /// Stable FNV-1a hash of the field value, mod partitions.
  Hash { field: String },
  /// Every row is sent to every partition.
  Mirror,
}

impl PartitionSpec {
  pub fn modulo(field: impl Into<String>, partitions: usize) -> Self {
    Self {
      method: PartitionMethod::Modulo { field: field.into() },
      partitions,
    }
  }

  pub fn hash(field: impl Into<String>, partitions: usize) -> Self {
    Self {
      method: PartitionMethod::Hash { field: field.into() },
      partitions,
    }
  }

  pub fn mirror(partitions: usize) -> Self {
    Self {
      method: PartitionMethod::Mirror,
      partitions,
    }
  }

  pub fn key_field(&self) -> Option<&str> {
    match &self.method {
      PartitionMethod::Modulo { field } | PartitionMethod::Hash { field } => Some(field),
      PartitionMethod::Mirror => None,
    }
  }
}

/// Where a row goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionTarget {
  One(usize),
  All,
}

/// The key → partition function shared by the producers feeding one partitioned stage.
#[derive(Debug, Clone)]
pub struct PartitionMap {
  spec: PartitionSpec,
}

impl PartitionMap {
  pub fn new(spec: PartitionSpec) -> Self {
    Self { spec }
  }

  pub fn spec(&self) -> &PartitionSpec {
    &self.spec
  }

  pub fn partitions(&self) -> usize {
    self.spec.partitions
  }

  /// Partition index of a single key value.
  pub fn partition_of(&self, key: &Value) -> usize {
    let partitions = self.spec.partitions.max(1) as u64;
    let slot = match &self.spec.method {
      PartitionMethod::Modulo { .. } => key.as_integer().map_or(0, |v| v.unsigned_abs() % partitions),
      PartitionMethod::Hash { .. } | PartitionMethod::Mirror => stable_hash(key) % partitions,
    };
    slot as usize
  }

  pub fn target(&self, row: &Row) -> FlowResult<PartitionTarget> {
    let Some(field) = self.spec.key_field() else {
      return Ok(PartitionTarget::All);
    };
    let key = row.get_by_name(field).ok_or_else(|| FlowError::PartitionKey {
      field: field.to_string(),
    })?;
    Ok(PartitionTarget::One(self.partition_of(key)))
  }
}

/// 64-bit FNV-1a over the canonical encoding of `value`.
pub fn stable_hash(value: &Value) -> u64 {
  const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
  const PRIME: u64 = 0x0000_0100_0000_01b3;
  let mut hash = OFFSET;
  value.write_canonical(&mut |bytes: &[u8]| {
    for byte in bytes {
      hash ^= u64::from(*byte);
      hash = hash.wrapping_mul(PRIME);
    }
  });
  hash
}
