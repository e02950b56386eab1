//! Choosing and building a table at runtime.

use crate::resize::MAXIMUM_CAPACITY_LOG;
use crate::{
    ConcurrentTable, CuckooTable, DefaultHashBuilder, LockFreeReadTable, LockingTable, OpenTable,
    Probing,
};

/// Which table implementation to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum TableKind {
    /// [`LockingTable`]
    #[default]
    Locking,
    /// [`LockFreeReadTable`]
    LockFreeRead,
    /// [`OpenTable`] with [`Probing::Linear`]
    OpenLinear,
    /// [`OpenTable`] with randomly chosen quadratic probing
    OpenQuadratic,
    /// [`CuckooTable`]
    Cuckoo,
}

/// Everything needed to build a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TableConfig {
    pub kind: TableKind,
    /// The table starts out with `2^capacity_log` buckets or slots.
    pub capacity_log: u32,
    /// Maximum bucket size, probe count or relocation count, depending on `kind`.
    pub bound: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            kind: TableKind::default(),
            capacity_log: 4,
            bound: 4,
        }
    }
}

/// The error type for [`TableConfig::validate`] and [`TableConfig::build`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The requested initial capacity is larger than any table may grow.
    #[error("capacity_log {0} exceeds the maximum of {}", MAXIMUM_CAPACITY_LOG)]
    CapacityTooLarge(u32),
    /// Every table needs a structural bound of at least one.
    #[error("the structural bound must be at least 1")]
    ZeroBound,
}

impl TableConfig {
    pub fn new(kind: TableKind, capacity_log: u32, bound: usize) -> Self {
        Self {
            kind,
            capacity_log,
            bound,
        }
    }

    /// Checks that a table can be built from this configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity_log > MAXIMUM_CAPACITY_LOG {
            return Err(ConfigError::CapacityTooLarge(self.capacity_log));
        }
        if self.bound == 0 {
            return Err(ConfigError::ZeroBound);
        }
        Ok(())
    }

    /// Builds the configured table behind the common [`ConcurrentTable`] interface.
    pub fn build<V>(&self) -> Result<Box<dyn ConcurrentTable<V>>, ConfigError>
    where
        V: Send + Sync + 'static,
    {
        self.validate()?;
        let Self {
            kind,
            capacity_log,
            bound,
        } = *self;
        Ok(match kind {
            TableKind::Locking => Box::new(LockingTable::new(capacity_log, bound)),
            TableKind::LockFreeRead => Box::new(LockFreeReadTable::new(capacity_log, bound)),
            TableKind::OpenLinear => Box::new(OpenTable::new(capacity_log, bound)),
            TableKind::OpenQuadratic => {
                let probing = Probing::random_quadratic(&DefaultHashBuilder::default());
                Box::new(OpenTable::with_probing(capacity_log, bound, probing))
            }
            TableKind::Cuckoo => Box::new(CuckooTable::new(capacity_log, bound)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KINDS: [TableKind; 5] = [
        TableKind::Locking,
        TableKind::LockFreeRead,
        TableKind::OpenLinear,
        TableKind::OpenQuadratic,
        TableKind::Cuckoo,
    ];

    #[test]
    fn rejects_bad_configs() {
        let config = TableConfig::new(TableKind::Cuckoo, MAXIMUM_CAPACITY_LOG + 1, 4);
        assert_eq!(
            config.validate(),
            Err(ConfigError::CapacityTooLarge(MAXIMUM_CAPACITY_LOG + 1))
        );
        let config = TableConfig::new(TableKind::OpenLinear, 2, 0);
        assert!(matches!(config.build::<()>(), Err(ConfigError::ZeroBound)));
        assert_eq!(
            ConfigError::ZeroBound.to_string(),
            "the structural bound must be at least 1"
        );
    }

    #[test]
    fn builds_every_kind() {
        for kind in KINDS {
            let table = TableConfig::new(kind, 2, 2).build::<i32>().unwrap();
            assert_eq!(table.capacity(), 4);
            let table = crate::TableRef::new(&*table);
            for key in 0..32 {
                table.add(key, -key);
            }
            for key in 0..32 {
                assert_eq!(table.get(key), Some(&-key), "{kind:?}");
            }
            assert_eq!(table.len(), 32);
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_round_trip() {
        let config = TableConfig::new(TableKind::OpenQuadratic, 10, 16);
        let json = serde_json::to_string(&config).expect("Couldn't serialize config");
        assert_eq!(
            json,
            r#"{"kind":"open_quadratic","capacity_log":10,"bound":16}"#
        );
        let back: TableConfig = serde_json::from_str(&json).expect("Couldn't deserialize config");
        assert_eq!(back, config);
    }
}
