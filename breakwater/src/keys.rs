use serde::Serialize;
use std::fmt;
use std::sync::Arc;

macro_rules! interned_key {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(name: impl AsRef<str>) -> Self {
                Self(Arc::from(name.as_ref()))
            }

            pub fn name(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(name: &str) -> Self {
                Self::new(name)
            }
        }

        impl From<String> for $name {
            fn from(name: String) -> Self {
                Self(Arc::from(name))
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }
    };
}

interned_key! {
    /// Identifies one command class. Drives the metrics, circuit breaker and
    /// semaphore registries; names are case-sensitive.
    CommandKey
}

interned_key! {
    /// Logical owner grouping related commands for reporting.
    GroupKey
}

interned_key! {
    /// Selects the worker pool a thread-isolated command runs on.
    PoolKey
}

impl GroupKey {
    /// Default pool selection: commands share a pool per group unless
    /// `thread_pool_key_override` says otherwise.
    pub fn as_pool_key(&self) -> PoolKey {
        PoolKey(Arc::clone(&self.0))
    }
}
