//! Allocator configuration
//!
//! Settings are read from an optional TOML file and then overridden by
//! `OFFHEAP_*` environment variables:
//!
//! ```text
//! OFFHEAP_VALIDATE_FILL_PATTERN=true
//! OFFHEAP_SLAB_SIZES=52428800,52428800
//! ```

use crate::error::{Error, Result};
use crate::offheap::MIN_CHUNK_SIZE;
use config::{Config, Environment, File, FileFormat};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Default size of a single slab (50 MB)
pub const DEFAULT_SLAB_SIZE: usize = 50 * 1024 * 1024;

/// Largest slab the allocator accepts; chunk headers store sizes as `u32`
pub const MAX_SLAB_SIZE: usize = u32::MAX as usize;

const ENV_PREFIX: &str = "OFFHEAP";

/// Configuration consumed by [`MemoryAllocator`](crate::MemoryAllocator)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Size of every slab to reserve, in bytes
    #[serde(deserialize_with = "slab_sizes")]
    pub slab_sizes: Vec<usize>,
    /// Write the sentinel into released chunks and allow `validate_fill`.
    /// Debug builds and tests only: adds a write on release and a scan on
    /// every validation.
    pub validate_fill_pattern: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            slab_sizes: vec![DEFAULT_SLAB_SIZE],
            validate_fill_pattern: false,
        }
    }
}

impl AllocatorConfig {
    /// A single slab of `size` bytes
    pub fn single_slab(size: usize) -> Self {
        Self {
            slab_sizes: vec![size],
            ..Self::default()
        }
    }

    /// Builder-style toggle for fill validation
    pub fn with_fill_validation(mut self, enabled: bool) -> Self {
        self.validate_fill_pattern = enabled;
        self
    }

    /// Load from `OFFHEAP_*` environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Load from a TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("slab_sizes"),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::InvalidConfig(format!("bad TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Total capacity over all slabs
    pub fn total_size(&self) -> usize {
        self.slab_sizes.iter().sum()
    }

    /// Reject configurations the allocator cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.slab_sizes.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one slab is required".to_string(),
            ));
        }
        self.slab_sizes.iter().try_for_each(|&size| check_slab_size(size))
    }
}

/// A slab must hold at least one chunk, and chunk headers store sizes as `u32`
pub fn check_slab_size(size: usize) -> Result<()> {
    if size < MIN_CHUNK_SIZE {
        return Err(Error::InvalidConfig(format!(
            "slab size {} is smaller than the minimum chunk size {}",
            size, MIN_CHUNK_SIZE
        )));
    }
    if size > MAX_SLAB_SIZE {
        return Err(Error::InvalidConfig(format!(
            "slab size {} exceeds the maximum of {}",
            size, MAX_SLAB_SIZE
        )));
    }
    Ok(())
}

/// Accepts a list of sizes or a single size.
/// `OFFHEAP_SLAB_SIZES=65536` arrives as a number, not a list.
fn slab_sizes<'de, D>(deserializer: D) -> std::result::Result<Vec<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    struct SlabSizes;

    impl<'de> Visitor<'de> for SlabSizes {
        type Value = Vec<usize>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a slab size or a list of slab sizes")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Self::Value, E> {
            usize::try_from(v)
                .map(|size| vec![size])
                .map_err(|_| E::custom(format!("slab size {} does not fit in usize", v)))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Self::Value, E> {
            usize::try_from(v)
                .map(|size| vec![size])
                .map_err(|_| E::custom(format!("invalid slab size {}", v)))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            v.split(',')
                .map(|s| s.trim().parse::<usize>().map_err(E::custom))
                .collect()
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut sizes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
            while let Some(size) = seq.next_element::<usize>()? {
                sizes.push(size);
            }
            Ok(sizes)
        }
    }

    deserializer.deserialize_any(SlabSizes)
}
