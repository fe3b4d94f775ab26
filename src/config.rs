//! Store configuration and the versioned on-disk format descriptor.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::codec::time::TimePrecision;
use crate::codec::unsigned::UnsignedBytes;
use crate::error::{Error, Result};

/// Strategy for encoding the non-temporal key prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyKind {
    /// One-byte boolean prefix.
    Bool,
    /// Two-byte signed prefix.
    Short,
    /// Four-byte signed prefix.
    Int,
    /// Eight-byte signed prefix.
    Long,
    /// Four-byte float prefix.
    Float,
    /// Eight-byte float prefix.
    Double,
    /// Raw UTF-8 prefix stored inline, bounded by the maximum key length.
    String,
    /// Always interned through the uid lookup table.
    Uid,
    /// Always interned through the hash lookup table.
    Hash,
    /// Tiered: inline, uid or hash by observed length.
    Auto,
}

/// How record values are stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueMode {
    /// The tagged value encoding is written into the row as-is.
    Direct,
    /// The tagged value encoding is routed through the lookup tiers so
    /// large or repeated values are stored once.
    Lookup,
}

/// Stored width of the content digest in the hash lookup table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashWidth {
    /// Four bytes; the 64-bit digest is folded to 32 bits.
    Four,
    /// Eight bytes, the full digest.
    Eight,
}

impl HashWidth {
    /// Digest width in bytes.
    pub fn width(&self) -> usize {
        match self {
            HashWidth::Four => 4,
            HashWidth::Eight => 8,
        }
    }
}

/// Size thresholds and reference widths for the lookup tiers.
///
/// These are on-disk format parameters: changing any of them changes how
/// records are encoded, so they are persisted at store creation and
/// validated on every open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LookupConfig {
    /// Values up to this many bytes are stored inline.
    pub direct_threshold: usize,
    /// Largest prefix the engine accepts as a native key; values between
    /// the direct threshold and this length go through the uid table.
    pub max_key_len: usize,
    /// Most distinct values the uid table may ever hold; fixes the id width.
    pub uid_capacity: u64,
    /// Stored digest width for the hash table.
    pub hash_width: HashWidth,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            direct_threshold: 32,
            max_key_len: 511,
            uid_capacity: u64::from(u32::MAX),
            hash_width: HashWidth::Eight,
        }
    }
}

impl LookupConfig {
    pub(crate) fn uid_width(&self) -> UnsignedBytes {
        UnsignedBytes::for_value(self.uid_capacity)
    }

    pub(crate) fn len_width(&self) -> UnsignedBytes {
        UnsignedBytes::for_value(self.direct_threshold as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.direct_threshold == 0 {
            return Err(Error::Config("direct-threshold must be at least 1".into()));
        }
        if self.direct_threshold >= self.max_key_len {
            return Err(Error::Config(format!(
                "direct-threshold {} must be below max-key-len {}",
                self.direct_threshold, self.max_key_len
            )));
        }
        if self.uid_capacity == 0 {
            return Err(Error::Config("uid-capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Everything needed to open or create a store.
///
/// The session and ranged stores ignore the fields that do not apply to
/// them (`value` for sessions, `key` and `value` for ranged state), but the
/// whole struct is still captured in the persisted format row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Key prefix strategy.
    pub key: KeyKind,
    /// Value storage mode.
    pub value: ValueMode,
    /// Width and precision of the trailing time region.
    pub time: TimePrecision,
    /// Lookup tier thresholds and widths.
    pub lookups: LookupConfig,
    /// When false, an insert for an existing key keeps the first record.
    pub overwrite: bool,
    /// Mutations per maintenance transaction before an intermediate commit.
    pub batch_size: usize,
    /// Entries in the per-store reverse-lookup cache; zero disables it.
    pub resolve_cache: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key: KeyKind::Auto,
            value: ValueMode::Lookup,
            time: TimePrecision::Millisecond,
            lookups: LookupConfig::default(),
            overwrite: true,
            batch_size: 10_000,
            resolve_cache: 1_024,
        }
    }
}

impl StoreConfig {
    /// A smaller on-disk footprint: second-precision times and four-byte
    /// digests. Keys beyond 2106 are rejected under this preset.
    pub fn compact() -> Self {
        Self {
            time: TimePrecision::Second,
            lookups: LookupConfig {
                hash_width: HashWidth::Four,
                ..LookupConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parses a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StoreConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML configuration file.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.lookups.validate()?;
        if self.batch_size == 0 {
            return Err(Error::Config("batch-size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Which store species owns a file; persisted so a session file cannot be
/// reopened as, say, ranged state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreKind {
    /// Temporal state store.
    TemporalState,
    /// Session store.
    Session,
    /// Ranged state store.
    RangedState,
}

/// Current format revision written into new store files.
pub const FORMAT_VERSION: u32 = 1;

/// The format descriptor persisted in the meta table at store creation and
/// compared on every subsequent open and on merge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Format {
    /// Format revision; bumped when any encoding changes shape.
    pub version: u32,
    /// Owning store species.
    pub store: StoreKind,
    /// Key prefix strategy.
    pub key: KeyKind,
    /// Value storage mode.
    pub value: ValueMode,
    /// Trailing time precision.
    pub time: TimePrecision,
    /// Inline-storage threshold in bytes.
    pub direct_threshold: usize,
    /// Largest native key the uid tier may cover.
    pub max_key_len: usize,
    /// Uid reference width in bytes.
    pub uid_width: usize,
    /// Stored digest width.
    pub hash_width: HashWidth,
}

impl Format {
    pub(crate) fn new(store: StoreKind, config: &StoreConfig) -> Self {
        Self {
            version: FORMAT_VERSION,
            store,
            key: config.key,
            value: config.value,
            time: config.time,
            direct_threshold: config.lookups.direct_threshold,
            max_key_len: config.lookups.max_key_len,
            uid_width: config.lookups.uid_width().width(),
            hash_width: config.lookups.hash_width,
        }
    }
}
