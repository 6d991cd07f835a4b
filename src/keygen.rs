//! Unique key minting for frames mirrored into the key/value store.
//!
//! Key format: `{vhost}:{prefix}:{camera_id}:{unix_nanos}[:{suffix}]`.
//! The vhost is the tenant identifier derived from the bus URL, so keys from
//! different tenants sharing a store can never collide.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

const SEQUENCE_MODULUS: u64 = 99_999;

/// How minted keys are suffixed to stay unique under concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Timestamp only. Collisions are possible at high capture rates.
    Basic,
    /// Timestamp plus a wrapping per-instance counter.
    #[default]
    Sequence,
    /// Timestamp plus the first 8 hex chars of a v4 UUID.
    Uuid,
}

/// Key generator configuration.
#[derive(Debug, Clone)]
pub struct KeyGeneratorConfig {
    pub strategy: KeyStrategy,
    pub prefix: String,
    pub vhost: String,
}

/// Errors raised when parsing a stored key.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid key format: {0}")]
    Malformed(String),

    #[error("invalid timestamp in key: {0}")]
    InvalidTimestamp(String),
}

/// Components recovered from a stored key. Parsing exists for diagnostics
/// only; the pipeline itself is write-only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyComponents {
    pub vhost: String,
    pub prefix: String,
    pub camera_id: String,
    pub timestamp: DateTime<Utc>,
    pub suffix: Option<String>,
}

/// Mints collision-free keys for one store instance.
pub struct KeyGenerator {
    config: KeyGeneratorConfig,
    sequence: AtomicU64,
}

impl KeyGenerator {
    pub fn new(mut config: KeyGeneratorConfig) -> Self {
        if config.vhost.is_empty() {
            config.vhost = "default".to_string();
        }
        Self {
            config,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &KeyGeneratorConfig {
        &self.config
    }

    /// Mint a key for one frame.
    pub fn generate(&self, camera_id: &str, timestamp: DateTime<Utc>) -> String {
        let base = format!(
            "{}:{}:{}:{}",
            self.config.vhost,
            self.config.prefix,
            camera_id,
            timestamp.timestamp_nanos_opt().unwrap_or_default(),
        );

        match self.config.strategy {
            KeyStrategy::Sequence => format!("{}:{:05}", base, self.next_sequence()),
            KeyStrategy::Uuid => {
                let id = Uuid::new_v4().simple().to_string();
                format!("{}:{}", base, &id[..8])
            }
            KeyStrategy::Basic => base,
        }
    }

    /// Pattern matching every key of one camera, or of the whole vhost when
    /// `camera_id` is empty.
    pub fn query_pattern(&self, camera_id: &str, vhost: Option<&str>) -> String {
        let vhost = vhost.filter(|v| !v.is_empty()).unwrap_or(&self.config.vhost);
        if camera_id.is_empty() {
            format!("{}:{}:*", vhost, self.config.prefix)
        } else {
            format!("{}:{}:{}:*", vhost, self.config.prefix, camera_id)
        }
    }

    /// Decompose a stored key into its components.
    pub fn parse_key(&self, key: &str) -> Result<KeyComponents, KeyError> {
        let mut parts = key.splitn(4, ':');
        let vhost = parts.next().filter(|s| !s.is_empty());
        let prefix = parts.next();
        let camera_id = parts.next();
        let remaining = parts.next();

        let (vhost, prefix, camera_id, remaining) = match (vhost, prefix, camera_id, remaining) {
            (Some(v), Some(p), Some(c), Some(r)) => (v, p, c, r),
            _ => return Err(KeyError::Malformed(key.to_string())),
        };

        // Everything after the third colon is `unix_nanos[:suffix]`.
        let (timestamp_str, suffix) = match remaining.rsplit_once(':') {
            Some((ts, sfx)) if !ts.is_empty() => (ts, Some(sfx.to_string())),
            _ => (remaining, None),
        };

        let nanos: i64 = timestamp_str
            .parse()
            .map_err(|_| KeyError::InvalidTimestamp(timestamp_str.to_string()))?;

        Ok(KeyComponents {
            vhost: vhost.to_string(),
            prefix: prefix.to_string(),
            camera_id: camera_id.to_string(),
            timestamp: DateTime::from_timestamp_nanos(nanos),
            suffix,
        })
    }

    // Wraps to 1 after 99 999 so the suffix keeps its five-digit shape and
    // never collides with the unsuffixed form.
    fn next_sequence(&self) -> u64 {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        (n - 1) % SEQUENCE_MODULUS + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn create_generator(strategy: KeyStrategy) -> KeyGenerator {
        KeyGenerator::new(KeyGeneratorConfig {
            strategy,
            prefix: "frames".to_string(),
            vhost: "tenant_a".to_string(),
        })
    }

    #[test]
    fn test_sequence_key_format() {
        let generator = create_generator(KeyStrategy::Sequence);
        let ts = DateTime::from_timestamp_nanos(1_731_024_000_123_456_789);
        let key = generator.generate("cam4", ts);
        assert_eq!(key, "tenant_a:frames:cam4:1731024000123456789:00001");
    }

    #[test]
    fn test_basic_key_has_no_suffix() {
        let generator = create_generator(KeyStrategy::Basic);
        let ts = DateTime::from_timestamp_nanos(1_000);
        assert_eq!(generator.generate("cam1", ts), "tenant_a:frames:cam1:1000");
    }

    #[test]
    fn test_uuid_suffix_is_eight_hex_chars() {
        let generator = create_generator(KeyStrategy::Uuid);
        let key = generator.generate("cam1", Utc::now());
        let suffix = key.rsplit(':').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_empty_vhost_defaults() {
        let generator = KeyGenerator::new(KeyGeneratorConfig {
            strategy: KeyStrategy::Basic,
            prefix: "frames".to_string(),
            vhost: String::new(),
        });
        let key = generator.generate("cam1", DateTime::from_timestamp_nanos(1));
        assert!(key.starts_with("default:frames:cam1:"));
    }

    #[test]
    fn test_sequence_wraps_to_one() {
        let generator = create_generator(KeyStrategy::Sequence);
        generator.sequence.store(SEQUENCE_MODULUS - 1, Ordering::SeqCst);

        let ts = Utc::now();
        let key = generator.generate("cam1", ts);
        assert!(key.ends_with(":99999"), "got {key}");

        let key = generator.generate("cam1", ts);
        assert!(key.ends_with(":00001"), "got {key}");
    }

    #[test]
    fn test_concurrent_generation_is_collision_free() {
        let generator = Arc::new(create_generator(KeyStrategy::Sequence));
        let ts = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let generator = generator.clone();
            handles.push(std::thread::spawn(move || {
                (0..500)
                    .map(|_| generator.generate("cam1", ts))
                    .collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for key in handle.join().unwrap() {
                assert!(seen.insert(key.clone()), "duplicate key {key}");
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    fn test_query_pattern() {
        let generator = create_generator(KeyStrategy::Sequence);
        assert_eq!(generator.query_pattern("", None), "tenant_a:frames:*");
        assert_eq!(
            generator.query_pattern("cam2", None),
            "tenant_a:frames:cam2:*"
        );
        assert_eq!(
            generator.query_pattern("cam2", Some("other")),
            "other:frames:cam2:*"
        );
    }

    #[test]
    fn test_parse_round_trip_all_strategies() {
        let ts = DateTime::from_timestamp_nanos(1_731_024_000_123_456_789);
        for strategy in [KeyStrategy::Basic, KeyStrategy::Sequence, KeyStrategy::Uuid] {
            let generator = create_generator(strategy);
            let key = generator.generate("cam9", ts);
            let parsed = generator.parse_key(&key).unwrap();

            assert_eq!(parsed.vhost, "tenant_a");
            assert_eq!(parsed.prefix, "frames");
            assert_eq!(parsed.camera_id, "cam9");
            assert_eq!(parsed.timestamp, ts);
            assert_eq!(parsed.suffix.is_some(), strategy != KeyStrategy::Basic);
        }
    }

    #[test]
    fn test_parse_rejects_malformed_keys() {
        let generator = create_generator(KeyStrategy::Sequence);
        assert!(matches!(
            generator.parse_key("no-colons-here"),
            Err(KeyError::Malformed(_))
        ));
        assert!(matches!(
            generator.parse_key("a:b:c"),
            Err(KeyError::Malformed(_))
        ));
        assert!(matches!(
            generator.parse_key("a:b:c:not-a-number"),
            Err(KeyError::InvalidTimestamp(_))
        ));
    }
}
