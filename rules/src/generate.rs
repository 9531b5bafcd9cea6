//! Header value generators.
//!
//! All three generators produce ASCII-safe values suitable for an HTTP
//! header. The UUID and timestamp generators are stateless; the ULID
//! generator keeps its entropy source behind a mutex so concurrent requests
//! draw from one seeded RNG.

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Crockford Base32, as used by the ULID spec.
const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum GeneratorKind {
    #[default]
    #[serde(rename = "uuid-v4")]
    UuidV4,
    #[serde(rename = "ulid")]
    Ulid,
    #[serde(rename = "rfc3339-timestamp")]
    Rfc3339Timestamp,
}

impl std::fmt::Display for GeneratorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::UuidV4 => "uuid-v4",
            Self::Ulid => "ulid",
            Self::Rfc3339Timestamp => "rfc3339-timestamp",
        };
        f.write_str(name)
    }
}

/// Shared generator state for one process.
#[derive(Debug)]
pub struct Generators {
    ulid_rng: Mutex<StdRng>,
}

impl Default for Generators {
    fn default() -> Self {
        Self::new()
    }
}

impl Generators {
    pub fn new() -> Self {
        Self {
            ulid_rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn generate(&self, kind: GeneratorKind) -> String {
        match kind {
            GeneratorKind::UuidV4 => uuid::Uuid::new_v4().to_string(),
            GeneratorKind::Ulid => self.ulid(),
            GeneratorKind::Rfc3339Timestamp => {
                Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
            }
        }
    }

    /// A 26-character ULID: 48 bits of Unix-millisecond timestamp followed
    /// by 80 bits of randomness, Crockford Base32. The timestamp prefix
    /// makes values generated in later milliseconds sort lexicographically
    /// after earlier ones.
    fn ulid(&self) -> String {
        let millis = Utc::now().timestamp_millis() as u128 & ((1 << 48) - 1);
        let entropy = {
            let mut rng = self.ulid_rng.lock();
            rng.random::<u128>() & ((1 << 80) - 1)
        };
        let value = (millis << 80) | entropy;

        let mut out = String::with_capacity(26);
        for i in 0..26 {
            let shift = 5 * (25 - i);
            let index = ((value >> shift) & 0x1f) as usize;
            out.push(CROCKFORD[index] as char);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_v4_format() {
        let generators = Generators::new();
        let re = regex::Regex::new(
            "^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$",
        )
        .unwrap();
        for _ in 0..64 {
            let v = generators.generate(GeneratorKind::UuidV4);
            assert!(re.is_match(&v), "{v} is not a v4 UUID");
        }
    }

    #[test]
    fn ulid_format() {
        let generators = Generators::new();
        let re = regex::Regex::new("^[0-9A-HJKMNP-TV-Z]{26}$").unwrap();
        for _ in 0..64 {
            let v = generators.generate(GeneratorKind::Ulid);
            assert!(re.is_match(&v), "{v} is not a ULID");
            // 2^48 ms keeps the leading character at or below '7'.
            assert!(v.as_bytes()[0] <= b'7', "{v} overflows the timestamp");
        }
    }

    #[test]
    fn ulid_orders_across_milliseconds() {
        let generators = Generators::new();
        let first = generators.generate(GeneratorKind::Ulid);
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = generators.generate(GeneratorKind::Ulid);
        assert!(first < second, "{first} should sort before {second}");
    }

    #[test]
    fn rfc3339_timestamp_has_nanosecond_precision() {
        let generators = Generators::new();
        let v = generators.generate(GeneratorKind::Rfc3339Timestamp);
        let parsed = chrono::DateTime::parse_from_rfc3339(&v).expect("parses as RFC 3339");
        assert!(v.ends_with('Z'));
        // Nine fractional digits between the seconds field and the zone.
        let frac = v.split('.').nth(1).expect("has a fractional part");
        assert_eq!(frac.trim_end_matches('Z').len(), 9);
        assert!(parsed.timestamp() > 0);
    }

    #[test]
    fn generator_kind_serde_names() {
        for (kind, name) in [
            (GeneratorKind::UuidV4, "\"uuid-v4\""),
            (GeneratorKind::Ulid, "\"ulid\""),
            (GeneratorKind::Rfc3339Timestamp, "\"rfc3339-timestamp\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), name);
            assert_eq!(
                serde_json::from_str::<GeneratorKind>(name).unwrap(),
                kind
            );
        }
    }
}
