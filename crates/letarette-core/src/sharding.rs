//! Document id to shard mapping.
//!
//! Every worker in a shard group must agree on where a document belongs,
//! so the mapping is a plain 32-bit FNV-1a hash of the id bytes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Zero-based shard index owning `doc_id` in a group of `group_size` shards.
pub fn shard_index_of(doc_id: &str, group_size: u16) -> u16 {
    if group_size <= 1 {
        return 0;
    }
    (fnv1a_32(doc_id.as_bytes()) % u32::from(group_size)) as u16
}

/// A shard position, written `"<index+1>/<size>"` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Shard {
    /// Zero-based index within the group.
    pub index: u16,
    /// Number of shards in the group.
    pub size: u16,
}

impl Shard {
    pub fn new(index: u16, size: u16) -> Result<Self> {
        if size == 0 || index >= size {
            return Err(Error::InvalidShard(format!("{}/{}", index + 1, size)));
        }
        Ok(Self { index, size })
    }

    /// Whether this shard owns the given document.
    pub fn owns(&self, doc_id: &str) -> bool {
        shard_index_of(doc_id, self.size) == self.index
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self { index: 0, size: 1 }
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index + 1, self.size)
    }
}

impl FromStr for Shard {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidShard(s.to_string());
        let (group, size) = s.split_once('/').ok_or_else(invalid)?;
        let group: i64 = group.trim().parse().map_err(|_| invalid())?;
        let size: i64 = size.trim().parse().map_err(|_| invalid())?;
        if group < 1 || size < 1 || group > size || size > i64::from(u16::MAX) {
            return Err(invalid());
        }
        Ok(Self {
            index: (group - 1) as u16,
            size: size as u16,
        })
    }
}

impl From<Shard> for String {
    fn from(shard: Shard) -> String {
        shard.to_string()
    }
}

impl TryFrom<String> for Shard {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a_32(b""), 0x811c9dc5);
        assert_eq!(fnv1a_32(b"a"), 0xe40c292c);
        assert_eq!(fnv1a_32(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_shard_index_in_range() {
        for size in 1..=10u16 {
            for i in 0..200 {
                let id = format!("doc-{}", i);
                assert!(shard_index_of(&id, size) < size);
            }
        }
    }

    #[test]
    fn test_shard_distribution() {
        const IDS: usize = 1000;
        for size in 2..=10u16 {
            let mut counts = vec![0usize; size as usize];
            for i in 0..IDS {
                counts[shard_index_of(&i.to_string(), size) as usize] += 1;
            }
            let expected = IDS as f64 / f64::from(size);
            for count in counts {
                let deviation = (count as f64 - expected).abs();
                assert!(
                    deviation <= expected * 2.0 / 3.0,
                    "size {}: {} vs {}",
                    size,
                    count,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_parse_shard() {
        let shard: Shard = "2/3".parse().unwrap();
        assert_eq!(shard, Shard { index: 1, size: 3 });
        assert_eq!(shard.to_string(), "2/3");

        for bad in ["", "1", "0/1", "3/2", "-1/2", "1/0", "a/b", "1/2/3"] {
            assert!(bad.parse::<Shard>().is_err(), "{:?} should not parse", bad);
        }
    }
}
