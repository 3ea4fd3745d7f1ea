// src/models/key_state.rs
//! Key-state snapshots and signing thresholds.
//!
//! A [`KeyState`] is a point-in-time copy of an identifier's current signing keys
//! and next-key commitments as seen by the party that queried it. Snapshots go
//! stale as soon as the identifier rotates, so they are refreshed right before
//! every event that embeds them.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Sequence number and digest of the latest establishment event.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct EstablishmentEvent {
    #[serde(deserialize_with = "hex_number")]
    pub s: String,
    pub d: String,
}

/// Current/next key commitments of one identifier.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeyState {
    #[serde(rename = "i")]
    pub prefix: String,
    /// Sequence number, lowercase hex
    #[serde(rename = "s", deserialize_with = "hex_number")]
    pub sequence: String,
    /// Digest of the latest event
    #[serde(rename = "d")]
    pub digest: String,
    #[serde(rename = "k", default)]
    pub keys: Vec<String>,
    #[serde(rename = "n", default)]
    pub next_digests: Vec<String>,
    #[serde(rename = "kt", default)]
    pub signing_threshold: Threshold,
    #[serde(rename = "nt", default)]
    pub next_threshold: Threshold,
    #[serde(rename = "b", default)]
    pub witnesses: Vec<String>,
    /// Witness threshold (toad), lowercase hex
    #[serde(rename = "bt", default, deserialize_with = "hex_number")]
    pub witness_threshold: String,
    /// Delegator prefix, empty when not delegated
    #[serde(rename = "di", default)]
    pub delegator: String,
    #[serde(default)]
    pub ee: EstablishmentEvent,
}

impl KeyState {
    /// Hex fields are checked on deserialization; an unset toad reads as 0.
    pub fn sn(&self) -> u64 {
        parse_hex(&self.sequence).unwrap_or_default()
    }

    pub fn toad(&self) -> u64 {
        parse_hex(&self.witness_threshold).unwrap_or_default()
    }

    pub fn delegator(&self) -> Option<&str> {
        if self.delegator.is_empty() {
            None
        } else {
            Some(&self.delegator)
        }
    }

    /// Whether `other` describes the same identifier at the same event.
    pub fn same_event(&self, other: &KeyState) -> bool {
        self.prefix == other.prefix && self.sn() == other.sn() && self.digest == other.digest
    }
}

pub(crate) fn parse_hex(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

/// Accepts a lowercase hex number, keeping its text form.
fn hex_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    match parse_hex(&raw) {
        Some(_) => Ok(raw),
        None => Err(serde::de::Error::custom(format!("invalid hex number {:?}", raw))),
    }
}

/// Signing or rotation threshold: either a plain count of signers or a list of
/// fractional weights, one per member key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Threshold {
    Count(u64),
    Weighted(Vec<String>),
}

impl Default for Threshold {
    fn default() -> Self {
        Threshold::Count(1)
    }
}

impl Threshold {
    /// Whether signatures from the members at `signers` (indices into the
    /// ordered member list) meet the threshold.
    pub fn is_satisfied(&self, signers: &[usize]) -> bool {
        let mut unique: Vec<usize> = signers.to_vec();
        unique.sort_unstable();
        unique.dedup();
        match self {
            Threshold::Count(m) => unique.len() as u64 >= *m,
            Threshold::Weighted(weights) => {
                let (mut num, mut den) = (0u64, 1u64);
                for idx in unique {
                    let Some((n, d)) = weights.get(idx).and_then(|w| parse_weight(w)) else {
                        continue;
                    };
                    num = num * d + n * den;
                    den *= d;
                    let g = gcd(num, den);
                    num /= g;
                    den /= g;
                }
                num >= den
            }
        }
    }

    /// Equal fractional weights for `members` signers, e.g. `["1/3","1/3","1/3"]`.
    pub fn equal_weights(members: usize) -> Self {
        Threshold::Weighted(vec![format!("1/{}", members.max(1)); members])
    }
}

fn parse_weight(raw: &str) -> Option<(u64, u64)> {
    match raw.split_once('/') {
        Some((n, d)) => {
            let d: u64 = d.trim().parse().ok()?;
            (d > 0).then_some(())?;
            Some((n.trim().parse().ok()?, d))
        }
        None => Some((raw.trim().parse().ok()?, 1)),
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 {
        a.max(1)
    } else {
        gcd(b, a % b)
    }
}

impl Serialize for Threshold {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Threshold::Count(m) => serializer.serialize_str(&format!("{:x}", m)),
            Threshold::Weighted(weights) => weights.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Threshold {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_u64()
                .map(Threshold::Count)
                .ok_or_else(|| serde::de::Error::custom("threshold must be unsigned")),
            Value::String(s) => parse_hex(&s)
                .map(Threshold::Count)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid hex threshold {:?}", s))),
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(serde::de::Error::custom(format!("bad weight {}", other))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Threshold::Weighted),
            other => Err(serde::de::Error::custom(format!("bad threshold {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_weighted_threshold_two_of_three() {
        let kt = Threshold::Weighted(vec!["1/2".into(), "1/2".into(), "1/2".into()]);
        assert!(!kt.is_satisfied(&[0]));
        assert!(kt.is_satisfied(&[0, 2]));
        // duplicates count once
        assert!(!kt.is_satisfied(&[1, 1]));

        let thirds = Threshold::equal_weights(3);
        assert!(!thirds.is_satisfied(&[0, 1]));
        assert!(thirds.is_satisfied(&[0, 1, 2]));
    }

    #[test]
    fn test_count_threshold() {
        let kt = Threshold::Count(2);
        assert!(!kt.is_satisfied(&[4]));
        assert!(kt.is_satisfied(&[0, 4]));
    }

    #[test]
    fn test_parse_agent_key_state() {
        let state: KeyState = serde_json::from_value(json!({
            "i": "EMember1", "s": "a", "d": "EDigest",
            "k": ["DKey"], "n": ["ENext"], "kt": "1", "nt": "1",
            "b": ["BWit"], "bt": "1", "di": "",
            "ee": {"s": "a", "d": "EDigest"}
        }))
        .unwrap();
        assert_eq!(state.sn(), 10);
        assert_eq!(state.toad(), 1);
        assert_eq!(state.signing_threshold, Threshold::Count(1));
        assert!(state.delegator().is_none());

        let weighted: Threshold = serde_json::from_value(json!(["1/3", "1/3", "1/3"])).unwrap();
        assert_eq!(weighted, Threshold::equal_weights(3));
        assert_eq!(serde_json::to_value(Threshold::Count(11)).unwrap(), json!("b"));
    }

    #[test]
    fn test_malformed_hex_is_rejected() {
        let state = |s: &str, bt: &str| {
            serde_json::from_value::<KeyState>(json!({"i": "EMember1", "s": s, "d": "EDigest", "bt": bt}))
        };
        assert!(state("1", "0").is_ok());
        let err = state("zz", "0").unwrap_err();
        assert!(err.to_string().contains("invalid hex number"));
        assert!(state("", "0").is_err());
        assert!(state("1", "-1").is_err());
        assert!(serde_json::from_value::<Threshold>(json!("two")).is_err());

        // an absent toad still defaults
        let bare: KeyState = serde_json::from_value(json!({"i": "EMember1", "s": "0", "d": "EDigest"})).unwrap();
        assert_eq!(bare.toad(), 0);
    }
}
