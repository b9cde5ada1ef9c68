//! The typed object model.
//!
//! String payloads are the only objects shared between client argument
//! vectors, the keyspace and container entries; they are reference-counted
//! through [`Arc`]. Container payloads ([`Value::Map`], [`Value::Queue`],
//! [`Value::Fts`]) have a single owner, the keyspace, so they carry no
//! refcount at all and transfer wholesale to the lazy-free worker on delete.
//!
//! Integer strings in `0..10000` are interned in a process-lifetime table, so
//! encoding the same small integer twice yields the same allocation. The
//! table's own strong reference is never dropped, which is what makes these
//! objects shared for the life of the process.

use std::{borrow::Cow, cmp::Ordering, fmt, sync::Arc};

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::{dict::Dict, fts::Fts, minheap::MinHeap};

/// Strings up to this length are stored inline.
pub const EMBSTR_MAX: usize = 44;

/// Integer strings below this bound are interned at startup.
pub const SHARED_INTEGERS: i64 = 10_000;

/// A reference-counted string object.
pub type RStr = Arc<StrObject>;

static SHARED_INTS: Lazy<Vec<RStr>> = Lazy::new(|| {
    (0..SHARED_INTEGERS)
        .map(|v| Arc::new(StrObject::Int(v)))
        .collect()
});

/// The interned object for a small integer, if `v` is in range.
pub fn shared_int(v: i64) -> Option<RStr> {
    usize::try_from(v)
        .ok()
        .filter(|idx| *idx < SHARED_INTS.len())
        .map(|idx| Arc::clone(&SHARED_INTS[idx]))
}

/// String payload with its encoding.
pub enum StrObject {
    /// Integer-encoded string.
    Int(i64),
    /// Short string stored inline.
    Embedded { len: u8, data: [u8; EMBSTR_MAX] },
    /// Heap-allocated bytes.
    Raw(Bytes),
}

impl StrObject {
    /// Build a string object from raw bytes, choosing the embedded encoding
    /// for short payloads.
    #[must_use]
    pub fn from_slice(src: &[u8]) -> RStr {
        Arc::new(if src.len() <= EMBSTR_MAX {
            let mut data = [0u8; EMBSTR_MAX];
            data[..src.len()].copy_from_slice(src);
            Self::Embedded {
                len: src.len() as u8,
                data,
            }
        } else {
            Self::Raw(Bytes::copy_from_slice(src))
        })
    }

    /// Build a string object from an owned chunk without copying large
    /// payloads.
    #[must_use]
    pub fn from_bytes(src: Bytes) -> RStr {
        if src.len() <= EMBSTR_MAX {
            Self::from_slice(&src)
        } else {
            Arc::new(Self::Raw(src))
        }
    }

    #[must_use]
    pub fn from_int(v: i64) -> RStr {
        shared_int(v).unwrap_or_else(|| Arc::new(Self::Int(v)))
    }

    /// Try to shrink a string object to its integer encoding. Small integers
    /// come out of the shared table, so repeated encodings of the same value
    /// are pointer-identical. Objects that do not look like a canonical
    /// decimal integer are returned unchanged.
    #[must_use]
    pub fn try_encode(obj: &RStr) -> RStr {
        match **obj {
            StrObject::Int(_) => Arc::clone(obj),
            StrObject::Embedded { .. } | StrObject::Raw(_) => {
                match parse_canonical_i64(&obj.as_bytes()) {
                    Some(v) => Self::from_int(v),
                    None => Arc::clone(obj),
                }
            }
        }
    }

    pub fn as_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            Self::Int(v) => Cow::Owned(v.to_string().into_bytes()),
            Self::Embedded { len, data } => Cow::Borrowed(&data[..usize::from(*len)]),
            Self::Raw(bytes) => Cow::Borrowed(bytes),
        }
    }

    /// Length of the string representation in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Int(v) => decimal_digits(*v),
            Self::Embedded { len, .. } => usize::from(*len),
            Self::Raw(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encoding(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Embedded { .. } => "embstr",
            Self::Raw(_) => "raw",
        }
    }

    /// Interpret the object as a signed integer.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => std::str::from_utf8(&self.as_bytes())
                .ok()
                .and_then(|s| s.parse().ok()),
        }
    }

    /// Interpret the object as a finite double.
    pub fn to_f64(&self) -> Option<f64> {
        let v = match self {
            Self::Int(v) => *v as f64,
            _ => std::str::from_utf8(&self.as_bytes())
                .ok()
                .and_then(|s| s.parse().ok())?,
        };
        v.is_finite().then_some(v)
    }
}

impl fmt::Debug for StrObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "Int({v})"),
            _ => write!(f, "Str({:?})", String::from_utf8_lossy(&self.as_bytes())),
        }
    }
}

impl PartialEq for StrObject {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a == b,
            _ => self.as_bytes() == other.as_bytes(),
        }
    }
}

impl Eq for StrObject {}

/// Strict parser for the integer encoding: canonical decimal only, so the
/// byte representation survives a round trip ("+7", "07" and friends stay
/// raw strings).
fn parse_canonical_i64(buf: &[u8]) -> Option<i64> {
    if buf == b"0" {
        return Some(0);
    }
    let (neg, digits) = match buf.split_first()? {
        (b'-', rest) => (true, rest),
        _ => (false, buf),
    };
    if digits.is_empty() || digits.len() > 19 || digits[0] == b'0' {
        return None;
    }
    // Accumulate negative to cover i64::MIN.
    let mut v: i64 = 0;
    for &d in digits {
        if !d.is_ascii_digit() {
            return None;
        }
        v = v.checked_mul(10)?.checked_sub(i64::from(d - b'0'))?;
    }
    if neg {
        Some(v)
    } else {
        v.checked_neg()
    }
}

fn decimal_digits(v: i64) -> usize {
    let mut len = 1;
    let mut n = v;
    if n < 0 {
        len += 1;
    }
    while {
        n /= 10;
        n != 0
    } {
        len += 1;
    }
    len
}

/// An entry in a priority queue value.
#[derive(Debug)]
pub struct QueueItem {
    pub score: f64,
    pub value: RStr,
}

/// Queue ordering: lowest score first. Scores are checked finite on entry,
/// so the partial comparison cannot actually fail.
pub fn queue_cmp(a: &QueueItem, b: &QueueItem) -> Ordering {
    a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal)
}

/// A keyspace value: a typed payload.
#[derive(Debug)]
pub enum Value {
    Str(RStr),
    Map(Dict<RStr>),
    Queue(MinHeap<QueueItem>),
    Fts(Fts),
}

impl Value {
    #[must_use]
    pub fn new_map() -> Self {
        Self::Map(Dict::new())
    }

    #[must_use]
    pub fn new_queue() -> Self {
        Self::Queue(MinHeap::new(queue_cmp))
    }

    #[must_use]
    pub fn new_fts() -> Self {
        Self::Fts(Fts::new())
    }

    /// Name reported by the `type` command.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::Map(_) => "trie",
            Self::Queue(_) | Self::Fts(_) => "unknown",
        }
    }

    /// Amount of work needed to free this value; proportional to the number
    /// of allocations it is composed of, 1 for anything released in one go.
    pub fn lazyfree_effort(&self) -> usize {
        match self {
            Self::Map(dict) => dict.len(),
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{shared_int, StrObject, Value, EMBSTR_MAX};

    #[test]
    fn embedded_vs_raw() {
        let short = StrObject::from_slice(b"hello");
        assert_eq!(short.encoding(), "embstr");
        assert_eq!(&*short.as_bytes(), b"hello");
        assert_eq!(short.len(), 5);

        let long = StrObject::from_slice(&[b'x'; EMBSTR_MAX + 1]);
        assert_eq!(long.encoding(), "raw");
        assert_eq!(long.len(), EMBSTR_MAX + 1);
    }

    #[test]
    fn integer_encoding_round_trip() {
        let obj = StrObject::try_encode(&StrObject::from_slice(b"12345"));
        assert_eq!(obj.encoding(), "int");
        assert_eq!(&*obj.as_bytes(), b"12345");
        assert_eq!(obj.len(), 5);
        assert_eq!(obj.to_i64(), Some(12345));

        let neg = StrObject::try_encode(&StrObject::from_slice(b"-42"));
        assert_eq!(neg.encoding(), "int");
        assert_eq!(&*neg.as_bytes(), b"-42");
        assert_eq!(neg.len(), 3);
    }

    #[test]
    fn non_canonical_integers_stay_raw() {
        for input in [&b"07"[..], b"+7", b" 7", b"7 ", b"", b"12a", b"-0", b"--1"] {
            let obj = StrObject::try_encode(&StrObject::from_slice(input));
            assert_ne!(obj.encoding(), "int", "input {input:?}");
            assert_eq!(&*obj.as_bytes(), input);
        }
    }

    #[test]
    fn extreme_integers() {
        let min = StrObject::try_encode(&StrObject::from_slice(b"-9223372036854775808"));
        assert_eq!(min.to_i64(), Some(i64::MIN));
        let over = StrObject::try_encode(&StrObject::from_slice(b"9223372036854775808"));
        assert_eq!(over.encoding(), "embstr");
    }

    #[test]
    fn shared_integers_reuse_identity() {
        let a = StrObject::try_encode(&StrObject::from_slice(b"42"));
        let b = StrObject::try_encode(&StrObject::from_slice(b"42"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &shared_int(42).unwrap()));

        // Outside the shared range every encoding is a fresh allocation.
        let big_a = StrObject::try_encode(&StrObject::from_slice(b"123456"));
        let big_b = StrObject::try_encode(&StrObject::from_slice(b"123456"));
        assert!(!Arc::ptr_eq(&big_a, &big_b));
        assert!(shared_int(10_000).is_none());
        assert!(shared_int(-1).is_none());
    }

    #[test]
    fn numeric_argument_parsing() {
        assert_eq!(StrObject::from_slice(b"3.5").to_f64(), Some(3.5));
        assert_eq!(StrObject::from_slice(b"-1e2").to_f64(), Some(-100.0));
        assert_eq!(StrObject::from_slice(b"nan").to_f64(), None);
        assert_eq!(StrObject::from_slice(b"inf").to_f64(), None);
        assert_eq!(StrObject::from_slice(b"abc").to_i64(), None);
        assert_eq!(StrObject::from_int(7).to_f64(), Some(7.0));
    }

    #[test]
    fn value_type_names_and_effort() {
        assert_eq!(Value::Str(StrObject::from_int(1)).type_name(), "string");
        assert_eq!(Value::new_map().type_name(), "trie");
        assert_eq!(Value::new_queue().type_name(), "unknown");
        assert_eq!(Value::new_fts().type_name(), "unknown");

        let mut map = Value::new_map();
        if let Value::Map(dict) = &mut map {
            for i in 0..100 {
                dict.insert(format!("field{i}").as_bytes(), StrObject::from_int(i));
            }
        }
        assert_eq!(map.lazyfree_effort(), 100);
        assert_eq!(Value::new_queue().lazyfree_effort(), 1);
    }
}
