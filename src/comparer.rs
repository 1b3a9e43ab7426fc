//! Key ordering.
//!
//! A [`Comparer`] defines a total order over user keys. The comparer's name
//! is written into the manifest when a store is created and must match on
//! every reopen, since the order is baked into every table file and into the
//! level structure itself.

use std::cmp::Ordering;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};

use crate::keys::{self, KeyKind};

/// A total order over user keys, plus the key-shortening hooks the table
/// writer uses to build small index entries.
pub trait Comparer: Send + Sync {
    /// Name persisted in the manifest. Changing the order of an existing
    /// comparer requires a new name.
    fn name(&self) -> &str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Returns a user key `s` with `a <= s < b`; the table writer shortens
    /// index separators with this (via [`InternalComparer::separator`],
    /// which reattaches the tag). `a < b` is a precondition.
    fn separator(&self, a: &[u8], b: &[u8]) -> Vec<u8>;

    /// Returns a user key `s >= a`, used for the final index entry of a
    /// table (via [`InternalComparer::successor`]).
    fn successor(&self, a: &[u8]) -> Vec<u8>;
}

/// Lexicographic byte order, the default comparer.
pub struct BytewiseComparer;

impl Comparer for BytewiseComparer {
    fn name(&self) -> &str {
        "emberdb.BytewiseComparer"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn separator(&self, a: &[u8], b: &[u8]) -> Vec<u8> {
        // Find the first differing byte. If it can be bumped without
        // reaching b, the shortened prefix still sorts in [a, b). A 0xff
        // byte cannot be bumped; checking before adding keeps the
        // increment from overflowing.
        let n = a.len().min(b.len());
        let mut i = 0;
        while i < n && a[i] == b[i] {
            i += 1;
        }
        if i < n && a[i] < 0xfe {
            let c = a[i] + 1;
            if c < b[i] {
                let mut dst = a[..i].to_vec();
                dst.push(c);
                return dst;
            }
        }
        a.to_vec()
    }

    fn successor(&self, a: &[u8]) -> Vec<u8> {
        // Bump the first byte below 0xfe; a run of 0xfe/0xff bytes has no
        // short successor and a is returned whole.
        for (i, &c) in a.iter().enumerate() {
            if c < 0xfe {
                let mut dst = a[..i].to_vec();
                dst.push(c + 1);
                return dst;
            }
        }
        a.to_vec()
    }
}

/// Orders internal keys: user key ascending per the wrapped comparer, then
/// sequence number descending, so newer entries sort earlier.
#[derive(Clone)]
pub struct InternalComparer {
    ucmp: Arc<dyn Comparer>,
}

impl InternalComparer {
    pub fn new(ucmp: Arc<dyn Comparer>) -> Self {
        Self { ucmp }
    }

    /// The wrapped user-key comparer.
    pub fn user(&self) -> &Arc<dyn Comparer> {
        &self.ucmp
    }

    pub fn ucompare(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.ucmp.compare(a, b)
    }

    /// Compares two encoded internal keys. Keys shorter than the 8-byte tag
    /// fall back to byte order; they only occur in corrupt input and the
    /// callers that can see them surface Corruption separately.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        if a.len() < keys::TAG_LEN || b.len() < keys::TAG_LEN {
            return a.cmp(b);
        }
        let (aukey, atag) = keys::split_ikey(a);
        let (bukey, btag) = keys::split_ikey(b);
        match self.ucmp.compare(aukey, bukey) {
            Ordering::Equal => btag.cmp(&atag),
            ord => ord,
        }
    }

    /// Separator between two internal keys, for index entries: an internal
    /// key `s` with `a <= s < b` in this comparer's order.
    ///
    /// The user-key portions are shortened by the user comparer and, when
    /// that produced a strictly shorter, strictly larger user key, the
    /// maximal tag is attached so `s` still sorts before every real entry
    /// of its user key. Otherwise `a` is returned whole, which is always
    /// correct. Tags are never compared bytewise.
    pub fn separator(&self, a: &[u8], b: &[u8]) -> Vec<u8> {
        if a.len() < keys::TAG_LEN || b.len() < keys::TAG_LEN {
            return a.to_vec();
        }
        let (aukey, _) = keys::split_ikey(a);
        let (bukey, _) = keys::split_ikey(b);
        let short = self.ucmp.separator(aukey, bukey);
        if short.len() < aukey.len() && self.ucmp.compare(aukey, &short) == Ordering::Less {
            let mut dst = short;
            push_seek_tag(&mut dst);
            return dst;
        }
        a.to_vec()
    }

    /// Successor of an internal key, for the final index entry: an
    /// internal key `s >= a` in this comparer's order.
    pub fn successor(&self, a: &[u8]) -> Vec<u8> {
        if a.len() < keys::TAG_LEN {
            return a.to_vec();
        }
        let (aukey, _) = keys::split_ikey(a);
        let short = self.ucmp.successor(aukey);
        if short.len() < aukey.len() && self.ucmp.compare(aukey, &short) == Ordering::Less {
            let mut dst = short;
            push_seek_tag(&mut dst);
            return dst;
        }
        a.to_vec()
    }
}

/// Appends the tag that sorts first among a user key's entries: the
/// maximum sequence number with the Value kind.
fn push_seek_tag(dst: &mut Vec<u8>) {
    let mut tag = [0u8; keys::TAG_LEN];
    LittleEndian::write_u64(&mut tag, keys::MAX_SEQ << 8 | KeyKind::Value as u64);
    dst.extend_from_slice(&tag);
}

/// Returns the internal key that sorts before every entry of `ukey`:
/// the maximum sequence number with the Value kind.
pub fn ikey_for_seek(ukey: &[u8], seq: u64) -> Vec<u8> {
    keys::make_ikey(ukey, seq, KeyKind::Value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::make_ikey;

    #[test]
    fn test_bytewise_separator() {
        let cmp = BytewiseComparer;
        // First differing byte can be bumped.
        assert_eq!(cmp.separator(b"abcd", b"abcf"), b"abce".to_vec());
        // a is a prefix of b, no shortening possible.
        assert_eq!(cmp.separator(b"abcd", b"abcde"), b"abcd".to_vec());
        // Bump would reach b, keep a.
        assert_eq!(cmp.separator(b"abcd", b"abce"), b"abcd".to_vec());
        // 0xff run cannot be bumped.
        assert_eq!(
            cmp.separator(&[0xff, 0xfe], &[0xff, 0xff]),
            vec![0xff, 0xfe]
        );
    }

    #[test]
    fn test_bytewise_successor() {
        let cmp = BytewiseComparer;
        assert_eq!(cmp.successor(b"abc"), b"b".to_vec());
        assert_eq!(cmp.successor(&[0xff, 0xff, 0xfd]), vec![0xff, 0xff, 0xfe]);
        assert_eq!(cmp.successor(&[0xff, 0xff]), vec![0xff, 0xff]);
    }

    #[test]
    fn test_bytewise_high_bytes_do_not_overflow() {
        let cmp = BytewiseComparer;
        // 0xff bytes are unbumpable; the walk must pass over them without
        // the increment wrapping (or panicking in debug builds).
        assert_eq!(cmp.successor(&[0xff]), vec![0xff]);
        assert_eq!(cmp.successor(&[0xff, 0x10]), vec![0xff, 0x11]);
        assert_eq!(cmp.successor(&[0xfe, 0xff]), vec![0xfe, 0xff]);

        let s = cmp.successor(&[0xff, 0x03]);
        assert!(cmp.compare(&[0xff, 0x03], &s) != Ordering::Greater, "s >= a");

        // Separator where the differing byte sits after 0xff prefix bytes.
        let s = cmp.separator(&[0xff, 0x01], &[0xff, 0x07]);
        assert_eq!(s, vec![0xff, 0x02]);
        // Differing byte of 0xfe cannot be bumped below b.
        assert_eq!(cmp.separator(&[0xfe], &[0xff]), vec![0xfe]);
    }

    #[test]
    fn test_separator_contract() {
        let cmp = BytewiseComparer;
        let cases: Vec<(&[u8], &[u8])> = vec![
            (b"abcd", b"abcf"),
            (b"a", b"b"),
            (b"hello", b"world"),
            (b"k001", b"k002"),
        ];
        for (a, b) in cases {
            let s = cmp.separator(a, b);
            assert!(cmp.compare(a, &s) != Ordering::Greater, "a <= s");
            assert!(cmp.compare(&s, b) == Ordering::Less, "s < b");
        }
    }

    #[test]
    fn test_internal_order() {
        let icmp = InternalComparer::new(Arc::new(BytewiseComparer));

        let a5 = make_ikey(b"a", 5, KeyKind::Value);
        let a3 = make_ikey(b"a", 3, KeyKind::Value);
        let b1 = make_ikey(b"b", 1, KeyKind::Value);

        // Same user key: higher sequence sorts first.
        assert_eq!(icmp.compare(&a5, &a3), Ordering::Less);
        // Different user keys: user order wins regardless of sequence.
        assert_eq!(icmp.compare(&a3, &b1), Ordering::Less);
        assert_eq!(icmp.compare(&a5, &a5), Ordering::Equal);
    }

    #[test]
    fn test_internal_order_deletion_tag() {
        let icmp = InternalComparer::new(Arc::new(BytewiseComparer));
        // Equal sequence: Deletion (kind 2) sorts before Value (kind 1).
        let del = make_ikey(b"k", 7, KeyKind::Deletion);
        let val = make_ikey(b"k", 7, KeyKind::Value);
        assert_eq!(icmp.compare(&del, &val), Ordering::Less);
    }

    #[test]
    fn test_internal_separator_contract() {
        let icmp = InternalComparer::new(Arc::new(BytewiseComparer));
        let cases = vec![
            // Shortenable user keys.
            (make_ikey(b"abcdef", 5, KeyKind::Value), make_ikey(b"abcz", 3, KeyKind::Value)),
            // Same user key across the boundary: only the tag differs.
            (make_ikey(b"dup", 9, KeyKind::Value), make_ikey(b"dup", 2, KeyKind::Value)),
            // One user key is a byte-wise prefix of the other, with the
            // longer key's next byte below the tag's kind byte.
            (make_ikey(b"ab", 4, KeyKind::Value), make_ikey(b"ab\x00x", 8, KeyKind::Value)),
            (make_ikey(b"a", 1, KeyKind::Deletion), make_ikey(b"b", 1, KeyKind::Value)),
        ];
        for (a, b) in cases {
            assert_eq!(icmp.compare(&a, &b), Ordering::Less, "case precondition");
            let s = icmp.separator(&a, &b);
            assert!(icmp.compare(&a, &s) != Ordering::Greater, "a <= s");
            assert_eq!(icmp.compare(&s, &b), Ordering::Less, "s < b");
        }
    }

    #[test]
    fn test_internal_separator_shortens_user_key() {
        let icmp = InternalComparer::new(Arc::new(BytewiseComparer));
        let a = make_ikey(b"abcdef", 5, KeyKind::Value);
        let b = make_ikey(b"abcz", 3, KeyKind::Value);
        let s = icmp.separator(&a, &b);
        // "abce" plus the seek tag: shorter than a, still an internal key.
        assert_eq!(keys::ukey(&s), b"abce");
        let (_, seq, kind) = keys::parse_ikey(&s).expect("separator is an internal key");
        assert_eq!(seq, keys::MAX_SEQ);
        assert_eq!(kind, KeyKind::Value);
        // The seek tag sorts before every attainable entry of "abce".
        let real = make_ikey(b"abce", keys::MAX_SEQ - 1, KeyKind::Deletion);
        assert_eq!(icmp.compare(&s, &real), Ordering::Less);
    }

    #[test]
    fn test_internal_successor() {
        let icmp = InternalComparer::new(Arc::new(BytewiseComparer));

        // Shortenable: "abc" -> "b" plus the seek tag.
        let a = make_ikey(b"abc", 7, KeyKind::Value);
        let s = icmp.successor(&a);
        assert_eq!(keys::ukey(&s), b"b");
        assert!(icmp.compare(&a, &s) != Ordering::Greater, "s >= a");

        // All-0xff user key has no successor; a comes back whole.
        let a = make_ikey(&[0xff, 0xff], 7, KeyKind::Value);
        assert_eq!(icmp.successor(&a), a);
    }
}
