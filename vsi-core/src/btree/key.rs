//! Key definitions: how two user records stored in a tree are compared.
//!
//! A key definition is a field count plus up to [`MAX_KEY_FIELDS`] triples
//! of (type, offset-within-record, size). Comparison is lexicographic over
//! the fields; the first non-equal field decides. String fields hold the
//! offset of a NUL-terminated byte string rather than inline bytes.

use std::cmp::Ordering;

use crate::offset::{Area, Offset};
use crate::segment::Segment;

pub(crate) const MAX_KEY_FIELDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum FieldKind {
    Invalid = 0,
    I8 = 1,
    U8 = 2,
    I16 = 3,
    U16 = 4,
    I32 = 5,
    U32 = 6,
    I64 = 7,
    U64 = 8,
    Str = 9,
}

impl FieldKind {
    pub fn from_raw(raw: u32) -> Option<FieldKind> {
        Some(match raw {
            1 => FieldKind::I8,
            2 => FieldKind::U8,
            3 => FieldKind::I16,
            4 => FieldKind::U16,
            5 => FieldKind::I32,
            6 => FieldKind::U32,
            7 => FieldKind::I64,
            8 => FieldKind::U64,
            9 => FieldKind::Str,
            _ => return None,
        })
    }

    pub fn byte_size(self) -> u32 {
        match self {
            FieldKind::Invalid => 0,
            FieldKind::I8 | FieldKind::U8 => 1,
            FieldKind::I16 | FieldKind::U16 => 2,
            FieldKind::I32 | FieldKind::U32 => 4,
            // A string field stores the 8-byte offset of the string.
            FieldKind::I64 | FieldKind::U64 | FieldKind::Str => 8,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyField {
    pub kind: u32,
    pub offset: u32,
    pub size: u32,
}

/// Segment-resident comparison recipe. Embedded directly in the segment
/// header for the six root trees.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct KeyDef {
    pub field_count: u32,
    pub _pad: u32,
    pub fields: [KeyField; MAX_KEY_FIELDS],
}

impl KeyDef {
    pub fn new(fields: &[(FieldKind, u32)]) -> KeyDef {
        assert!(fields.len() <= MAX_KEY_FIELDS);
        let mut def = KeyDef {
            field_count: fields.len() as u32,
            _pad: 0,
            fields: [KeyField {
                kind: FieldKind::Invalid as u32,
                offset: 0,
                size: 0,
            }; MAX_KEY_FIELDS],
        };
        for (i, &(kind, offset)) in fields.iter().enumerate() {
            def.fields[i] = KeyField {
                kind: kind as u32,
                offset,
                size: kind.byte_size(),
            };
        }
        def
    }
}

/// One extracted (or caller-supplied) key field value.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FieldVal<'a> {
    Unsigned(u64),
    Signed(i64),
    Str(&'a [u8]),
}

fn compare_vals(a: &FieldVal<'_>, b: &FieldVal<'_>) -> Ordering {
    match (a, b) {
        (FieldVal::Unsigned(x), FieldVal::Unsigned(y)) => x.cmp(y),
        (FieldVal::Signed(x), FieldVal::Signed(y)) => x.cmp(y),
        (FieldVal::Str(x), FieldVal::Str(y)) => x.cmp(y),
        _ => panic!("vsi: key field kind mismatch"),
    }
}

/// A partially or fully specified search key, built from native values.
/// Fields are matched positionally against the tree's key definition;
/// a shorter probe compares as a prefix.
#[derive(Default)]
pub(crate) struct KeyProbe<'a> {
    vals: Vec<FieldVal<'a>>,
}

impl<'a> KeyProbe<'a> {
    pub fn new() -> KeyProbe<'a> {
        KeyProbe { vals: Vec::new() }
    }

    pub fn unsigned(mut self, v: u64) -> KeyProbe<'a> {
        self.vals.push(FieldVal::Unsigned(v));
        self
    }

    pub fn str(mut self, s: &'a str) -> KeyProbe<'a> {
        self.vals.push(FieldVal::Str(s.as_bytes()));
        self
    }
}

/// Owned key values materialised from a record, so the record can be
/// located again after the tree has shifted it around.
pub(crate) enum OwnedVal {
    Unsigned(u64),
    Signed(i64),
    Str(Vec<u8>),
}

pub(crate) struct OwnedKey {
    vals: Vec<OwnedVal>,
}

impl OwnedKey {
    pub fn probe(&self) -> KeyProbe<'_> {
        KeyProbe {
            vals: self
                .vals
                .iter()
                .map(|v| match v {
                    OwnedVal::Unsigned(x) => FieldVal::Unsigned(*x),
                    OwnedVal::Signed(x) => FieldVal::Signed(*x),
                    OwnedVal::Str(s) => FieldVal::Str(s.as_slice()),
                })
                .collect(),
        }
    }
}

/// Read one key field out of a segment-resident record.
///
/// # Safety
/// `rec` must point at a live record laid out per `field`, inside the
/// area the owning tree is based on.
unsafe fn extract_field<'a>(
    seg: &'a Segment,
    area: Area,
    rec: *const u8,
    field: &KeyField,
) -> FieldVal<'a> {
    let p = rec.add(field.offset as usize);
    let kind = FieldKind::from_raw(field.kind)
        .unwrap_or_else(|| panic!("vsi: invalid key field kind {}", field.kind));
    match kind {
        FieldKind::U8 => FieldVal::Unsigned(std::ptr::read_unaligned(p) as u64),
        FieldKind::U16 => FieldVal::Unsigned(std::ptr::read_unaligned(p as *const u16) as u64),
        FieldKind::U32 => FieldVal::Unsigned(std::ptr::read_unaligned(p as *const u32) as u64),
        FieldKind::U64 => FieldVal::Unsigned(std::ptr::read_unaligned(p as *const u64)),
        FieldKind::I8 => FieldVal::Signed(std::ptr::read_unaligned(p as *const i8) as i64),
        FieldKind::I16 => FieldVal::Signed(std::ptr::read_unaligned(p as *const i16) as i64),
        FieldKind::I32 => FieldVal::Signed(std::ptr::read_unaligned(p as *const i32) as i64),
        FieldKind::I64 => FieldVal::Signed(std::ptr::read_unaligned(p as *const i64)),
        FieldKind::Str => {
            let off = std::ptr::read_unaligned(p as *const u64);
            if off == 0 {
                // An unnamed record compares as the empty string.
                FieldVal::Str(&[])
            } else {
                let s = seg.ptr(area, Offset::new(off));
                let cstr = std::ffi::CStr::from_ptr(s as *const libc::c_char);
                FieldVal::Str(cstr.to_bytes())
            }
        }
        FieldKind::Invalid => panic!("vsi: comparison against invalid key field"),
    }
}

/// Compare a probe against a segment-resident record.
///
/// # Safety
/// `rec` must point at a live record matching `def`.
pub(crate) unsafe fn compare_probe(
    seg: &Segment,
    area: Area,
    def: &KeyDef,
    probe: &KeyProbe<'_>,
    rec: *const u8,
) -> Ordering {
    let count = (def.field_count as usize).min(probe.vals.len());
    for (val, field) in probe.vals.iter().take(count).zip(def.fields.iter()) {
        let rec_val = extract_field(seg, area, rec, field);
        let ord = compare_vals(val, &rec_val);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Compare two segment-resident records field by field.
///
/// # Safety
/// Both pointers must address live records matching `def`.
pub(crate) unsafe fn compare_records(
    seg: &Segment,
    area: Area,
    def: &KeyDef,
    a: *const u8,
    b: *const u8,
) -> Ordering {
    for field in def.fields.iter().take(def.field_count as usize) {
        let av = extract_field(seg, area, a, field);
        let bv = extract_field(seg, area, b, field);
        let ord = compare_vals(&av, &bv);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Materialise a record's full key so it can be re-located later even if
/// the record itself moves between nodes.
///
/// # Safety
/// `rec` must point at a live record matching `def`.
pub(crate) unsafe fn extract_owned(
    seg: &Segment,
    area: Area,
    def: &KeyDef,
    rec: *const u8,
) -> OwnedKey {
    let vals = def
        .fields
        .iter()
        .take(def.field_count as usize)
        .map(|field| match extract_field(seg, area, rec, field) {
            FieldVal::Unsigned(v) => OwnedVal::Unsigned(v),
            FieldVal::Signed(v) => OwnedVal::Signed(v),
            FieldVal::Str(s) => OwnedVal::Str(s.to_vec()),
        })
        .collect();
    OwnedKey { vals }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keydef_sizes_follow_kinds() {
        let def = KeyDef::new(&[(FieldKind::U32, 0), (FieldKind::Str, 16)]);
        assert_eq!(def.field_count, 2);
        assert_eq!(def.fields[0].size, 4);
        assert_eq!(def.fields[1].size, 8);
        assert_eq!(def.fields[2].kind, FieldKind::Invalid as u32);
    }

    #[test]
    fn value_comparison_is_lexicographic() {
        assert_eq!(
            compare_vals(&FieldVal::Unsigned(1), &FieldVal::Unsigned(2)),
            Ordering::Less
        );
        assert_eq!(
            compare_vals(&FieldVal::Signed(-1), &FieldVal::Signed(1)),
            Ordering::Less
        );
        assert_eq!(
            compare_vals(&FieldVal::Str(b"bar"), &FieldVal::Str(b"barn")),
            Ordering::Less
        );
        assert_eq!(
            compare_vals(&FieldVal::Str(b"bar"), &FieldVal::Str(b"bar")),
            Ordering::Equal
        );
    }
}
