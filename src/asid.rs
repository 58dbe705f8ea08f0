//! Address-space identifiers and their wildcard-aware match relation.
use crate::error::{Error, Result};
use std::mem;

/// Wire shape of a user-supplied ASID: `{ size, cr3, vmcs }`.
///
/// `size` lets a caller version this struct; `Asid::from_user` rejects any
/// `size` larger than this crate's own definition, since that would mean the
/// caller is carrying fields this crate doesn't know how to interpret.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserAsid {
    pub size: usize,
    pub cr3: u64,
    pub vmcs: u64,
}

/// Sentinel value for "no cr3"/"no vmcs" on the wire.
const NO_VALUE: u64 = u64::MAX;

/// An address-space identifier: `(cr3, vmcs)`, either of which may be a
/// wildcard.
///
/// The wildcard is modeled as `None` rather than carrying a raw sentinel
/// value through application code (see `DESIGN.md`); `UserAsid` is where the
/// sentinel actually lives, at the wire boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Asid {
    pub cr3: Option<u64>,
    pub vmcs: Option<u64>,
}

impl Asid {
    /// A fully-wildcarded ASID: matches any concrete ASID.
    #[inline]
    pub const fn any() -> Self {
        Self { cr3: None, vmcs: None }
    }

    /// A concrete ASID with both fields set.
    #[inline]
    pub const fn new(cr3: u64, vmcs: u64) -> Self {
        Self { cr3: Some(cr3), vmcs: Some(vmcs) }
    }

    /// Builds an `Asid` from an optional user-supplied wire struct.
    ///
    /// A missing input yields [`Asid::any`]. A present input is rejected with
    /// [`Error::BadAsid`] if it names a struct layout larger than the one
    /// this crate understands.
    pub fn from_user(user_asid: Option<&UserAsid>) -> Result<Self> {
        let user_asid = match user_asid {
            None => return Ok(Self::any()),
            Some(u) => u,
        };
        if user_asid.size > mem::size_of::<UserAsid>() {
            return Err(Error::BadAsid);
        }
        Ok(Self {
            cr3: (user_asid.cr3 != NO_VALUE).then_some(user_asid.cr3),
            vmcs: (user_asid.vmcs != NO_VALUE).then_some(user_asid.vmcs),
        })
    }

    /// True iff `a` and `b` are compatible under the wildcard relation: for
    /// each field, either side is a wildcard, or both sides carry the same
    /// concrete value.
    pub fn matches(a: &Asid, b: &Asid) -> bool {
        Self::field_matches(a.cr3, b.cr3) && Self::field_matches(a.vmcs, b.vmcs)
    }

    #[inline]
    fn field_matches(a: Option<u64>, b: Option<u64>) -> bool {
        match (a, b) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) => a == b,
        }
    }
}
