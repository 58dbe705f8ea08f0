//! Bridge to an external "read memory" function for addresses no section
//! covers.
use crate::asid::Asid;
use crate::error::Result;

/// A user-supplied fallback reader, consulted when no section answers a
/// read.
///
/// The spec models this as a `(fn, ctx)` pair; Rust closures capture their
/// own context, so this crate collapses that into a single `FnMut` that
/// owns whatever a C caller would thread through separately.
pub type ReadMemoryFn = Box<dyn FnMut(&mut [u8], u16, &Asid, u64) -> Result<u16>>;
