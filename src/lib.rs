//! An in-memory model of traced process address spaces.
//!
//! An [`Image`] is a set of [`Section`]s bound to `(asid, vaddr)` locations;
//! an offline instruction-trace decoder consults it to resolve the bytes a
//! trace refers to without keeping the traced process's entire address space
//! resident. Sections are lazily mapped on first read and demand-unmapped
//! again once the image's residency cache fills up, so a decoder can work
//! over far more code than fits comfortably in memory at once.
//!
//! ```no_run
//! use trace_image::{Asid, Image};
//!
//! let mut image = Image::new(Some("my-trace".to_string()));
//! image.add_file("/bin/ls", 0, 0x2000, Asid::any(), 0x55_0000_0000)?;
//!
//! let mut buf = [0u8; 16];
//! image.read(&mut buf, 16, Asid::any(), 0x55_0000_0000)?;
//! # Ok::<(), trace_image::Error>(())
//! ```
mod asid;
mod callback;
mod error;
mod image;
mod msec;
mod section;

pub use asid::{Asid, UserAsid};
pub use callback::ReadMemoryFn;
pub use error::{Error, Result};
pub use image::{Image, DEFAULT_CAPACITY};
pub use msec::MappedSection;
pub use section::Section;
