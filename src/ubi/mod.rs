//! UBI on-flash structures and PEB-level I/O.
//!
//! UBI populates the first writable page of every PEB with an erase counter ("EC") header and, if
//! the block is in use, the second page with a volume ID ("VID") header naming the volume and
//! logical eraseblock the PEB carries. The fast-scan subsystem relies on exactly these two headers:
//! its metadata blocks are ordinary PEBs whose VID header names a reserved internal volume.

mod headers;
mod io;

pub use headers::{Ec, HeaderError, Vid, VolType, UBI_CRC};
pub use io::{PebHeader, UbiIo};

/// Volume ID of the internal layout volume (the volume table)
pub const UBI_LAYOUT_VOLUME_ID: u32 = 0x7FFFEFFF;

/// Highest number of user volumes a device can carry
pub const UBI_MAX_VOLUMES: usize = 128;

/// Internal volumes occupying slots after the user volumes
pub const UBI_INT_VOL_COUNT: usize = 1;

/// Internal-volume compatibility flag: implementations that don't know the volume may delete it
pub const UBI_COMPAT_DELETE: u8 = 1;

/// Largest erase counter UBI accepts
pub const UBI_MAX_ERASECOUNTER: u32 = 0x7FFFFFFF;
