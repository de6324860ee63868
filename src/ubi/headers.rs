//! This module contains the code necessary to read and write EC/VID headers, with CRC
//! verification/computation.

use crc::{Crc, CRC_32_JAMCRC};
pub use deku::{DekuContainerRead, DekuContainerWrite};
use income::{EcHdr, VidHdr, UBI_EC_HDR_MAGIC, UBI_VID_HDR_MAGIC};
use thiserror::Error;

use crate::nand::PageUtil;

pub const UBI_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);
const UBI_VERSION: u8 = 1;

/// Why a page did not yield a usable header
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum HeaderError {
    #[error("page is erased")]
    Erased,
    #[error("header magic or version mismatch")]
    BadMagic,
    #[error("header CRC mismatch")]
    BadCrc,
    #[error("header fields out of range")]
    Malformed,
}

/// Parsing of UBI headers from byteslices, with magic and CRC verification.
pub trait ParseHeader<'a>: Sized + DekuContainerRead<'a> + ComputeCrc {
    fn get_magic() -> &'static [u8];
    fn get_hdr_magic(&self) -> &[u8];
    fn get_hdr_version(&self) -> u8;

    fn parse(buf: &'a [u8]) -> Result<Self, HeaderError> {
        if buf.is_erased() {
            return Err(HeaderError::Erased);
        }

        // Checked on the raw bytes: the deku structs assert their magic while parsing
        let magic = Self::get_magic();
        if !buf.starts_with(magic) || buf.get(magic.len()) != Some(&UBI_VERSION) {
            return Err(HeaderError::BadMagic);
        }

        let (_, header) = Self::from_bytes((buf, 0)).map_err(|_| HeaderError::Malformed)?;

        if (header.get_hdr_magic(), header.get_hdr_version()) != (magic, UBI_VERSION) {
            return Err(HeaderError::BadMagic);
        }

        if !header.check_crc() {
            return Err(HeaderError::BadCrc);
        }

        Ok(header)
    }
}

impl ParseHeader<'_> for EcHdr {
    fn get_magic() -> &'static [u8] {
        UBI_EC_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

impl ParseHeader<'_> for VidHdr {
    fn get_magic() -> &'static [u8] {
        UBI_VID_HDR_MAGIC
    }
    fn get_hdr_magic(&self) -> &[u8] {
        &self.magic
    }
    fn get_hdr_version(&self) -> u8 {
        self.version
    }
}

/// Computes the trailing CRC of a Vid/Ec header over every byte before it
pub trait ComputeCrc: DekuContainerWrite {
    fn compute_crc(&self) -> u32 {
        // Both header structs are plain fixed-size fields, so serialization can't fail
        let header_bytes = self.to_bytes().unwrap_or_default();
        let header_len = header_bytes.len().saturating_sub(std::mem::size_of::<u32>());
        UBI_CRC.checksum(&header_bytes[..header_len])
    }

    fn check_crc(&self) -> bool {
        self.get_crc() == self.compute_crc()
    }

    fn fix_crc(&mut self) {
        self.set_crc(self.compute_crc())
    }

    fn get_crc(&self) -> u32;
    fn set_crc(&mut self, crc: u32);
}

impl ComputeCrc for EcHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}
impl ComputeCrc for VidHdr {
    fn get_crc(&self) -> u32 {
        self.hdr_crc
    }
    fn set_crc(&mut self, crc: u32) {
        self.hdr_crc = crc;
    }
}

/// Copy serialized header bytes to the front of a page buffer
fn place(bytes: &[u8], out_bytes: &mut [u8]) -> anyhow::Result<()> {
    let out_bytes = out_bytes
        .get_mut(..bytes.len())
        .ok_or(anyhow::anyhow!("out_bytes too small"))?;
    out_bytes.copy_from_slice(bytes);
    Ok(())
}

/// The EC header fields this crate cares about
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Ec {
    pub ec: u64,
    pub vid_hdr_offset: u32,
    pub data_offset: u32,
    pub image_seq: u32,
}

impl Ec {
    pub fn ec(mut self, ec: u64) -> Self {
        self.ec = ec;
        self
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        EcHdr::parse(bytes).map(Into::into)
    }

    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        place(&EcHdr::from(self).to_bytes()?, out_bytes)
    }
}

impl From<EcHdr> for Ec {
    fn from(value: EcHdr) -> Self {
        let EcHdr {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
            ..
        } = value;

        Self {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        }
    }
}

impl From<Ec> for EcHdr {
    fn from(value: Ec) -> EcHdr {
        let Ec {
            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,
        } = value;

        let mut target = Self {
            magic: *b"UBI#",
            version: UBI_VERSION,

            ec,
            vid_hdr_offset,
            data_offset,
            image_seq,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
        };

        target.fix_crc();
        target
    }
}

/// UBI volume types, as stored in VID headers and fast-scan volume records
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub enum VolType {
    /// A volume that may be read and written in random order
    #[default]
    Dynamic,

    /// A volume that is read-only after it is initially written, except for whole-volume updates
    Static,
}

impl From<VolType> for u8 {
    fn from(value: VolType) -> Self {
        match value {
            VolType::Dynamic => 1,
            VolType::Static => 2,
        }
    }
}

impl TryFrom<u8> for VolType {
    type Error = HeaderError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Dynamic),
            2 => Ok(Self::Static),
            _ => Err(HeaderError::Malformed),
        }
    }
}

/// The VID header fields this crate cares about
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct Vid {
    pub vol_type: VolType,

    /// Whether this PEB was written as a copy of another, for wear-leveling purposes.
    pub copy_flag: bool,

    /// For internal volumes, flags indicating how UBI should handle the volume.
    pub compat: u8,

    pub vol_id: u32,

    /// The offset of the LEB within this volume.
    pub lnum: u32,

    pub data_size: u32,
    pub used_ebs: u32,
    pub data_pad: u32,
    pub data_crc: u32,

    /// A unique counter greater than any other VID header written, for resolving `vol_id:lnum`
    /// collisions.
    pub sqnum: u64,
}

impl Vid {
    pub fn sqnum(mut self, sqnum: u64) -> Self {
        self.sqnum = sqnum;
        self
    }

    pub fn lnum(mut self, lnum: u32) -> Self {
        self.lnum = lnum;
        self
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        VidHdr::parse(bytes)?.try_into()
    }

    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        place(&VidHdr::from(self).to_bytes()?, out_bytes)
    }
}

impl TryFrom<VidHdr> for Vid {
    type Error = HeaderError;

    fn try_from(value: VidHdr) -> Result<Self, Self::Error> {
        let VidHdr {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
            ..
        } = value;

        Ok(Self {
            vol_type: vol_type.try_into()?,
            copy_flag: copy_flag != 0,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        })
    }
}

impl From<Vid> for VidHdr {
    fn from(value: Vid) -> VidHdr {
        let Vid {
            vol_type,
            copy_flag,
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,
        } = value;

        let mut target = Self {
            magic: *b"UBI!",
            version: UBI_VERSION,

            vol_type: vol_type.into(),
            copy_flag: copy_flag.into(),
            compat,
            vol_id,
            lnum,
            data_size,
            used_ebs,
            data_pad,
            data_crc,
            sqnum,

            hdr_crc: Default::default(),
            padding1: Default::default(),
            padding2: Default::default(),
            padding3: Default::default(),
        };

        target.fix_crc();
        target
    }
}

#[test]
fn test_encode() -> anyhow::Result<()> {
    let ec = Ec::default().ec(42);
    let vid = Vid {
        vol_id: 0x7FFFF000,
        compat: 1,
        lnum: 3,
        sqnum: 99,
        ..Default::default()
    };

    let mut buf = vec![0xFFu8; 1024];
    assert_eq!(Ec::decode(&buf), Err(HeaderError::Erased));

    ec.encode(&mut buf)?;
    assert_eq!(Ec::decode(&buf), Ok(ec));
    assert_eq!(Vid::decode(&buf), Err(HeaderError::BadMagic));

    vid.encode(&mut buf)?;
    assert_eq!(Vid::decode(&buf), Ok(vid));

    // Corrupt a field covered by the CRC
    buf[12] ^= 0x01;
    assert_eq!(Vid::decode(&buf), Err(HeaderError::BadCrc));
    buf[12] ^= 0x01;

    let mut bad_magic = buf.clone();
    bad_magic[1] ^= 0x20;
    assert_eq!(Vid::decode(&bad_magic), Err(HeaderError::BadMagic));
    let mut bad_version = buf.clone();
    bad_version[4] = UBI_VERSION + 1;
    assert_eq!(Vid::decode(&bad_version), Err(HeaderError::BadMagic));

    assert!(vid.encode(&mut [0u8; 8]).is_err());
    Ok(())
}
