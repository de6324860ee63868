//! PEB-level I/O in UBI terms: EC/VID headers and LEB payloads, on top of a [Nand].
//!
//! Page 0 of every PEB holds the EC header, page 1 the VID header, and the LEB occupies the
//! remaining pages. LEB offsets and lengths passed here must be page-aligned for writes; reads may
//! start and end anywhere.

use anyhow::ensure;

use super::headers::{Ec, HeaderError, Vid};
use crate::nand::{FlashLayout, Nand, NandBlock, UBI_HEADER_PAGES};

const EC_HDR_PAGE: u32 = 0;
const VID_HDR_PAGE: u32 = 1;

/// What the VID header page of a PEB holds
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PebHeader {
    /// The block is marked bad and can't be read
    Bad,

    /// No VID header; the PEB is unused (or holds something UBI doesn't recognize)
    Empty,

    /// A valid VID header
    Vid(Vid),
}

/// UBI's view of a flash device
pub struct UbiIo<'n, N: Nand> {
    nand: &'n mut N,
    layout: FlashLayout,
}

impl<'n, N: Nand> UbiIo<'n, N> {
    pub fn new(nand: &'n mut N) -> anyhow::Result<Self> {
        let layout = nand.get_layout();
        layout.validate()?;
        Ok(Self { nand, layout })
    }

    pub fn layout(&self) -> FlashLayout {
        self.layout
    }

    pub fn peb_count(&self) -> u32 {
        self.layout.blocks
    }

    pub fn leb_size(&self) -> usize {
        self.layout.leb_size()
    }

    pub fn is_bad_block(&mut self, pnum: u32) -> anyhow::Result<bool> {
        Ok(self.nand.block(pnum)?.is_none())
    }

    fn read_page(&mut self, pnum: u32, page: u32) -> anyhow::Result<Option<Vec<u8>>> {
        let mut buf = vec![0; self.layout.bytes_per_page];
        match self.nand.block(pnum)? {
            None => Ok(None),
            Some(block) => {
                block.read(page, &mut buf)?;
                Ok(Some(buf))
            }
        }
    }

    /// Read the EC header, or `None` if the PEB is bad or carries no valid EC header
    pub fn read_ec_header(&mut self, pnum: u32) -> anyhow::Result<Option<Ec>> {
        Ok(self
            .read_page(pnum, EC_HDR_PAGE)?
            .and_then(|page| Ec::decode(&page).ok()))
    }

    /// Read and characterize the VID header of a PEB
    ///
    /// A page that isn't a valid VID header (erased, wrong magic, bad CRC) reads as
    /// [PebHeader::Empty]; only device failures are errors.
    pub fn read_block_header(&mut self, pnum: u32) -> anyhow::Result<PebHeader> {
        let Some(page) = self.read_page(pnum, VID_HDR_PAGE)? else {
            return Ok(PebHeader::Bad);
        };

        Ok(match Vid::decode(&page) {
            Ok(vid) => PebHeader::Vid(vid),
            Err(HeaderError::Erased | HeaderError::BadMagic) => PebHeader::Empty,
            Err(err) => {
                tracing::debug!(pnum, %err, "ignoring unreadable VID header");
                PebHeader::Empty
            }
        })
    }

    pub fn write_block_header(&mut self, pnum: u32, vid: Vid) -> anyhow::Result<()> {
        let mut page = vec![0xFF; self.layout.bytes_per_page];
        vid.encode(&mut page)?;
        self.good_block(pnum)?.program(VID_HDR_PAGE, &page)
    }

    /// Read `buf.len()` bytes of the LEB held by `pnum`, starting at `offset`
    pub fn read_block(&mut self, pnum: u32, offset: usize, buf: &mut [u8]) -> anyhow::Result<()> {
        let page_size = self.layout.bytes_per_page;
        let end = offset + buf.len();
        ensure!(end <= self.leb_size(), "read past end of LEB on PEB {pnum}");

        let first_page = offset / page_size;
        let last_page = end.div_ceil(page_size);
        let mut pages = vec![0; (last_page - first_page) * page_size];
        self.good_block(pnum)?
            .read(UBI_HEADER_PAGES + first_page as u32, &mut pages)?;

        let skip = offset - first_page * page_size;
        buf.copy_from_slice(&pages[skip..][..buf.len()]);
        Ok(())
    }

    /// Program `data` into the LEB held by `pnum`, starting at `offset`
    ///
    /// A short final page is padded with erased bytes.
    pub fn write_block(&mut self, pnum: u32, offset: usize, data: &[u8]) -> anyhow::Result<()> {
        let page_size = self.layout.bytes_per_page;
        ensure!(offset % page_size == 0, "unaligned LEB write at {offset}");
        ensure!(
            offset + data.len() <= self.leb_size(),
            "write past end of LEB on PEB {pnum}",
        );

        let mut padded;
        let mut data = data;
        if data.len() % page_size != 0 {
            padded = Vec::with_capacity(data.len().next_multiple_of(page_size));
            padded.extend_from_slice(data);
            padded.resize(data.len().next_multiple_of(page_size), 0xFF);
            data = &padded;
        }

        let page = UBI_HEADER_PAGES + (offset / page_size) as u32;
        self.good_block(pnum)?.program(page, data)
    }

    /// Erase a PEB and stamp a fresh EC header on it
    pub fn format_block(&mut self, pnum: u32, ec: Ec) -> anyhow::Result<()> {
        let mut page = vec![0xFF; self.layout.bytes_per_page];
        ec.encode(&mut page)?;

        let mut block = self.good_block(pnum)?;
        block.erase()?;
        block.program(EC_HDR_PAGE, &page)
    }

    fn good_block(&mut self, pnum: u32) -> anyhow::Result<N::Block<'_>> {
        self.nand
            .block(pnum)?
            .ok_or(anyhow::anyhow!("PEB {pnum} is bad"))
    }
}
