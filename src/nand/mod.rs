//! Abstractions over raw NAND flash, plus a simulated device for tests and tooling.
//!
//! Everything above this layer addresses flash as physical eraseblocks (PEBs) made of pages.
//! The fast-scan code never touches a device directly; it goes through [crate::ubi::UbiIo], which
//! is built on the [Nand] trait defined here.

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};

/// Number of pages at the start of every PEB that hold UBI headers: page 0 for the EC header,
/// page 1 for the VID header. The LEB begins right after.
pub const UBI_HEADER_PAGES: u32 = 2;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// Geometry of a flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FlashLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
}

impl FlashLayout {
    /// Size of a whole PEB in bytes
    pub fn peb_size(&self) -> usize {
        self.pages_per_block as usize * self.bytes_per_page
    }

    /// Size of the LEB carried by each PEB: the block minus the EC and VID header pages
    pub fn leb_size(&self) -> usize {
        self.pages_per_block.saturating_sub(UBI_HEADER_PAGES) as usize * self.bytes_per_page
    }

    /// Reject geometries that can't hold the UBI headers plus at least one data page
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.blocks > 0, "flash has no blocks");
        ensure!(self.bytes_per_page > 0, "page size must be nonzero");
        ensure!(
            self.pages_per_block > UBI_HEADER_PAGES,
            "blocks need more than {UBI_HEADER_PAGES} pages to carry data",
        );
        Ok(())
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES"
impl FromStr for FlashLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#"))?;

        let layout = FlashLayout {
            blocks: blocks.parse()?,
            pages_per_block: pages_per_block.parse()?,
            bytes_per_page: bytes_per_page.parse()?,
        };
        layout.validate()?;
        Ok(layout)
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> FlashLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Pages must be programmed in ascending order: writing a page makes it and every skipped
    /// page below it nonwritable until the next erase.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// Failure modes that can be armed on a [SimNand] block
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SimFault {
    /// Every read of the block fails
    Read,

    /// Every program of the block fails
    Program,
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: FlashLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    page_count: u32,
    page_size: usize,
    marked_bad: bool,
    fault: Option<SimFault>,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: FlashLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize].into_boxed_slice();

        Self { blocks, layout }
    }

    /// Arm a fault on a block; it persists until [SimNand::clear_faults]
    pub fn inject_fault(&mut self, index: u32, fault: SimFault) -> anyhow::Result<()> {
        let Some(block) = self.blocks.get_mut(index as usize) else {
            bail!("block {index} out of range");
        };
        block.fault = Some(fault);
        Ok(())
    }

    /// Disarm every injected fault
    pub fn clear_faults(&mut self) {
        self.blocks.iter_mut().for_each(|b| b.fault = None);
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// Blocks that were saved as bad (filled with the `0xBD` marker) are marked bad again.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.peb_size()];

        for mut block in self.blocks.iter_mut() {
            read.read_exact(&mut buf)?;
            block.data.clear();
            block.marked_bad = buf.iter().all(|&b| b == SimBlock::BAD_FILL);
            if !block.marked_bad {
                block.program(0, &buf)?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.peb_size()];

        for block in 0..self.layout.blocks {
            match self.block(block)? {
                None => buf.fill(SimBlock::BAD_FILL),
                Some(block) => block.read(0, &mut buf)?,
            };

            write.write_all(&buf)?;
        }

        Ok(())
    }
}

/// Per-block bookkeeping for [SimNand]
///
/// Unwritten pages read back as erased. Writes are append-only until the next erase.
impl SimBlock {
    const BAD_FILL: u8 = 0xBD;

    fn new(layout: FlashLayout) -> Self {
        Self {
            data: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            marked_bad: false,
            fault: None,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");
        ensure!(self.fault != Some(SimFault::Program), "simulated program failure");

        let begin = index as usize * self.page_size;

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");
        ensure!(self.fault != Some(SimFault::Read), "simulated read failure");

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        match self.data.get(begin..end) {
            Some(page) => content.copy_from_slice(page),
            None => content.fill(0xFF),
        }

        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn get_layout(&self) -> FlashLayout {
        self.layout
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        for (page, chunk) in (start_page..).zip(content.chunks_mut(self.page_size)) {
            self.read_page(page, chunk)?;
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        for (page, chunk) in (start_page..).zip(content.chunks(self.page_size)) {
            self.write_page(page, chunk)?;
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        self.data.clear();
        Ok(())
    }

    fn mark_bad(self) -> anyhow::Result<()> {
        self.data.clear();
        self.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TEST_LAYOUT: FlashLayout = FlashLayout {
        blocks: 8,
        pages_per_block: 16,
        bytes_per_page: 256,
    };

    #[test]
    fn test_layout_parse() -> anyhow::Result<()> {
        let layout: FlashLayout = "8x16x256".parse()?;
        assert_eq!(layout, TEST_LAYOUT);
        assert_eq!(layout.leb_size(), 14 * 256);
        assert_eq!(layout.peb_size(), 16 * 256);

        assert!("8x16".parse::<FlashLayout>().is_err());
        assert!("8x2x256".parse::<FlashLayout>().is_err());
        assert!("0x16x256".parse::<FlashLayout>().is_err());
        Ok(())
    }

    #[test]
    fn test_sim_block() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        assert!(nand.block(0).unwrap().is_some());
        assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
        assert!(nand.block(TEST_LAYOUT.blocks).is_err());
    }

    #[test]
    fn test_sim_mark_bad() {
        let mut nand = SimNand::new(TEST_LAYOUT);
        nand.block(0).unwrap().unwrap().mark_bad().unwrap();
        assert!(nand.block(0).unwrap().is_none());
        assert!(nand.block(1).unwrap().is_some());
    }

    #[test]
    fn test_sim_read_write() {
        let mut nand = SimNand::new(TEST_LAYOUT);

        let data_in = vec![0xA5u8; TEST_LAYOUT.bytes_per_page];
        let mut data_out = data_in.clone();

        let mut block = nand.block(0).unwrap().unwrap();
        block.program(2, &data_in).unwrap();
        assert!(block.program(1, &data_in).is_err());

        block.read(1, &mut data_out).unwrap();
        assert!(data_out.is_erased());

        block.read(2, &mut data_out).unwrap();
        assert_eq!(data_out, data_in);

        block.erase().unwrap();
        block.program(1, &data_in).unwrap();
    }

    #[test]
    fn test_sim_faults() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let mut page = vec![0u8; TEST_LAYOUT.bytes_per_page];

        nand.inject_fault(3, SimFault::Read)?;
        nand.inject_fault(4, SimFault::Program)?;

        assert!(nand.block(3)?.unwrap().read(0, &mut page).is_err());
        assert!(nand.block(4)?.unwrap().program(0, &page).is_err());
        nand.block(4)?.unwrap().read(0, &mut page)?;

        nand.clear_faults();
        nand.block(3)?.unwrap().read(0, &mut page)?;
        nand.block(4)?.unwrap().program(0, &page)?;
        Ok(())
    }

    #[test]
    fn test_sim_save_load() -> anyhow::Result<()> {
        let mut nand = SimNand::new(TEST_LAYOUT);
        let page = vec![0x55u8; TEST_LAYOUT.bytes_per_page];
        nand.block(0)?.unwrap().program(3, &page)?;
        nand.block(5)?.unwrap().mark_bad()?;

        let mut image = Vec::new();
        nand.save(&mut image)?;
        assert_eq!(image.len(), TEST_LAYOUT.peb_size() * TEST_LAYOUT.blocks as usize);

        let mut copy = SimNand::new(TEST_LAYOUT);
        copy.load(&mut &image[..])?;
        assert!(copy.block(5)?.is_none());

        let mut out = vec![0u8; TEST_LAYOUT.bytes_per_page];
        copy.block(0)?.unwrap().read(3, &mut out)?;
        assert_eq!(out, page);
        Ok(())
    }
}
