//! Descriptor memory manager
//!
//! Hands out zeroed 32-byte blocks carved from coherent pages. One block
//! holds either an ED or a TD together with its software side record, so a
//! single bitmap per page is enough. The pool grows a page at a time and only
//! gives pages back when the controller is torn down.

use alloc::vec::Vec;

use log::{debug, error};

use crate::{
    descriptor::TransferDescriptor,
    error::{OhciError, OhciResult},
    platform::{BusAddr, DmaRegion, OhciPlatform, PAGE_SIZE},
};

/// Size of one descriptor block
pub const BLOCK_SIZE: usize = TransferDescriptor::SIZE;

const BLOCKS_PER_PAGE: usize = PAGE_SIZE / BLOCK_SIZE;
const BITMAP_WORDS: usize = BLOCKS_PER_PAGE / 64;

/// Which descriptor a block is handed out for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Endpoint,
    Transfer,
}

impl DescriptorKind {
    fn resource(self) -> &'static str {
        match self {
            Self::Endpoint => "endpoint descriptor",
            Self::Transfer => "transfer descriptor",
        }
    }
}

/// One coherent page subdivided into blocks
struct PoolPage {
    region: DmaRegion,
    /// 1 = free, 0 = allocated
    bitmap: [u64; BITMAP_WORDS],
    free_blocks: usize,
}

impl PoolPage {
    fn new(region: DmaRegion) -> Self {
        Self {
            region,
            bitmap: [u64::MAX; BITMAP_WORDS],
            free_blocks: BLOCKS_PER_PAGE,
        }
    }

    fn take(&mut self) -> Option<BusAddr> {
        for (word_idx, word) in self.bitmap.iter_mut().enumerate() {
            if *word == 0 {
                continue;
            }
            let bit = word.trailing_zeros() as usize;
            *word &= !(1u64 << bit);
            self.free_blocks -= 1;
            let block = word_idx * 64 + bit;
            return Some(self.region.bus_addr.offset((block * BLOCK_SIZE) as u32));
        }
        None
    }

    /// Returns false on a double free
    fn give_back(&mut self, addr: BusAddr) -> bool {
        let offset = (addr.as_u32() - self.region.bus_addr.as_u32()) as usize;
        let block = offset / BLOCK_SIZE;
        let (word_idx, bit) = (block / 64, block % 64);
        if self.bitmap[word_idx] & (1u64 << bit) != 0 {
            return false;
        }
        self.bitmap[word_idx] |= 1u64 << bit;
        self.free_blocks += 1;
        true
    }
}

/// Pool of DMA-coherent descriptor blocks
pub struct DescriptorPool {
    pages: Vec<PoolPage>,
}

impl DescriptorPool {
    pub const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    /// Allocate a zeroed block, growing the pool by one page if needed
    pub fn allocate<P: OhciPlatform>(
        &mut self,
        platform: &P,
        kind: DescriptorKind,
    ) -> OhciResult<BusAddr> {
        let addr = match self.pages.iter_mut().find_map(PoolPage::take) {
            Some(addr) => addr,
            None => {
                let region = platform
                    .allocate_coherent(1)
                    .ok_or(OhciError::ResourceExhausted {
                        resource: kind.resource(),
                    })?;
                debug!("OHCI: descriptor pool grew to {} pages", self.pages.len() + 1);
                let mut page = PoolPage::new(region);
                let addr = page.take().ok_or(OhciError::ResourceExhausted {
                    resource: kind.resource(),
                })?;
                self.pages.push(page);
                addr
            }
        };
        platform.zero_dma(addr, BLOCK_SIZE);
        Ok(addr)
    }

    /// Return a block to its page; unknown addresses are logged and ignored
    pub fn free(&mut self, addr: BusAddr) {
        match self.pages.iter_mut().find(|p| p.region.contains(addr)) {
            Some(page) => {
                if !page.give_back(addr) {
                    error!("OHCI: double free of descriptor {:?}", addr);
                }
            }
            None => error!("OHCI: free of foreign descriptor {:?}", addr),
        }
    }

    /// Blocks currently handed out
    pub fn in_use(&self) -> usize {
        self.pages
            .iter()
            .map(|p| BLOCKS_PER_PAGE - p.free_blocks)
            .sum()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Give every page back to the platform
    pub fn release_all<P: OhciPlatform>(&mut self, platform: &P) {
        for page in self.pages.drain(..) {
            platform.free_coherent(page.region);
        }
    }
}

impl Default for DescriptorPool {
    fn default() -> Self {
        Self::new()
    }
}
