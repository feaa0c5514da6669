//! Host environment seam
//!
//! The engine never dereferences descriptor memory directly. Everything the
//! controller can see is named by a [`BusAddr`] and reached through an
//! [`OhciPlatform`], which supplies:
//! - 32-bit access to the operational and root hub registers
//! - coherent page allocation for descriptors and the HCCA
//! - bus-master mapping of caller buffers for the duration of a transfer
//! - a microsecond delay primitive

use core::fmt;

/// Size of one coherent allocation unit
pub const PAGE_SIZE: usize = 4096;

/// Address of a location as seen by the controller's bus master
///
/// OHCI descriptors hold 32-bit bus addresses; zero terminates every list.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BusAddr(u32);

impl BusAddr {
    pub const NULL: Self = Self(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn offset(self, bytes: u32) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    /// Strip the low bits that descriptors use for flags
    pub const fn align_down(self, align: u32) -> Self {
        Self(self.0 & !(align - 1))
    }
}

impl fmt::Debug for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BusAddr(0x{:08x})", self.0)
    }
}

/// Direction of a bus-master mapping, named from the controller's side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOperation {
    /// Controller reads the buffer (host-to-device data)
    BusMasterRead,
    /// Controller writes the buffer (device-to-host data)
    BusMasterWrite,
    /// Shared for the lifetime of the mapping
    CommonBuffer,
}

/// Contiguous pages of coherent memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    pub bus_addr: BusAddr,
    pub pages: usize,
}

impl DmaRegion {
    pub fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.pages == 0
    }

    pub fn contains(&self, addr: BusAddr) -> bool {
        let start = self.bus_addr.as_u32() as usize;
        let addr = addr.as_u32() as usize;
        addr >= start && addr < start + self.len()
    }
}

/// Live bus-master mapping of a caller buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaMapping {
    pub bus_addr: BusAddr,
    pub len: usize,
    pub operation: MapOperation,
    /// Platform bookkeeping, opaque to the engine
    pub handle: usize,
}

/// Capabilities the engine consumes from its host environment
///
/// Implementations must make DMA writes visible to the controller in program
/// order; the skip/link discipline of the schedule depends on it.
pub trait OhciPlatform {
    /// Read a 32-bit operational register
    fn read_register(&self, offset: u32) -> u32;

    /// Write a 32-bit operational register
    fn write_register(&self, offset: u32, value: u32);

    /// Busy-wait for at least `microseconds`
    fn stall(&self, microseconds: u32);

    /// Allocate zeroed, page-aligned coherent memory
    fn allocate_coherent(&self, pages: usize) -> Option<DmaRegion>;

    fn free_coherent(&self, region: DmaRegion);

    /// Make `buffer` visible to the controller
    ///
    /// For [`MapOperation::BusMasterRead`] the mapped bytes equal `buffer`
    /// on return. Device-written data is read back with
    /// [`read_dma`](Self::read_dma) before unmapping.
    fn map(&self, operation: MapOperation, buffer: &[u8]) -> Option<DmaMapping>;

    fn unmap(&self, mapping: DmaMapping);

    /// Copy bytes out of bus-visible memory
    fn read_dma(&self, addr: BusAddr, buf: &mut [u8]);

    /// Copy bytes into bus-visible memory
    fn write_dma(&self, addr: BusAddr, data: &[u8]);

    /// Read a little-endian descriptor word
    fn read_u32(&self, addr: BusAddr) -> u32 {
        let mut bytes = [0u8; 4];
        self.read_dma(addr, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    /// Write a little-endian descriptor word
    fn write_u32(&self, addr: BusAddr, value: u32) {
        self.write_dma(addr, &value.to_le_bytes());
    }

    fn zero_dma(&self, addr: BusAddr, len: usize) {
        const ZEROES: [u8; 64] = [0; 64];
        let mut done = 0;
        while done < len {
            let chunk = (len - done).min(ZEROES.len());
            self.write_dma(addr.offset(done as u32), &ZEROES[..chunk]);
            done += chunk;
        }
    }
}

impl<T: OhciPlatform + ?Sized> OhciPlatform for &T {
    fn read_register(&self, offset: u32) -> u32 {
        (**self).read_register(offset)
    }

    fn write_register(&self, offset: u32, value: u32) {
        (**self).write_register(offset, value)
    }

    fn stall(&self, microseconds: u32) {
        (**self).stall(microseconds)
    }

    fn allocate_coherent(&self, pages: usize) -> Option<DmaRegion> {
        (**self).allocate_coherent(pages)
    }

    fn free_coherent(&self, region: DmaRegion) {
        (**self).free_coherent(region)
    }

    fn map(&self, operation: MapOperation, buffer: &[u8]) -> Option<DmaMapping> {
        (**self).map(operation, buffer)
    }

    fn unmap(&self, mapping: DmaMapping) {
        (**self).unmap(mapping)
    }

    fn read_dma(&self, addr: BusAddr, buf: &mut [u8]) {
        (**self).read_dma(addr, buf)
    }

    fn write_dma(&self, addr: BusAddr, data: &[u8]) {
        (**self).write_dma(addr, data)
    }
}
