//! Endpoint descriptor list manager
//!
//! EDs hang off three places:
//! - the control list, headed by HcControlHeadED
//! - the bulk list, headed by HcBulkHeadED
//! - the periodic tree, reached from the 32 HCCA interrupt table entries
//!
//! The periodic tree has six levels. Level 0 holds the 32 leaves the HCCA
//! table points at, level 5 the single root that every frame reaches. Each
//! node links to one parent, so an ED attached below a node at depth `d` is
//! visited every `32 >> d` frames.
//!
//! Linking and unlinking only happens while the ED concerned is skipped.

use alloc::vec::Vec;

use log::debug;

use crate::{
    controller::OhciController,
    descriptor::{hcca, Ed, EdDirection, EndpointDescriptor},
    error::{OhciError, OhciResult},
    platform::{BusAddr, OhciPlatform},
    pool::DescriptorKind,
    usb::UsbSpeed,
};

/// Levels in the periodic tree
pub const TREE_LEVELS: usize = 6;
/// Deepest level index (the root)
pub const MAX_DEPTH: usize = TREE_LEVELS - 1;
pub const LEAF_COUNT: usize = hcca::INTERRUPT_TABLE_ENTRIES;

/// Guard against a corrupted `next` cycle
const MAX_LIST_WALK: usize = 4096;

/// Bit-reversed frame order: leaf `i` of level 0 is HCCA entry
/// `LEAF_ORDER[i]`, so siblings are 16 frames apart
const LEAF_ORDER: [usize; LEAF_COUNT] = [
    0, 16, 8, 24, 4, 20, 12, 28, 2, 18, 10, 26, 6, 22, 14, 30, 1, 17, 9, 25, 5, 21, 13, 29, 3, 19,
    11, 27, 7, 23, 15, 31,
];

/// Which schedule an ED belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Control,
    Bulk,
    Interrupt,
}

/// Permanent anchor EDs of the periodic tree
pub struct PeriodicSchedule {
    /// `levels[d][i]` for `i < 32 >> d`; null until built
    levels: [[BusAddr; LEAF_COUNT]; TREE_LEVELS],
}

impl PeriodicSchedule {
    pub const fn new() -> Self {
        Self {
            levels: [[BusAddr::NULL; LEAF_COUNT]; TREE_LEVELS],
        }
    }

    pub const fn nodes_at(depth: usize) -> usize {
        LEAF_COUNT >> depth
    }

    pub fn node(&self, depth: usize, index: usize) -> Option<BusAddr> {
        if depth > MAX_DEPTH || index >= Self::nodes_at(depth) {
            return None;
        }
        let node = self.levels[depth][index];
        (!node.is_null()).then_some(node)
    }

    pub fn is_built(&self) -> bool {
        !self.levels[MAX_DEPTH][0].is_null()
    }

    pub fn is_anchor(&self, ed: BusAddr) -> bool {
        self.levels
            .iter()
            .enumerate()
            .any(|(depth, level)| level[..Self::nodes_at(depth)].contains(&ed))
    }

    /// Tree depth serving a polling interval of `interval` frames
    ///
    /// Starts at the root and moves one level towards the leaves each time
    /// the interval covers twice the current period.
    pub fn depth_for_interval(interval: u8) -> usize {
        let interval = interval as usize;
        let mut depth = MAX_DEPTH;
        let mut index = 1;
        while interval >= index * 2 && depth > 0 {
            index *= 2;
            depth -= 1;
        }
        depth
    }
}

impl Default for PeriodicSchedule {
    fn default() -> Self {
        Self::new()
    }
}

/// Count EDs reachable from `head`, `head` included
pub(crate) fn count_eds<P: OhciPlatform>(platform: &P, head: BusAddr) -> usize {
    let mut count = 0;
    let mut ed = head;
    while !ed.is_null() && count < MAX_LIST_WALK {
        count += 1;
        ed = Ed::new(platform, ed).next();
    }
    count
}

/// Splice `new` directly after `ed`
pub(crate) fn attach_ed<P: OhciPlatform>(platform: &P, ed: BusAddr, new: BusAddr) {
    let ed = Ed::new(platform, ed);
    let next = ed.next();
    if !next.is_null() {
        Ed::new(platform, new).set_next(next);
    }
    ed.set_next(new);
}

impl<P: OhciPlatform> OhciController<P> {
    /// Allocate a skipped ED with null links
    pub fn create_ed(
        &mut self,
        function_address: u8,
        endpoint: u8,
        direction: EdDirection,
        speed: UsbSpeed,
        max_packet: u16,
    ) -> OhciResult<BusAddr> {
        let ed = self.pool.allocate(&self.platform, DescriptorKind::Endpoint)?;
        EndpointDescriptor::new(
            function_address,
            endpoint,
            direction,
            speed == UsbSpeed::Low,
            max_packet,
        )
        .store(&self.platform, ed);
        Ok(ed)
    }

    pub(crate) fn free_ed(&mut self, ed: BusAddr) {
        self.pool.free(ed);
    }

    /// Link a skipped ED into a schedule and return the list head.
    ///
    /// Control and bulk EDs go behind the controller's head register (or
    /// become the head on an empty list); interrupt EDs are spliced after
    /// `existing_head`, which must be a tree node.
    pub fn attach_to_list(
        &mut self,
        list: ListKind,
        ed: BusAddr,
        existing_head: Option<BusAddr>,
    ) -> OhciResult<BusAddr> {
        let regs = self.regs();
        match list {
            ListKind::Control | ListKind::Bulk => {
                let head = if list == ListKind::Control {
                    regs.control_head()
                } else {
                    regs.bulk_head()
                };
                if head.is_null() {
                    if list == ListKind::Control {
                        regs.set_control_head(ed);
                    } else {
                        regs.set_bulk_head(ed);
                    }
                    Ok(ed)
                } else {
                    attach_ed(&self.platform, head, ed);
                    Ok(head)
                }
            }
            ListKind::Interrupt => {
                let head = existing_head.ok_or(OhciError::InvalidParameter {
                    name: "existing_head",
                    reason: "interrupt EDs attach behind a tree node",
                })?;
                attach_ed(&self.platform, head, ed);
                Ok(head)
            }
        }
    }

    /// Unlink a control or bulk ED, marking it skipped first
    pub(crate) fn detach_from_async_list(&mut self, list: ListKind, ed: BusAddr) {
        let regs = self.regs();
        let target = Ed::new(&self.platform, ed);
        target.set_skip(true);
        let head = match list {
            ListKind::Control => regs.control_head(),
            ListKind::Bulk => regs.bulk_head(),
            ListKind::Interrupt => return,
        };
        if head == ed {
            let next = target.next();
            if list == ListKind::Control {
                regs.set_control_head(next);
            } else {
                regs.set_bulk_head(next);
            }
            return;
        }
        let mut prev = head;
        for _ in 0..MAX_LIST_WALK {
            if prev.is_null() {
                break;
            }
            let node = Ed::new(&self.platform, prev);
            if node.next() == ed {
                node.set_next(target.next());
                return;
            }
            prev = node.next();
        }
        debug!("OHCI: ED {:?} not on the {:?} list", ed, list);
    }

    /// First live ED on the chain from `head` serving the given pipe
    pub fn find_working_endpoint(
        &self,
        head: BusAddr,
        function_address: u8,
        endpoint: u8,
        direction: EdDirection,
    ) -> Option<BusAddr> {
        let mut ed = head;
        for _ in 0..MAX_LIST_WALK {
            if ed.is_null() {
                return None;
            }
            let image = Ed::new(&self.platform, ed).image();
            if !image.is_halted()
                && !image.is_skipped()
                && image.function_address() == function_address
                && image.endpoint_number() == endpoint
                && image.direction() == direction
            {
                return Some(ed);
            }
            ed = image.next();
        }
        None
    }

    /// Tree node at `depth` with the fewest EDs downstream of it
    ///
    /// Ties go to the lowest index. `None` when `depth` is past the root or
    /// the tree has not been built.
    pub fn find_least_loaded_list(&self, depth: usize) -> Option<BusAddr> {
        if depth > MAX_DEPTH {
            return None;
        }
        let mut best: Option<(BusAddr, usize)> = None;
        for index in 0..PeriodicSchedule::nodes_at(depth) {
            let node = self.schedule.node(depth, index)?;
            let count = count_eds(&self.platform, node);
            if best.map_or(true, |(_, min)| count < min) {
                best = Some((node, count));
            }
        }
        best.map(|(node, _)| node)
    }

    /// Unlink and return every non-anchor ED on the tree matching the
    /// device address and endpoint number
    ///
    /// The EDs are left skipped and allocated; callers free them once they
    /// have dealt with the TDs hanging off them.
    pub(crate) fn unlink_interrupt_eds(&mut self, function_address: u8, endpoint: u8) -> Vec<BusAddr> {
        let mut removed = Vec::new();
        for leaf in 0..LEAF_COUNT {
            let mut ed = self.interrupt_table_entry(leaf);
            for _ in 0..MAX_LIST_WALK {
                if ed.is_null() {
                    break;
                }
                let node = Ed::new(&self.platform, ed);
                let next = node.next();
                if next.is_null() {
                    break;
                }
                let candidate = Ed::new(&self.platform, next).image();
                if !self.schedule.is_anchor(next)
                    && candidate.function_address() == function_address
                    && candidate.endpoint_number() == endpoint
                {
                    Ed::new(&self.platform, next).set_skip(true);
                    node.set_next(candidate.next());
                    removed.push(next);
                } else {
                    ed = next;
                }
            }
        }
        if !removed.is_empty() {
            debug!(
                "OHCI: unlinked {} interrupt ED(s) for {}:{}",
                removed.len(),
                function_address,
                endpoint
            );
        }
        removed
    }

    /// Unlink one ED from the tree by identity
    pub(crate) fn unlink_interrupt_ed(&mut self, target: BusAddr) -> bool {
        Ed::new(&self.platform, target).set_skip(true);
        for leaf in 0..LEAF_COUNT {
            let mut ed = self.interrupt_table_entry(leaf);
            for _ in 0..MAX_LIST_WALK {
                if ed.is_null() {
                    break;
                }
                let node = Ed::new(&self.platform, ed);
                let next = node.next();
                if next == target {
                    node.set_next(Ed::new(&self.platform, target).next());
                    return true;
                }
                ed = next;
            }
        }
        false
    }

    fn interrupt_table_entry(&self, index: usize) -> BusAddr {
        BusAddr::new(
            self.platform
                .read_u32(self.hcca.bus_addr.offset(hcca::interrupt_entry(index))),
        )
    }

    /// Build the six-level tree and publish its leaves in the HCCA.
    ///
    /// Anchors are skipped EDs with address 0; the controller only follows
    /// their `next` links. A failed allocation leaves the partial tree in
    /// place for [`free_interrupt_tree`](Self::free_interrupt_tree).
    pub(crate) fn init_interrupt_tree(&mut self) -> OhciResult<()> {
        let mut table = [BusAddr::NULL; LEAF_COUNT];
        for (frame, entry) in table.iter_mut().enumerate() {
            let ed = self.create_ed(0, 0, EdDirection::FromTd, UsbSpeed::Full, 0)?;
            *entry = ed;
            self.schedule.levels[0][frame] = ed;
            self.platform
                .write_u32(self.hcca.bus_addr.offset(hcca::interrupt_entry(frame)), ed.as_u32());
        }
        // Level 0 is ordered so that children 2i and 2i+1 are 16 frames apart
        for (index, &frame) in LEAF_ORDER.iter().enumerate() {
            self.schedule.levels[0][index] = table[frame];
        }

        for depth in 1..TREE_LEVELS {
            for index in 0..PeriodicSchedule::nodes_at(depth) {
                let ed = self.create_ed(0, 0, EdDirection::FromTd, UsbSpeed::Full, 0)?;
                self.schedule.levels[depth][index] = ed;
                Ed::new(&self.platform, self.schedule.levels[depth - 1][2 * index]).set_next(ed);
                Ed::new(&self.platform, self.schedule.levels[depth - 1][2 * index + 1])
                    .set_next(ed);
            }
        }
        debug!("OHCI: periodic tree built ({} anchors)", 2 * LEAF_COUNT - 1);
        Ok(())
    }

    /// Free every anchor ED and clear the HCCA table
    pub(crate) fn free_interrupt_tree(&mut self) {
        for index in 0..LEAF_COUNT {
            self.platform
                .write_u32(self.hcca.bus_addr.offset(hcca::interrupt_entry(index)), 0);
        }
        for depth in 0..TREE_LEVELS {
            for index in 0..PeriodicSchedule::nodes_at(depth) {
                let ed = self.schedule.levels[depth][index];
                if !ed.is_null() {
                    self.pool.free(ed);
                    self.schedule.levels[depth][index] = BusAddr::NULL;
                }
            }
        }
    }
}
