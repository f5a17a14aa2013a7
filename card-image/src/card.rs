use std::collections::HashMap;

use log::{debug, error, trace};

use crate::error::{Error, Result};
use crate::header::{self, HeaderView, HeaderViewMut, STATUS_END, STATUS_FREE, STATUS_LINKED, STATUS_USED};
use crate::save::Save;

pub const BLOCK_COUNT: usize = 0x10;
pub const BLOCK_LENGTH: usize = 0x2000;
pub const CARD_LENGTH: usize = BLOCK_COUNT * BLOCK_LENGTH;
const SUPERBLOCK_MAGIC: &[u8; 2] = b"MC";
/// Writes below this offset invalidate the cached link map.
const LINK_MAP_SENSITIVE_LENGTH: usize = 2048;

/// Resolution of a block index within the derived link map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Block is the head of its own save.
    Head,
    /// Block is a non-head member of the chain rooted at this head.
    LinkedTo(u8),
    /// Block carries the "used, linked" status but is unreachable from any
    /// head block found by the forward scan.
    OrphanLinked,
}

/// In-memory view of a raw 131072-byte PS1 memory card image.
pub struct CardImage {
    bytes: Vec<u8>,
    link_map: Option<HashMap<u8, LinkState>>,
}

impl CardImage {
    /// Attach to a buffer of exactly [`CARD_LENGTH`] bytes.
    pub fn open(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() != CARD_LENGTH {
            return Err(Error::BadLength(bytes.len(), CARD_LENGTH));
        }
        if &bytes[..2] != SUPERBLOCK_MAGIC {
            return Err(Error::BadMagic);
        }
        Ok(CardImage { bytes, link_map: None })
    }

    /// A freshly formatted, all-free card image.
    pub fn blank() -> Self {
        let mut bytes = vec![0u8; CARD_LENGTH];
        bytes[0] = SUPERBLOCK_MAGIC[0];
        bytes[1] = SUPERBLOCK_MAGIC[1];
        for block in 0..BLOCK_COUNT as u8 {
            let mut header = HeaderViewMut(header_slice_mut(&mut bytes, block));
            if block != 0 {
                header.set_status(STATUS_FREE);
            }
            header.update_xor();
        }
        CardImage { bytes, link_map: None }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn header(&self, block: u8) -> HeaderView<'_> {
        HeaderView(header_slice(&self.bytes, block))
    }

    fn header_mut(&mut self, block: u8) -> HeaderViewMut<'_> {
        HeaderViewMut(header_slice_mut(&mut self.bytes, block))
    }

    pub fn check_header(&self, block: u8) -> Result<()> {
        header::check(self.header(block), block)
    }

    fn require_block_range(block: u8) -> Result<()> {
        if block == 0 || block as usize >= BLOCK_COUNT {
            return Err(Error::BadBlockIndex(block));
        }
        Ok(())
    }

    /// Step-wise walk of the chain rooted at `head`, yielding successor block
    /// indices (not including `head` itself). Fails with [`Error::ChainLoop`]
    /// if a block index repeats.
    pub fn iter_chained(&self, head: u8) -> Result<Vec<u8>> {
        self.check_header(head)?;
        let mut seen = vec![head];
        let mut chain = Vec::new();
        let mut current = head;
        loop {
            self.check_header(current)?;
            let next = self.header(current).next();
            let Some(next) = next else { break };
            if seen.contains(&next) {
                return Err(Error::ChainLoop(head));
            }
            seen.push(next);
            chain.push(next);
            current = next;
        }
        Ok(chain)
    }

    /// Returns (and lazily builds) the derived block -> head mapping.
    pub fn link_map(&mut self) -> Result<&HashMap<u8, LinkState>> {
        if self.link_map.is_none() {
            self.link_map = Some(self.build_link_map()?);
        }
        Ok(self.link_map.as_ref().unwrap())
    }

    fn build_link_map(&self) -> Result<HashMap<u8, LinkState>> {
        let mut map = HashMap::new();
        for block in 1..BLOCK_COUNT as u8 {
            if map.contains_key(&block) {
                continue;
            }
            self.check_header(block)?;
            if self.header(block).is_head() {
                map.insert(block, LinkState::Head);
                for linked in self.iter_chained(block)? {
                    map.insert(linked, LinkState::LinkedTo(block));
                }
            }
        }
        for block in 1..BLOCK_COUNT as u8 {
            if map.contains_key(&block) {
                continue;
            }
            let h = self.header(block);
            if h.is_used() && h.is_linked() {
                debug!("block {block} is used+linked but unreachable from any head");
                map.insert(block, LinkState::OrphanLinked);
            }
        }
        Ok(map)
    }

    fn invalidate_link_map_if_needed(&mut self, offset: usize) {
        if offset < LINK_MAP_SENSITIVE_LENGTH {
            trace!("superblock write at offset {offset}, invalidating link map cache");
            self.link_map = None;
        }
    }

    pub fn open_save(&mut self, block: u8) -> Result<Option<Save>> {
        match self.link_map()?.get(&block) {
            Some(LinkState::Head) => Ok(Some(Save::new(self, block)?)),
            _ => Ok(None),
        }
    }

    /// Allocate `block` as a new, empty single-block save.
    pub fn create_save(&mut self, block: u8) -> Result<()> {
        Self::require_block_range(block)?;
        if self.header(block).is_used() {
            return Err(Error::AlreadyAllocated(block));
        }
        {
            let mut header = self.header_mut(block);
            header.set_status(STATUS_USED | STATUS_END);
            header.set_size(BLOCK_LENGTH as u32);
            header.set_next(None);
            // The per-block offset here (not an absolute offset into header
            // 0) is the correct placement of this marker.
            header.set_unknown1_marker();
            header.update_xor();
        }
        let data_start = block as usize * BLOCK_LENGTH;
        self.bytes[data_start..data_start + BLOCK_LENGTH].fill(0);
        self.invalidate_link_map_if_needed(0);
        Ok(())
    }

    /// Append `new` to the tail of the chain rooted at `head`.
    pub fn append_block(&mut self, head: u8, new: u8) -> Result<()> {
        Self::require_block_range(head)?;
        Self::require_block_range(new)?;
        if self.header(new).is_used() {
            return Err(Error::AlreadyAllocated(new));
        }
        if !self.header(head).is_head() {
            return Err(Error::NotAllocated(head));
        }
        let chain = self.iter_chained(head)?;
        let tail = chain.last().copied().unwrap_or(head);

        {
            let mut header = self.header_mut(new);
            header.set_status(STATUS_USED | STATUS_LINKED | STATUS_END);
            header.set_next(None);
            header.update_xor();
        }
        let data_start = new as usize * BLOCK_LENGTH;
        self.bytes[data_start..data_start + BLOCK_LENGTH].fill(0);
        {
            let mut tail_header = self.header_mut(tail);
            tail_header.set_next(Some(new));
            tail_header.update_xor();
        }
        {
            let size = self.header(head).size();
            let mut head_header = self.header_mut(head);
            head_header.set_size(size + BLOCK_LENGTH as u32);
            head_header.update_xor();
        }
        self.invalidate_link_map_if_needed(0);
        Ok(())
    }

    /// Free `head` and every block chained to it. No payload bytes are
    /// erased.
    pub fn delete_save(&mut self, head: u8) -> Result<()> {
        Self::require_block_range(head)?;
        if !self.header(head).is_used() {
            return Err(Error::NotAllocated(head));
        }
        let chain = self.iter_chained(head)?;
        for block in chain {
            self.free_block(block);
        }
        self.free_block(head);
        self.invalidate_link_map_if_needed(0);
        Ok(())
    }

    fn free_block(&mut self, block: u8) {
        let status = self.header(block).status();
        let mut header = self.header_mut(block);
        header.set_status((status & 0x0f) | STATUS_FREE);
        header.update_xor();
    }

    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<&[u8]> {
        if offset.checked_add(len).is_none() || offset + len > CARD_LENGTH {
            return Err(Error::OutOfRange(offset, len, CARD_LENGTH));
        }
        Ok(&self.bytes[offset..offset + len])
    }

    /// The single write path for raw bytes: callers never need to remember
    /// a separate cache-invalidating variant, this one already knows which
    /// offset ranges matter.
    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        if offset.checked_add(data.len()).is_none() || offset + data.len() > CARD_LENGTH {
            return Err(Error::OutOfRange(offset, data.len(), CARD_LENGTH));
        }
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        self.invalidate_link_map_if_needed(offset);
        Ok(())
    }

    pub(crate) fn header_block(&self, block: u8) -> HeaderView<'_> {
        self.header(block)
    }

    pub(crate) fn header_block_mut(&mut self, block: u8) -> HeaderViewMut<'_> {
        self.header_mut(block)
    }

    pub(crate) fn block_payload(&self, block: u8) -> &[u8] {
        let start = block as usize * BLOCK_LENGTH;
        &self.bytes[start..start + BLOCK_LENGTH]
    }

    pub(crate) fn note_header_corrupt(&self, block: u8) {
        error!("header {block} checksum invalid");
    }
}

fn header_slice(bytes: &[u8], block: u8) -> &[u8] {
    let start = block as usize * header::HEADER_LENGTH;
    &bytes[start..start + header::HEADER_LENGTH]
}

fn header_slice_mut(bytes: &mut [u8], block: u8) -> &mut [u8] {
    let start = block as usize * header::HEADER_LENGTH;
    &mut bytes[start..start + header::HEADER_LENGTH]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_card_has_valid_headers_and_empty_link_map() {
        let mut card = CardImage::blank();
        for block in 0..BLOCK_COUNT as u8 {
            card.check_header(block).expect("valid header");
        }
        assert!(card.link_map().unwrap().is_empty());
    }

    #[test]
    fn create_single_block_save() {
        let mut card = CardImage::blank();
        card.create_save(1).unwrap();
        let header = card.header(1);
        assert_eq!(header.status(), STATUS_USED | STATUS_END);
        assert_eq!(header.size(), BLOCK_LENGTH as u32);
        assert_eq!(header.next(), None);
        assert!(header.checksum_ok());
        assert_eq!(card.link_map().unwrap().get(&1), Some(&LinkState::Head));
    }

    #[test]
    fn create_save_rejects_double_allocation() {
        let mut card = CardImage::blank();
        card.create_save(1).unwrap();
        assert!(matches!(card.create_save(1), Err(Error::AlreadyAllocated(1))));
    }

    #[test]
    fn append_block_grows_chain_and_size() {
        let mut card = CardImage::blank();
        card.create_save(1).unwrap();
        card.append_block(1, 2).unwrap();
        card.append_block(1, 3).unwrap();
        assert_eq!(card.header(1).size(), (BLOCK_LENGTH * 3) as u32);
        assert_eq!(card.iter_chained(1).unwrap(), vec![2, 3]);
        assert_eq!(card.header(3).next(), None);
        assert_eq!(
            card.link_map().unwrap().get(&3),
            Some(&LinkState::LinkedTo(1))
        );
    }

    #[test]
    fn delete_then_recreate_restores_link_map() {
        let mut card = CardImage::blank();
        card.create_save(1).unwrap();
        card.append_block(1, 2).unwrap();
        card.delete_save(1).unwrap();
        assert!(card.link_map().unwrap().is_empty());
        assert_eq!(card.header(1).status() & 0xf0, STATUS_FREE);
        assert_eq!(card.header(2).status() & 0xf0, STATUS_FREE);
    }

    #[test]
    fn chain_loop_is_detected() {
        let mut card = CardImage::blank();
        card.create_save(1).unwrap();
        card.append_block(1, 2).unwrap();
        // Manually corrupt block 2's "next" pointer into a loop back to 1.
        let mut header = card.header_mut(2);
        header.set_next(Some(1));
        header.update_xor();
        assert!(matches!(card.iter_chained(1), Err(Error::ChainLoop(1))));
    }
}
