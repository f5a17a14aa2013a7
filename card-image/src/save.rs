use crate::card::{CardImage, BLOCK_LENGTH};
use crate::error::{Error, Result};

/// One of the fixed set of named views a save exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveEntry {
    Data,
    Region,
    ProductCode,
    GameCode,
}

impl SaveEntry {
    pub const ALL: [SaveEntry; 4] = [
        SaveEntry::Data,
        SaveEntry::GameCode,
        SaveEntry::ProductCode,
        SaveEntry::Region,
    ];
}

/// A logical view of one save: its head block plus every block chained to
/// it, resolved once at construction time.
pub struct Save {
    blocks: Vec<u8>,
    region: u8,
    product_code: [u8; 10],
    game_code: [u8; 8],
}

impl Save {
    pub(crate) fn new(card: &CardImage, head: u8) -> Result<Self> {
        let header = card.header_block(head);
        let declared_size = header.size();
        let region = header.region();
        let mut product_code = [0u8; 10];
        product_code.copy_from_slice(header.product_code());
        let mut game_code = [0u8; 8];
        game_code.copy_from_slice(header.game_code());

        let mut blocks = vec![head];
        blocks.extend(card.iter_chained(head)?);

        let actual_size = (blocks.len() * BLOCK_LENGTH) as u32;
        if declared_size != actual_size {
            return Err(Error::SizeMismatch(head, declared_size, actual_size));
        }

        Ok(Save { blocks, region, product_code, game_code })
    }

    pub fn head_block(&self) -> u8 {
        self.blocks[0]
    }

    pub fn blocks(&self) -> &[u8] {
        &self.blocks
    }

    pub fn entries(&self) -> impl Iterator<Item = SaveEntry> {
        SaveEntry::ALL.into_iter()
    }

    pub fn entry_size(&self, entry: SaveEntry) -> usize {
        match entry {
            SaveEntry::Data => self.blocks.len() * BLOCK_LENGTH,
            SaveEntry::Region => 1,
            SaveEntry::ProductCode => self.product_code.len(),
            SaveEntry::GameCode => self.game_code.len(),
        }
    }

    fn entry_bytes(&self, entry: SaveEntry) -> Option<&[u8]> {
        match entry {
            SaveEntry::Region => Some(std::slice::from_ref(&self.region)),
            SaveEntry::ProductCode => Some(&self.product_code),
            SaveEntry::GameCode => Some(&self.game_code),
            SaveEntry::Data => None,
        }
    }

    /// Read up to `size` bytes of `entry` starting at `offset`, truncated at
    /// the entry's end. Returns an empty slice if `offset` is past the end.
    pub fn read(&self, card: &CardImage, entry: SaveEntry, offset: usize, size: usize) -> Vec<u8> {
        let total = self.entry_size(entry);
        if offset >= total {
            return Vec::new();
        }
        let len = size.min(total - offset);
        match entry {
            SaveEntry::Data => {
                let mut out = Vec::with_capacity(len);
                let mut remaining = len;
                let mut skip = offset;
                for &block in &self.blocks {
                    if remaining == 0 {
                        break;
                    }
                    let payload = card.block_payload(block);
                    if skip >= payload.len() {
                        skip -= payload.len();
                        continue;
                    }
                    let take = (payload.len() - skip).min(remaining);
                    out.extend_from_slice(&payload[skip..skip + take]);
                    remaining -= take;
                    skip = 0;
                }
                out
            }
            _ => self.entry_bytes(entry).unwrap()[offset..offset + len].to_vec(),
        }
    }

    /// Write `data` into `entry` at `offset`. Fails [`Error::WouldGrow`] if
    /// this would extend the save past its current length.
    pub fn write(&self, card: &mut CardImage, entry: SaveEntry, offset: usize, data: &[u8]) -> Result<()> {
        let total = self.entry_size(entry);
        if offset + data.len() > total {
            return Err(Error::WouldGrow);
        }
        match entry {
            SaveEntry::Data => {
                let mut skip = offset;
                let mut cursor = 0;
                for &block in &self.blocks {
                    if cursor == data.len() {
                        break;
                    }
                    if skip >= BLOCK_LENGTH {
                        skip -= BLOCK_LENGTH;
                        continue;
                    }
                    let room = BLOCK_LENGTH - skip;
                    let take = room.min(data.len() - cursor);
                    let block_offset = block as usize * BLOCK_LENGTH + skip;
                    card.write_bytes(block_offset, &data[cursor..cursor + take])?;
                    cursor += take;
                    skip = 0;
                }
                Ok(())
            }
            SaveEntry::Region | SaveEntry::ProductCode | SaveEntry::GameCode => {
                let field_offset = match entry {
                    SaveEntry::Region => 0x0b,
                    SaveEntry::ProductCode => 0x0c,
                    SaveEntry::GameCode => 0x16,
                    SaveEntry::Data => unreachable!(),
                };
                let head = self.head_block();
                {
                    let mut header = card.header_block_mut(head);
                    header.0[field_offset + offset..field_offset + offset + data.len()]
                        .copy_from_slice(data);
                    header.update_xor();
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::CardImage;

    #[test]
    fn data_entry_spans_whole_chain() {
        let mut card = CardImage::blank();
        card.create_save(1).unwrap();
        card.append_block(1, 2).unwrap();
        let save = card.open_save(1).unwrap().unwrap();
        assert_eq!(save.entry_size(SaveEntry::Data), BLOCK_LENGTH * 2);
    }

    #[test]
    fn data_round_trips_through_write_then_read() {
        let mut card = CardImage::blank();
        card.create_save(1).unwrap();
        card.append_block(1, 2).unwrap();
        let save = card.open_save(1).unwrap().unwrap();
        let payload = vec![0xABu8; 64];
        save.write(&mut card, SaveEntry::Data, BLOCK_LENGTH - 32, &payload).unwrap();
        let back = save.read(&card, SaveEntry::Data, BLOCK_LENGTH - 32, 64);
        assert_eq!(back, payload);
    }

    #[test]
    fn write_past_end_is_rejected() {
        let mut card = CardImage::blank();
        card.create_save(1).unwrap();
        let save = card.open_save(1).unwrap().unwrap();
        let err = save.write(&mut card, SaveEntry::Data, BLOCK_LENGTH - 4, &[0u8; 16]);
        assert!(matches!(err, Err(Error::WouldGrow)));
    }
}
