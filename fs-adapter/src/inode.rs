//! Deterministic inode numbering for the two-level save tree: the root,
//! one directory (or symlink, or orphan placeholder) per block id, and one
//! regular file per save entry underneath a head block's directory.

use card_image::SaveEntry;

pub const ROOT_INO: u64 = 1;
const BLOCK_DIR_BASE: u64 = 0x1000;
const ENTRY_BASE: u64 = 0x2000;

pub fn block_dir_ino(block: u8) -> u64 {
    BLOCK_DIR_BASE + block as u64
}

pub fn ino_to_block(ino: u64) -> Option<u8> {
    if (BLOCK_DIR_BASE..BLOCK_DIR_BASE + 16).contains(&ino) {
        Some((ino - BLOCK_DIR_BASE) as u8)
    } else {
        None
    }
}

fn entry_index(entry: SaveEntry) -> u8 {
    match entry {
        SaveEntry::Data => 0,
        SaveEntry::GameCode => 1,
        SaveEntry::ProductCode => 2,
        SaveEntry::Region => 3,
    }
}

fn entry_from_index(idx: u8) -> Option<SaveEntry> {
    match idx {
        0 => Some(SaveEntry::Data),
        1 => Some(SaveEntry::GameCode),
        2 => Some(SaveEntry::ProductCode),
        3 => Some(SaveEntry::Region),
        _ => None,
    }
}

pub fn entry_ino(block: u8, entry: SaveEntry) -> u64 {
    ENTRY_BASE + (block as u64) * 16 + entry_index(entry) as u64
}

pub fn ino_to_entry(ino: u64) -> Option<(u8, SaveEntry)> {
    if ino < ENTRY_BASE {
        return None;
    }
    let rel = ino - ENTRY_BASE;
    let block = (rel / 16) as u8;
    let idx = (rel % 16) as u8;
    entry_from_index(idx).map(|e| (block, e))
}

pub fn entry_name(entry: SaveEntry) -> &'static str {
    match entry {
        SaveEntry::Data => "data",
        SaveEntry::GameCode => "game_code",
        SaveEntry::ProductCode => "product_code",
        SaveEntry::Region => "region",
    }
}

pub fn entry_from_name(name: &str) -> Option<SaveEntry> {
    match name {
        "data" => Some(SaveEntry::Data),
        "game_code" => Some(SaveEntry::GameCode),
        "product_code" => Some(SaveEntry::ProductCode),
        "region" => Some(SaveEntry::Region),
        _ => None,
    }
}

/// Block id names are always two decimal digits, "01".."15".
pub fn block_name(block: u8) -> String {
    format!("{block:02}")
}

pub fn block_from_name(name: &str) -> Option<u8> {
    if name.len() != 2 {
        return None;
    }
    name.parse::<u8>().ok().filter(|b| (1..16).contains(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ino_round_trips() {
        for block in 1u8..16 {
            assert_eq!(ino_to_block(block_dir_ino(block)), Some(block));
        }
        assert_eq!(ino_to_block(ROOT_INO), None);
        assert_eq!(ino_to_block(ENTRY_BASE), None);
    }

    #[test]
    fn entry_ino_round_trips() {
        for block in 1u8..16 {
            for entry in [SaveEntry::Data, SaveEntry::GameCode, SaveEntry::ProductCode, SaveEntry::Region] {
                assert_eq!(ino_to_entry(entry_ino(block, entry)), Some((block, entry)));
            }
        }
    }

    #[test]
    fn block_name_round_trips() {
        for block in 1u8..16 {
            assert_eq!(block_from_name(&block_name(block)), Some(block));
        }
        assert_eq!(block_from_name("00"), None);
        assert_eq!(block_from_name("16"), None);
        assert_eq!(block_from_name("1"), None);
        assert_eq!(block_from_name("xx"), None);
    }

    #[test]
    fn entry_name_round_trips() {
        for name in ["data", "game_code", "product_code", "region"] {
            let entry = entry_from_name(name).unwrap();
            assert_eq!(entry_name(entry), name);
        }
        assert_eq!(entry_from_name("bogus"), None);
    }
}
