//! Adapts the USB reader driver to the transport-agnostic `BlockTarget`
//! shape the NBD protocol engine expects.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use nbd_proto::BlockTarget;
use reader::{Card, CardType};

/// Shared handle to the one physical reader; cloned cheaply per connection
/// since the USB device itself only ever serves one command at a time.
#[derive(Clone)]
pub struct ReaderTarget(Rc<RefCell<Card>>);

impl ReaderTarget {
    pub fn new(card: Card) -> Self {
        ReaderTarget(Rc::new(RefCell::new(card)))
    }
}

fn to_io_error(e: reader::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

impl BlockTarget for ReaderTarget {
    fn size(&mut self) -> u64 {
        let mut card = self.0.borrow_mut();
        match card.get_card_type() {
            Ok(CardType::Ps1) => reader::card::PS1_CARD_SIZE as u64,
            Ok(CardType::Ps2) => reader::card::PS2_CARD_SIZE as u64,
            _ => 0,
        }
    }

    fn preferred_block_size(&mut self) -> u32 {
        let mut card = self.0.borrow_mut();
        match card.get_card_type() {
            Ok(CardType::Ps1) => reader::card::PS1_FRAME_LENGTH as u32,
            Ok(CardType::Ps2) => reader::card::PS2_PAGE_LENGTH as u32,
            _ => 512,
        }
    }

    fn read(&mut self, offset: u64, length: u32) -> io::Result<Vec<u8>> {
        self.0.borrow_mut().read(offset as usize, length as usize).map_err(to_io_error)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.0.borrow_mut().write(offset as usize, data).map_err(to_io_error)
    }
}
