//! Wire constants for the newstyle fixed NBD handshake, option negotiation
//! and transmission phase. Values match the upstream NBD protocol
//! specification exactly.

pub const NBD_MAGIC_IHAVEOPT: [u8; 16] = *b"NBDMAGICIHAVEOPT";
pub const IHAVEOPT: [u8; 8] = *b"IHAVEOPT";
pub const OPTION_REPLY_MAGIC: [u8; 8] = [0x00, 0x03, 0xe8, 0x89, 0x04, 0x55, 0x65, 0xa9];
pub const REQUEST_MAGIC: [u8; 4] = [0x25, 0x60, 0x95, 0x13];
pub const SIMPLE_REPLY_MAGIC: [u8; 4] = [0x67, 0x44, 0x66, 0x98];

pub const HANDSHAKE_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const HANDSHAKE_FLAG_NO_ZEROES: u16 = 1 << 1;

pub const CLIENT_FLAG_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const CLIENT_FLAG_NO_ZEROES: u32 = 1 << 1;
pub const KNOWN_CLIENT_FLAGS: u32 = CLIENT_FLAG_FIXED_NEWSTYLE | CLIENT_FLAG_NO_ZEROES;

pub const OPT_EXPORT_NAME: u32 = 1;
pub const OPT_ABORT: u32 = 2;
pub const OPT_LIST: u32 = 3;
pub const OPT_INFO: u32 = 6;
pub const OPT_GO: u32 = 7;

pub const REP_ACK: u32 = 1;
pub const REP_SERVER: u32 = 2;
pub const REP_INFO: u32 = 3;
pub const REP_ERR_UNSUP: u32 = 0x8000_0001;
pub const REP_ERR_INVALID: u32 = 0x8000_0003;
pub const REP_ERR_TOO_BIG: u32 = 0x8000_0008;

pub const INFO_EXPORT: u16 = 0;
pub const INFO_NAME: u16 = 1;
pub const INFO_BLOCK_SIZE: u16 = 3;

pub const TRANSMIT_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const TRANSMIT_FLAG_READ_ONLY: u16 = 1 << 1;
pub const TRANSMIT_FLAG_CAN_MULTI_CONN: u16 = 1 << 8;

pub const CMD_READ: u16 = 0;
pub const CMD_WRITE: u16 = 1;
pub const CMD_DISC: u16 = 2;

pub const CMD_FLAG_FUA: u16 = 1 << 0;
pub const CMD_FLAG_NO_HOLE: u16 = 1 << 1;
pub const CMD_FLAG_DF: u16 = 1 << 2;
pub const KNOWN_CMD_FLAGS: u16 = CMD_FLAG_FUA | CMD_FLAG_NO_HOLE | CMD_FLAG_DF;

pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_ENOTSUP: u32 = 95;

pub const MAX_OPT_SIZE: u32 = 1 << 10;
pub const MAX_BLOCK_SIZE: u32 = 1 << 25;
