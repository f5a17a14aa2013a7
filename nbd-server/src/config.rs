use std::path::PathBuf;

use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "nbd-server", about = "Expose a PS1/PS2 memory card reader as an NBD device")]
pub struct Config {
    #[structopt(short = "p", long = "nbd-port", default_value = "10809", help = "TCP port to listen on")]
    pub nbd_port: u16,

    #[structopt(short = "a", long = "nbd-address", default_value = "", help = "Address to bind the NBD listener to")]
    pub nbd_address: String,

    #[structopt(
        short = "c",
        long = "auth-cache",
        parse(from_os_str),
        default_value = "auth_cache.bin",
        help = "Path to the authentication cache file"
    )]
    pub auth_cache: PathBuf,

    #[structopt(short = "r", long = "auth-cache-read-only", help = "Open the auth cache read-only")]
    pub auth_cache_read_only: bool,

    #[structopt(short = "P", long = "auth-port", default_value = "20531", help = "Authentication oracle TCP port")]
    pub auth_port: u16,

    #[structopt(
        short = "A",
        long = "auth-address",
        default_value = "127.0.0.1",
        help = "Authentication oracle address"
    )]
    pub auth_address: String,

    #[structopt(long = "read-only", help = "Advertise the export as read-only to NBD clients")]
    pub read_only: bool,

    #[structopt(short = "v", long = "verbose", parse(from_occurrences), help = "Increase log verbosity")]
    pub verbose: u8,
}
