extern crate structopt;
#[macro_use]
extern crate structopt_derive;

use std::fs::OpenOptions;
use std::io::Read;
use std::path::PathBuf;

use log::info;
use structopt::StructOpt;

use card_image::CardImage;
use fs_adapter::FsAdapter;

#[derive(StructOpt, Debug)]
#[structopt(name = "mc-mount", about = "Mount a PS1 memory card image as a filesystem")]
struct Opt {
    #[structopt(parse(from_os_str), help = "Path to the raw 131072-byte card image")]
    image: PathBuf,

    #[structopt(parse(from_os_str), help = "Directory to mount the filesystem at")]
    mountpoint: PathBuf,

    #[structopt(long = "ro", help = "Mount read-only")]
    read_only: bool,

    #[structopt(short = "v", long = "verbose", parse(from_occurrences), help = "Increase log verbosity")]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env().filter_level(level).init();
}

fn load_image(path: &PathBuf, read_only: bool) -> anyhow::Result<(CardImage, std::fs::File)> {
    let mut file = OpenOptions::new().read(true).write(!read_only).open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let card = CardImage::open(bytes)?;
    Ok((card, file))
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    init_logging(opt.verbose);

    let (card, file) = load_image(&opt.image, opt.read_only)?;
    info!("mounting {:?} at {:?} (read_only={})", opt.image, opt.mountpoint, opt.read_only);

    let backing = if opt.read_only { None } else { Some(file) };
    let fs = FsAdapter::new(card, opt.read_only, backing);
    let options = vec![fuser::MountOption::FSName("mc-mount".to_string())];
    fuser::mount2(fs, &opt.mountpoint, &options)?;
    Ok(())
}
