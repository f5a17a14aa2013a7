extern crate structopt;
#[macro_use]
extern crate structopt_derive;

mod config;
mod lock;
mod target;

use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use structopt::StructOpt;

use auth_cache::AuthCache;
use auth_client::SockAuthenticator;
use reader::{Card, RusbTransport};

use crate::config::Config;
use crate::target::ReaderTarget;

const LISTENER_TOKEN: Token = Token(0);

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env().filter_level(level).init();
}

fn bind_address(config: &Config) -> String {
    let host = if config.nbd_address.is_empty() { "0.0.0.0" } else { &config.nbd_address };
    format!("{host}:{}", config.nbd_port)
}

fn build_card(config: &Config) -> anyhow::Result<Card> {
    let transport = RusbTransport::open().map_err(|e| anyhow::anyhow!("opening reader: {e}"))?;
    let cache = AuthCache::open(&config.auth_cache, config.auth_cache_read_only)?;
    let oracle = SockAuthenticator::new((config.auth_address.as_str(), config.auth_port), Some(cache));
    Ok(Card::new(Box::new(transport), Box::new(oracle)))
}

/// Hands a freshly accepted `mio` connection off to blocking I/O: the
/// protocol engine's handshake/option loop assumes reads complete in full,
/// which only a blocking socket can guarantee.
fn to_blocking_stream(stream: mio::net::TcpStream) -> std::io::Result<StdTcpStream> {
    let std_stream = unsafe { StdTcpStream::from_raw_fd(stream.into_raw_fd()) };
    std_stream.set_nonblocking(false)?;
    Ok(std_stream)
}

fn run(config: Config) -> anyhow::Result<()> {
    let _cache_lock = match lock::acquire(&config.auth_cache) {
        Ok(lock) => lock,
        Err(e) => {
            error!("could not lock auth cache {:?}: {e:#}", config.auth_cache);
            return Err(e);
        }
    };

    let card = build_card(&config)?;
    let target = ReaderTarget::new(card);

    let addr = bind_address(&config).parse()?;
    let std_listener = StdTcpListener::bind(addr)?;
    std_listener.set_nonblocking(true)?;
    let mut listener = TcpListener::from_std(std_listener);

    let mut poll = Poll::new()?;
    poll.registry().register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
    let mut events = Events::with_capacity(16);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))?;
    }

    info!("nbd-server listening on {}", bind_address(&config));
    while !shutdown.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, Some(Duration::from_millis(200))) {
            if e.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }
        for event in events.iter() {
            if event.token() == LISTENER_TOKEN {
                loop {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            info!("accepted NBD connection from {peer}");
                            match to_blocking_stream(stream) {
                                Ok(blocking) => serve_connection(blocking, target.clone(), config.read_only),
                                Err(e) => warn!("could not hand off connection: {e}"),
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            error!("accept error: {e}");
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("shutting down");
    Ok(())
}

/// Each accepted client is served to completion before the accept loop
/// resumes — acceptable because the USB reader behind every connection is
/// a single-owner resource that could not be driven concurrently anyway.
fn serve_connection(stream: StdTcpStream, target: ReaderTarget, read_only: bool) {
    let session = nbd_proto::Session::new(stream, target, read_only);
    if let Err(e) = session.run() {
        warn!("connection ended with error: {e}");
    }
}

fn main() -> anyhow::Result<()> {
    let config = Config::from_args();
    init_logging(config.verbose);
    run(config)
}
