//! Smoke-tests `TcpTransport` against a real socket mesh: every rank binds
//! to its slot in a `--addrs` list, dials every higher rank, sends one
//! eager frame to its right-hand neighbor, and prints whatever it receives.
//! The mio-driven accept/connect loop this exercises mirrors the teacher's
//! own raw `mio::Poll` listen probe.

use clap::{App, Arg};
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use vt_core::net::tag::Tag;
use vt_core::net::tcp::TcpTransport;
use vt_core::net::transport::Transport;

fn main() {
    let matches = App::new("tcp_smoke")
        .arg(Arg::with_name("rank").long("rank").takes_value(true).required(true))
        .arg(Arg::with_name("addrs").long("addrs").takes_value(true).required(true)
            .help("comma-separated host:port list, one per rank"))
        .get_matches();

    let me: i64 = matches.value_of("rank").unwrap().parse().expect("--rank must be an integer");
    let addrs: Vec<SocketAddr> = matches
        .value_of("addrs")
        .unwrap()
        .split(',')
        .map(|s| s.parse().expect("--addrs entries must be host:port"))
        .collect();

    let mut transport = TcpTransport::new(me, &addrs).expect("failed to bind tcp mesh");
    let world_size = transport.world_size();

    let neighbor = (me + 1) % world_size;
    if world_size > 1 {
        transport
            .send(neighbor, Tag::ActiveMsg, format!("hello from rank {}", me).into_bytes())
            .unwrap_or_else(|e| eprintln!("send to {} failed: {:?}", neighbor, e));
    }

    for _ in 0..50 {
        for frame in transport.poll_recv() {
            println!(
                "rank {} got {:?} bytes from {}: {}",
                me,
                frame.tag,
                frame.from,
                String::from_utf8_lossy(&frame.bytes)
            );
        }
        thread::sleep(Duration::from_millis(20));
    }
}
