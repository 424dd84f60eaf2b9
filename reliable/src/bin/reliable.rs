//! Client/server entry point. Opens a UDP socket, wires it and stdin/stdout
//! into the session machinery, and drives everything from the workspace's
//! poll-based event loop (§4.4, §6 — the loop itself, argument parsing, and
//! raw datagram demultiplexing are all external collaborators, not core).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, UdpSocket};
use std::rc::Rc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use log::{error, info};
use runtime::Io;
use utils::error::*;

use reliable::conn::{self, PeerConn, StdioConn};
use reliable::packet::MAX_LEN;
use reliable::registry::Registry;
use reliable::session::Session;

/// A reliable byte-stream endpoint layered over UDP.
#[derive(Parser)]
#[command(name = "reliable", about = "Reliable, in-order byte streams over UDP")]
struct Args {
	#[command(subcommand)]
	mode: Mode,

	/// Sliding window size, in packets.
	#[arg(short = 'w', long, default_value_t = 5, global = true)]
	window: u32,

	/// Retransmission timeout, in milliseconds.
	#[arg(short = 't', long = "timeout", default_value_t = 5000, global = true)]
	timeout_ms: u64,
}

#[derive(Subcommand)]
enum Mode {
	/// Connect to a listening endpoint and relay stdin/stdout over it.
	Client {
		/// Destination, as `host:port`.
		destination: String,
	},
	/// Listen for incoming connections and relay each peer's stream to stdout.
	Server {
		/// Local port to listen on.
		#[arg(short = 'p', long)]
		port: u16,

		/// Exit once the first peer session tears down.
		#[arg(short = 's', long)]
		single_connection: bool,
	},
}

fn main() {
	log::set_max_level(log::LevelFilter::Info);
	let _ = log::set_logger(&runtime::logger::Logger);

	let args = Args::parse();
	let timeout = Duration::from_millis(args.timeout_ms);

	let result = match args.mode {
		Mode::Client { destination } => run_client(&destination, args.window, timeout),
		Mode::Server { port, single_connection } => run_server(port, args.window, timeout, single_connection),
	};

	if result.is_err() {
		std::process::exit(1);
	}
}

fn bind_unspecified(addr: SocketAddr) -> std::io::Result<UdpSocket> {
	let socket = UdpSocket::bind::<SocketAddr>(match addr {
		SocketAddr::V4(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into(),
		SocketAddr::V6(_) => SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0).into(),
	})?;

	socket.set_nonblocking(true)?;
	Ok(socket)
}

fn run_client(destination: &str, window: u32, timeout: Duration) -> Result {
	let addr: SocketAddr = destination.parse().map_err(|e| error!("invalid destination {destination:?}: {e}"))?;

	let raw = bind_unspecified(addr).map_err(|e| error!("failed to open socket: {e}"))?;
	raw.connect(addr).map_err(|e| error!("failed to connect to {addr}: {e}"))?;

	let mut socket = Some(Rc::new(Io::new(raw)));
	let conn = StdioConn::new(Rc::clone(socket.as_ref().expect("just set"))).map_err(|e| error!("failed to set up stdio: {e}"))?;

	let mut session = Some(Session::new(conn, window, timeout));
	let mut buf = [0u8; MAX_LEN];
	let period = (timeout / 2).max(Duration::from_millis(1));

	info!("connecting to {addr}");

	runtime::exec(move || {
		let mut done = false;

		if let Some(io) = socket.clone() {
			while !done {
				let Some(s) = session.as_mut() else { break };

				match io.get().recv(&mut buf) {
					Ok(n) => done = s.on_packet(&buf[..n]),
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
					Err(e) => {
						error!("recv failed: {e}");
						break;
					}
				}
			}
		}

		if !done {
			if let Some(s) = session.as_mut() {
				done = s.on_input_readable() || s.on_output_writable();
			}
		}

		if !done {
			if let Some(s) = session.as_mut() {
				done = s.on_timer(Instant::now());
			}
		}

		if done {
			session = None;
			socket = None;
		}

		if session.is_some() {
			Some(period)
		} else {
			None
		}
	})
}

fn run_server(port: u16, window: u32, timeout: Duration, single_connection: bool) -> Result {
	let raw = UdpSocket::bind(("0.0.0.0", port)).map_err(|e| error!("failed to bind port {port}: {e}"))?;
	raw.set_nonblocking(true).map_err(|e| error!("failed to set nonblocking: {e}"))?;

	let mut socket = Some(Rc::new(Io::new(raw)));
	let mut stdout = Some(conn::shared_stdout().map_err(|e| error!("failed to set up stdout: {e}"))?);

	let mut registry: Registry<PeerConn> = Registry::new(window, timeout);
	let mut buf = [0u8; MAX_LEN];
	let period = (timeout / 2).max(Duration::from_millis(1));
	let mut seen_a_connection = false;

	info!("listening on 0.0.0.0:{port}");

	runtime::exec(move || {
		if let Some(io) = socket.as_ref() {
			loop {
				match io.get().recv_from(&mut buf) {
					Ok((n, peer)) => {
						let socket = Rc::clone(io);
						let stdout = Rc::clone(stdout.as_ref().expect("still listening"));
						registry.on_datagram(peer, &buf[..n], || PeerConn::new(socket, peer, stdout));
					}
					Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
					Err(e) => {
						error!("recv_from failed: {e}");
						break;
					}
				}
			}
		}

		registry.drive_io();
		registry.tick(Instant::now());

		seen_a_connection |= !registry.is_empty();

		if single_connection && seen_a_connection && registry.is_empty() {
			socket = None;
			stdout = None;
		}

		if socket.is_some() {
			Some(period)
		} else {
			None
		}
	})
}
