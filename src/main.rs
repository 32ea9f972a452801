use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use ipnet::Ipv4Net;
use nix::sys::epoll::EpollFlags;
use nix::sys::signal::{SigHandler, Signal, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tunroute::error::Error;
use tunroute::l3::L3Peer;
use tunroute::router::Router;
use tunroute::transport;
use tunroute::tun::TunDevice;

/// Event batch capacity per epoll wait.
const MAX_CONCURRENT: usize = 32;

/// Milliseconds one tick may wait before returning to the supervisory loop.
const WAIT_TIMEOUT_MS: u16 = 250;

#[derive(Parser)]
#[command(name = "tunroute")]
#[command(about = "User-space IPv4 tunnel router")]
struct Args {
    /// Tunnel network address (must match --address and --netmask)
    #[arg(long)]
    network: Ipv4Addr,

    /// Netmask of the tunnel network
    #[arg(long)]
    netmask: Ipv4Addr,

    /// Local address assigned to the TUN interface
    #[arg(long)]
    address: Ipv4Addr,

    /// TUN interface name
    #[arg(long, default_value = "tun0")]
    device: String,

    /// TCP port to listen on (server mode) or connect to (client mode)
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Server address to connect to (client mode)
    #[arg(long)]
    connect: Option<Ipv4Addr>,

    /// Tunnel address reachable through --connect (repeatable)
    #[arg(long = "peer")]
    peers: Vec<Ipv4Addr>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn shutdown_handler(_: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tunroute=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();

    unsafe {
        signal(Signal::SIGINT, SigHandler::Handler(shutdown_handler))?;
        signal(Signal::SIGTERM, SigHandler::Handler(shutdown_handler))?;
    }

    let net = Ipv4Net::with_netmask(args.address, args.netmask)
        .map_err(|e| format!("invalid --address/--netmask: {e}"))?;
    if net.network() != args.network {
        warn!(
            given = %args.network,
            derived = %net.network(),
            "--network does not match --address/--netmask"
        );
    }

    info!(device = %args.device, address = %args.address, "Initializing tunroute");

    let tun = TunDevice::create(&args.device)?;
    tun.configure(args.address, args.netmask)?;
    info!(device = %tun.name(), fd = tun.as_raw_fd(), "TUN device ready");

    let router = Arc::new(Router::new(MAX_CONCURRENT, WAIT_TIMEOUT_MS)?);

    let tun_peer = Arc::new(L3Peer::new(
        tun.into_fd(),
        SocketAddrV4::new(args.address, 0),
    ));
    router.register(tun_peer, EpollFlags::empty())?;

    let listener = match args.connect {
        Some(server) => {
            transport::connect_peer(server, args.port, &router, &args.peers)?;
            None
        }
        None => Some(transport::spawn_listener(args.port, Arc::clone(&router))?),
    };

    info!("Forwarding engine running");

    // Tick until a signal flips the shutdown flag. A tick ends whenever a
    // wait comes back empty, so the flag is observed within one timeout.
    while !SHUTDOWN.load(Ordering::SeqCst) {
        match router.run() {
            Ok(()) => {}
            Err(Error::Interrupted) => break,
            Err(e) => {
                error!(error = %e, "Event loop failed");
                return Err(e.into());
            }
        }
    }

    if let Some(handle) = listener {
        handle.stop();
    }

    info!("Shut down cleanly");
    Ok(())
}
