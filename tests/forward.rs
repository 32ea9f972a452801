//! End-to-end forwarding scenarios: pipes standing in for the TUN device,
//! real TCP sockets for tunnel peers.

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::epoll::EpollFlags;
use nix::unistd;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv4Repr};

use tunroute::forwarding::AddrKey;
use tunroute::l3::L3Peer;
use tunroute::peer::Peer;
use tunroute::router::Router;
use tunroute::transport;

/// Build an IPv4 datagram with a correct header checksum.
fn build_datagram(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    let repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: IpProtocol::Udp,
        payload_len: payload.len(),
        hop_limit: 64,
    };

    let mut buffer = vec![0u8; 20 + payload.len()];
    let mut packet = Ipv4Packet::new_unchecked(&mut buffer);
    repr.emit(&mut packet, &ChecksumCapabilities::default());
    packet.payload_mut().copy_from_slice(payload);
    buffer
}

fn unspecified() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
}

#[test]
fn forwards_datagram_between_descriptors() {
    let router = Router::new(1, 50).unwrap();
    let map = router.forwarding_map();

    let (in_rx, in_tx) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();
    let (out_rx, out_tx) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();

    let dst = Ipv4Addr::new(172, 168, 2, 32);
    map.put(AddrKey::from_destination(dst), out_tx.as_raw_fd());

    let peer = Arc::new(L3Peer::new(in_rx, unspecified()));
    router.register(peer.clone(), EpollFlags::empty()).unwrap();

    let datagram = build_datagram(Ipv4Addr::new(10, 0, 0, 2), dst, b"Hello");
    assert_eq!(datagram.len(), 25);
    unistd::write(&in_tx, &datagram).unwrap();

    router.run().unwrap();

    let mut out = [0u8; 128];
    let n = unistd::read(out_rx.as_raw_fd(), &mut out).unwrap();
    assert_eq!(n, 25);
    assert_eq!(&out[..n], &datagram[..]);
    assert_eq!(peer.forwarded(), 1);
}

#[test]
fn drops_non_ipv4_without_eviction() {
    let router = Router::new(1, 50).unwrap();
    let map = router.forwarding_map();

    let (in_rx, in_tx) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();
    let (out_rx, out_tx) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();

    let dst = Ipv4Addr::new(172, 168, 2, 32);
    map.put(AddrKey::from_destination(dst), out_tx.as_raw_fd());

    let peer = Arc::new(L3Peer::new(in_rx, unspecified()));
    let fd = peer.socket();
    router.register(peer.clone(), EpollFlags::empty()).unwrap();

    // Same shape as a valid datagram, but the version nibble says 6.
    let mut datagram = build_datagram(Ipv4Addr::new(10, 0, 0, 2), dst, b"Hello");
    datagram[0] = 0x65;
    unistd::write(&in_tx, &datagram).unwrap();

    router.run().unwrap();

    // Dropped quietly: nothing forwarded, peer still registered.
    let mut out = [0u8; 128];
    assert!(unistd::read(out_rx.as_raw_fd(), &mut out).is_err());
    assert_eq!(peer.dropped(), 1);
    assert!(router.is_registered(fd));
}

#[test]
fn header_only_datagram_forwards() {
    // Total length 20: header with no payload is still a datagram.
    let router = Router::new(1, 50).unwrap();
    let map = router.forwarding_map();

    let (in_rx, in_tx) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();
    let (out_rx, out_tx) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();

    let dst = Ipv4Addr::new(10, 4, 4, 4);
    map.put(AddrKey::from_destination(dst), out_tx.as_raw_fd());

    let peer = Arc::new(L3Peer::new(in_rx, unspecified()));
    router.register(peer, EpollFlags::empty()).unwrap();

    let datagram = build_datagram(Ipv4Addr::new(10, 0, 0, 2), dst, b"");
    assert_eq!(datagram.len(), 20);
    unistd::write(&in_tx, &datagram).unwrap();

    router.run().unwrap();

    let mut out = [0u8; 64];
    assert_eq!(unistd::read(out_rx.as_raw_fd(), &mut out).unwrap(), 20);
}

/// Full tunnel path over TCP: a raw client pushes a datagram through the
/// accept loop into the "TUN" pipe, and the learned source mapping carries
/// the reply back over the same socket.
#[test]
fn tcp_peer_roundtrip_with_source_learning() {
    let router = Arc::new(Router::new(8, 50).unwrap());
    let map = router.forwarding_map();

    // Pipe pair standing in for the TUN device.
    let (tun_rx, tun_tx) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();
    let (tun_out_rx, tun_out_tx) = unistd::pipe2(OFlag::O_NONBLOCK).unwrap();

    let tun_addr = Ipv4Addr::new(10, 8, 0, 1);
    let client_tun_addr = Ipv4Addr::new(10, 8, 0, 2);

    // Traffic for the local tunnel address goes out the TUN write side.
    map.put(
        AddrKey::from_destination(tun_addr),
        tun_out_tx.as_raw_fd(),
    );

    let tun_peer = Arc::new(L3Peer::new(tun_rx, SocketAddrV4::new(tun_addr, 0)));
    router.register(tun_peer, EpollFlags::empty()).unwrap();

    let handle = transport::spawn_listener(0, Arc::clone(&router)).unwrap();
    let port = handle.local_addr().port();

    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .unwrap();

    // Wait for the accept loop to register the connection (TUN peer + one
    // TCP peer).
    for _ in 0..200 {
        if router.peer_count() == 2 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(router.peer_count(), 2);

    // Client -> TUN: the datagram lands on the TUN write side and the
    // client's tunnel address is learned.
    use std::io::Write;
    let inbound = build_datagram(client_tun_addr, tun_addr, b"ping");
    client.write_all(&inbound).unwrap();

    let mut delivered = Vec::new();
    for _ in 0..50 {
        router.run().unwrap();
        let mut out = [0u8; 256];
        if let Ok(n) = unistd::read(tun_out_rx.as_raw_fd(), &mut out) {
            delivered.extend_from_slice(&out[..n]);
            break;
        }
    }
    assert_eq!(delivered, inbound);
    assert!(
        map.get(&AddrKey::from_destination(client_tun_addr))
            .is_some()
    );

    // TUN -> client: the learned mapping resolves the reply.
    let reply = build_datagram(tun_addr, client_tun_addr, b"pong");
    unistd::write(&tun_tx, &reply).unwrap();

    let mut received = vec![0u8; reply.len()];
    let mut filled = 0;
    for _ in 0..50 {
        router.run().unwrap();
        match client.read(&mut received[filled..]) {
            Ok(n) => {
                filled += n;
                if filled == reply.len() {
                    break;
                }
            }
            Err(_) => continue,
        }
    }
    assert_eq!(filled, reply.len());
    assert_eq!(received, reply);

    handle.stop();
}

/// A disconnected TCP peer is evicted on its next event and its forwarding
/// entries disappear with it.
#[test]
fn disconnected_peer_is_evicted_and_scrubbed() {
    let router = Arc::new(Router::new(8, 50).unwrap());
    let map = router.forwarding_map();

    let handle = transport::spawn_listener(0, Arc::clone(&router)).unwrap();
    let port = handle.local_addr().port();

    let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
    for _ in 0..200 {
        if router.peer_count() == 1 {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(router.peer_count(), 1);

    // Teach the map about the client, then hang up.
    use std::io::Write;
    let datagram = build_datagram(
        Ipv4Addr::new(10, 8, 0, 2),
        Ipv4Addr::new(10, 8, 0, 1),
        b"hi",
    );
    client.write_all(&datagram).unwrap();
    for _ in 0..50 {
        router.run().unwrap();
        if !map.is_empty() {
            break;
        }
    }
    assert!(!map.is_empty());

    drop(client);
    for _ in 0..50 {
        router.run().unwrap();
        if router.peer_count() == 0 {
            break;
        }
    }
    assert_eq!(router.peer_count(), 0);
    assert!(map.is_empty());

    handle.stop();
}
