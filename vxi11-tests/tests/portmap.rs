use std::{
    net::{SocketAddr, UdpSocket},
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use vxi11_client::get_port;
use vxi11_protocol::{
    GETPORT, PORTMAP_PROGRAM, PORTMAP_VERSION, Transport, VXI11_CORE_PROGRAM,
    VXI11_CORE_VERSION,
    codec::{decode_u32, encode_call, getport_args, parse_reply},
};
use vxi11_server::{
    portmap::{Portmapper, PortmapperHandle},
    registry::{PortRange, PortRegistry},
};

const GRACE: Duration = Duration::from_millis(500);

fn start(transport: Transport, registry: &PortRegistry) -> PortmapperHandle {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    Portmapper::bind(transport, addr, registry.reader())
        .unwrap()
        .spawn(CancellationToken::new())
        .unwrap()
}

#[test]
fn garbage_datagram_is_ignored() {
    let registry = PortRegistry::new(PortRange::new(47010, 47019).unwrap());
    let portmapper = start(Transport::Udp, &registry);

    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    socket
        .send_to(&[0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3, 4, 5], portmapper.local_addr())
        .unwrap();
    let mut buf = [0u8; 64];
    assert!(socket.recv(&mut buf).is_err());

    let call = encode_call(
        0x1234,
        PORTMAP_PROGRAM,
        PORTMAP_VERSION,
        GETPORT,
        &getport_args(VXI11_CORE_PROGRAM, VXI11_CORE_VERSION, 6),
    );
    socket.send_to(&call, portmapper.local_addr()).unwrap();
    let len = socket.recv(&mut buf).unwrap();
    assert_eq!(len, 28);
    let payload = parse_reply(&buf[..len], 0x1234).unwrap();
    assert_eq!(decode_u32(payload).unwrap(), 47010);

    portmapper.stop(GRACE);
}

#[test]
fn announces_rotated_port() {
    let registry = PortRegistry::new(PortRange::new(47020, 47021).unwrap());
    let udp = start(Transport::Udp, &registry);
    let tcp = start(Transport::Tcp, &registry);

    assert_eq!(get_port(udp.local_addr(), Transport::Udp).unwrap(), 47020);
    assert_eq!(get_port(tcp.local_addr(), Transport::Tcp).unwrap(), 47020);
    registry.advance();
    assert_eq!(get_port(udp.local_addr(), Transport::Udp).unwrap(), 47021);
    assert_eq!(get_port(tcp.local_addr(), Transport::Tcp).unwrap(), 47021);
    registry.advance();
    assert_eq!(get_port(tcp.local_addr(), Transport::Tcp).unwrap(), 47020);

    udp.stop(GRACE);
    tcp.stop(GRACE);
}

#[test]
fn stopped_portmapper_releases_port() {
    let registry = PortRegistry::new(PortRange::default());
    let portmapper = start(Transport::Udp, &registry);
    let addr = portmapper.local_addr();
    portmapper.stop(GRACE);
    UdpSocket::bind(addr).unwrap();
}
