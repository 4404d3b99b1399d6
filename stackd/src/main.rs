//! `ustackd` — a minimal runnable binary wiring a TAP device to the stack
//! and exposing a demo UDP echo and TCP echo service, analogous to
//! `userland/apps/nc`.

use std::net::Ipv4Addr as StdIpv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use ustack_abi::SockAddrIn;
use ustack_core::event::Notification;
use ustack_core::stack::{StackConfig as CoreStackConfig, StackContext};
use ustack_net::socket::{TcpListener, UdpSocket};
use ustack_net::types::{Ipv4Addr, MacAddr, SockAddr};
use ustack_tap::TapDevice;

/// Userspace TCP/IP stack over a host TAP device, with demo echo services.
#[derive(Parser, Debug)]
#[command(name = "ustackd", about = "Userspace TCP/IP stack over a TAP device")]
struct Cli {
    /// Requested TAP interface name.
    #[arg(long, default_value = "ustack0")]
    tap_name: String,

    /// Our IPv4 address on the TAP interface.
    #[arg(long, default_value = "10.0.0.1")]
    ip: String,

    /// Netmask for the TAP interface.
    #[arg(long, default_value = "255.255.255.0")]
    netmask: String,

    /// Broadcast address for the TAP interface.
    #[arg(long, default_value = "10.0.0.255")]
    broadcast: String,

    /// MTU advertised by the TAP interface.
    #[arg(long, default_value_t = 1500)]
    mtu: u16,

    /// Capacity of the ARP neighbor cache.
    #[arg(long, default_value_t = 64)]
    arp_cache_capacity: usize,

    /// Expiry for an unanswered (INCOMPLETE) ARP request, in milliseconds.
    #[arg(long, default_value_t = 1_000)]
    arp_incomplete_ttl_ms: u64,

    /// Maximum ARP request retransmits before giving up on an address.
    #[arg(long, default_value_t = 3)]
    arp_max_retransmits: u8,

    /// UDP port the demo echo service listens on. Omit to disable it.
    #[arg(long)]
    udp_echo_port: Option<u16>,

    /// TCP port the demo echo service listens on. Omit to disable it.
    #[arg(long)]
    tcp_echo_port: Option<u16>,
}

fn parse_ipv4(s: &str) -> Result<Ipv4Addr, String> {
    let parsed = StdIpv4Addr::from_str(s).map_err(|e| e.to_string())?;
    let octets = parsed.octets();
    Ok(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_sigint_handler() {
    // SAFETY: `handle_sigint` only touches an `AtomicBool`, which is
    // signal-safe, and the registration follows the documented `signal(2)`
    // contract.
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
    }
}

/// Build a caller-facing `SockAddrIn` for the wildcard address and `port`
/// (host byte order), the shape a real ABI entry point would hand in.
fn wildcard_user_addr(port: u16) -> SockAddrIn {
    SockAddrIn {
        family: ustack_abi::AF_INET,
        port: port.to_be(),
        addr: Ipv4Addr::UNSPECIFIED.0,
        _pad: [0; 8],
    }
}

fn udp_echo_service(iface_stack: Arc<ustack_net::ingress::IfaceContext>, port: u16) {
    let local = match SockAddr::from_user(&wildcard_user_addr(port)) {
        Ok(addr) => addr,
        Err(e) => {
            error!("udp-echo: invalid bind address: {e}");
            return;
        }
    };
    let socket = match UdpSocket::bind(iface_stack, local) {
        Ok(s) => s,
        Err(e) => {
            error!("udp-echo: bind failed: {e}");
            return;
        }
    };
    info!("udp-echo: listening on port {port}");
    loop {
        match socket.recv_from(None) {
            Ok((from, data)) => {
                let now = ustack_sync::clock::uptime_ms();
                if let Err(e) = socket.send_to(&data, from, now) {
                    error!("udp-echo: send_to {from:?} failed: {e}");
                }
            }
            Err(e) => {
                error!("udp-echo: recv_from failed: {e}");
                break;
            }
        }
    }
}

fn tcp_echo_service(iface_stack: Arc<ustack_net::ingress::IfaceContext>, port: u16) {
    let local = match SockAddr::from_user(&wildcard_user_addr(port)) {
        Ok(addr) => addr,
        Err(e) => {
            error!("tcp-echo: invalid bind address: {e}");
            return;
        }
    };
    let listener = match TcpListener::bind(iface_stack, local) {
        Ok(l) => l,
        Err(e) => {
            error!("tcp-echo: bind failed: {e}");
            return;
        }
    };
    info!("tcp-echo: listening on port {port}");
    loop {
        match listener.accept(None) {
            Ok(conn) => {
                std::thread::spawn(move || {
                    let mut buf = [0u8; 2048];
                    loop {
                        match conn.recv(&mut buf, None) {
                            Ok(0) => break,
                            Ok(n) => {
                                let now = ustack_sync::clock::uptime_ms();
                                if conn.send(&buf[..n], now).is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    let now = ustack_sync::clock::uptime_ms();
                    let _ = conn.close(now);
                });
            }
            Err(e) => {
                error!("tcp-echo: accept failed: {e}");
                break;
            }
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let ipv4 = parse_ipv4(&cli.ip).unwrap_or_else(|e| {
        eprintln!("invalid --ip: {e}");
        std::process::exit(2);
    });
    let netmask = parse_ipv4(&cli.netmask).unwrap_or_else(|e| {
        eprintln!("invalid --netmask: {e}");
        std::process::exit(2);
    });
    let broadcast = parse_ipv4(&cli.broadcast).unwrap_or_else(|e| {
        eprintln!("invalid --broadcast: {e}");
        std::process::exit(2);
    });

    let config = CoreStackConfig {
        ipv4,
        netmask,
        broadcast,
        arp_cache_capacity: cli.arp_cache_capacity,
        arp_incomplete_ttl_ms: cli.arp_incomplete_ttl_ms,
        arp_max_retransmits: cli.arp_max_retransmits,
    };

    let stack = Arc::new(StackContext::new(config));

    let mac = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
    let tap = match TapDevice::open(&cli.tap_name, mac, cli.mtu) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!("failed to open tap device {}: {e}", cli.tap_name);
            std::process::exit(1);
        }
    };
    info!("opened tap device {}", tap.name());

    let handle = match stack.register_device(tap.clone()) {
        Ok(h) => h,
        Err(e) => {
            error!("failed to register device: {e}");
            std::process::exit(1);
        }
    };
    let _ = handle;

    if let Err(e) = stack.init() {
        error!("failed to initialize stack: {e}");
        std::process::exit(1);
    }
    if let Err(e) = stack.run() {
        error!("failed to start stack: {e}");
        std::process::exit(1);
    }

    let iface = stack.iface().expect("device was just registered");
    info!("interface up: {:?}", iface.info());
    let _reader = ustack_tap::spawn_reader(tap, iface.clone(), stack.clone());

    let timer_stack = stack.clone();
    std::thread::Builder::new()
        .name("ustack-timer-tick".into())
        .spawn(move || loop {
            std::thread::sleep(std::time::Duration::from_millis(100));
            timer_stack.notifier().send(Notification::Timer);
        })
        .expect("failed to spawn timer ticker thread");

    if let Some(port) = cli.udp_echo_port {
        let iface = iface.clone();
        std::thread::spawn(move || udp_echo_service(iface, port));
    }
    if let Some(port) = cli.tcp_echo_port {
        let iface = iface.clone();
        std::thread::spawn(move || tcp_echo_service(iface, port));
    }

    install_sigint_handler();
    info!("ustackd running, ip={ipv4} tap={}", cli.tap_name);
    while !SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }
    info!("shutting down");
    stack.shutdown();
}
