//! Network plumbing shared by discovery, signaling and media

pub mod interfaces;
pub mod udp;

pub use interfaces::{
    select_local_ip, select_local_ip_with, shared_network, InterfaceLister, NetworkInterface,
    StaticInterfaces, SystemInterfaces,
};
pub use udp::{bind_media_socket, create_socket, is_timeout, local_port, SocketOptions};
