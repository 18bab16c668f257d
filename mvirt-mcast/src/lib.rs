//! mvirt-mcast: multicast fan-out forwarder
//!
//! Every frame received on an enabled port is copied to a set of mirror ports
//! and forwarded to a primary port, with its Ethernet header rewritten.

pub mod config;
pub mod dataplane;
pub mod test_util;
