use super::*;
use crate::testing::{static_host, Mesh};


pub(super) const A: &str = "10.1.0.1";
pub(super) const B: &str = "10.1.0.2";
pub(super) const LH: &str = "10.1.0.100";

pub(super) fn vpn(s: &str) -> VpnAddr {
    s.parse().unwrap()
}

/// Two nodes that know each other's outside address.
pub(super) fn pair_mesh() -> Mesh {
    let mut mesh = Mesh::new();
    mesh.add(A, |c| static_host(c, B, 1));
    mesh.add(B, |c| static_host(c, A, 0));
    mesh
}

/// A lighthouse (node 0) and two clients that can only reach it.
pub(super) fn lighthouse_mesh() -> Mesh {
    let mut mesh = Mesh::new();
    mesh.add(LH, |c| c.lighthouse.am_lighthouse = true);
    for client in [A, B] {
        mesh.add(client, |c| {
            c.lighthouse.hosts = vec![vpn(LH)];
            static_host(c, LH, 0);
        });
    }
    let (a, b) = (mesh.nodes[1].addr(), mesh.nodes[2].addr());
    mesh.net.block(a, b);

    for client in [1, 2] {
        mesh.nodes[client].iface.rebind().unwrap();
        mesh.nodes[client].kick(vpn(LH));
        mesh.pump();
        assert!(mesh.nodes[client].tunnel(vpn(LH)).is_some());
    }
    mesh
}
