//! Per-peer-IP authorization.
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::ClientInner;
use crate::peer::{PeerConnection, PeerInner};
use crate::{ErrorKind, Result};

/// Authorization for the allocation to exchange traffic with one peer IP,
/// on any port.
///
/// Created by `Allocation::create`. Owns the [`PeerConnection`]s opened to
/// that IP; dropping the handle closes them like [`Permission::close`]
/// does, so none stays registered with the client past its owner.
#[derive(Debug)]
pub struct Permission {
    inner: Arc<PermissionInner>,
}
impl Permission {
    pub(crate) fn new(inner: Arc<PermissionInner>) -> Permission {
        Permission { inner }
    }

    /// Returns the peer IP this permission covers.
    pub fn ip(&self) -> IpAddr {
        self.inner.peer_ip
    }

    /// Opens a datagram-style connection to `peer`.
    ///
    /// Purely local: the permission already covers the IP, so no request is
    /// sent. Fails if `peer` is not on this permission's IP, or if a
    /// connection to `peer` already exists.
    pub fn create_udp(&self, peer: SocketAddr) -> Result<PeerConnection> {
        track_assert!(
            !self.inner.closed.load(Ordering::SeqCst),
            ErrorKind::Closed,
            "Permission is closed"
        );
        track_assert_eq!(
            peer.ip(),
            self.inner.peer_ip,
            ErrorKind::InvalidInput,
            "Peer {} is not covered by the permission for {}",
            peer,
            self.inner.peer_ip
        );
        let client = track_assert_some!(
            self.inner.client.upgrade(),
            ErrorKind::Closed,
            "Client has been dropped"
        );
        let conn = PeerInner::new(self.inner.client.clone(), peer);
        track!(client.register_peer(&conn))?;
        self.inner.connections.lock().push(Arc::clone(&conn));
        Ok(PeerConnection::new(conn))
    }

    /// Closes every connection opened under this permission and deregisters
    /// them from the client. Calling it again is a no-op that also succeeds.
    pub fn close(&self) -> Result<()> {
        self.inner.close();
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct PermissionInner {
    client: Weak<ClientInner>,
    peer_ip: IpAddr,
    connections: Mutex<Vec<Arc<PeerInner>>>,
    closed: AtomicBool,
}
impl PermissionInner {
    pub(crate) fn new(client: Weak<ClientInner>, peer_ip: IpAddr) -> PermissionInner {
        PermissionInner {
            client,
            peer_ip,
            connections: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let connections: Vec<_> = self.connections.lock().drain(..).collect();
        for conn in connections {
            conn.close();
        }
    }
}
impl Drop for PermissionInner {
    fn drop(&mut self) {
        self.close();
    }
}
