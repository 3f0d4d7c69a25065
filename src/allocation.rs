//! Server-side allocation of a relayed transport address.
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use stun_codec::rfc5389::attributes::XorMappedAddress;
use stun_codec::rfc5766::attributes::{
    Lifetime, RequestedTransport, XorPeerAddress, XorRelayAddress,
};
use stun_codec::rfc5766::methods::{ALLOCATE, CREATE_PERMISSION, REFRESH};
use tracing::debug;

use crate::client::ClientInner;
use crate::permission::{Permission, PermissionInner};
use crate::{Error, ErrorKind, Result, DEFAULT_LIFETIME_SECONDS};

const TRANSPORT_PROTOCOL_UDP: u8 = 17;

/// A relayed transport address reserved on the server.
///
/// Created by `Client::allocate`. The allocation stays valid on the server
/// for the lifetime hint; call [`Allocation::refresh`] to extend it and
/// [`Allocation::close`] to release it early.
#[derive(Debug)]
pub struct Allocation {
    inner: Arc<AllocationInner>,
}
impl Allocation {
    pub(crate) fn allocate(client: &Arc<ClientInner>) -> Result<Allocation> {
        let response = track!(client.request_with_auth(ALLOCATE, &|request| {
            request.add_attribute(RequestedTransport::new(TRANSPORT_PROTOCOL_UDP));
            Ok(())
        }))?;

        let relayed = track_assert_some!(
            response
                .get_attribute::<XorRelayAddress>()
                .map(|a| a.address()),
            ErrorKind::Protocol,
            "Allocate success response without XOR-RELAYED-ADDRESS"
        );
        let reflexive = response
            .get_attribute::<XorMappedAddress>()
            .map(|a| a.address());
        let lifetime = response
            .get_attribute::<Lifetime>()
            .map(|a| a.lifetime())
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_LIFETIME_SECONDS));
        debug!(
            "allocated relayed address {} (reflexive: {:?}, lifetime: {:?})",
            relayed, reflexive, lifetime
        );

        let inner = Arc::new(AllocationInner {
            client: Arc::downgrade(client),
            relayed,
            reflexive,
            lifetime: Mutex::new(lifetime),
            permissions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        client.register_allocation(&inner);
        Ok(Allocation { inner })
    }

    /// Returns the relayed transport address peers send to.
    pub fn relayed(&self) -> SocketAddr {
        self.inner.relayed
    }

    /// Returns the server-reflexive address, when the server reported one.
    pub fn reflexive(&self) -> Option<SocketAddr> {
        self.inner.reflexive
    }

    /// Returns the most recent lifetime hint from the server.
    pub fn lifetime(&self) -> Duration {
        *self.inner.lifetime.lock()
    }

    /// Installs a permission for `peer_ip`, covering every port on that IP.
    pub fn create(&self, peer_ip: IpAddr) -> Result<Permission> {
        let client = track!(self.inner.client())?;
        let peer = SocketAddr::new(peer_ip, 0);
        track!(client.request_with_auth(CREATE_PERMISSION, &|request| {
            request.add_attribute(XorPeerAddress::new(peer));
            Ok(())
        }))?;
        debug!("permission installed for {}", peer_ip);

        let inner = Arc::new(PermissionInner::new(self.inner.client.clone(), peer_ip));
        self.inner.permissions.lock().push(Arc::downgrade(&inner));
        Ok(Permission::new(inner))
    }

    /// Asks the server to extend the allocation to `lifetime`.
    ///
    /// Returns the lifetime the server granted. There is no background
    /// refresh task; callers decide when to invoke this.
    pub fn refresh(&self, lifetime: Duration) -> Result<Duration> {
        let client = track!(self.inner.client())?;
        let response = track!(client.request_with_auth(REFRESH, &|request| {
            let lifetime = track!(Lifetime::new(lifetime).map_err(Error::from))?;
            request.add_attribute(lifetime);
            Ok(())
        }))?;
        let granted = response
            .get_attribute::<Lifetime>()
            .map(|a| a.lifetime())
            .unwrap_or(lifetime);
        *self.inner.lifetime.lock() = granted;
        Ok(granted)
    }

    /// Releases the allocation: closes its permissions, then requests a zero
    /// lifetime on the server. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        track!(self.inner.close())
    }
}

#[derive(Debug)]
pub(crate) struct AllocationInner {
    client: Weak<ClientInner>,
    relayed: SocketAddr,
    reflexive: Option<SocketAddr>,
    lifetime: Mutex<Duration>,
    permissions: Mutex<Vec<Weak<PermissionInner>>>,
    closed: AtomicBool,
}
impl AllocationInner {
    fn client(&self) -> Result<Arc<ClientInner>> {
        track_assert!(
            !self.closed.load(Ordering::SeqCst),
            ErrorKind::Closed,
            "Allocation is closed"
        );
        let client = track_assert_some!(
            self.client.upgrade(),
            ErrorKind::Closed,
            "Client has been dropped"
        );
        Ok(client)
    }

    pub(crate) fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let permissions: Vec<_> = self.permissions.lock().drain(..).collect();
        for permission in permissions {
            if let Some(permission) = permission.upgrade() {
                permission.close();
            }
        }
        let client = match self.client.upgrade() {
            Some(client) => client,
            None => return Ok(()),
        };
        track!(client.request_with_auth(REFRESH, &|request| {
            let lifetime = track!(Lifetime::new(Duration::from_secs(0)).map_err(Error::from))?;
            request.add_attribute(lifetime);
            Ok(())
        }))?;
        debug!("released allocation {}", self.relayed);
        Ok(())
    }
}
