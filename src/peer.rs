//! Datagram-style connection to a single peer behind the relay.
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytecodec::EncodeExt;
use parking_lot::Mutex;
use stun_codec::rfc5766::attributes::{ChannelNumber, Data, XorPeerAddress};
use stun_codec::rfc5766::methods::{CHANNEL_BIND, SEND};
use tracing::debug;

use crate::auth::attach_fingerprint;
use crate::channel_data::{ChannelData, ChannelDataEncoder};
use crate::client::ClientInner;
use crate::{Error, ErrorKind, Result};

/// Inbound datagrams buffered per connection; the oldest is discarded when
/// the queue is full, matching UDP semantics.
const INBOUND_QUEUE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BindState {
    Unbound,
    Binding(u16),
    Bound(u16),
    Closed,
}

/// A datagram endpoint for one `(relayed address, peer address)` pair.
///
/// Writes travel as Send indications until [`PeerConnection::bind`] installs
/// a channel binding, after which both directions use compact ChannelData
/// frames. Reads block until a datagram arrives or the read deadline fires.
///
/// The owning `Permission` keeps the connection registered with the client;
/// dropping this handle alone does not close it, closing the permission (or
/// dropping it) does.
pub struct PeerConnection {
    inner: Arc<PeerInner>,
}
impl PeerConnection {
    pub(crate) fn new(inner: Arc<PeerInner>) -> PeerConnection {
        PeerConnection { inner }
    }

    /// Returns the peer transport address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Receives one datagram, copying at most `buf.len()` bytes of it.
    ///
    /// Blocks until a datagram is queued, the read deadline expires
    /// ([`ErrorKind::Timeout`]) or the connection is closed
    /// ([`ErrorKind::Closed`]). Bytes past `buf.len()` are discarded.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        track_assert!(
            *self.inner.state.lock() != BindState::Closed,
            ErrorKind::Closed,
            "Connection is closed"
        );
        let deadline = *self.inner.read_deadline.lock();
        let datagram = match deadline {
            Some(deadline) => match self.inner.queue_rx.recv_deadline(deadline) {
                Ok(datagram) => datagram,
                Err(flume::RecvTimeoutError::Timeout) => {
                    track_panic!(ErrorKind::Timeout, "Read deadline expired")
                }
                Err(flume::RecvTimeoutError::Disconnected) => {
                    track_panic!(ErrorKind::Closed, "Connection is closed")
                }
            },
            None => match self.inner.queue_rx.recv() {
                Ok(datagram) => datagram,
                Err(_) => track_panic!(ErrorKind::Closed, "Connection is closed"),
            },
        };
        let len = datagram.len().min(buf.len());
        buf[..len].copy_from_slice(&datagram[..len]);
        Ok(len)
    }

    /// Sends one datagram to the peer.
    ///
    /// Unbound connections wrap the payload in a Send indication; bound ones
    /// write a ChannelData frame straight to the server socket.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let state = *self.inner.state.lock();
        match state {
            BindState::Closed => track_panic!(ErrorKind::Closed, "Connection is closed"),
            BindState::Bound(number) => self.write_channel_data(number, buf),
            BindState::Unbound | BindState::Binding(_) => self.write_send_indication(buf),
        }
    }

    fn write_send_indication(&self, buf: &[u8]) -> Result<usize> {
        let client = track!(self.inner.client())?;
        let mut indication = client.new_indication(SEND);
        indication.add_attribute(XorPeerAddress::new(self.inner.peer));
        let data = track!(Data::new(buf.to_vec()).map_err(Error::from))?;
        indication.add_attribute(data);
        track!(attach_fingerprint(&mut indication))?;
        track!(client.stun.indicate(indication))?;
        Ok(buf.len())
    }

    fn write_channel_data(&self, number: u16, buf: &[u8]) -> Result<usize> {
        let client = track!(self.inner.client())?;
        let frame = track!(ChannelData::new(number, buf.to_vec()))?;
        let bytes = track!(ChannelDataEncoder::default()
            .encode_into_bytes(frame)
            .map_err(Error::from))?;
        let deadline = *self.inner.write_deadline.lock();
        track!(client.conn.send(&bytes, deadline))?;
        Ok(buf.len())
    }

    /// Installs a channel binding for this peer.
    ///
    /// Picks an unused channel number, issues a ChannelBind request and, on
    /// success, switches writes to the ChannelData path. Fails with
    /// [`ErrorKind::AlreadyBound`] if a binding exists or is in flight; on
    /// any failure the picked number is not reserved.
    pub fn bind(&self) -> Result<()> {
        let client = track!(self.inner.client())?;
        let number = {
            let mut state = self.inner.state.lock();
            match *state {
                BindState::Closed => track_panic!(ErrorKind::Closed, "Connection is closed"),
                BindState::Bound(_) | BindState::Binding(_) => {
                    track_panic!(ErrorKind::AlreadyBound, "Channel already bound")
                }
                BindState::Unbound => {
                    let number = track!(client.pick_channel_number())?;
                    *state = BindState::Binding(number);
                    number
                }
            }
        };

        let peer = self.inner.peer;
        let result = client.request_with_auth(CHANNEL_BIND, &|request| {
            let channel_number = track!(ChannelNumber::new(number).map_err(Error::from))?;
            request.add_attribute(channel_number);
            request.add_attribute(XorPeerAddress::new(peer));
            Ok(())
        });
        match result {
            Ok(_response) => {
                let mut state = self.inner.state.lock();
                match *state {
                    BindState::Binding(n) => {
                        client.install_channel(n, &self.inner);
                        *state = BindState::Bound(n);
                        debug!("bound {} to channel 0x{:04x}", peer, n);
                        Ok(())
                    }
                    // Closed while the transaction was in flight.
                    _ => track_panic!(ErrorKind::Closed, "Connection is closed"),
                }
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                if let BindState::Binding(_) = *state {
                    *state = BindState::Unbound;
                }
                Err(e)
            }
        }
    }

    /// Returns `true` once a channel binding is installed.
    pub fn bound(&self) -> bool {
        matches!(*self.inner.state.lock(), BindState::Bound(_))
    }

    /// Returns the bound channel number, if any.
    pub fn binding(&self) -> Option<u16> {
        self.inner.channel_number()
    }

    /// Sets the deadline for blocked and future `read` calls.
    ///
    /// `None` removes the deadline. Reads past the deadline fail with
    /// [`ErrorKind::Timeout`].
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.inner.read_deadline.lock() = deadline;
    }

    /// Sets the deadline applied to ChannelData writes on the server socket.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.inner.write_deadline.lock() = deadline;
    }

    /// Closes the connection and deregisters it from the client.
    ///
    /// Blocked readers are woken with [`ErrorKind::Closed`]. Calling it
    /// again is a no-op.
    pub fn close(&self) {
        self.inner.close();
    }
}

#[derive(Debug)]
pub(crate) struct PeerInner {
    client: Weak<ClientInner>,
    peer: SocketAddr,
    state: Mutex<BindState>,
    queue_tx: Mutex<Option<flume::Sender<Vec<u8>>>>,
    queue_rx: flume::Receiver<Vec<u8>>,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
}
impl PeerInner {
    pub(crate) fn new(client: Weak<ClientInner>, peer: SocketAddr) -> Arc<PeerInner> {
        let (queue_tx, queue_rx) = flume::bounded(INBOUND_QUEUE_LEN);
        Arc::new(PeerInner {
            client,
            peer,
            state: Mutex::new(BindState::Unbound),
            queue_tx: Mutex::new(Some(queue_tx)),
            queue_rx,
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
        })
    }

    fn client(&self) -> Result<Arc<ClientInner>> {
        let client = track_assert_some!(
            self.client.upgrade(),
            ErrorKind::Closed,
            "Client has been dropped"
        );
        Ok(client)
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn channel_number(&self) -> Option<u16> {
        match *self.state.lock() {
            BindState::Bound(number) => Some(number),
            _ => None,
        }
    }

    /// Queues one inbound datagram, discarding the oldest when full.
    pub(crate) fn enqueue(&self, datagram: Vec<u8>) {
        let queue_tx = self.queue_tx.lock();
        if let Some(tx) = queue_tx.as_ref() {
            if let Err(flume::TrySendError::Full(datagram)) = tx.try_send(datagram) {
                let _ = self.queue_rx.try_recv();
                let _ = tx.try_send(datagram);
                debug!("inbound queue full for {}, dropped oldest datagram", self.peer);
            }
        }
    }

    pub(crate) fn close(&self) {
        let previous = {
            let mut state = self.state.lock();
            if *state == BindState::Closed {
                return;
            }
            std::mem::replace(&mut *state, BindState::Closed)
        };
        if let Some(client) = self.client.upgrade() {
            let channel_number = match previous {
                BindState::Bound(number) => Some(number),
                _ => None,
            };
            client.deregister_peer(self.peer, channel_number);
        }
        // Dropping the sender wakes readers blocked on the queue.
        *self.queue_tx.lock() = None;
    }
}
