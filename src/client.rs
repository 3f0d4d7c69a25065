//! TURN client: owns the transports and routes inbound traffic.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use stun_codec::rfc5389::attributes::{ErrorCode, MessageIntegrity, Software};
use stun_codec::rfc5389::errors::{StaleNonce, Unauthorized};
use stun_codec::rfc5766::attributes::{Data, XorPeerAddress};
use stun_codec::rfc5766::methods::DATA;
use stun_codec::{MessageClass, Method, TransactionId};
use tracing::{debug, warn};

use crate::allocation::{Allocation, AllocationInner};
use crate::attribute::Message;
use crate::auth::{attach_fingerprint, AuthParams};
use crate::channel_data::{ChannelData, MAX_CHANNEL_NUMBER, MIN_CHANNEL_NUMBER};
use crate::demux::InboundPacket;
use crate::peer::PeerInner;
use crate::transport::{PacketSocket, StunTransport};
use crate::{Error, ErrorKind, Result};

/// Recognized client options.
pub struct Options {
    /// Connected datagram socket to the TURN server. ChannelData frames are
    /// written here directly, bypassing the STUN layer.
    pub conn: Arc<dyn PacketSocket>,

    /// STUN transaction engine speaking to the same server.
    pub stun: Arc<dyn StunTransport>,

    /// Username for long-term credentials. Must be set together with
    /// `password`.
    pub username: Option<String>,

    /// Password for long-term credentials.
    pub password: Option<String>,

    /// Value of the SOFTWARE attribute attached to outbound requests.
    pub software: Option<String>,
}

/// TURN client.
///
/// Dropping the client invalidates every [`Allocation`], `Permission` and
/// `PeerConnection` created through it: their operations fail with
/// [`ErrorKind::Closed`] and blocked readers are woken. Call [`Client::close`]
/// first to also release the allocations on the server.
pub struct Client {
    inner: Arc<ClientInner>,
}
impl Client {
    pub fn new(options: Options) -> Result<Client> {
        let auth = match (options.username, options.password) {
            (Some(username), Some(password)) => {
                Some(track!(AuthParams::new(username, password))?)
            }
            (None, None) => None,
            _ => track_panic!(
                ErrorKind::InvalidInput,
                "Username and password must be given together"
            ),
        };
        let software = match options.software {
            Some(s) => Some(track!(Software::new(s).map_err(Error::from))?),
            None => None,
        };
        let inner = Arc::new(ClientInner {
            stun: options.stun,
            conn: options.conn,
            software,
            auth: Mutex::new(auth),
            channels: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            next_channel_number: Mutex::new(MIN_CHANNEL_NUMBER),
            allocations: Mutex::new(Vec::new()),
        });
        let demux = Arc::downgrade(&inner);
        inner.stun.install_demux(Box::new(move |datagram| {
            if let Some(inner) = demux.upgrade() {
                inner.route_packet(datagram);
            }
        }));
        Ok(Client { inner })
    }

    /// Requests a relayed transport address on the server.
    pub fn allocate(&self) -> Result<Allocation> {
        track!(Allocation::allocate(&self.inner))
    }

    /// Releases every live allocation on the server, then closes the client.
    pub fn close(&self) -> Result<()> {
        let allocations: Vec<_> = self.inner.allocations.lock().drain(..).collect();
        for allocation in allocations {
            if let Some(allocation) = allocation.upgrade() {
                if let Err(e) = allocation.close() {
                    debug!("allocation release failed: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Demultiplexes one inbound datagram.
    ///
    /// This is the entry point the STUN transport invokes for traffic outside
    /// any transaction; it is public so drivers (and tests) can inject
    /// datagrams directly. Unroutable datagrams are dropped and logged.
    pub fn route_packet(&self, datagram: &[u8]) {
        self.inner.route_packet(datagram);
    }
}

pub(crate) struct ClientInner {
    pub(crate) stun: Arc<dyn StunTransport>,
    pub(crate) conn: Arc<dyn PacketSocket>,
    software: Option<Software>,
    auth: Mutex<Option<AuthParams>>,
    pub(crate) channels: Mutex<HashMap<u16, Arc<PeerInner>>>,
    pub(crate) peers: Mutex<HashMap<SocketAddr, Arc<PeerInner>>>,
    next_channel_number: Mutex<u16>,
    allocations: Mutex<Vec<Weak<AllocationInner>>>,
}
impl ClientInner {
    pub(crate) fn new_request(&self, method: Method) -> Message {
        let mut request = Message::new(MessageClass::Request, method, transaction_id());
        if let Some(software) = &self.software {
            request.add_attribute(software.clone());
        }
        request
    }

    pub(crate) fn new_indication(&self, method: Method) -> Message {
        Message::new(MessageClass::Indication, method, transaction_id())
    }

    /// Appends the authentication block (once a challenge is cached) and the
    /// trailing FINGERPRINT.
    fn finish_request(&self, request: &mut Message) -> Result<()> {
        {
            let auth = self.auth.lock();
            if let Some(auth) = auth.as_ref() {
                if auth.has_challenge() {
                    track!(auth.add_auth_attributes(request))?;
                }
            }
        }
        track!(attach_fingerprint(request))
    }

    /// Runs one transaction, blocking until the completion event arrives.
    fn transact(&self, request: Message) -> Result<Message> {
        let (reply_tx, reply_rx) = flume::bounded(1);
        track!(self.stun.request(
            request,
            Box::new(move |event| {
                let _ = reply_tx.send(event);
            })
        ))?;
        match reply_rx.recv() {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(e),
            Err(_) => track_panic!(
                ErrorKind::Transaction,
                "Transaction dropped without a completion event"
            ),
        }
    }

    /// Issues a request for `method`, retrying exactly once with refreshed
    /// credentials if the server answers 401 or 438.
    pub(crate) fn request_with_auth(
        &self,
        method: Method,
        fill: &dyn Fn(&mut Message) -> Result<()>,
    ) -> Result<Message> {
        let mut request = self.new_request(method);
        track!(fill(&mut request))?;
        track!(self.finish_request(&mut request))?;
        let response = track!(self.transact(request))?;
        if response.class() == MessageClass::SuccessResponse {
            track!(self.validate_integrity(&response))?;
            return Ok(response);
        }
        let (code, reason) = track!(error_code(&response))?;

        let challenged = code == Unauthorized::CODEPOINT || code == StaleNonce::CODEPOINT;
        if challenged {
            let refreshed = {
                let mut auth = self.auth.lock();
                match auth.as_mut() {
                    Some(auth) => {
                        track!(auth.update_from_challenge(&response))?;
                        true
                    }
                    None => false,
                }
            };
            if refreshed {
                let mut retry = self.new_request(method);
                track!(fill(&mut retry))?;
                track!(self.finish_request(&mut retry))?;
                let response = track!(self.transact(retry))?;
                if response.class() == MessageClass::SuccessResponse {
                    track!(self.validate_integrity(&response))?;
                    return Ok(response);
                }
                let (code, reason) = track!(error_code(&response))?;
                match code {
                    c if c == Unauthorized::CODEPOINT => track_panic!(
                        ErrorKind::Unauthorized,
                        "Server rejected the credentials: {} (code={})",
                        reason,
                        code
                    ),
                    c if c == StaleNonce::CODEPOINT => track_panic!(
                        ErrorKind::StaleNonce,
                        "Nonce went stale again: {} (code={})",
                        reason,
                        code
                    ),
                    _ => track_panic!(
                        ErrorKind::ServerError,
                        "Request failed: {} (code={})",
                        reason,
                        code
                    ),
                }
            }
            if code == StaleNonce::CODEPOINT {
                track_panic!(
                    ErrorKind::StaleNonce,
                    "Nonce went stale without credentials to retry: {} (code={})",
                    reason,
                    code
                );
            }
            track_panic!(
                ErrorKind::Unauthorized,
                "Server requires credentials: {} (code={})",
                reason,
                code
            );
        }
        track_panic!(
            ErrorKind::ServerError,
            "Request failed: {} (code={})",
            reason,
            code
        )
    }

    /// Verifies MESSAGE-INTEGRITY on responses once credentials are active.
    fn validate_integrity(&self, response: &Message) -> Result<()> {
        let auth = self.auth.lock();
        if let Some(auth) = auth.as_ref() {
            if auth.has_challenge() {
                if let Some(mi) = response.get_attribute::<MessageIntegrity>() {
                    track!(auth.validate(mi))?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn register_allocation(&self, allocation: &Arc<AllocationInner>) {
        self.allocations.lock().push(Arc::downgrade(allocation));
    }

    /// Picks an unused channel number.
    ///
    /// The number is not reserved until the ChannelBind transaction succeeds
    /// and [`ClientInner::install_channel`] runs; a monotonic wrapping cursor
    /// keeps concurrent binds apart in the meantime.
    pub(crate) fn pick_channel_number(&self) -> Result<u16> {
        let channels = self.channels.lock();
        let mut next = self.next_channel_number.lock();
        for _ in MIN_CHANNEL_NUMBER..=MAX_CHANNEL_NUMBER {
            let candidate = *next;
            *next = if candidate == MAX_CHANNEL_NUMBER {
                MIN_CHANNEL_NUMBER
            } else {
                candidate + 1
            };
            if !channels.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        track_panic!(ErrorKind::Exhausted, "Every channel number is in use")
    }

    pub(crate) fn install_channel(&self, number: u16, peer: &Arc<PeerInner>) {
        self.channels.lock().insert(number, Arc::clone(peer));
    }

    pub(crate) fn register_peer(&self, peer: &Arc<PeerInner>) -> Result<()> {
        let mut peers = self.peers.lock();
        track_assert!(
            !peers.contains_key(&peer.peer_addr()),
            ErrorKind::InvalidInput,
            "A connection to {} already exists",
            peer.peer_addr()
        );
        peers.insert(peer.peer_addr(), Arc::clone(peer));
        Ok(())
    }

    pub(crate) fn deregister_peer(&self, addr: SocketAddr, channel_number: Option<u16>) {
        self.peers.lock().remove(&addr);
        if let Some(number) = channel_number {
            self.channels.lock().remove(&number);
        }
    }

    pub(crate) fn route_packet(&self, datagram: &[u8]) {
        match InboundPacket::decode(datagram) {
            Ok(InboundPacket::Stun(message)) => self.route_stun(message),
            Ok(InboundPacket::BrokenStun(broken)) => {
                debug!("dropping broken STUN message: {:?}", broken);
            }
            Ok(InboundPacket::ChannelData(frame)) => self.route_channel_data(frame),
            Err(e) => debug!("dropping undecodable datagram: {}", e),
        }
    }

    fn route_stun(&self, message: Message) {
        if message.class() != MessageClass::Indication {
            warn!(
                "unexpected STUN message outside any transaction: class={:?}, method={:?}",
                message.class(),
                message.method()
            );
            return;
        }
        if message.method() != DATA {
            debug!("dropping indication of method {:?}", message.method());
            return;
        }
        let peer = match message.get_attribute::<XorPeerAddress>() {
            Some(a) => a.address(),
            None => {
                debug!("dropping Data indication without XOR-PEER-ADDRESS");
                return;
            }
        };
        let data = match message.get_attribute::<Data>() {
            Some(a) => a.data().to_vec(),
            None => {
                debug!("dropping Data indication without DATA");
                return;
            }
        };
        let target = self.peers.lock().get(&peer).cloned();
        match target {
            Some(conn) => conn.enqueue(data),
            None => debug!("no connection for peer {}, dropping {} bytes", peer, data.len()),
        }
    }

    fn route_channel_data(&self, frame: ChannelData) {
        let number = frame.channel_number();
        let target = self.channels.lock().get(&number).cloned();
        match target {
            Some(conn) => conn.enqueue(frame.into_data()),
            None => debug!("no binding for channel 0x{:04x}, dropping frame", number),
        }
    }
}
impl Drop for ClientInner {
    fn drop(&mut self) {
        // Wake readers blocked on connections that will never receive again.
        let peers: Vec<_> = self.peers.get_mut().drain().map(|(_, p)| p).collect();
        for peer in &peers {
            peer.close();
        }
        self.channels.get_mut().clear();
    }
}

fn transaction_id() -> TransactionId {
    TransactionId::new(rand::random::<[u8; 12]>())
}

fn error_code(response: &Message) -> Result<(u16, String)> {
    track_assert_eq!(
        response.class(),
        MessageClass::ErrorResponse,
        ErrorKind::Protocol,
        "Unexpected response class for method {:?}",
        response.method()
    );
    let code: &ErrorCode = track_assert_some!(
        response.get_attribute(),
        ErrorKind::Protocol,
        "Error response without ERROR-CODE"
    );
    Ok((code.code(), code.reason_phrase().to_owned()))
}
