//! Happy Eyeballs (v1) dual-stack connection racing.
//!
//! One candidate address per family is registered before start. The primary
//! family (cached hint, defaulting to v6) writes immediately; the secondary
//! socket is bound and read from start but only becomes writable when the
//! connection-attempt delay fires. The first inbound datagram locks in its
//! socket and closes the loser synchronously, so no bytes are ever processed
//! from the losing socket afterwards.

use std::net::SocketAddr;

use socket2::Socket;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

use quicc_quic::error::{Error, Result};

use crate::config::TransportSettings;
use crate::netio;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }
}

#[derive(Default)]
pub struct HappyEyeballs {
    v4_peer: Option<SocketAddr>,
    v6_peer: Option<SocketAddr>,
    cached_family: Option<AddressFamily>,

    /// Supplied before start, bound during start.
    second_socket_raw: Option<Socket>,
    second_socket: Option<UdpSocket>,
    second_peer: Option<SocketAddr>,

    delay_deadline: Option<Instant>,
    write_to_first: bool,
    write_to_second: bool,
    finished: bool,
    started: bool,

    /// Both families actually raced (for stats).
    raced: bool,
    /// Secondary bind failed and the race was abandoned (for stats).
    second_bind_failed: bool,
}

impl HappyEyeballs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a candidate peer address. At most one per family, and only
    /// before `start`.
    pub fn add_peer_address(&mut self, addr: SocketAddr) -> Result<()> {
        if self.started {
            return Err(Error::ConfigError(
                "peer address added after start".into(),
            ));
        }
        let slot = match AddressFamily::of(&addr) {
            AddressFamily::V4 => &mut self.v4_peer,
            AddressFamily::V6 => &mut self.v6_peer,
        };
        if slot.is_some() {
            return Err(Error::ConfigError(format!(
                "duplicate peer address family for {addr}"
            )));
        }
        debug!(%addr, "peer address registered");
        *slot = Some(addr);
        Ok(())
    }

    /// Supply the extra socket used for the losing family. Required iff both
    /// families are registered.
    pub fn add_second_socket(&mut self, socket: Socket) {
        self.second_socket_raw = Some(socket);
    }

    /// Hint: the family that won last time.
    pub fn set_cached_family(&mut self, family: AddressFamily) {
        self.cached_family = Some(family);
    }

    pub fn has_any_address(&self) -> bool {
        self.v4_peer.is_some() || self.v6_peer.is_some()
    }

    /// Select the starting family, bind the secondary, arm the delay.
    /// Returns the primary peer address the transport should use.
    pub fn start(&mut self, settings: &TransportSettings) -> Result<SocketAddr> {
        self.started = true;
        let (primary, secondary) = match (self.v4_peer, self.v6_peer) {
            (None, None) => {
                return Err(Error::ConfigError("no peer address registered".into()))
            }
            (Some(v4), None) => (v4, None),
            (None, Some(v6)) => (v6, None),
            (Some(v4), Some(v6)) => {
                if !settings.happy_eyeballs_enabled {
                    // Racing disabled: fall back to a single family.
                    let pick = match self.cached_family {
                        Some(AddressFamily::V4) => v4,
                        _ => v6,
                    };
                    debug!(peer = %pick, "happy eyeballs disabled, single family");
                    (pick, None)
                } else if self.cached_family == Some(AddressFamily::V4) {
                    (v4, Some(v6))
                } else {
                    (v6, Some(v4))
                }
            }
        };

        let Some(second_peer) = secondary else {
            self.finished = true;
            self.write_to_first = true;
            return Ok(primary);
        };

        if settings.conn_attempt_delay.is_zero() {
            return Err(Error::ConfigError(
                "connection attempt delay must be positive".into(),
            ));
        }
        let raw = self.second_socket_raw.take().ok_or_else(|| {
            Error::ConfigError("second socket required for dual-stack racing".into())
        })?;

        debug!(primary = %primary, secondary = %second_peer, "happy eyeballs racing");
        match netio::setup_socket(&raw, &second_peer, settings)
            .and_then(|()| netio::into_tokio(raw))
        {
            Ok(socket) => {
                self.second_socket = Some(socket);
                self.second_peer = Some(second_peer);
                self.delay_deadline = Some(Instant::now() + settings.conn_attempt_delay);
                self.write_to_first = true;
                self.write_to_second = false;
                self.raced = true;
            }
            Err(err) => {
                // Give up the race; the primary carries the connection.
                warn!(error = %err, "secondary socket setup failed, racing abandoned");
                self.second_bind_failed = true;
                self.delay_deadline = None;
                self.finished = true;
                self.write_to_first = true;
            }
        }
        Ok(primary)
    }

    /// The connection-attempt delay fired: open the secondary for writes.
    pub fn on_delay_expired(&mut self) {
        self.delay_deadline = None;
        if self.finished {
            return;
        }
        debug!("connection attempt delay expired, writing to both sockets");
        self.write_to_second = true;
    }

    /// First datagram observed while racing. Promotes the receiving socket,
    /// swapping handles and addresses if the secondary won, and closes the
    /// loser. Returns whether a swap happened.
    pub fn on_data_received(
        &mut self,
        received_on_second: bool,
        primary_socket: &mut UdpSocket,
        peer_addr: &mut SocketAddr,
        original_peer_addr: &mut SocketAddr,
    ) -> bool {
        if self.finished {
            return false;
        }
        self.delay_deadline = None;
        self.finished = true;
        self.write_to_first = true;
        self.write_to_second = false;

        let swapped = if received_on_second {
            let second = self
                .second_socket
                .as_mut()
                .expect("racing without a second socket");
            std::mem::swap(primary_socket, second);
            let winner = self.second_peer.expect("racing without a second address");
            debug!(peer = %winner, "secondary socket won the race");
            *peer_addr = winner;
            *original_peer_addr = winner;
            true
        } else {
            debug!(peer = %peer_addr, "primary socket won the race");
            false
        };

        // Closing the loser here guarantees nothing more is read from it.
        self.second_socket = None;
        self.second_peer = None;
        swapped
    }

    /// Application close: cancel the timer and drop both extra handles.
    pub fn close(&mut self) {
        self.delay_deadline = None;
        self.second_socket = None;
        self.second_socket_raw = None;
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn write_to_first(&self) -> bool {
        self.write_to_first
    }

    pub fn write_to_second(&self) -> bool {
        self.write_to_second
    }

    pub fn delay_deadline(&self) -> Option<Instant> {
        if self.finished {
            None
        } else {
            self.delay_deadline
        }
    }

    pub fn second_socket(&self) -> Option<&UdpSocket> {
        self.second_socket.as_ref()
    }

    pub fn second_peer(&self) -> Option<SocketAddr> {
        self.second_peer
    }

    pub fn raced(&self) -> bool {
        self.raced
    }

    pub fn second_bind_failed(&self) -> bool {
        self.second_bind_failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netio::{create_socket, into_tokio, setup_socket};
    use std::time::Duration;

    fn v4() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    fn v6() -> SocketAddr {
        "[::1]:4433".parse().unwrap()
    }

    fn settings() -> TransportSettings {
        TransportSettings {
            conn_attempt_delay: Duration::from_millis(150),
            ..Default::default()
        }
    }

    fn bound_primary(peer: &SocketAddr) -> UdpSocket {
        let socket = create_socket(peer).unwrap();
        setup_socket(&socket, peer, &settings()).unwrap();
        into_tokio(socket).unwrap()
    }

    #[test]
    fn duplicate_family_is_config_error() {
        let mut he = HappyEyeballs::new();
        he.add_peer_address(v4()).unwrap();
        let err = he.add_peer_address("127.0.0.2:4433".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn address_after_start_is_config_error() {
        let mut he = HappyEyeballs::new();
        he.add_peer_address(v4()).unwrap();
        he.start(&settings()).unwrap();
        assert!(matches!(
            he.add_peer_address(v6()),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn no_address_is_config_error() {
        let mut he = HappyEyeballs::new();
        assert!(matches!(
            he.start(&settings()),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn single_family_finishes_immediately() {
        let mut he = HappyEyeballs::new();
        he.add_peer_address(v6()).unwrap();
        let primary = he.start(&settings()).unwrap();
        assert_eq!(primary, v6());
        assert!(he.finished());
        assert!(he.write_to_first());
        assert!(!he.write_to_second());
        assert!(he.delay_deadline().is_none());
    }

    #[test]
    fn dual_stack_requires_second_socket() {
        let mut he = HappyEyeballs::new();
        he.add_peer_address(v4()).unwrap();
        he.add_peer_address(v6()).unwrap();
        assert!(matches!(
            he.start(&settings()),
            Err(Error::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn cached_family_picks_primary() {
        let mut he = HappyEyeballs::new();
        he.add_peer_address(v4()).unwrap();
        he.add_peer_address(v6()).unwrap();
        he.set_cached_family(AddressFamily::V4);
        he.add_second_socket(create_socket(&v6()).unwrap());

        let primary = he.start(&settings()).unwrap();
        assert_eq!(primary, v4());
        assert_eq!(he.second_peer(), Some(v6()));
        assert!(!he.finished());
        assert!(he.write_to_first());
        assert!(!he.write_to_second());
        assert!(he.delay_deadline().is_some());
        assert!(he.second_socket().is_some());
    }

    #[tokio::test]
    async fn no_second_writes_before_delay() {
        let mut he = HappyEyeballs::new();
        he.add_peer_address(v4()).unwrap();
        he.add_peer_address(v6()).unwrap();
        he.set_cached_family(AddressFamily::V6);
        he.add_second_socket(create_socket(&v4()).unwrap());
        he.start(&settings()).unwrap();

        assert!(!he.write_to_second());
        he.on_delay_expired();
        assert!(he.write_to_second());
        assert!(!he.finished());
    }

    #[tokio::test]
    async fn second_socket_wins_and_swaps() {
        let mut he = HappyEyeballs::new();
        he.add_peer_address(v4()).unwrap();
        he.add_peer_address(v6()).unwrap();
        he.set_cached_family(AddressFamily::V6);
        he.add_second_socket(create_socket(&v4()).unwrap());

        let mut peer = he.start(&settings()).unwrap();
        assert_eq!(peer, v6());
        let mut original_peer = peer;
        let mut primary = bound_primary(&peer);
        he.on_delay_expired();

        let second_local = he.second_socket().unwrap().local_addr().unwrap();
        let swapped = he.on_data_received(true, &mut primary, &mut peer, &mut original_peer);
        assert!(swapped);
        assert!(he.finished());
        // The promoted handle is the old secondary.
        assert_eq!(primary.local_addr().unwrap(), second_local);
        assert_eq!(peer, v4());
        assert_eq!(original_peer, v4());
        assert!(he.write_to_first());
        assert!(!he.write_to_second());
        // Exactly one socket remains open.
        assert!(he.second_socket().is_none());

        // Later datagrams no longer change anything.
        let swapped = he.on_data_received(false, &mut primary, &mut peer, &mut original_peer);
        assert!(!swapped);
        assert_eq!(peer, v4());
    }

    #[tokio::test]
    async fn primary_win_keeps_socket_and_closes_second() {
        let mut he = HappyEyeballs::new();
        he.add_peer_address(v4()).unwrap();
        he.add_peer_address(v6()).unwrap();
        he.add_second_socket(create_socket(&v4()).unwrap());

        let mut peer = he.start(&settings()).unwrap();
        let mut original_peer = peer;
        let mut primary = bound_primary(&peer);
        let primary_local = primary.local_addr().unwrap();

        let swapped = he.on_data_received(false, &mut primary, &mut peer, &mut original_peer);
        assert!(!swapped);
        assert_eq!(primary.local_addr().unwrap(), primary_local);
        assert_eq!(peer, v6());
        assert!(he.second_socket().is_none());
        assert!(he.delay_deadline().is_none());
    }

    #[tokio::test]
    async fn secondary_bind_failure_falls_back_to_primary() {
        let mut he = HappyEyeballs::new();
        he.add_peer_address(v4()).unwrap();
        he.add_peer_address(v6()).unwrap();
        he.set_cached_family(AddressFamily::V4);
        // Wrong family: an AF_INET socket cannot bind the v6 wildcard.
        he.add_second_socket(create_socket(&v4()).unwrap());

        let primary = he.start(&settings()).unwrap();
        assert_eq!(primary, v4());
        assert!(he.finished());
        assert!(he.second_bind_failed());
        assert!(he.write_to_first());
        assert!(!he.write_to_second());
        assert!(he.delay_deadline().is_none());
        assert!(he.second_socket().is_none());
    }

    #[tokio::test]
    async fn racing_disabled_picks_cached_family() {
        let mut he = HappyEyeballs::new();
        he.add_peer_address(v4()).unwrap();
        he.add_peer_address(v6()).unwrap();
        he.set_cached_family(AddressFamily::V4);
        let disabled = TransportSettings {
            happy_eyeballs_enabled: false,
            ..settings()
        };
        let primary = he.start(&disabled).unwrap();
        assert_eq!(primary, v4());
        assert!(he.finished());
        assert!(!he.raced());
    }
}
