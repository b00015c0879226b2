//! Connection handling: the accept loop and the per-session tasks.
//!
//! Every accepted connection gets two tasks:
//! - a writer that drains the session's outgoing queue onto the socket
//! - a processor that reads frames, runs the handshake and turns gameplay
//!   packets into [`SessionEvent`]s for the tick driver
//!
//! Session tasks never touch the world. They talk to it only through the
//! event channel, which the tick driver drains without blocking.

use crate::error::{RegistryError, SessionError};
use crate::session::{HandoffInfo, Login, Session, SessionId};
use crate::session_registry::SessionRegistry;
use log::{debug, error, info, warn};
use realm_shared::{read_frame, write_frame, Packet, PROTOCOL_VERSION};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Longest chat line accepted from a client, in bytes.
pub const MAX_CHAT_LEN: usize = 256;

/// How long a closed session's writer keeps trying to flush a blocked write.
pub const FLUSH_GRACE: Duration = Duration::from_millis(250);

/// Gameplay requests a session forwards to the world.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Move { dx: f32, dy: f32 },
    Chat { text: String },
}

/// Messages from session tasks to the tick driver.
#[derive(Debug)]
pub enum SessionEvent {
    Joined { session_id: SessionId, login: Login },
    Intent { session_id: SessionId, intent: Intent },
    Left { session_id: SessionId },
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Everything a session task needs, cloned into each one.
#[derive(Clone)]
pub struct NetworkContext {
    registry: Arc<SessionRegistry>,
    events: UnboundedSender<SessionEvent>,
    trusted_center: IpAddr,
    tasks: TaskTracker,
}

impl NetworkContext {
    pub fn new(
        registry: Arc<SessionRegistry>,
        events: UnboundedSender<SessionEvent>,
        trusted_center: IpAddr,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            registry,
            events,
            trusted_center,
            tasks,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Admits a freshly accepted connection under the next session id.
    pub fn on_accept(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        cancel_token: CancellationToken,
    ) -> Result<SessionId, RegistryError> {
        let id = self.registry.next_session_id();
        self.admit(id, stream, addr, cancel_token)
    }

    /// Registers a connection under `id` and starts its tasks.
    ///
    /// If registration fails the peer is told why and the connection is
    /// closed straight away; existing sessions are not affected.
    pub fn admit(
        &self,
        id: SessionId,
        stream: TcpStream,
        addr: SocketAddr,
        cancel_token: CancellationToken,
    ) -> Result<SessionId, RegistryError> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        let (session, outgoing) = Session::new(id, addr, cancel_token);
        let session = Arc::new(session);
        let (reader, writer) = stream.into_split();

        if let Err(e) = self.registry.register(Arc::clone(&session)) {
            warn!("Rejecting connection {} from {}: {}", id, addr, e);
            session.send(Packet::Rejected {
                reason: e.to_string(),
            });
            session.close();
            self.spawn_writer(session, writer, outgoing);
            return Err(e);
        }

        self.spawn_writer(Arc::clone(&session), writer, outgoing);
        let ctx = self.clone();
        self.tasks
            .spawn(async move { ctx.process_session(session, reader).await });
        Ok(id)
    }

    fn spawn_writer<W>(&self, session: Arc<Session>, writer: W, outgoing: UnboundedReceiver<Packet>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        self.tasks
            .spawn(async move { write_outgoing(session, writer, outgoing, registry).await });
    }

    /// Reads frames until the peer leaves, a fault occurs or the session is
    /// cancelled, then unregisters the session.
    pub async fn process_session<R>(&self, session: Arc<Session>, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let id = session.id;
        let token = session.cancel_token().clone();

        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = read_frame(&mut reader) => frame,
            };

            match frame {
                Ok(Some((packet, len))) => {
                    self.registry.record_received(len);
                    match self.handle_packet(&session, packet) {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => {
                            debug!("Session {} said goodbye", id);
                            break;
                        }
                        Err(e) => {
                            warn!("Session {} ({}): {}", id, session.addr, e);
                            let reason = e.to_string();
                            session.send(if e.is_handshake_failure() {
                                Packet::Rejected { reason }
                            } else {
                                Packet::Disconnected { reason }
                            });
                            break;
                        }
                    }
                }
                Ok(None) => {
                    debug!("Session {} closed by peer", id);
                    break;
                }
                Err(e) => {
                    warn!("Session {} read failed: {}", id, e);
                    break;
                }
            }
        }

        session.close();
        self.registry.remove(id);
        if session.is_authenticated() && self.events.send(SessionEvent::Left { session_id: id }).is_err() {
            debug!("World already gone when session {} left", id);
        }
        info!("Session {} ended", id);
    }

    fn handle_packet(&self, session: &Session, packet: Packet) -> Result<Flow, SessionError> {
        match packet {
            Packet::Ping { timestamp } => {
                session.send(Packet::Pong { timestamp });
                Ok(Flow::Continue)
            }
            Packet::Hello {
                protocol_version,
                login_id,
                auth_token,
            } => {
                self.handshake(session, protocol_version, login_id, &auth_token)?;
                Ok(Flow::Continue)
            }
            Packet::DepositHandoff {
                login_id,
                account,
                character_name,
                auth_token,
            } => {
                let peer = session.addr.ip();
                if peer != self.trusted_center {
                    return Err(SessionError::UntrustedDeposit(peer));
                }
                self.registry.add_handoff_info(
                    login_id,
                    HandoffInfo::new(account, character_name, auth_token),
                );
                Ok(Flow::Continue)
            }
            Packet::Move { dx, dy } => {
                self.forward(session, "Move", Intent::Move { dx, dy })?;
                Ok(Flow::Continue)
            }
            Packet::Chat { text } => {
                if text.len() > MAX_CHAT_LEN {
                    return Err(SessionError::ChatTooLong(text.len()));
                }
                self.forward(session, "Chat", Intent::Chat { text })?;
                Ok(Flow::Continue)
            }
            Packet::Disconnect => Ok(Flow::Close),
            other => Err(SessionError::UnexpectedPacket(server_packet_name(&other))),
        }
    }

    fn handshake(
        &self,
        session: &Session,
        protocol_version: u32,
        login_id: u32,
        auth_token: &[u8],
    ) -> Result<(), SessionError> {
        if session.is_authenticated() {
            return Err(SessionError::AlreadyAuthenticated);
        }

        // The entry is consumed whatever the outcome.
        let claimed = self.registry.remove_handoff_info(login_id);

        if protocol_version != PROTOCOL_VERSION {
            return Err(SessionError::ProtocolVersion {
                expected: PROTOCOL_VERSION,
                got: protocol_version,
            });
        }
        let info = claimed.ok_or(SessionError::UnknownLogin(login_id))?;
        if info.is_expired(Instant::now(), self.registry.handoff_timeout()) {
            return Err(SessionError::HandoffExpired(login_id));
        }
        if !info.token_matches(auth_token) {
            return Err(SessionError::BadToken(login_id));
        }

        let login = Login {
            login_id,
            account: info.account,
            character_name: info.character_name,
        };
        if !session.authenticate(login.clone()) {
            return Err(SessionError::AlreadyAuthenticated);
        }

        info!(
            "Session {} authenticated as {} ({})",
            session.id, login.character_name, login.account
        );
        self.events
            .send(SessionEvent::Joined {
                session_id: session.id,
                login,
            })
            .map_err(|_| SessionError::WorldUnavailable)
    }

    fn forward(&self, session: &Session, what: &'static str, intent: Intent) -> Result<(), SessionError> {
        if !session.is_authenticated() {
            return Err(SessionError::NotAuthenticated(what));
        }
        self.events
            .send(SessionEvent::Intent {
                session_id: session.id,
                intent,
            })
            .map_err(|_| SessionError::WorldUnavailable)
    }
}

fn server_packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Welcome { .. } => "Welcome",
        Packet::Rejected { .. } => "Rejected",
        Packet::Pong { .. } => "Pong",
        Packet::Notice { .. } => "Notice",
        Packet::ChatRelay { .. } => "ChatRelay",
        Packet::GameTime { .. } => "GameTime",
        Packet::EntityState { .. } => "EntityState",
        Packet::Disconnected { .. } => "Disconnected",
        _ => "client",
    }
}

/// Drains the outgoing queue onto the socket. Queued packets are flushed
/// before the task honours cancellation, but a write that is still stuck
/// [`FLUSH_GRACE`] after cancellation is abandoned, so a peer that stops
/// reading cannot hold the task open.
async fn write_outgoing<W>(
    session: Arc<Session>,
    mut writer: W,
    mut outgoing: UnboundedReceiver<Packet>,
    registry: Arc<SessionRegistry>,
) where
    W: AsyncWrite + Unpin,
{
    let token = session.cancel_token().clone();
    loop {
        let packet = tokio::select! {
            biased;
            packet = outgoing.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            _ = token.cancelled() => break,
        };

        let written = tokio::select! {
            biased;
            result = write_frame(&mut writer, &packet) => result,
            _ = cancelled_with_grace(&token) => {
                warn!(
                    "Session {} stopped reading, dropping {} queued packets",
                    session.id,
                    outgoing.len() + 1
                );
                break;
            }
        };
        match written {
            Ok(bytes) => registry.record_sent(bytes),
            Err(e) => {
                if !token.is_cancelled() {
                    warn!("Failed to send to session {}: {}", session.id, e);
                }
                session.close();
                break;
            }
        }
    }

    match tokio::time::timeout(FLUSH_GRACE, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Session {} write shutdown: {}", session.id, e),
        Err(_) => debug!("Session {} write shutdown timed out", session.id),
    }
}

async fn cancelled_with_grace(token: &CancellationToken) {
    token.cancelled().await;
    tokio::time::sleep(FLUSH_GRACE).await;
}

/// Accepts connections until cancelled. Each session gets a child of
/// `cancel`, so cancelling it tears every session down too.
pub async fn run_accept_loop(listener: TcpListener, ctx: NetworkContext, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    // Failures are logged by `admit`.
                    let _ = ctx.on_accept(stream, addr, cancel.child_token());
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }
    info!("Accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const CENTER: &str = "10.0.0.1:5000";
    const PLAYER: &str = "192.168.1.20:40000";

    struct Fixture {
        ctx: NetworkContext,
        events: UnboundedReceiver<SessionEvent>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(SessionRegistry::new(8, Duration::from_secs(120)));
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = NetworkContext::new(
            registry,
            tx,
            "10.0.0.1".parse().unwrap(),
            TaskTracker::new(),
        );
        Fixture { ctx, events: rx }
    }

    fn session(id: SessionId, addr: &str) -> (Session, UnboundedReceiver<Packet>) {
        Session::new(id, addr.parse().unwrap(), CancellationToken::new())
    }

    fn deposit(ctx: &NetworkContext, login_id: u32, token: &[u8]) {
        ctx.registry.add_handoff_info(
            login_id,
            HandoffInfo::new("acct".into(), "Hero".into(), token.to_vec()),
        );
    }

    fn hello(login_id: u32, token: &[u8]) -> Packet {
        Packet::Hello {
            protocol_version: PROTOCOL_VERSION,
            login_id,
            auth_token: token.to_vec(),
        }
    }

    #[test]
    fn test_ping_answered_before_handshake() {
        let f = fixture();
        let (s, mut rx) = session(1, PLAYER);
        let flow = f.ctx.handle_packet(&s, Packet::Ping { timestamp: 99 });
        assert_eq!(flow, Ok(Flow::Continue));
        assert_eq!(rx.try_recv().ok(), Some(Packet::Pong { timestamp: 99 }));
    }

    #[test]
    fn test_handshake_success_emits_joined() {
        let mut f = fixture();
        deposit(&f.ctx, 7, b"secret");
        let (s, _rx) = session(1, PLAYER);

        assert_eq!(f.ctx.handle_packet(&s, hello(7, b"secret")), Ok(Flow::Continue));
        assert_eq!(s.login().unwrap().character_name, "Hero");
        assert!(f.ctx.registry.get_handoff_info(7).is_none());

        match f.events.try_recv() {
            Ok(SessionEvent::Joined { session_id, login }) => {
                assert_eq!(session_id, 1);
                assert_eq!(login.login_id, 7);
            }
            other => panic!("expected Joined, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_token_consumes_handoff() {
        let f = fixture();
        deposit(&f.ctx, 7, b"secret");
        let (s, _rx) = session(1, PLAYER);

        let result = f.ctx.handle_packet(&s, hello(7, b"guess"));
        assert_eq!(result, Err(SessionError::BadToken(7)));
        assert!(result.unwrap_err().is_handshake_failure());
        assert!(!s.is_authenticated());

        // Lost the claim, so even the right token no longer works.
        let (retry, _rx) = session(2, PLAYER);
        assert_eq!(
            f.ctx.handle_packet(&retry, hello(7, b"secret")),
            Err(SessionError::UnknownLogin(7))
        );
    }

    #[test]
    fn test_expired_handoff_rejected() {
        let (tx, _events) = mpsc::unbounded_channel();
        let ctx = NetworkContext::new(
            Arc::new(SessionRegistry::new(8, Duration::ZERO)),
            tx,
            "10.0.0.1".parse().unwrap(),
            TaskTracker::new(),
        );
        deposit(&ctx, 7, b"secret");
        let (s, _rx) = session(1, PLAYER);

        let result = ctx.handle_packet(&s, hello(7, b"secret"));
        assert_eq!(result, Err(SessionError::HandoffExpired(7)));
        assert!(result.unwrap_err().is_handshake_failure());
        assert!(!s.is_authenticated());
        assert!(ctx.registry.get_handoff_info(7).is_none());
    }

    #[test]
    fn test_wrong_protocol_version() {
        let f = fixture();
        deposit(&f.ctx, 7, b"secret");
        let (s, _rx) = session(1, PLAYER);
        let packet = Packet::Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            login_id: 7,
            auth_token: b"secret".to_vec(),
        };
        assert!(matches!(
            f.ctx.handle_packet(&s, packet),
            Err(SessionError::ProtocolVersion { .. })
        ));
        assert!(f.ctx.registry.get_handoff_info(7).is_none());
    }

    #[test]
    fn test_second_hello_rejected() {
        let f = fixture();
        deposit(&f.ctx, 7, b"secret");
        let (s, _rx) = session(1, PLAYER);
        f.ctx.handle_packet(&s, hello(7, b"secret")).unwrap();
        assert_eq!(
            f.ctx.handle_packet(&s, hello(7, b"secret")),
            Err(SessionError::AlreadyAuthenticated)
        );
    }

    #[test]
    fn test_gameplay_requires_handshake() {
        let f = fixture();
        let (s, _rx) = session(1, PLAYER);
        assert_eq!(
            f.ctx.handle_packet(&s, Packet::Move { dx: 1.0, dy: 0.0 }),
            Err(SessionError::NotAuthenticated("Move"))
        );
    }

    #[test]
    fn test_intents_forwarded_after_handshake() {
        let mut f = fixture();
        deposit(&f.ctx, 7, b"secret");
        let (s, _rx) = session(1, PLAYER);
        f.ctx.handle_packet(&s, hello(7, b"secret")).unwrap();
        let _joined = f.events.try_recv().unwrap();

        f.ctx
            .handle_packet(&s, Packet::Chat { text: "hello".into() })
            .unwrap();
        match f.events.try_recv() {
            Ok(SessionEvent::Intent { session_id, intent }) => {
                assert_eq!(session_id, 1);
                assert_eq!(intent, Intent::Chat { text: "hello".into() });
            }
            other => panic!("expected Intent, got {:?}", other),
        }
    }

    #[test]
    fn test_long_chat_rejected() {
        let f = fixture();
        let (s, _rx) = session(1, PLAYER);
        let text = "x".repeat(MAX_CHAT_LEN + 1);
        assert_eq!(
            f.ctx.handle_packet(&s, Packet::Chat { text }),
            Err(SessionError::ChatTooLong(MAX_CHAT_LEN + 1))
        );
    }

    #[test]
    fn test_deposit_only_from_trusted_center() {
        let f = fixture();
        let packet = Packet::DepositHandoff {
            login_id: 3,
            account: "acct".into(),
            character_name: "Hero".into(),
            auth_token: vec![1],
        };

        let (stranger, _rx) = session(1, PLAYER);
        assert_eq!(
            f.ctx.handle_packet(&stranger, packet.clone()),
            Err(SessionError::UntrustedDeposit("192.168.1.20".parse().unwrap()))
        );
        assert!(f.ctx.registry.get_handoff_info(3).is_none());

        let (center, _rx) = session(2, CENTER);
        assert_eq!(f.ctx.handle_packet(&center, packet), Ok(Flow::Continue));
        assert!(f.ctx.registry.get_handoff_info(3).is_some());
    }

    #[test]
    fn test_server_packets_from_client_are_violations() {
        let f = fixture();
        let (s, _rx) = session(1, PLAYER);
        let result = f.ctx.handle_packet(&s, Packet::Notice { text: "x".into() });
        assert_eq!(result, Err(SessionError::UnexpectedPacket("Notice")));
        assert!(!result.unwrap_err().is_handshake_failure());
    }

    #[test]
    fn test_disconnect_closes() {
        let f = fixture();
        let (s, _rx) = session(1, PLAYER);
        assert_eq!(f.ctx.handle_packet(&s, Packet::Disconnect), Ok(Flow::Close));
    }

    #[tokio::test]
    async fn test_process_session_cleans_up_on_eof() {
        let mut f = fixture();
        deposit(&f.ctx, 7, b"secret");
        let (s, _rx) = session(1, PLAYER);
        let s = Arc::new(s);
        f.ctx.registry.register(Arc::clone(&s)).unwrap();

        let mut wire = Vec::new();
        for packet in [hello(7, b"secret"), Packet::Move { dx: 0.0, dy: 1.0 }] {
            wire.extend(realm_shared::encode_frame(&packet).unwrap());
        }
        let reader = tokio_test::io::Builder::new().read(&wire).build();

        f.ctx.process_session(Arc::clone(&s), reader).await;

        assert!(s.is_closed());
        assert!(f.ctx.registry.is_empty());
        assert!(matches!(f.events.try_recv(), Ok(SessionEvent::Joined { .. })));
        assert!(matches!(f.events.try_recv(), Ok(SessionEvent::Intent { .. })));
        assert!(matches!(
            f.events.try_recv(),
            Ok(SessionEvent::Left { session_id: 1 })
        ));
        assert_eq!(f.ctx.registry.stats().bytes_received as usize, wire.len());
    }

    #[tokio::test]
    async fn test_handshake_failure_sends_rejected() {
        let f = fixture();
        let (s, mut rx) = session(1, PLAYER);
        let s = Arc::new(s);
        f.ctx.registry.register(Arc::clone(&s)).unwrap();

        let wire = realm_shared::encode_frame(&hello(404, b"nope")).unwrap();
        let reader = tokio_test::io::Builder::new().read(&wire).build();
        f.ctx.process_session(Arc::clone(&s), reader).await;

        assert_eq!(
            rx.try_recv().ok(),
            Some(Packet::Rejected {
                reason: SessionError::UnknownLogin(404).to_string()
            })
        );
        assert!(f.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_writer_flushes_queue_before_exit() {
        let registry = Arc::new(SessionRegistry::new(1, Duration::from_secs(1)));
        let (s, outgoing) = session(1, PLAYER);
        let s = Arc::new(s);

        let packet = Packet::Rejected {
            reason: "full".into(),
        };
        let expected = realm_shared::encode_frame(&packet).unwrap();
        s.send(packet);
        s.close();

        let writer = tokio_test::io::Builder::new().write(&expected).build();
        write_outgoing(Arc::clone(&s), writer, outgoing, Arc::clone(&registry)).await;
        assert_eq!(registry.stats().bytes_sent as usize, expected.len());
    }

    #[tokio::test]
    async fn test_writer_gives_up_on_stalled_peer() {
        let registry = Arc::new(SessionRegistry::new(1, Duration::from_secs(1)));
        let (s, outgoing) = session(1, PLAYER);
        let s = Arc::new(s);
        for _ in 0..8 {
            s.send(Packet::Notice {
                text: "x".repeat(4096),
            });
        }

        // The peer end stays open but is never read.
        let (writer, _peer) = tokio::io::duplex(64);
        let task = tokio::spawn(write_outgoing(
            Arc::clone(&s),
            writer,
            outgoing,
            Arc::clone(&registry),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        s.close();

        let finished = tokio::time::timeout(FLUSH_GRACE * 8, task).await;
        assert!(finished.is_ok(), "writer stayed blocked after cancellation");
        assert_eq!(registry.stats().bytes_sent, 0);
    }
}
