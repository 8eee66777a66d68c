//! WebSocket Game Server
//!
//! Async WebSocket server for two-player rooms.
//! Routes client actions into the delivery engine and broadcasts snapshots.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock, broadcast};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn, error, debug, instrument};

use crate::config::ServerConfig;
use crate::game::engine::DeliveryEngine;
use crate::game::state::{PlayerId, RoomId};
use crate::network::protocol::{ClientMessage, ServerMessage, ServerError, ErrorCode};
use crate::network::room::{Departure, JoinOutcome, RoomError, RoomRegistry};

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Room error.
    #[error("Room error: {0}")]
    Room(#[from] RoomError),
}

/// Room membership and match state. Held for the whole of each action,
/// broadcast included.
struct Rooms {
    registry: RoomRegistry,
    engine: DeliveryEngine,
}

/// Connected client state.
struct ConnectedClient {
    /// Player bound to this connection (after create/join).
    player_id: Option<PlayerId>,
    /// Room bound to this connection.
    room_id: Option<RoomId>,
    /// Connection time.
    connected_at: Instant,
    /// Last activity.
    last_activity: Instant,
    /// Message sender (for direct messaging to client).
    sender: mpsc::Sender<ServerMessage>,
}

type Clients = Arc<RwLock<BTreeMap<SocketAddr, ConnectedClient>>>;
type SharedRooms = Arc<Mutex<Rooms>>;

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Rooms and matches.
    rooms: SharedRooms,
    /// Connected clients.
    clients: Clients,
    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a new game server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let engine = DeliveryEngine::with_rules(config.rules);

        Self {
            config,
            rooms: Arc::new(Mutex::new(Rooms {
                registry: RoomRegistry::new(),
                engine,
            })),
            clients: Arc::new(RwLock::new(BTreeMap::new())),
            shutdown_tx,
        }
    }

    /// Bind the configured address and run the server.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Run the server on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);

        let cleanup_rooms = self.rooms.clone();
        let cleanup_config = self.config.clone();

        // Spawn cleanup task
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_rooms, cleanup_config).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let clients_count = self.clients.read().await.len();
                            if clients_count >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                tokio::spawn(Self::reject_connection(stream, addr));
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        cleanup_handle.abort();

        Ok(())
    }

    /// Complete the handshake only to report overload, then close.
    async fn reject_connection(stream: TcpStream, addr: SocketAddr) {
        let mut ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                debug!("Handshake with rejected client {} failed: {}", addr, e);
                return;
            }
        };

        let refusal = ServerMessage::Error(ServerError::new(
            ErrorCode::ServerOverloaded,
            "Server is at its connection limit",
        ));
        if let Ok(text) = refusal.to_json() {
            let _ = ws_stream.send(Message::Text(text)).await;
        }
        let _ = ws_stream.close(None).await;
    }

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let clients = self.clients.clone();
        let rooms = self.rooms.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    error!("WebSocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            // Register client
            {
                let mut clients = clients.write().await;
                clients.insert(addr, ConnectedClient {
                    player_id: None,
                    room_id: None,
                    connected_at: Instant::now(),
                    last_activity: Instant::now(),
                    sender: msg_tx.clone(),
                });
            }

            // Spawn message sender task
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            // Handle incoming messages
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!("Invalid message from {}: {}", addr, e);
                                        let _ = msg_tx.send(ServerMessage::Error(ServerError::new(
                                            ErrorCode::InvalidInput,
                                            "Invalid message format",
                                        ))).await;
                                        continue;
                                    }
                                };

                                // Update activity
                                {
                                    let mut clients = clients.write().await;
                                    if let Some(client) = clients.get_mut(&addr) {
                                        client.last_activity = Instant::now();
                                    }
                                }

                                Self::handle_client_message(addr, client_msg, &clients, &rooms, &msg_tx).await;
                            }
                            Some(Ok(Message::Binary(_))) => {
                                let _ = msg_tx.send(ServerMessage::Error(ServerError::new(
                                    ErrorCode::InvalidInput,
                                    "Binary frames are not supported",
                                ))).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("Client {} disconnected", addr);
                                break;
                            }
                            Some(Err(e)) => {
                                error!("WebSocket error for {}: {}", addr, e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::Shutdown {
                            reason: "Server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            // Cleanup
            sender_task.abort();
            Self::handle_disconnect(addr, &clients, &rooms).await;

            info!("Client {} cleaned up", addr);
        });
    }

    /// Handle a client message.
    async fn handle_client_message(
        addr: SocketAddr,
        msg: ClientMessage,
        clients: &Clients,
        rooms: &SharedRooms,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match msg {
            ClientMessage::CreateRoom { player_id } => {
                Self::handle_create_room(addr, player_id, clients, rooms, sender).await;
            }
            ClientMessage::JoinRoom { room_id, player_id } => {
                Self::handle_join_room(addr, room_id, player_id, clients, rooms, sender).await;
            }
            ClientMessage::RotatePie { room_id, player_id, rotation } => {
                Self::handle_rotate_pie(addr, room_id, player_id, rotation, clients, rooms, sender).await;
            }
            ClientMessage::FieldSet { player_id, room_id, rotation } => {
                Self::handle_field_set(addr, room_id, player_id, rotation, clients, rooms, sender).await;
            }
            ClientMessage::ShotPlayed { player_id, room_id, choice } => {
                Self::handle_shot_played(addr, room_id, player_id, choice, clients, rooms, sender).await;
            }
            ClientMessage::SyncRequest { room_id } => {
                let snapshot = rooms.lock().await.engine.query(&room_id).cloned();
                let reply = match snapshot {
                    Some(state) => ServerMessage::State { state },
                    None => ServerMessage::RoomNotFound,
                };
                let _ = sender.send(reply).await;
            }
            ClientMessage::Ping { timestamp } => {
                let _ = sender.send(ServerMessage::Pong {
                    timestamp,
                    server_time: chrono::Utc::now().timestamp_millis().max(0) as u64,
                }).await;
            }
            ClientMessage::Leave => {
                Self::handle_leave(addr, clients, rooms).await;
            }
        }
    }

    /// Handle room creation.
    async fn handle_create_room(
        addr: SocketAddr,
        player_id: PlayerId,
        clients: &Clients,
        rooms: &SharedRooms,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let room_id = RoomId::generate();

        let mut guard = rooms.lock().await;
        let Rooms { registry, engine } = &mut *guard;

        match registry.create_room(&player_id, &room_id, engine) {
            Ok(created) => {
                Self::bind_client(clients, addr, &player_id, &room_id).await;
                let _ = sender.send(ServerMessage::RoomCreated { room_id }).await;
                if let Some(departure) = created.vacated {
                    Self::announce_departure(clients, &player_id, &departure).await;
                }
            }
            Err(e) => {
                warn!("Room creation failed for {}: {}", player_id, e);
                let _ = sender.send(ServerMessage::Error(ServerError::from(&e))).await;
            }
        }
    }

    /// Handle joining (or rejoining) a room. Starts the match once both seats fill.
    async fn handle_join_room(
        addr: SocketAddr,
        room_id: RoomId,
        player_id: PlayerId,
        clients: &Clients,
        rooms: &SharedRooms,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        let mut guard = rooms.lock().await;
        let Rooms { registry, engine } = &mut *guard;

        match registry.join_room(&player_id, &room_id, engine) {
            Ok(JoinOutcome::Joined { player, state, room_ready, vacated }) => {
                Self::bind_client(clients, addr, &player_id, &room_id).await;
                let _ = sender.send(ServerMessage::PlayerJoined { state, player }).await;
                if let Some(departure) = vacated {
                    Self::announce_departure(clients, &player_id, &departure).await;
                }

                if room_ready {
                    match engine.start(&room_id) {
                        Ok(state) => {
                            Self::broadcast(clients, &room_id, ServerMessage::GameStarted { state }, None).await;
                        }
                        Err(e) => {
                            error!("Failed to start match in room {}: {}", room_id, e);
                            let _ = sender.send(ServerMessage::Error(ServerError::new(
                                ErrorCode::InternalError,
                                "Match could not be started",
                            ))).await;
                        }
                    }
                }
            }
            Ok(JoinOutcome::Rejoined { player, state }) => {
                Self::bind_client(clients, addr, &player_id, &room_id).await;
                let _ = sender.send(ServerMessage::PlayerJoined { state, player }).await;
            }
            Err(RoomError::RoomNotFound) => {
                let _ = sender.send(ServerMessage::RoomNotFound).await;
            }
            Err(RoomError::RoomFull) => {
                let _ = sender.send(ServerMessage::RoomFull).await;
            }
            Err(e) => {
                warn!("Join failed for {} in room {}: {}", player_id, room_id, e);
                let _ = sender.send(ServerMessage::Error(ServerError::from(&e))).await;
            }
        }
    }

    /// Relay a live rotation preview to the other member.
    async fn handle_rotate_pie(
        addr: SocketAddr,
        room_id: RoomId,
        player_id: PlayerId,
        rotation: f64,
        clients: &Clients,
        rooms: &SharedRooms,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        if let Err(e) = Self::ensure_bound(clients, addr, &player_id, &room_id).await {
            let _ = sender.send(ServerMessage::Error(e)).await;
            return;
        }

        let guard = rooms.lock().await;
        match guard.engine.query(&room_id) {
            Some(state) => {
                let update = ServerMessage::RotationUpdate { state: state.clone(), rotation };
                Self::broadcast(clients, &room_id, update, Some(addr)).await;
            }
            None => {
                let _ = sender.send(ServerMessage::RoomNotFound).await;
            }
        }
    }

    /// Handle the bowler's field setting.
    async fn handle_field_set(
        addr: SocketAddr,
        room_id: RoomId,
        player_id: PlayerId,
        rotation: f64,
        clients: &Clients,
        rooms: &SharedRooms,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        if let Err(e) = Self::ensure_bound(clients, addr, &player_id, &room_id).await {
            let _ = sender.send(ServerMessage::Error(e)).await;
            return;
        }

        let mut guard = rooms.lock().await;
        match guard.engine.submit_field_rotation(&player_id, &room_id, rotation) {
            Ok(state) => {
                debug!("Field set for ball {} in room {}", state.current_ball, room_id);
                Self::broadcast(clients, &room_id, ServerMessage::PlayShot { state }, None).await;
            }
            Err(e) => {
                warn!("Rejected field_set from {}: {}", player_id, e);
                let _ = sender.send(ServerMessage::Error(ServerError::from(&e))).await;
            }
        }
    }

    /// Handle the batsman's shot.
    async fn handle_shot_played(
        addr: SocketAddr,
        room_id: RoomId,
        player_id: PlayerId,
        choice: String,
        clients: &Clients,
        rooms: &SharedRooms,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        if let Err(e) = Self::ensure_bound(clients, addr, &player_id, &room_id).await {
            let _ = sender.send(ServerMessage::Error(e)).await;
            return;
        }

        let mut guard = rooms.lock().await;
        match guard.engine.submit_shot_choice(&player_id, &room_id, &choice) {
            Ok(state) if state.is_finished() => {
                info!("Game ended in room {}", room_id);
                let outcome = state.outcome();
                Self::broadcast(clients, &room_id, ServerMessage::GameEnded { state, outcome }, None).await;
            }
            Ok(state) => {
                debug!("Delivery completed in room {}, next ball {}", room_id, state.current_ball);
                Self::broadcast(clients, &room_id, ServerMessage::SetField { state }, None).await;
            }
            Err(e) => {
                warn!("Rejected shot_played from {}: {}", player_id, e);
                let _ = sender.send(ServerMessage::Error(ServerError::from(&e))).await;
            }
        }
    }

    /// Handle player leave. Leaving a started match, or being the last one
    /// out, tears the room down.
    async fn handle_leave(addr: SocketAddr, clients: &Clients, rooms: &SharedRooms) {
        let mut guard = rooms.lock().await;

        let player_id = {
            let mut clients = clients.write().await;
            match clients.get_mut(&addr) {
                Some(client) => {
                    client.room_id = None;
                    client.player_id.clone()
                }
                None => return,
            }
        };

        if let Some(player_id) = player_id {
            let Rooms { registry, engine } = &mut *guard;
            if let Some(departure) = registry.remove_player(&player_id, engine) {
                Self::announce_departure(clients, &player_id, &departure).await;
            }
        }
    }

    /// Tell a room a player has gone; unbind everyone if the room closed.
    async fn announce_departure(clients: &Clients, player_id: &PlayerId, departure: &Departure) {
        info!(
            "Player {} left room {} (closed: {})",
            player_id, departure.room_id, departure.room_closed
        );
        let message = ServerMessage::PlayerLeft { player_id: player_id.clone() };
        Self::broadcast(clients, &departure.room_id, message, None).await;

        if departure.room_closed {
            let mut clients = clients.write().await;
            for client in clients.values_mut() {
                if client.room_id.as_ref() == Some(&departure.room_id) {
                    client.room_id = None;
                }
            }
        }
    }

    /// Socket closed: membership marks the player disconnected, match untouched.
    async fn handle_disconnect(addr: SocketAddr, clients: &Clients, rooms: &SharedRooms) {
        let mut guard = rooms.lock().await;

        let Some(client) = clients.write().await.remove(&addr) else {
            return;
        };
        debug!(
            "Client {} removed after {:?} (idle {:?})",
            addr,
            client.connected_at.elapsed(),
            client.last_activity.elapsed()
        );

        if let (Some(player_id), Some(room_id)) = (client.player_id, client.room_id) {
            // Same player may already be back on a newer connection
            let reconnected = clients.read().await.values().any(|c| {
                c.player_id.as_ref() == Some(&player_id) && c.room_id.as_ref() == Some(&room_id)
            });
            if reconnected {
                return;
            }

            if guard.registry.mark_disconnected(&player_id, Instant::now()).is_some() {
                Self::broadcast(clients, &room_id, ServerMessage::PlayerDisconnected { player_id }, None).await;
            }
        }
    }

    /// Reject actions from connections not bound to this player and room.
    async fn ensure_bound(
        clients: &Clients,
        addr: SocketAddr,
        player_id: &PlayerId,
        room_id: &RoomId,
    ) -> Result<(), ServerError> {
        let clients = clients.read().await;
        let client = clients
            .get(&addr)
            .ok_or_else(|| ServerError::new(ErrorCode::NotInRoom, "Unknown connection"))?;

        if client.room_id.as_ref() != Some(room_id) {
            return Err(ServerError::new(ErrorCode::NotInRoom, "Join the room first"));
        }
        if client.player_id.as_ref() != Some(player_id) {
            return Err(ServerError::new(
                ErrorCode::NotYourTurn,
                "Connection is bound to a different player",
            ));
        }
        Ok(())
    }

    /// Bind a connection to a player and room.
    async fn bind_client(clients: &Clients, addr: SocketAddr, player_id: &PlayerId, room_id: &RoomId) {
        let mut clients = clients.write().await;
        if let Some(client) = clients.get_mut(&addr) {
            client.player_id = Some(player_id.clone());
            client.room_id = Some(room_id.clone());
        }
    }

    /// Send a message to every connection bound to a room.
    async fn broadcast(clients: &Clients, room_id: &RoomId, message: ServerMessage, except: Option<SocketAddr>) {
        let senders: Vec<_> = {
            let clients = clients.read().await;
            clients
                .iter()
                .filter(|(addr, c)| c.room_id.as_ref() == Some(room_id) && Some(**addr) != except)
                .map(|(_, c)| c.sender.clone())
                .collect()
        };

        for sender in senders {
            let _ = sender.send(message.clone()).await;
        }
    }

    /// Run cleanup loop: tear down rooms nobody has been connected to for a while.
    async fn run_cleanup_loop(rooms: SharedRooms, config: ServerConfig) {
        let mut interval = interval(config.cleanup_interval);

        loop {
            interval.tick().await;

            let mut guard = rooms.lock().await;
            let Rooms { registry, engine } = &mut *guard;

            for room_id in registry.idle_rooms(Instant::now(), config.room_idle_timeout) {
                registry.delete_room(&room_id, engine);
                info!("Removed idle room {}", room_id);
            }
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Get room count.
    pub async fn room_count(&self) -> usize {
        self.rooms.lock().await.registry.room_count()
    }

    /// Get live match count.
    pub async fn match_count(&self) -> usize {
        self.rooms.lock().await.engine.room_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::state::{GamePhase, MatchRules};

    struct Harness {
        clients: Clients,
        rooms: SharedRooms,
    }

    struct TestClient {
        addr: SocketAddr,
        tx: mpsc::Sender<ServerMessage>,
        rx: mpsc::Receiver<ServerMessage>,
    }

    impl Harness {
        fn new(rules: MatchRules) -> Self {
            Self {
                clients: Arc::new(RwLock::new(BTreeMap::new())),
                rooms: Arc::new(Mutex::new(Rooms {
                    registry: RoomRegistry::new(),
                    engine: DeliveryEngine::with_rules(rules),
                })),
            }
        }

        async fn connect(&self, port: u16) -> TestClient {
            let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
            let (tx, rx) = mpsc::channel(64);
            self.clients.write().await.insert(addr, ConnectedClient {
                player_id: None,
                room_id: None,
                connected_at: Instant::now(),
                last_activity: Instant::now(),
                sender: tx.clone(),
            });
            TestClient { addr, tx, rx }
        }

        async fn send(&self, client: &TestClient, msg: ClientMessage) {
            GameServer::handle_client_message(client.addr, msg, &self.clients, &self.rooms, &client.tx).await;
        }

        async fn disconnect(&self, client: &TestClient) {
            GameServer::handle_disconnect(client.addr, &self.clients, &self.rooms).await;
        }
    }

    /// Two connected clients in a started room; returns room id.
    async fn started_room(h: &Harness, c1: &mut TestClient, c2: &mut TestClient) -> RoomId {
        h.send(c1, ClientMessage::CreateRoom { player_id: "p1".into() }).await;
        let room_id = match c1.rx.recv().await {
            Some(ServerMessage::RoomCreated { room_id }) => room_id,
            other => panic!("expected RoomCreated, got {:?}", other),
        };

        h.send(c2, ClientMessage::JoinRoom { room_id: room_id.clone(), player_id: "p2".into() }).await;
        assert!(matches!(c2.rx.recv().await, Some(ServerMessage::PlayerJoined { .. })));
        assert!(matches!(c2.rx.recv().await, Some(ServerMessage::GameStarted { .. })));
        match c1.rx.recv().await {
            Some(ServerMessage::GameStarted { state }) => {
                assert_eq!(state.phase, GamePhase::SettingField);
                assert_eq!(state.bowler, PlayerId::from("p1"));
            }
            other => panic!("expected GameStarted, got {:?}", other),
        }
        room_id
    }

    #[test]
    fn test_server_creation_defaults() {
        let server = GameServer::new(ServerConfig::default());
        assert_eq!(server.config.max_connections, 1000);
    }

    #[tokio::test]
    async fn test_server_counts_start_empty() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GameServer::new(config);

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.room_count().await, 0);
        assert_eq!(server.match_count().await, 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_field_and_shot_broadcast() {
        let h = Harness::new(MatchRules::default());
        let mut c1 = h.connect(1001).await;
        let mut c2 = h.connect(1002).await;
        let room_id = started_room(&h, &mut c1, &mut c2).await;

        h.send(&c1, ClientMessage::FieldSet { player_id: "p1".into(), room_id: room_id.clone(), rotation: 1.2 }).await;
        assert!(matches!(c1.rx.recv().await, Some(ServerMessage::PlayShot { .. })));
        assert!(matches!(c2.rx.recv().await, Some(ServerMessage::PlayShot { .. })));

        h.send(&c2, ClientMessage::ShotPlayed { player_id: "p2".into(), room_id: room_id.clone(), choice: "4".into() }).await;
        for client in [&mut c1, &mut c2] {
            match client.rx.recv().await {
                Some(ServerMessage::SetField { state }) => {
                    assert_eq!(state.runs, [4, 0]);
                    assert_eq!(state.current_ball, 2);
                }
                other => panic!("expected SetField, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_rejection_goes_to_caller_only() {
        let h = Harness::new(MatchRules::default());
        let mut c1 = h.connect(1001).await;
        let mut c2 = h.connect(1002).await;
        let room_id = started_room(&h, &mut c1, &mut c2).await;

        h.send(&c1, ClientMessage::ShotPlayed { player_id: "p1".into(), room_id, choice: "4".into() }).await;

        match c1.rx.recv().await {
            Some(ServerMessage::Error(err)) => assert_eq!(err.code, ErrorCode::NotYourTurn),
            other => panic!("expected Error, got {:?}", other),
        }
        assert!(c2.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spoofed_player_rejected() {
        let h = Harness::new(MatchRules::default());
        let mut c1 = h.connect(1001).await;
        let mut c2 = h.connect(1002).await;
        let room_id = started_room(&h, &mut c1, &mut c2).await;

        // c2 tries to act as the bowler
        h.send(&c2, ClientMessage::FieldSet { player_id: "p1".into(), room_id, rotation: 0.3 }).await;
        match c2.rx.recv().await {
            Some(ServerMessage::Error(err)) => assert_eq!(err.code, ErrorCode::NotYourTurn),
            other => panic!("expected Error, got {:?}", other),
        }
        assert!(c1.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_third_player_gets_room_full() {
        let h = Harness::new(MatchRules::default());
        let mut c1 = h.connect(1001).await;
        let mut c2 = h.connect(1002).await;
        let mut c3 = h.connect(1003).await;
        let room_id = started_room(&h, &mut c1, &mut c2).await;

        h.send(&c3, ClientMessage::JoinRoom { room_id, player_id: "p3".into() }).await;
        assert!(matches!(c3.rx.recv().await, Some(ServerMessage::RoomFull)));

        h.send(&c3, ClientMessage::JoinRoom { room_id: "missing".into(), player_id: "p3".into() }).await;
        assert!(matches!(c3.rx.recv().await, Some(ServerMessage::RoomNotFound)));
    }

    #[tokio::test]
    async fn test_rotation_preview_skips_sender() {
        let h = Harness::new(MatchRules::default());
        let mut c1 = h.connect(1001).await;
        let mut c2 = h.connect(1002).await;
        let room_id = started_room(&h, &mut c1, &mut c2).await;

        h.send(&c1, ClientMessage::RotatePie { room_id, player_id: "p1".into(), rotation: 0.75 }).await;
        assert!(matches!(
            c2.rx.recv().await,
            Some(ServerMessage::RotationUpdate { rotation, .. }) if rotation == 0.75
        ));
        assert!(c1.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_and_rejoin_resyncs() {
        let h = Harness::new(MatchRules::default());
        let mut c1 = h.connect(1001).await;
        let mut c2 = h.connect(1002).await;
        let room_id = started_room(&h, &mut c1, &mut c2).await;

        h.send(&c1, ClientMessage::FieldSet { player_id: "p1".into(), room_id: room_id.clone(), rotation: 1.0 }).await;
        c1.rx.recv().await;
        c2.rx.recv().await;

        h.disconnect(&c2).await;
        assert!(matches!(c1.rx.recv().await, Some(ServerMessage::PlayerDisconnected { .. })));

        let mut c2b = h.connect(1004).await;
        h.send(&c2b, ClientMessage::JoinRoom { room_id: room_id.clone(), player_id: "p2".into() }).await;
        match c2b.rx.recv().await {
            Some(ServerMessage::PlayerJoined { state, player }) => {
                assert!(player.connected);
                assert_eq!(state.phase, GamePhase::Batting);
                assert_eq!(state.pending_rotation, Some(1.0));
            }
            other => panic!("expected PlayerJoined, got {:?}", other),
        }

        h.send(&c2b, ClientMessage::SyncRequest { room_id }).await;
        assert!(matches!(c2b.rx.recv().await, Some(ServerMessage::State { .. })));
    }

    #[tokio::test]
    async fn test_full_match_ends_with_game_ended() {
        let h = Harness::new(MatchRules { ball_quota: 1, wicket_quota: 1 });
        let mut c1 = h.connect(1001).await;
        let mut c2 = h.connect(1002).await;
        let room_id = started_room(&h, &mut c1, &mut c2).await;

        h.send(&c1, ClientMessage::FieldSet { player_id: "p1".into(), room_id: room_id.clone(), rotation: 0.1 }).await;
        h.send(&c2, ClientMessage::ShotPlayed { player_id: "p2".into(), room_id: room_id.clone(), choice: "2".into() }).await;
        h.send(&c2, ClientMessage::FieldSet { player_id: "p2".into(), room_id: room_id.clone(), rotation: 0.2 }).await;
        h.send(&c1, ClientMessage::ShotPlayed { player_id: "p1".into(), room_id: room_id.clone(), choice: "W".into() }).await;

        let mut last = None;
        while let Ok(msg) = c1.rx.try_recv() {
            last = Some(msg);
        }
        match last {
            Some(ServerMessage::GameEnded { state, outcome }) => {
                assert_eq!(state.phase, GamePhase::Finished);
                assert_eq!(state.delivery_history.len(), 2);
                assert!(matches!(
                    outcome,
                    Some(crate::game::state::MatchOutcome::Winner { ref player, margin: 2, .. })
                        if *player == PlayerId::from("p2")
                ));
            }
            other => panic!("expected GameEnded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_leave_started_match_closes_room() {
        let h = Harness::new(MatchRules::default());
        let mut c1 = h.connect(1001).await;
        let mut c2 = h.connect(1002).await;
        let room_id = started_room(&h, &mut c1, &mut c2).await;

        h.send(&c1, ClientMessage::Leave).await;
        assert!(matches!(c2.rx.recv().await, Some(ServerMessage::PlayerLeft { .. })));
        {
            let rooms = h.rooms.lock().await;
            assert_eq!(rooms.registry.room_count(), 0);
            assert_eq!(rooms.engine.room_count(), 0);
        }

        // Remaining member is unbound from the closed room
        h.send(&c2, ClientMessage::FieldSet { player_id: "p2".into(), room_id: room_id.clone(), rotation: 0.4 }).await;
        match c2.rx.recv().await {
            Some(ServerMessage::Error(err)) => assert_eq!(err.code, ErrorCode::NotInRoom),
            other => panic!("expected Error, got {:?}", other),
        }

        h.send(&c1, ClientMessage::JoinRoom { room_id, player_id: "p1".into() }).await;
        assert!(matches!(c1.rx.recv().await, Some(ServerMessage::RoomNotFound)));
    }

    #[tokio::test]
    async fn test_creator_leaving_alone_deletes_room() {
        let h = Harness::new(MatchRules::default());
        let mut c1 = h.connect(1001).await;
        let mut c2 = h.connect(1002).await;

        h.send(&c1, ClientMessage::CreateRoom { player_id: "p1".into() }).await;
        let room_id = match c1.rx.recv().await {
            Some(ServerMessage::RoomCreated { room_id }) => room_id,
            other => panic!("expected RoomCreated, got {:?}", other),
        };

        h.send(&c1, ClientMessage::Leave).await;
        assert_eq!(h.rooms.lock().await.registry.room_count(), 0);

        h.send(&c2, ClientMessage::JoinRoom { room_id, player_id: "p2".into() }).await;
        assert!(matches!(c2.rx.recv().await, Some(ServerMessage::RoomNotFound)));
    }

    #[tokio::test]
    async fn test_new_room_vacates_old_one() {
        let h = Harness::new(MatchRules::default());
        let mut c1 = h.connect(1001).await;
        let mut c2 = h.connect(1002).await;
        let old_room = started_room(&h, &mut c1, &mut c2).await;

        h.send(&c1, ClientMessage::CreateRoom { player_id: "p1".into() }).await;
        let new_room = match c1.rx.recv().await {
            Some(ServerMessage::RoomCreated { room_id }) => room_id,
            other => panic!("expected RoomCreated, got {:?}", other),
        };
        assert!(matches!(c2.rx.recv().await, Some(ServerMessage::PlayerLeft { .. })));
        assert!(c1.rx.try_recv().is_err());

        let rooms = h.rooms.lock().await;
        assert!(rooms.registry.room(&old_room).is_none());
        assert!(rooms.engine.query(&old_room).is_none());
        assert_eq!(rooms.registry.player_room(&PlayerId::from("p1")), Some(&new_room));
    }

    #[tokio::test]
    async fn test_stale_socket_close_after_reconnect_is_ignored() {
        let h = Harness::new(MatchRules::default());
        let mut c1 = h.connect(1001).await;
        let mut c2 = h.connect(1002).await;
        let room_id = started_room(&h, &mut c1, &mut c2).await;

        // p2 comes back on a new socket before the old one is reaped
        let mut c2b = h.connect(1004).await;
        h.send(&c2b, ClientMessage::JoinRoom { room_id: room_id.clone(), player_id: "p2".into() }).await;
        assert!(matches!(c2b.rx.recv().await, Some(ServerMessage::PlayerJoined { .. })));

        h.disconnect(&c2).await;
        assert!(c1.rx.try_recv().is_err());

        let rooms = h.rooms.lock().await;
        assert!(rooms.registry.player(&PlayerId::from("p2")).unwrap().connected);
        assert_eq!(h.clients.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let h = Harness::new(MatchRules::default());
        let mut c1 = h.connect(1001).await;

        h.send(&c1, ClientMessage::Ping { timestamp: 42 }).await;
        assert!(matches!(c1.rx.recv().await, Some(ServerMessage::Pong { timestamp: 42, .. })));
    }
}
