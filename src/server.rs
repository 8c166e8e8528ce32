use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WebSocketMessage, WebSocket},
        ConnectInfo, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};

use futures_util::StreamExt;
use log::{error, info, warn};

use crate::actor::{ActorConfig, ConnectionActor};

pub struct Server {
    config: ActorConfig,
}

impl Server {
    pub fn new() -> Self {
        Self {
            config: ActorConfig::default(),
        }
    }

    pub fn with_config(config: ActorConfig) -> Self {
        Self { config }
    }

    pub async fn run(self, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
        info!("Listening on: {}", addr);

        let listener = std::net::TcpListener::bind(addr)?;
        self.serve_listener(listener).await
    }

    /// Serves on an already-bound listener; tests bind port 0 through this.
    pub async fn serve_listener(
        self,
        listener: std::net::TcpListener,
    ) -> Result<(), Box<dyn std::error::Error>> {
        listener.set_nonblocking(true)?;

        let config = self.config.clone();

        let app = Router::new().route(
            "/ws",
            get(
                move |ws: WebSocketUpgrade, conn_info: ConnectInfo<SocketAddr>| {
                    Self::ws_handler(ws, conn_info, config.clone())
                },
            ),
        );

        axum::Server::from_tcp(listener)?
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        Ok(())
    }

    async fn ws_handler(
        ws: WebSocketUpgrade,
        ConnectInfo(addr): ConnectInfo<SocketAddr>,
        config: ActorConfig,
    ) -> impl IntoResponse {
        info!("New connection from: {}", addr);

        ws.on_upgrade(move |socket| Self::handle_socket(socket, addr, config))
    }

    /// Wires one accepted socket to a connection actor: a read loop feeding
    /// the inbound queue, plus receive, broadcast and timer tasks.
    async fn handle_socket(socket: WebSocket, addr: SocketAddr, config: ActorConfig) {
        let actor = Arc::new(ConnectionActor::new(config));
        let (write, mut read) = socket.split();

        let inbound = match actor.inbound() {
            Some(inbound) => inbound,
            None => return,
        };

        let timer = Arc::clone(&actor).spawn_timer();

        let receive_actor = Arc::clone(&actor);
        let receive = tokio::spawn(async move {
            if let Err(e) = receive_actor.receive_loop().await {
                error!("[{}] receive loop failed: {}", receive_actor.id(), e);
                receive_actor.shutdown();
            }
        });

        let broadcast_actor = Arc::clone(&actor);
        let broadcast = tokio::spawn(async move {
            broadcast_actor.broadcast_loop(write).await;
        });

        let cancelled = actor.cancellation();

        loop {
            let frame = tokio::select! {
                _ = cancelled.cancelled() => break,
                frame = read.next() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match frame {
                Ok(WebSocketMessage::Text(text)) => {
                    if inbound.send(text).is_err() {
                        break;
                    }
                }
                Ok(WebSocketMessage::Close(_)) => break,
                Ok(_) => {
                    warn!("[{}] ignoring a non-text frame", actor.id());
                }
                Err(e) => {
                    warn!("[{}] read error: {}", actor.id(), e);
                    break;
                }
            }
        }

        drop(inbound);
        actor.close_inbound();
        actor.shutdown();

        let _ = tokio::join!(receive, broadcast, timer);

        info!("Connection closed: {}", addr);
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}
