use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::namespace::codec;
use crate::net::protocol::{
    self, Command, ControlReply, ControlRequest, Registration, RegistrationReply, Response,
};
use crate::net::{ByteStream, ControlChannel};
use crate::registry::{ServerRegistry, StorageServerRecord};
use crate::router::Router;
use crate::{Result, ShardError};

/// How long an already registered address gets to answer a ping before a
/// new registration for it is let through.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(5);

/// The naming server: registry of storage nodes plus the client front end.
pub struct NamingServer {
    registry: Arc<ServerRegistry>,
    router: Router,
    heartbeat: Option<Duration>,
    /// Serializes the duplicate check and insert of registrations.
    registrations: tokio::sync::Mutex<()>,
}

impl NamingServer {
    pub fn new(heartbeat: Option<Duration>) -> Self {
        let registry = Arc::new(ServerRegistry::new());
        Self {
            router: Router::new(registry.clone()),
            registry,
            heartbeat,
            registrations: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Run both accept loops (and the heartbeat, if enabled) until one of the
    /// listeners fails.
    pub async fn serve(self: Arc<Self>, storage: TcpListener, clients: TcpListener) -> Result<()> {
        info!(
            storage = %storage.local_addr()?,
            clients = %clients.local_addr()?,
            "Naming server listening"
        );
        if let Some(period) = self.heartbeat {
            tokio::spawn(self.clone().heartbeat_loop(period));
        }
        tokio::select! {
            r = self.clone().accept_storage(storage) => r,
            r = self.clone().accept_clients(clients) => r,
        }
    }

    async fn accept_storage(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.register_storage(stream, peer).await {
                    warn!(%peer, error = %e, "Storage registration failed");
                }
            });
        }
    }

    async fn accept_clients(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let _ = stream.set_nodelay(true);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.client_session(stream, peer).await {
                    debug!(%peer, error = %e, "Client session ended with error");
                }
            });
        }
    }

    /// Handle the registration exchange on a new control connection. On
    /// success the connection becomes the record's control channel.
    pub async fn register_storage<S>(&self, mut stream: S, peer: SocketAddr) -> Result<Arc<StorageServerRecord>>
    where
        S: ByteStream + 'static,
    {
        let registration: Registration = protocol::read_message(&mut stream).await?;
        let address = registration.address;
        info!(%peer, storage = %address, name = %registration.name, "Storage server connecting");

        let mirror = match codec::decode_tree(&registration.tree) {
            Ok(tree) => tree,
            Err(e) => {
                let reply = RegistrationReply::Rejected {
                    reason: e.to_string(),
                };
                protocol::write_message(&mut stream, &reply).await?;
                return Err(e);
            }
        };
        let nodes = mirror.len();

        let _gate = self.registrations.lock().await;
        if let Some(existing) = self.registry.find_by_address(address.ip, address.control_port) {
            if self.still_alive(&existing).await {
                let reason = format!("{} is already registered and active", address);
                protocol::write_message(&mut stream, &RegistrationReply::Rejected { reason: reason.clone() })
                    .await?;
                return Err(ShardError::DuplicateName(reason));
            }
        }

        // The acceptance must reach the node before any control request can.
        protocol::write_message(&mut stream, &RegistrationReply::Accepted).await?;
        let record = self.registry.new_record(
            registration.name,
            address,
            mirror,
            ControlChannel::new(stream),
        );
        self.registry.add(record.clone());
        info!(storage = %address, nodes, "Namespace mirrored");
        Ok(record)
    }

    /// Whether a registered record still answers on its control channel. A
    /// record that does not is tombstoned, which frees its address.
    async fn still_alive(&self, record: &StorageServerRecord) -> bool {
        let mut state = record.lock().await;
        if !state.is_active() {
            return false;
        }
        match tokio::time::timeout(LIVENESS_TIMEOUT, state.call(&ControlRequest::Ping)).await {
            Ok(Ok(ControlReply::Pong)) => true,
            Ok(Ok(other)) => {
                let e = state.unexpected(other);
                warn!(storage = %record.address, error = %e, "Registered node answered ping wrongly");
                false
            }
            Ok(Err(e)) => {
                info!(storage = %record.address, error = %e, "Registered node is gone, replacing it");
                false
            }
            Err(_) => {
                warn!(storage = %record.address, "Registered node did not answer ping, replacing it");
                state.tombstone();
                false
            }
        }
    }

    /// One client connection: commands in, responses out, until `EXIT` or
    /// hangup.
    pub async fn client_session<S>(&self, mut stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!(%peer, "Client connected");
        while let Some(command) = protocol::read_message_opt::<_, Command>(&mut stream).await? {
            let response = self.router.dispatch(command).await;
            protocol::write_message(&mut stream, &response).await?;
            if response == Response::Bye {
                break;
            }
        }
        info!(%peer, "Client disconnected");
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.heartbeat_round().await;
        }
    }

    /// Ping every active node that is not busy. A node that fails to answer
    /// is tombstoned by the failed call itself.
    pub async fn heartbeat_round(&self) {
        for record in self.registry.snapshot() {
            // A busy record is in the middle of a control call, which will
            // notice a dead channel on its own.
            let Some(mut state) = record.try_lock() else {
                continue;
            };
            if !state.is_active() {
                continue;
            }
            match state.call(&ControlRequest::Ping).await {
                Ok(ControlReply::Pong) => {}
                Ok(other) => {
                    let e = state.unexpected(other);
                    warn!(storage = %record.address, error = %e, "Heartbeat failed");
                }
                Err(e) => {
                    warn!(storage = %record.address, error = %e, "Heartbeat failed");
                }
            }
        }
    }
}
