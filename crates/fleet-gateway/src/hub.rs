//! [`Hub`] – who is connected and what they want to hear.
//!
//! # Concurrency model
//!
//! Membership changes and fleet-wide broadcasts are sent as commands to a
//! single loop ([`Hub::run`]), so the client map only ever has one writer.
//! Targeted delivery ([`Hub::broadcast_to_robot`], [`Hub::send_to_client`])
//! takes the map's read lock directly and never waits on the loop.
//!
//! Delivery is best-effort and at-most-once: when a client's outbound queue
//! is full its copy of the frame is dropped with a warning and the broadcast
//! moves on to the next client.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use fleet_types::{ClientId, GatewayError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{Client, DeliveryError};

enum HubCommand {
    Register(Arc<Client>, oneshot::Sender<()>),
    Unregister(ClientId, oneshot::Sender<()>),
    Broadcast(Bytes),
}

pub struct Hub {
    clients: RwLock<HashMap<ClientId, Arc<Client>>>,
    commands: mpsc::UnboundedSender<HubCommand>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<HubCommand>>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        let (commands, inbox) = mpsc::unbounded_channel();
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            commands,
            inbox: Mutex::new(Some(inbox)),
        })
    }

    /// Start [`Hub::run`] on the tokio runtime.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Process membership commands and fleet-wide broadcasts until the
    /// task is aborted.  Only the first call does anything.
    pub async fn run(self: Arc<Self>) {
        let Some(mut inbox) = self.inbox.lock().take() else {
            warn!("hub loop already running");
            return;
        };
        info!("hub loop started");
        while let Some(command) = inbox.recv().await {
            match command {
                HubCommand::Register(client, ack) => {
                    let id = client.id();
                    self.clients.write().insert(id, client);
                    debug!(client_id = %id, "client registered");
                    let _ = ack.send(());
                }
                HubCommand::Unregister(id, ack) => {
                    if let Some(client) = self.clients.write().remove(&id) {
                        client.close();
                        debug!(client_id = %id, "client unregistered");
                    }
                    let _ = ack.send(());
                }
                HubCommand::Broadcast(frame) => {
                    let clients = self.clients.read();
                    for client in clients.values() {
                        deliver(client, frame.clone());
                    }
                }
            }
        }
    }

    /// Add `client` to the hub.  Resolves once the hub loop has applied it.
    pub async fn register(&self, client: Arc<Client>) -> Result<(), GatewayError> {
        let (ack, done) = oneshot::channel();
        self.submit(HubCommand::Register(client, ack))?;
        done.await
            .map_err(|_| GatewayError::Channel("hub loop stopped".to_string()))
    }

    /// Remove a client and close its outbound queue.  Unknown IDs are
    /// ignored.
    pub async fn unregister(&self, client_id: ClientId) -> Result<(), GatewayError> {
        let (ack, done) = oneshot::channel();
        self.submit(HubCommand::Unregister(client_id, ack))?;
        done.await
            .map_err(|_| GatewayError::Channel("hub loop stopped".to_string()))
    }

    /// Send `frame` to every connected client regardless of subscriptions.
    ///
    /// Reserved for safety alerts and system notices.
    pub fn broadcast_to_all(&self, frame: Bytes) {
        if self.submit(HubCommand::Broadcast(frame)).is_err() {
            warn!("broadcast dropped: hub loop stopped");
        }
    }

    /// Send `frame` to every client subscribed to `robot_id`.  Returns the
    /// number of clients it was queued for.
    pub fn broadcast_to_robot(&self, robot_id: &str, frame: Bytes) -> usize {
        let clients = self.clients.read();
        clients
            .values()
            .filter(|c| c.is_subscribed(robot_id))
            .filter(|c| deliver(c, frame.clone()))
            .count()
    }

    /// Queue `frame` for one client.  Returns `false` if the client is not
    /// registered or its queue rejected the frame.
    pub fn send_to_client(&self, client_id: ClientId, frame: Bytes) -> bool {
        match self.clients.read().get(&client_id) {
            Some(client) => deliver(client, frame),
            None => false,
        }
    }

    /// Add `robot_id` to a registered client's subscriptions.
    pub fn subscribe_client(&self, client_id: ClientId, robot_id: &str) -> bool {
        match self.clients.read().get(&client_id) {
            Some(client) => {
                client.subscribe(robot_id);
                true
            }
            None => false,
        }
    }

    pub fn unsubscribe_client(&self, client_id: ClientId, robot_id: &str) -> bool {
        match self.clients.read().get(&client_id) {
            Some(client) => client.unsubscribe(robot_id),
            None => false,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.read().contains_key(&client_id)
    }

    fn submit(&self, command: HubCommand) -> Result<(), GatewayError> {
        self.commands
            .send(command)
            .map_err(|_| GatewayError::Channel("hub loop stopped".to_string()))
    }
}

fn deliver(client: &Client, frame: Bytes) -> bool {
    match client.try_send(frame) {
        Ok(()) => true,
        Err(DeliveryError::Full) => {
            warn!(client_id = %client.id(), "send buffer full, dropping message");
            false
        }
        Err(DeliveryError::Closed) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn running_hub() -> Arc<Hub> {
        let hub = Hub::new();
        hub.spawn();
        hub
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let hub = running_hub().await;
        let (client, mut rx) = Client::new(8, None);

        hub.register(Arc::clone(&client)).await.unwrap();
        assert_eq!(hub.client_count(), 1);
        assert!(hub.contains(client.id()));

        hub.unregister(client.id()).await.unwrap();
        assert_eq!(hub.client_count(), 0);
        // Unregistering closes the queue, which ends the write pump.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn robot_broadcast_reaches_only_subscribers() {
        let hub = running_hub().await;
        let (a, mut a_rx) = Client::new(8, None);
        let (b, mut b_rx) = Client::new(8, None);
        hub.register(Arc::clone(&a)).await.unwrap();
        hub.register(Arc::clone(&b)).await.unwrap();

        assert!(hub.subscribe_client(a.id(), "r1"));
        hub.subscribe_client(b.id(), "r2");

        assert_eq!(hub.broadcast_to_robot("r1", Bytes::from_static(b"r1-data")), 1);
        assert_eq!(a_rx.recv().await.unwrap(), Bytes::from_static(b"r1-data"));
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_all_ignores_subscriptions() {
        let hub = running_hub().await;
        let (a, mut a_rx) = Client::new(8, None);
        let (b, mut b_rx) = Client::new(8, None);
        hub.register(Arc::clone(&a)).await.unwrap();
        hub.register(Arc::clone(&b)).await.unwrap();
        hub.subscribe_client(a.id(), "r1");

        hub.broadcast_to_all(Bytes::from_static(b"alert"));
        assert_eq!(a_rx.recv().await.unwrap(), Bytes::from_static(b"alert"));
        assert_eq!(b_rx.recv().await.unwrap(), Bytes::from_static(b"alert"));
    }

    #[tokio::test]
    async fn full_client_does_not_block_others() {
        let hub = running_hub().await;
        let (slow, _slow_rx) = Client::new(1, None);
        let (fast, mut fast_rx) = Client::new(8, None);
        hub.register(Arc::clone(&slow)).await.unwrap();
        hub.register(Arc::clone(&fast)).await.unwrap();
        hub.subscribe_client(slow.id(), "r1");
        hub.subscribe_client(fast.id(), "r1");

        for i in 0..3u8 {
            hub.broadcast_to_robot("r1", Bytes::from(vec![i]));
        }
        for i in 0..3u8 {
            assert_eq!(fast_rx.recv().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn robot_broadcast_keeps_order() {
        let hub = running_hub().await;
        let (client, mut rx) = Client::new(64, None);
        hub.register(Arc::clone(&client)).await.unwrap();
        hub.subscribe_client(client.id(), "r1");

        for i in 0..20u8 {
            hub.broadcast_to_robot("r1", Bytes::from(vec![i]));
        }
        for i in 0..20u8 {
            assert_eq!(rx.recv().await.unwrap()[0], i);
        }
    }

    #[tokio::test]
    async fn send_to_unknown_client_is_false() {
        let hub = running_hub().await;
        assert!(!hub.send_to_client(uuid::Uuid::new_v4(), Bytes::new()));
        assert!(!hub.subscribe_client(uuid::Uuid::new_v4(), "r1"));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = running_hub().await;
        let (client, mut rx) = Client::new(8, None);
        hub.register(Arc::clone(&client)).await.unwrap();
        hub.subscribe_client(client.id(), "r1");
        assert!(hub.unsubscribe_client(client.id(), "r1"));

        assert_eq!(hub.broadcast_to_robot("r1", Bytes::from_static(b"x")), 0);
        assert!(rx.try_recv().is_err());
    }
}
