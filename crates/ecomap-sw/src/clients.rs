//! Open UI clients and update broadcasts.

use std::sync::atomic::{AtomicU64, Ordering};

use ecomap_core::ClientBroadcast;
use hashbrown::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use crate::lifecycle::WorkerId;
use crate::ServiceWorkerError;

/// Unique identifier for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    /// Only meaningful in [`ClientMatchOptions`].
    All,
}

/// An open page or worker in the controller's scope.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    /// Instance controlling this client, if any.
    pub controller: Option<WorkerId>,
    sender: mpsc::UnboundedSender<ClientBroadcast>,
}

impl Client {
    /// Post message to client.
    pub fn post_message(&self, message: ClientBroadcast) -> Result<(), ServiceWorkerError> {
        self.sender
            .send(message)
            .map_err(|_| ServiceWorkerError::StateError(format!("client {:?} is gone", self.id)))
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

impl ClientMatchOptions {
    /// Every window, controlled or not.
    pub fn all_windows() -> Self {
        Self {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        }
    }
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. The receiver gets every message posted to it.
    pub fn add(
        &mut self,
        url: Url,
        client_type: ClientType,
        controller: Option<WorkerId>,
    ) -> (ClientId, mpsc::UnboundedReceiver<ClientBroadcast>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = ClientId::new();
        trace!(client = ?id, url = %url, "Client added");
        self.clients.insert(
            id,
            Client {
                id,
                url,
                client_type,
                controller,
                sender,
            },
        );
        (id, receiver)
    }

    /// Remove a client.
    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        self.clients.remove(&id)
    }

    /// Get a client by ID.
    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Match clients. Without `include_uncontrolled`, only clients controlled
    /// by `controller` are returned.
    pub fn match_all(
        &self,
        options: ClientMatchOptions,
        controller: Option<WorkerId>,
    ) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| {
                options.include_uncontrolled
                    || (c.controller.is_some() && c.controller == controller)
            })
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by_key(|c| c.id);
        matched
    }

    /// Make `worker` the controller of every client.
    pub fn claim(&mut self, worker: WorkerId) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.controller != Some(worker) {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        debug!(worker = ?worker, claimed, "Claimed clients");
        claimed
    }

    /// Remove every client whose receiver was dropped.
    pub fn prune_closed(&mut self) -> Vec<Client> {
        let closed: Vec<ClientId> = self
            .clients
            .values()
            .filter(|c| c.is_closed())
            .map(|c| c.id)
            .collect();

        let mut pruned: Vec<Client> = closed
            .iter()
            .filter_map(|id| self.clients.remove(id))
            .collect();
        pruned.sort_by_key(|c| c.id);
        if !pruned.is_empty() {
            debug!(pruned = pruned.len(), "Pruned closed clients");
        }
        pruned
    }

    /// Post `message` to every matching client. Clients whose receiver was
    /// dropped are removed; their ids are returned with the delivered count.
    pub fn broadcast(
        &mut self,
        message: &ClientBroadcast,
        options: ClientMatchOptions,
        controller: Option<WorkerId>,
    ) -> (usize, Vec<ClientId>) {
        let targets: Vec<ClientId> = self
            .match_all(options, controller)
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut delivered = 0;
        let mut gone = Vec::new();
        for id in targets {
            let Some(client) = self.clients.get(&id) else {
                continue;
            };
            match client.post_message(message.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => gone.push(id),
            }
        }
        for id in &gone {
            self.clients.remove(id);
        }

        debug!(version = %message.version(), delivered, pruned = gone.len(), "Broadcast sent");
        (delivered, gone)
    }
}
