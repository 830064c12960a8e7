//! Registration controller.
//!
//! A single task owns the lifecycle state, the per-instance configs and the
//! client list. Everything that changes them goes through [`ControllerHandle`]
//! as a message. Fetches do not: the active [`ServingPolicy`] is published on
//! a watch channel and answered in the caller's task.

use std::collections::VecDeque;
use std::sync::Arc;

use ecomap_core::{ClientBroadcast, ClientCommand, ControllerConfig};
use ecomap_net::{Fetcher, Request};
use hashbrown::HashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::clients::{ClientId, ClientMatchOptions, ClientType, Clients};
use crate::lifecycle::{
    transition, Effect, LifecycleEvent, RegistrationState, ServiceWorkerState, WorkerId,
    WorkerInstance,
};
use crate::policy::{FetchResponse, ServingPolicy};
use crate::store::{CacheEntry, CacheKey, CacheStorage};
use crate::ServiceWorkerError;

/// Events observable from outside the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new version started installing.
    UpdateFound { worker: WorkerId, version: String },
    StateChange {
        worker: WorkerId,
        version: String,
        state: ServiceWorkerState,
    },
    InstallFailed { worker: WorkerId, reason: String },
    /// Open clients switched to a new controlling instance.
    ControllerChange { worker: WorkerId, claimed: usize },
}

/// Point-in-time view of the registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationSnapshot {
    pub installing: Option<WorkerInstance>,
    pub waiting: Option<WorkerInstance>,
    pub active: Option<WorkerInstance>,
    pub open_clients: usize,
}

impl RegistrationSnapshot {
    pub fn active_version(&self) -> Option<&str> {
        self.active.as_ref().map(|i| i.version.as_str())
    }

    pub fn waiting_version(&self) -> Option<&str> {
        self.waiting.as_ref().map(|i| i.version.as_str())
    }

    /// Whether `version` is active and finished activating.
    pub fn is_activated(&self, version: &str) -> bool {
        self.active
            .as_ref()
            .is_some_and(|i| i.version == version && i.state == ServiceWorkerState::Activated)
    }
}

impl From<&RegistrationState> for RegistrationSnapshot {
    fn from(state: &RegistrationState) -> Self {
        Self {
            installing: state.installing.clone(),
            waiting: state.waiting.clone(),
            active: state.active.clone(),
            open_clients: state.open_clients,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Register {
        config: Box<ControllerConfig>,
        reply: Reply<Result<WorkerId, ServiceWorkerError>>,
    },
    Message {
        command: ClientCommand,
        reply: Reply<()>,
    },
    OpenClient {
        url: Url,
        client_type: ClientType,
        reply: Reply<(ClientId, mpsc::UnboundedReceiver<ClientBroadcast>)>,
    },
    CloseClient {
        id: ClientId,
        reply: Reply<bool>,
    },
    ClearCaches {
        reply: Reply<Result<usize, ServiceWorkerError>>,
    },
    Unregister {
        reply: Reply<()>,
    },
    /// Result of a background install.
    Lifecycle(LifecycleEvent),
    Shutdown,
}

/// The controller task.
pub struct ServiceWorkerController {
    state: RegistrationState,
    configs: HashMap<WorkerId, ControllerConfig>,
    clients: Clients,
    storage: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    /// Instance whose policy is currently published.
    serving: Option<WorkerId>,
    commands: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
    active_tx: watch::Sender<Option<Arc<ServingPolicy>>>,
    snapshot_tx: watch::Sender<RegistrationSnapshot>,
}

impl ServiceWorkerController {
    /// Start the controller task. Must be called inside a tokio runtime.
    ///
    /// The task stops on [`ControllerHandle::shutdown`] or once every handle
    /// is dropped.
    pub fn spawn(
        storage: CacheStorage,
        fetcher: Arc<dyn Fetcher>,
    ) -> (ControllerHandle, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (active_tx, active_rx) = watch::channel(None);
        let (snapshot_tx, snapshot_rx) = watch::channel(RegistrationSnapshot::default());

        let controller = Self {
            state: RegistrationState::default(),
            configs: HashMap::new(),
            clients: Clients::new(),
            storage,
            fetcher,
            serving: None,
            commands: commands_tx.downgrade(),
            events: events_tx,
            active_tx,
            snapshot_tx,
        };
        tokio::spawn(controller.run(commands_rx));

        let handle = ControllerHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            active: active_rx,
        };
        (handle, events_rx)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("Service worker controller started");

        while let Some(command) = commands.recv().await {
            match command {
                Command::Register { config, reply } => {
                    let _ = reply.send(self.register(*config));
                }
                Command::Message { command, reply } => {
                    match command {
                        ClientCommand::SkipWaiting => self.dispatch(LifecycleEvent::SkipWaiting),
                    }
                    let _ = reply.send(());
                }
                Command::OpenClient {
                    url,
                    client_type,
                    reply,
                } => {
                    let controller = self.state.active.as_ref().map(|i| i.id);
                    let opened = self.clients.add(url, client_type, controller);
                    if client_type == ClientType::Window {
                        self.dispatch(LifecycleEvent::ClientOpened);
                    }
                    let _ = reply.send(opened);
                }
                Command::CloseClient { id, reply } => {
                    let removed = self.clients.remove(id);
                    if removed
                        .as_ref()
                        .is_some_and(|c| c.client_type == ClientType::Window)
                    {
                        self.dispatch(LifecycleEvent::ClientClosed);
                    }
                    let _ = reply.send(removed.is_some());
                }
                Command::ClearCaches { reply } => {
                    let result = self.storage.clear_all();
                    if let Ok(count) = result {
                        info!(count, "Cleared every store");
                    }
                    let _ = reply.send(result);
                }
                Command::Unregister { reply } => {
                    info!("Unregistering");
                    self.dispatch(LifecycleEvent::Unregister);
                    let _ = reply.send(());
                }
                Command::Lifecycle(event) => self.dispatch(event),
                Command::Shutdown => break,
            }
        }

        // Handles outlive the task; a stopped controller intercepts nothing.
        self.serving = None;
        self.active_tx.send_replace(None);
        info!("Service worker controller stopped");
    }

    fn register(&mut self, config: ControllerConfig) -> Result<WorkerId, ServiceWorkerError> {
        config.validate()?;

        if let Some(existing) = self
            .state
            .instances()
            .find(|i| i.version == config.version)
        {
            debug!(version = %config.version, worker = existing.id.raw(), "Version already registered");
            return Ok(existing.id);
        }

        let worker = WorkerId::new();
        let event = LifecycleEvent::UpdateFound {
            worker,
            version: config.version.clone(),
            shell_store: config.shell_store_name(),
            runtime_store: config.runtime_store_name(),
            shell_urls: config.shell_urls()?,
        };
        self.configs.insert(worker, config);
        self.dispatch(event);
        Ok(worker)
    }

    /// Run one event and every follow-up it causes, then publish the result.
    fn dispatch(&mut self, event: LifecycleEvent) {
        // Windows that went away without closing still count as open until
        // pruned; settle them before the event sees the client count.
        let mut queue: VecDeque<LifecycleEvent> = self
            .clients
            .prune_closed()
            .into_iter()
            .filter(|c| c.client_type == ClientType::Window)
            .map(|_| LifecycleEvent::ClientClosed)
            .collect();
        queue.push_back(event);

        while let Some(event) = queue.pop_front() {
            if let LifecycleEvent::InstallFailed { worker, reason } = &event {
                if self.state.installing.as_ref().is_some_and(|i| i.id == *worker) {
                    warn!(worker = worker.raw(), reason = %reason, "Install failed");
                    self.emit(ServiceWorkerEvent::InstallFailed {
                        worker: *worker,
                        reason: reason.clone(),
                    });
                }
            }

            let (next, effects) = transition(std::mem::take(&mut self.state), event);
            debug_assert!(next.check_invariants().is_ok());
            self.state = next;

            for effect in effects {
                self.apply(effect, &mut queue);
            }
        }

        self.snapshot_tx
            .send_replace(RegistrationSnapshot::from(&self.state));
    }

    fn apply(&mut self, effect: Effect, queue: &mut VecDeque<LifecycleEvent>) {
        match effect {
            Effect::StateChanged { worker, state } => {
                let version = self
                    .configs
                    .get(&worker)
                    .map(|c| c.version.clone())
                    .unwrap_or_default();
                info!(worker = worker.raw(), version = %version, ?state, "Worker state changed");
                self.emit(ServiceWorkerEvent::StateChange {
                    worker,
                    version,
                    state,
                });

                match state {
                    ServiceWorkerState::Activating => {
                        self.serve(worker);
                        queue.push_back(LifecycleEvent::ActivationFinished { worker });
                    }
                    ServiceWorkerState::Redundant => {
                        self.configs.remove(&worker);
                        if self.serving == Some(worker) {
                            self.serving = None;
                            self.active_tx.send_replace(None);
                        }
                    }
                    _ => {}
                }
            }

            Effect::PopulateShell { worker, store, urls } => {
                let version = self
                    .configs
                    .get(&worker)
                    .map(|c| c.version.clone())
                    .unwrap_or_default();
                self.emit(ServiceWorkerEvent::UpdateFound { worker, version });
                self.install(worker, store, urls);
            }

            Effect::DeleteObsoleteStores { keep } => match self.storage.retain(&keep) {
                Ok(deleted) if !deleted.is_empty() => {
                    info!(deleted = ?deleted, "Deleted obsolete stores");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to sweep obsolete stores"),
            },

            Effect::ClaimClients { worker } => {
                let claimed = self.clients.claim(worker);
                if claimed > 0 {
                    self.emit(ServiceWorkerEvent::ControllerChange { worker, claimed });
                }
            }

            Effect::BroadcastUpdate { version } => {
                let message = ClientBroadcast::update_available(version);
                let controller = self.state.active.as_ref().map(|i| i.id);
                let (_, gone) =
                    self.clients
                        .broadcast(&message, ClientMatchOptions::all_windows(), controller);
                for _ in gone {
                    queue.push_back(LifecycleEvent::ClientClosed);
                }
            }
        }
    }

    /// Publish the serving policy of a newly activating instance.
    fn serve(&mut self, worker: WorkerId) {
        let Some(config) = self.configs.get(&worker) else {
            return;
        };
        match ServingPolicy::new(config, self.storage.clone(), self.fetcher.clone()) {
            Ok(policy) => {
                self.serving = Some(worker);
                self.active_tx.send_replace(Some(Arc::new(policy)));
            }
            Err(e) => error!(worker = worker.raw(), error = %e, "Failed to build serving policy"),
        }
    }

    /// Populate the shell in the background and report back.
    fn install(&self, worker: WorkerId, store: String, urls: Vec<Url>) {
        let fetcher = self.fetcher.clone();
        let storage = self.storage.clone();
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let event = match populate_shell(fetcher.as_ref(), &storage, &store, urls).await {
                Ok(count) => {
                    info!(worker = worker.raw(), store = %store, count, "Shell populated");
                    LifecycleEvent::InstallSucceeded { worker }
                }
                Err(e) => LifecycleEvent::InstallFailed {
                    worker,
                    reason: e.to_string(),
                },
            };
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Lifecycle(event));
            }
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.events.send(event);
    }
}

/// Fetch every shell URL, then store them in one transaction. Nothing is
/// written unless every fetch succeeded.
async fn populate_shell(
    fetcher: &dyn Fetcher,
    storage: &CacheStorage,
    store: &str,
    urls: Vec<Url>,
) -> Result<usize, ServiceWorkerError> {
    let mut entries = Vec::with_capacity(urls.len());
    for url in urls {
        let key = CacheKey::get(&url);
        let response = fetcher.fetch(Request::get(url)).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::InstallFailed(format!(
                "{} returned {}",
                key.url, response.status
            )));
        }
        entries.push(CacheEntry::from_response(&key, response));
    }
    storage.put_all(store, &entries)?;
    Ok(entries.len())
}

/// Handle to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<RegistrationSnapshot>,
    active: watch::Receiver<Option<Arc<ServingPolicy>>>,
}

impl ControllerHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ServiceWorkerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| ServiceWorkerError::Shutdown)?;
        rx.await.map_err(|_| ServiceWorkerError::Shutdown)
    }

    /// Register a release. Returns the instance installing (or already
    /// holding) that version. Installation finishes in the background.
    pub async fn register(&self, config: ControllerConfig) -> Result<WorkerId, ServiceWorkerError> {
        self.request(|reply| Command::Register {
            config: Box::new(config),
            reply,
        })
        .await?
    }

    /// Deliver a raw page message, e.g. `{"type":"SKIP_WAITING"}`.
    pub async fn post_message(&self, raw: &str) -> Result<(), ServiceWorkerError> {
        let command = ClientCommand::parse(raw)?;
        self.request(|reply| Command::Message { command, reply })
            .await
    }

    /// Ask the waiting instance to activate now.
    pub async fn skip_waiting(&self) -> Result<(), ServiceWorkerError> {
        self.request(|reply| Command::Message {
            command: ClientCommand::SkipWaiting,
            reply,
        })
        .await
    }

    /// Open a client. Its receiver gets every update broadcast.
    pub async fn open_client(
        &self,
        url: Url,
        client_type: ClientType,
    ) -> Result<(ClientId, mpsc::UnboundedReceiver<ClientBroadcast>), ServiceWorkerError> {
        self.request(|reply| Command::OpenClient {
            url,
            client_type,
            reply,
        })
        .await
    }

    /// Close a client. Returns false if it was not open.
    pub async fn close_client(&self, id: ClientId) -> Result<bool, ServiceWorkerError> {
        self.request(|reply| Command::CloseClient { id, reply })
            .await
    }

    /// Answer a request through the active instance. `None` when nothing is
    /// active or the request is not intercepted.
    pub async fn handle_fetch(&self, request: Request) -> Option<FetchResponse> {
        let policy = self.active.borrow().clone();
        match policy {
            Some(policy) => policy.respond(request).await,
            None => None,
        }
    }

    /// Current registration state.
    pub fn status(&self) -> RegistrationSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Wait until the registration satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&RegistrationSnapshot) -> bool,
    ) -> Result<RegistrationSnapshot, ServiceWorkerError> {
        let mut snapshot = self.snapshot.clone();
        let current = snapshot
            .wait_for(predicate)
            .await
            .map_err(|_| ServiceWorkerError::Shutdown)?;
        Ok(current.clone())
    }

    /// Delete every store generation. Returns how many were deleted.
    pub async fn clear_caches(&self) -> Result<usize, ServiceWorkerError> {
        self.request(|reply| Command::ClearCaches { reply }).await?
    }

    /// Retire every instance. Stores are left in place.
    pub async fn unregister(&self) -> Result<(), ServiceWorkerError> {
        self.request(|reply| Command::Unregister { reply }).await
    }

    /// Stop the controller task.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use ecomap_net::{NetError, Response};
    use http::{HeaderMap, StatusCode};
    use std::time::Duration;

    /// Serves every URL with 200, except paths listed in `missing`.
    struct Origin {
        missing: Vec<&'static str>,
    }

    #[async_trait]
    impl Fetcher for Origin {
        async fn fetch(&self, request: Request) -> Result<Response, NetError> {
            let status = if self.missing.contains(&request.url.path()) {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::OK
            };
            let body = Bytes::from(request.url.to_string());
            Ok(Response::new(request.url, status, HeaderMap::new(), body))
        }
    }

    fn config(version: &str) -> ControllerConfig {
        ControllerConfig {
            origin: Url::parse("https://ecomap.test/").unwrap(),
            version: version.to_string(),
            ..Default::default()
        }
    }

    fn spawn(
        missing: Vec<&'static str>,
    ) -> (
        ControllerHandle,
        mpsc::UnboundedReceiver<ServiceWorkerEvent>,
        CacheStorage,
    ) {
        let storage = CacheStorage::in_memory().unwrap();
        let (handle, events) =
            ServiceWorkerController::spawn(storage.clone(), Arc::new(Origin { missing }));
        (handle, events, storage)
    }

    async fn wait(
        handle: &ControllerHandle,
        predicate: impl FnMut(&RegistrationSnapshot) -> bool,
    ) -> RegistrationSnapshot {
        tokio::time::timeout(Duration::from_secs(5), handle.wait_for(predicate))
            .await
            .expect("timed out")
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_installs_and_activates() {
        let (handle, mut events, storage) = spawn(vec![]);

        let worker = handle.register(config("1")).await.unwrap();
        let snapshot = wait(&handle, |s| s.is_activated("1")).await;

        assert_eq!(snapshot.active.unwrap().id, worker);
        assert_eq!(storage.entry_keys("ecomap-shell-1").unwrap().len(), 5);

        assert_eq!(
            events.recv().await.unwrap(),
            ServiceWorkerEvent::StateChange {
                worker,
                version: "1".to_string(),
                state: ServiceWorkerState::Installing,
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ServiceWorkerEvent::UpdateFound {
                worker,
                version: "1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_register_same_version_returns_existing() {
        let (handle, _events, _) = spawn(vec![]);

        let first = handle.register(config("1")).await.unwrap();
        let second = handle.register(config("1")).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (handle, _events, _) = spawn(vec![]);
        let mut bad = config("1");
        bad.version = String::new();

        assert!(matches!(
            handle.register(bad).await,
            Err(ServiceWorkerError::Config(_))
        ));
        assert_eq!(handle.status(), RegistrationSnapshot::default());
    }

    #[tokio::test]
    async fn test_install_failure_reports_and_stores_nothing() {
        let (handle, mut events, storage) = spawn(vec!["/icon-512.svg"]);

        let worker = handle.register(config("1")).await.unwrap();
        loop {
            match events.recv().await.unwrap() {
                ServiceWorkerEvent::InstallFailed { worker: failed, reason } => {
                    assert_eq!(failed, worker);
                    assert!(reason.contains("404"));
                    break;
                }
                _ => continue,
            }
        }

        let snapshot = wait(&handle, |s| s.installing.is_none()).await;
        assert!(snapshot.active.is_none());
        assert!(storage.keys().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_interception_without_active_instance() {
        let (handle, _events, _) = spawn(vec![]);
        let request = Request::parse("https://ecomap.test/assets/app.js").unwrap();
        assert!(handle.handle_fetch(request).await.is_none());
    }

    #[tokio::test]
    async fn test_post_message_rejects_unknown_messages() {
        let (handle, _events, _) = spawn(vec![]);

        assert!(handle.post_message(r#"{"type":"SKIP_WAITING"}"#).await.is_ok());
        assert!(handle.post_message(r#"{"type":"RELOAD"}"#).await.is_err());
        assert!(handle.post_message("not json").await.is_err());
    }

    #[tokio::test]
    async fn test_unregister_stops_interception() {
        let (handle, _events, _) = spawn(vec![]);
        handle.register(config("1")).await.unwrap();
        wait(&handle, |s| s.is_activated("1")).await;

        handle.unregister().await.unwrap();

        assert!(handle.status().active.is_none());
        let request = Request::parse("https://ecomap.test/assets/app.js").unwrap();
        assert!(handle.handle_fetch(request).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (handle, _events, _) = spawn(vec![]);
        handle.shutdown();

        let result = handle.register(config("1")).await;
        assert!(matches!(result, Err(ServiceWorkerError::Shutdown)));
    }

    #[tokio::test]
    async fn test_stopped_controller_stops_intercepting() {
        let (handle, _events, _) = spawn(vec![]);
        handle.register(config("1")).await.unwrap();
        wait(&handle, |s| s.is_activated("1")).await;
        let request = Request::parse("https://ecomap.test/assets/app.js").unwrap();
        assert!(handle.handle_fetch(request.clone()).await.is_some());

        handle.shutdown();
        // Fails once the task has exited and dropped its snapshot sender.
        let stopped = tokio::time::timeout(Duration::from_secs(5), handle.wait_for(|_| false))
            .await
            .expect("timed out");
        assert!(matches!(stopped, Err(ServiceWorkerError::Shutdown)));

        assert!(handle.handle_fetch(request).await.is_none());
    }
}
