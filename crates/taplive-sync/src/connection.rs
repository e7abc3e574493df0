//! Connection manager for the push channel
//!
//! One manager owns at most one underlying connection. Callers receive
//! reference-counted [`ConnectionHandle`]s; the connection is torn down when
//! the last handle is released. Subjects are subscribed through
//! [`Subscription`] guards, also reference counted, so the wire-level
//! unsubscribe is only sent when the last view of a subject goes away.
//!
//! A background driver task owns the actual transport. It reconnects with a
//! capped exponential backoff, re-subscribes every routed subject after each
//! successful connect, and settles disconnected once the attempt budget is
//! spent. A settled connection starts over when a new handle is requested.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use taplive_core::{
    parse_frame, ClientMessage, LiveError, LiveEvent, ReconnectPolicy, Result, SubjectId,
};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{Connector, Transport};

/// Per-subject event buffer. Slow views skip ahead rather than block the driver.
const EVENT_BUFFER: usize = 256;

/// Lifecycle of the underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum LinkStatus {
    /// First connection attempt in progress
    Connecting,
    /// Session open, subjects subscribed
    Connected,
    /// Waiting before reconnect attempt `attempt`
    Reconnecting { attempt: u32 },
    /// Attempt budget exhausted; the next `connect` starts a fresh budget
    Settled,
    /// Released by its last handle
    Closed,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

struct Route {
    refs: usize,
    sender: broadcast::Sender<LiveEvent>,
}

type Routes = HashMap<SubjectId, Route>;

/// One underlying connection and its driver
struct Link {
    id: u64,
    routes: Arc<Mutex<Routes>>,
    commands: mpsc::UnboundedSender<ClientMessage>,
    status: Arc<watch::Sender<LinkStatus>>,
    retry: Arc<Notify>,
    cancel: CancellationToken,
}

impl Link {
    /// Wake a settled driver. No-op in any other state.
    fn revive(&self) -> bool {
        let revived = self.status.send_if_modified(|status| {
            if *status != LinkStatus::Settled {
                return false;
            }
            *status = LinkStatus::Connecting;
            true
        });
        if revived {
            self.retry.notify_one();
        }
        revived
    }
}

struct Active {
    link: Arc<Link>,
    refs: usize,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    active: Option<Active>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the single shared push connection
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    registry: Arc<Mutex<Registry>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Open the connection, or join the one already open.
    ///
    /// Must be called from within a tokio runtime. Fails only when no
    /// credential is available; transport problems are reported through
    /// [`ConnectionHandle::status`].
    pub fn connect(&self, auth_token: Option<&str>) -> Result<ConnectionHandle> {
        let token = auth_token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(LiveError::MissingCredential)?;

        let mut registry = lock(&self.registry);
        if let Some(active) = registry.active.as_mut() {
            active.refs += 1;
            if active.link.revive() {
                info!("Retrying settled push connection {}", active.link.id);
            }
            debug!(
                "Reusing push connection {} ({} handles)",
                active.link.id, active.refs
            );
            return Ok(ConnectionHandle {
                link: Arc::clone(&active.link),
                registry: Arc::clone(&self.registry),
            });
        }

        registry.next_id += 1;
        let link = spawn_link(
            registry.next_id,
            Arc::clone(&self.connector),
            token.to_string(),
            self.policy.clone(),
        );
        info!("Opening push connection {}", link.id);
        registry.active = Some(Active {
            link: Arc::clone(&link),
            refs: 1,
        });

        Ok(ConnectionHandle {
            link,
            registry: Arc::clone(&self.registry),
        })
    }

    /// Start receiving events for `subject`
    pub fn subscribe(&self, handle: &ConnectionHandle, subject: SubjectId) -> Subscription {
        let link = &handle.link;
        let sender = {
            let mut routes = lock(&link.routes);
            let route = routes.entry(subject).or_insert_with(|| Route {
                refs: 0,
                sender: broadcast::channel(EVENT_BUFFER).0,
            });
            route.refs += 1;
            if route.refs == 1 {
                // Ignored when the driver is gone; reconnects resubscribe from the routes
                let _ = link
                    .commands
                    .send(ClientMessage::Subscribe { event_id: subject });
            }
            route.sender.clone()
        };
        debug!("Subscribed to event {} on connection {}", subject, link.id);

        Subscription {
            subject,
            sender,
            routes: Arc::clone(&link.routes),
            commands: link.commands.clone(),
        }
    }

    /// Stop receiving events for the subscription's subject
    pub fn unsubscribe(&self, _handle: &ConnectionHandle, subscription: Subscription) {
        drop(subscription);
    }

    /// Release a handle. The connection closes with the last one.
    pub fn disconnect(&self, handle: ConnectionHandle) {
        drop(handle);
    }

    /// Number of live handles on the current connection
    pub fn handle_count(&self) -> usize {
        lock(&self.registry)
            .active
            .as_ref()
            .map(|active| active.refs)
            .unwrap_or(0)
    }

    /// Whether an underlying connection is held open
    pub fn has_connection(&self) -> bool {
        lock(&self.registry).active.is_some()
    }
}

/// Shared use of the underlying connection
pub struct ConnectionHandle {
    link: Arc<Link>,
    registry: Arc<Mutex<Registry>>,
}

impl ConnectionHandle {
    /// Identifier of the underlying connection
    pub fn id(&self) -> u64 {
        self.link.id
    }

    pub fn status(&self) -> LinkStatus {
        *self.link.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Watch status changes
    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.link.status.subscribe()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        let mut registry = lock(&self.registry);
        let release = match registry.active.as_mut() {
            Some(active) if active.link.id == self.link.id => {
                active.refs = active.refs.saturating_sub(1);
                active.refs == 0
            }
            _ => false,
        };
        if release {
            registry.active = None;
            self.link.cancel.cancel();
            info!("Released push connection {}", self.link.id);
        }
    }
}

/// Guard for one view's interest in one subject
pub struct Subscription {
    subject: SubjectId,
    sender: broadcast::Sender<LiveEvent>,
    routes: Arc<Mutex<Routes>>,
    commands: mpsc::UnboundedSender<ClientMessage>,
}

impl Subscription {
    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    /// New receiver for this subject's events. Closes when the subject is
    /// no longer routed.
    pub fn events(&self) -> broadcast::Receiver<LiveEvent> {
        self.sender.subscribe()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut routes = lock(&self.routes);
        let last = match routes.get_mut(&self.subject) {
            Some(route) => {
                route.refs = route.refs.saturating_sub(1);
                route.refs == 0
            }
            None => false,
        };
        if last {
            routes.remove(&self.subject);
            let _ = self.commands.send(ClientMessage::Unsubscribe {
                event_id: self.subject,
            });
            debug!("Unsubscribed from event {}", self.subject);
        }
    }
}

fn spawn_link(
    id: u64,
    connector: Arc<dyn Connector>,
    token: String,
    policy: ReconnectPolicy,
) -> Arc<Link> {
    let routes = Arc::new(Mutex::new(Routes::new()));
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let status = Arc::new(watch::channel(LinkStatus::Connecting).0);
    let retry = Arc::new(Notify::new());
    let cancel = CancellationToken::new();

    let driver = Driver {
        id,
        connector,
        token,
        policy,
        routes: Arc::clone(&routes),
        commands: commands_rx,
        status: Arc::clone(&status),
        retry: Arc::clone(&retry),
        cancel: cancel.clone(),
    };
    tokio::spawn(driver.run());

    Arc::new(Link {
        id,
        routes,
        commands: commands_tx,
        status,
        retry,
        cancel,
    })
}

enum Step {
    Command(Option<ClientMessage>),
    Frame(Option<Result<String>>),
    Shutdown,
}

/// Background task owning the transport
struct Driver {
    id: u64,
    connector: Arc<dyn Connector>,
    token: String,
    policy: ReconnectPolicy,
    routes: Arc<Mutex<Routes>>,
    commands: mpsc::UnboundedReceiver<ClientMessage>,
    status: Arc<watch::Sender<LinkStatus>>,
    retry: Arc<Notify>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        let mut failures: u32 = 0;

        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect(&self.token) => result,
            };

            match attempt {
                Ok(mut transport) => {
                    if self.resubscribe(transport.as_mut()).await {
                        self.status.send_replace(LinkStatus::Connected);
                        failures = 0;
                        info!("Push connection {} established", self.id);
                        self.run_session(transport.as_mut()).await;
                    }
                    if self.cancel.is_cancelled() {
                        transport.close().await;
                        break;
                    }
                    warn!("Push connection {} lost", self.id);
                }
                Err(e) => {
                    warn!("Push connection {} attempt failed: {}", self.id, e);
                }
            }

            failures += 1;
            if failures > self.policy.max_attempts {
                warn!(
                    "Push connection {} giving up after {} attempts",
                    self.id, self.policy.max_attempts
                );
                self.status.send_replace(LinkStatus::Settled);
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.retry.notified() => {}
                }
                info!("Push connection {} starting a new attempt budget", self.id);
                failures = 0;
                continue;
            }

            self.status
                .send_replace(LinkStatus::Reconnecting { attempt: failures });
            let delay = self.policy.delay_for(failures);
            debug!(
                "Push connection {} reconnecting in {:?} (attempt {}/{})",
                self.id, delay, failures, self.policy.max_attempts
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.status.send_replace(LinkStatus::Closed);
        debug!("Push connection {} driver stopped", self.id);
    }

    /// Subscribe every routed subject on a fresh session
    async fn resubscribe(&mut self, transport: &mut dyn Transport) -> bool {
        // Queued commands predate this session; the route table is authoritative.
        // Route changes queue their command under this lock, so none slips between.
        let subjects: Vec<SubjectId> = {
            let routes = lock(&self.routes);
            while self.commands.try_recv().is_ok() {}
            routes.keys().copied().collect()
        };
        for subject in subjects {
            if let Err(e) = transport
                .send(&ClientMessage::Subscribe { event_id: subject })
                .await
            {
                warn!("Resubscribe to event {} failed: {}", subject, e);
                return false;
            }
        }
        true
    }

    async fn run_session(&mut self, transport: &mut dyn Transport) {
        loop {
            let step = tokio::select! {
                _ = self.cancel.cancelled() => Step::Shutdown,
                command = self.commands.recv() => Step::Command(command),
                frame = transport.recv() => Step::Frame(frame),
            };

            match step {
                Step::Shutdown | Step::Command(None) => return,
                Step::Command(Some(message)) => {
                    if let Err(e) = transport.send(&message).await {
                        warn!("Push connection {} send failed: {}", self.id, e);
                        return;
                    }
                }
                Step::Frame(Some(Ok(text))) => self.dispatch(&text),
                Step::Frame(Some(Err(e))) => {
                    warn!("Push connection {} read failed: {}", self.id, e);
                    return;
                }
                Step::Frame(None) => {
                    debug!("Push connection {} closed by server", self.id);
                    return;
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Dropping frame on connection {}: {}", self.id, e);
                return;
            }
        };

        let routes = lock(&self.routes);
        match routes.get(&frame.event_id) {
            // No receivers is not an error: the view may be between renders
            Some(route) => {
                let _ = route.sender.send(frame.event);
            }
            None => debug!("No subscriber for event {}", frame.event_id),
        }
    }
}
