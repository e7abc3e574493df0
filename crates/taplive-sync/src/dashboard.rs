//! Lifecycle binder
//!
//! [`LiveDashboard::start`] mounts one dashboard: it joins the shared push
//! connection, subscribes the subject, spawns the store actor and starts both
//! pollers. [`LiveDashboard::stop`] undoes that in reverse. The actor is the
//! only task that mutates the dashboard's [`LiveStore`]; pollers and the push
//! channel feed it through channels, and every change is published as a
//! composed [`DashboardView`] on a `watch` channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taplive_core::{
    BarId, LiveConfig, LiveError, LiveEvent, RankedList, Result, Snapshot, SubjectId,
};
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::composer::{compose, DashboardView};
use crate::connection::{ConnectionHandle, ConnectionManager, LinkStatus, Subscription};
use crate::fetcher::{HttpSnapshotSource, SnapshotFetcher};
use crate::reducer::Reduction;
use crate::store::{DashboardMode, LiveStore};
use crate::transport::WsConnector;

/// Everything shared by the dashboards of one process
#[derive(Clone)]
pub struct SyncContext {
    connections: Arc<ConnectionManager>,
    fetcher: SnapshotFetcher,
    auth_token: Option<String>,
    config: LiveConfig,
    credential_reported: Arc<AtomicBool>,
}

impl SyncContext {
    pub fn new(
        connections: Arc<ConnectionManager>,
        fetcher: SnapshotFetcher,
        auth_token: Option<String>,
        config: LiveConfig,
    ) -> Self {
        Self {
            connections,
            fetcher,
            auth_token,
            config,
            credential_reported: Arc::new(AtomicBool::new(false)),
        }
    }

    /// WebSocket push channel and HTTP read models, as configured
    pub fn from_config(config: LiveConfig) -> Result<Self> {
        config.validate()?;
        let auth_token = config.auth_token();
        let connector = WsConnector::new(config.backend.ws_url.clone());
        let source = HttpSnapshotSource::new(config.backend.api_base_url.clone(), auth_token.clone())?;

        Ok(Self::new(
            Arc::new(ConnectionManager::new(
                Arc::new(connector),
                config.reconnect.clone(),
            )),
            SnapshotFetcher::new(Arc::new(source)),
            auth_token,
            config,
        ))
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn fetcher(&self) -> &SnapshotFetcher {
        &self.fetcher
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    /// Mount a dashboard for `subject`
    pub fn mount(&self, subject: SubjectId) -> LiveDashboard {
        LiveDashboard::start(subject, self)
    }
}

/// Input to the store actor
#[derive(Debug)]
enum Inbox {
    Totals(Result<Snapshot>),
    TopProducts(Result<RankedList>),
    Names(HashMap<BarId, String>),
}

/// One mounted dashboard
pub struct LiveDashboard {
    subject: SubjectId,
    view: watch::Receiver<DashboardView>,
    inbox: mpsc::UnboundedSender<Inbox>,
    subscription: Option<Subscription>,
    connection: Option<ConnectionHandle>,
    cancel: CancellationToken,
    pollers: Vec<JoinHandle<()>>,
    actor: Option<JoinHandle<()>>,
}

impl LiveDashboard {
    /// Connect (or join the open connection), subscribe, then start polling.
    ///
    /// Without a credential the dashboard runs pull-only. Must be called from
    /// within a tokio runtime.
    pub fn start(subject: SubjectId, context: &SyncContext) -> Self {
        let config = &context.config;
        let limit = config.refresh.top_products_limit;

        let mut store = LiveStore::new(subject, &config.feeds);
        store.seed(
            context.fetcher.cached_totals(subject),
            context.fetcher.cached_top_products(subject, limit),
        );
        store.subscribe();

        let (connection, subscription) =
            match context.connections.connect(context.auth_token.as_deref()) {
                Ok(handle) => {
                    let subscription = context.connections.subscribe(&handle, subject);
                    (Some(handle), Some(subscription))
                }
                Err(LiveError::MissingCredential) => {
                    if !context.credential_reported.swap(true, Ordering::Relaxed) {
                        warn!(
                            "No credential in ${}; dashboards run pull-only",
                            config.backend.token_env
                        );
                    }
                    debug!("Dashboard for event {} is pull-only", subject);
                    (None, None)
                }
                Err(e) => {
                    warn!("Push channel unavailable for event {}: {}", subject, e);
                    (None, None)
                }
            };

        store.set_mode(if connection.is_some() {
            DashboardMode::Live
        } else {
            DashboardMode::PullOnly
        });
        let status = connection.as_ref().map(ConnectionHandle::watch_status);
        if let Some(status) = &status {
            store.set_connected(status.borrow().is_connected());
        }

        let (view_tx, view_rx) = watch::channel(compose(&store));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let revalidate_totals = Arc::new(Notify::new());
        let revalidate_top = Arc::new(Notify::new());

        let actor = StoreActor {
            store,
            inbox: inbox_rx,
            events: subscription.as_ref().map(Subscription::events),
            status,
            view: view_tx,
            revalidate: [Arc::clone(&revalidate_totals), Arc::clone(&revalidate_top)],
            cancel: cancel.clone(),
        };
        let actor = tokio::spawn(actor.run());

        let pollers = vec![
            spawn_poller(
                Query::Totals,
                subject,
                config.refresh.totals_interval(),
                context.fetcher.clone(),
                revalidate_totals,
                inbox_tx.clone(),
                cancel.clone(),
            ),
            spawn_poller(
                Query::TopProducts { limit },
                subject,
                config.refresh.top_products_interval(),
                context.fetcher.clone(),
                revalidate_top,
                inbox_tx.clone(),
                cancel.clone(),
            ),
        ];

        info!(
            "Mounted dashboard for event {} ({})",
            subject,
            if connection.is_some() { "live" } else { "pull-only" }
        );

        Self {
            subject,
            view: view_rx,
            inbox: inbox_tx,
            subscription,
            connection,
            cancel,
            pollers,
            actor: Some(actor),
        }
    }

    /// Unsubscribe, stop polling and release the connection.
    ///
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        let Some(actor) = self.actor.take() else {
            return;
        };

        drop(self.subscription.take());
        self.cancel.cancel();
        for poller in self.pollers.drain(..) {
            if let Err(e) = poller.await {
                warn!("Poller for event {} ended abnormally: {}", self.subject, e);
            }
        }
        drop(self.connection.take());
        if let Err(e) = actor.await {
            warn!("Store actor for event {} ended abnormally: {}", self.subject, e);
        }
        info!("Unmounted dashboard for event {}", self.subject);
    }

    pub fn subject(&self) -> SubjectId {
        self.subject
    }

    /// Receiver for composed view changes
    pub fn view(&self) -> watch::Receiver<DashboardView> {
        self.view.clone()
    }

    /// Latest composed view
    pub fn current(&self) -> DashboardView {
        self.view.borrow().clone()
    }

    /// Replace the bar name table. Ignored once stopped.
    pub fn update_names(&self, names: HashMap<BarId, String>) {
        if self.inbox.send(Inbox::Names(names)).is_err() {
            debug!("Dashboard for event {} is stopped; names ignored", self.subject);
        }
    }

    pub fn is_running(&self) -> bool {
        self.actor.is_some()
    }
}

impl Drop for LiveDashboard {
    fn drop(&mut self) {
        if self.actor.is_some() {
            self.subscription.take();
            self.cancel.cancel();
            self.connection.take();
            debug!("Dashboard for event {} dropped without stop", self.subject);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Query {
    Totals,
    TopProducts { limit: usize },
}

impl Query {
    async fn run(self, fetcher: &SnapshotFetcher, subject: SubjectId) -> Inbox {
        match self {
            Self::Totals => Inbox::Totals(fetcher.fetch_totals(subject).await),
            Self::TopProducts { limit } => {
                Inbox::TopProducts(fetcher.fetch_top_products(subject, limit).await)
            }
        }
    }
}

/// Fetch on mount, then every `interval` or when nudged
fn spawn_poller(
    query: Query,
    subject: SubjectId,
    interval: Duration,
    fetcher: SnapshotFetcher,
    revalidate: Arc<Notify>,
    inbox: mpsc::UnboundedSender<Inbox>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = query.run(&fetcher, subject) => result,
            };

            if inbox.send(result).is_err() {
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = revalidate.notified() => {
                    debug!("Early {:?} revalidation for event {}", query, subject);
                }
            }
        }
    })
}

enum Step {
    Stop,
    Inbox(Option<Inbox>),
    Event(Option<std::result::Result<LiveEvent, broadcast::error::RecvError>>),
    Status(Option<LinkStatus>),
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<LiveEvent>>,
) -> Option<std::result::Result<LiveEvent, broadcast::error::RecvError>> {
    match events {
        Some(rx) => Some(rx.recv().await),
        None => std::future::pending().await,
    }
}

async fn next_status(status: &mut Option<watch::Receiver<LinkStatus>>) -> Option<LinkStatus> {
    match status {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

/// Sole owner of one dashboard's store
struct StoreActor {
    store: LiveStore,
    inbox: mpsc::UnboundedReceiver<Inbox>,
    events: Option<broadcast::Receiver<LiveEvent>>,
    status: Option<watch::Receiver<LinkStatus>>,
    view: watch::Sender<DashboardView>,
    revalidate: [Arc<Notify>; 2],
    cancel: CancellationToken,
}

impl StoreActor {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Stop,
                message = self.inbox.recv() => Step::Inbox(message),
                event = next_event(&mut self.events) => Step::Event(event),
                status = next_status(&mut self.status) => Step::Status(status),
            };

            match step {
                Step::Stop | Step::Inbox(None) => break,
                Step::Inbox(Some(message)) => self.receive(message),
                Step::Event(Some(Ok(event))) => {
                    if self.store.apply_event(event) == Reduction::Revalidate {
                        for notify in &self.revalidate {
                            notify.notify_one();
                        }
                    }
                }
                Step::Event(Some(Err(broadcast::error::RecvError::Lagged(skipped)))) => {
                    warn!(
                        "Dashboard for event {} fell behind; {} events skipped",
                        self.store.subject(),
                        skipped
                    );
                }
                Step::Event(_) => self.events = None,
                Step::Status(Some(status)) => self.store.set_connected(status.is_connected()),
                Step::Status(None) => {
                    if let Some(rx) = self.status.take() {
                        let last = *rx.borrow();
                        self.store.set_connected(last.is_connected());
                    }
                }
            }
            self.publish();
        }

        self.store.unsubscribe();
        self.publish();
    }

    fn receive(&mut self, message: Inbox) {
        let subject = self.store.subject();
        match message {
            Inbox::Totals(Ok(snapshot)) => {
                self.store.accept_snapshot(snapshot);
            }
            Inbox::Totals(Err(e)) => {
                warn!("Totals fetch for event {} failed: {}", subject, e);
                self.store.totals_failed(&e);
            }
            Inbox::TopProducts(Ok(list)) => {
                self.store.accept_top_products(list);
            }
            Inbox::TopProducts(Err(e)) => {
                warn!("Top products fetch for event {} failed: {}", subject, e);
                self.store.top_products_failed(&e);
            }
            Inbox::Names(names) => self.store.update_names(names),
        }
    }

    fn publish(&self) {
        let next = compose(&self.store);
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
