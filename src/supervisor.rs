//! Bot supervisor: keeps one running session per active messenger credential.
//!
//! Each pass queries the store for active Telegram messengers and starts a
//! session for every one that is not tracked yet. Tracked sessions are never
//! torn down because their messenger was disabled or its token rotated; only
//! sessions whose transport died on their own are pruned so the next pass can
//! restart them.

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::messaging::TelegramAdapter;
use crate::session::{BotSession, SessionDeps};
use crate::store::{ConversationStore, Messenger, MessengerId, MessengerKind};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// A long-lived session the supervisor starts and stops.
#[async_trait]
pub trait ManagedSession: Send + Sync {
    /// Connect and begin handling events. On error the session is discarded.
    async fn initialize(&mut self) -> Result<()>;

    /// Stop accepting events, drain in-flight work, and disconnect. Must be
    /// safe to call whether or not `initialize` succeeded.
    async fn shutdown(&mut self) -> Result<()>;

    /// Whether the session is still receiving events.
    fn is_running(&self) -> bool;
}

/// Builds sessions for messengers.
pub trait SessionFactory: Send + Sync {
    fn create(&self, messenger: &Messenger) -> Box<dyn ManagedSession>;
}

/// Production factory: a Telegram transport plus the shared pipeline deps.
pub struct TelegramSessionFactory {
    deps: SessionDeps,
}

impl TelegramSessionFactory {
    pub fn new(deps: SessionDeps) -> Self {
        Self { deps }
    }
}

impl SessionFactory for TelegramSessionFactory {
    fn create(&self, messenger: &Messenger) -> Box<dyn ManagedSession> {
        let transport = Arc::new(TelegramAdapter::new(&messenger.token));
        Box::new(BotSession::new(
            messenger.clone(),
            transport,
            self.deps.clone(),
        ))
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<MessengerId>,
    pub failed: Vec<MessengerId>,
    pub pruned: Vec<MessengerId>,
}

/// Owns every running session, keyed by messenger id.
pub struct Supervisor {
    store: Arc<dyn ConversationStore>,
    factory: Box<dyn SessionFactory>,
    sessions: HashMap<MessengerId, Box<dyn ManagedSession>>,
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        factory: Box<dyn SessionFactory>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            store,
            factory,
            sessions: HashMap::new(),
            config,
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_tracked(&self, messenger_id: MessengerId) -> bool {
        self.sessions.contains_key(&messenger_id)
    }

    /// One pass: prune dead sessions, then start sessions for untracked
    /// active messengers. Store errors are returned for the caller to back off.
    pub async fn reconcile(&mut self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        self.prune_dead(&mut report).await;

        let messengers = self.store.active_messengers(MessengerKind::Telegram).await?;

        for messenger in messengers {
            if self.sessions.contains_key(&messenger.id) {
                continue;
            }

            tracing::info!(
                messenger_id = messenger.id,
                dashboard = %messenger.dashboard_name,
                token_prefix = %format_args!("{}...", messenger.token_prefix()),
                "starting bot session"
            );

            let mut session = self.factory.create(&messenger);
            match session.initialize().await {
                Ok(()) => {
                    self.sessions.insert(messenger.id, session);
                    report.started.push(messenger.id);
                }
                Err(error) => {
                    tracing::error!(
                        messenger_id = messenger.id,
                        dashboard = %messenger.dashboard_name,
                        %error,
                        "failed to start bot session, will retry next pass"
                    );
                    if let Err(error) = session.shutdown().await {
                        tracing::debug!(messenger_id = messenger.id, %error, "cleanup after failed start");
                    }
                    report.failed.push(messenger.id);
                }
            }
        }

        Ok(report)
    }

    async fn prune_dead(&mut self, report: &mut ReconcileReport) {
        let dead: Vec<MessengerId> = self
            .sessions
            .iter()
            .filter(|(_, session)| !session.is_running())
            .map(|(id, _)| *id)
            .collect();

        for messenger_id in dead {
            let Some(mut session) = self.sessions.remove(&messenger_id) else {
                continue;
            };
            tracing::warn!(messenger_id, "bot session stopped receiving, restarting next pass");
            if let Err(error) = session.shutdown().await {
                tracing::warn!(messenger_id, %error, "failed to shut down dead session");
            }
            report.pruned.push(messenger_id);
        }
    }

    /// Reconcile until `shutdown` flips to true, then stop every session.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_secs = self.config.poll_interval_secs,
            "supervisor started"
        );

        while !*shutdown.borrow() {
            let delay = match self.reconcile().await {
                Ok(report) => {
                    if !report.started.is_empty() || !report.failed.is_empty() || !report.pruned.is_empty() {
                        tracing::info!(
                            started = report.started.len(),
                            failed = report.failed.len(),
                            pruned = report.pruned.len(),
                            running = self.sessions.len(),
                            "reconciliation pass complete"
                        );
                    }
                    self.config.poll_interval()
                }
                Err(error) => {
                    tracing::error!(
                        %error,
                        backoff_secs = self.config.error_backoff_secs,
                        "failed to load messengers, backing off"
                    );
                    self.config.error_backoff()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tracing::warn!("shutdown sender dropped, stopping supervisor");
                        break;
                    }
                }
            }
        }

        self.shutdown_all().await;
    }

    /// Stop every tracked session. One session failing to stop does not
    /// prevent the others from stopping.
    pub async fn shutdown_all(&mut self) {
        let sessions: Vec<(MessengerId, Box<dyn ManagedSession>)> = self.sessions.drain().collect();
        tracing::info!(count = sessions.len(), "shutting down bot sessions");

        let results = futures::future::join_all(sessions.into_iter().map(
            |(messenger_id, mut session)| async move {
                (messenger_id, session.shutdown().await)
            },
        ))
        .await;

        for (messenger_id, result) in results {
            if let Err(error) = result {
                tracing::error!(messenger_id, %error, "bot session failed to shut down cleanly");
            }
        }
        tracing::info!("all bot sessions stopped");
    }
}
