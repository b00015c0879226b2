//! Server lifecycle: wiring the listener, the tick driver and the session
//! tasks together, and tearing them down again.

use crate::config::ServerConfig;
use crate::error::{ProcessError, ServerError};
use crate::network::{run_accept_loop, NetworkContext};
use crate::process::{Process, ProcessHandlers, ProcessKind};
use crate::scheduler::Scheduler;
use crate::session::HandoffInfo;
use crate::session_registry::{HandoffSweeper, NetworkStats, SessionRegistry};
use crate::time_system::{TimeSubscriber, TimeSystem};
use crate::world::World;
use chrono::NaiveDateTime;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct Running {
    local_addr: SocketAddr,
    network_cancel: CancellationToken,
    tick_cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    tick_task: JoinHandle<Scheduler>,
    tasks: TaskTracker,
}

/// The whole server. `start` and `stop` may each be called any number of
/// times; only state changes do any work.
pub struct GameServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    // Parked here while stopped, owned by the tick driver while running.
    handlers: Option<ProcessHandlers>,
    time: Option<TimeSystem>,
    shutdown: CancellationToken,
    running: Option<Running>,
}

impl GameServer {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.max_sessions,
            config.handoff_timeout,
        ));
        let time = swept_time_system(&registry, chrono::Local::now().naive_local());

        Self {
            config,
            registry,
            handlers: Some(ProcessHandlers::with_core_handlers()),
            time: Some(time),
            shutdown: CancellationToken::new(),
            running: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Installs a process handler. Only possible while stopped.
    pub fn register_handler<F>(&mut self, kind: ProcessKind, handler: F) -> bool
    where
        F: FnMut(&mut World, &Process) -> Result<(), ProcessError> + Send + 'static,
    {
        match self.handlers.as_mut() {
            Some(handlers) => {
                handlers.register(kind, handler);
                true
            }
            None => {
                warn!("Cannot register a {:?} handler while running", kind);
                false
            }
        }
    }

    /// Adds a calendar subscriber. Only possible while stopped.
    pub fn subscribe_time(&mut self, subscriber: Box<dyn TimeSubscriber>) -> bool {
        match self.time.as_mut() {
            Some(time) => {
                time.subscribe(subscriber);
                true
            }
            None => {
                warn!("Cannot add a time subscriber while running");
                false
            }
        }
    }

    /// Binds the listener, builds the world and starts ticking.
    ///
    /// Returns the bound address. Nothing is left running if any step
    /// fails.
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        if let Some(running) = &self.running {
            return Ok(running.local_addr);
        }
        self.config.validate()?;

        let addr = self.config.bind_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        let now = chrono::Local::now().naive_local();
        let world = match World::initialize(
            &self.config,
            Arc::clone(&self.registry),
            self.shutdown.clone(),
            now,
        ) {
            Ok(world) => world,
            Err(e) => {
                error!("Start aborted, releasing {}: {}", local_addr, e);
                drop(listener);
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handlers = self.handlers.take().unwrap_or_default();
        // Lost with a tick task that panicked; start over with the sweeper.
        let time = self
            .time
            .take()
            .unwrap_or_else(|| swept_time_system(&self.registry, now));
        let scheduler = Scheduler::new(
            world,
            handlers,
            time,
            events_rx,
            self.config.tick_interval,
            self.config.stats_interval_ticks,
        );

        let tasks = TaskTracker::new();
        let ctx = NetworkContext::new(
            Arc::clone(&self.registry),
            events_tx,
            self.config.trusted_center,
            tasks.clone(),
        );

        let tick_cancel = CancellationToken::new();
        let network_cancel = CancellationToken::new();
        let tick_task = tokio::spawn(scheduler.run(tick_cancel.clone()));
        let accept_task = tokio::spawn(run_accept_loop(listener, ctx, network_cancel.clone()));

        info!("Server listening on {}", local_addr);
        self.running = Some(Running {
            local_addr,
            network_cancel,
            tick_cancel,
            accept_task,
            tick_task,
            tasks,
        });
        Ok(local_addr)
    }

    /// Disconnects every session, halts the tick and releases the network,
    /// in that order. Returns the final world, or `None` if the server was
    /// not running.
    pub async fn stop(&mut self) -> Result<Option<World>, ServerError> {
        let Some(running) = self.running.take() else {
            return Ok(None);
        };
        info!("Stopping server on {}", running.local_addr);

        let disconnected = self.registry.disconnect_all();
        info!("Disconnected {} sessions", disconnected);

        running.tick_cancel.cancel();
        let joined = running.tick_task.await;

        running.network_cancel.cancel();
        if let Err(e) = running.accept_task.await {
            error!("Accept task ended abnormally: {}", e);
        }
        running.tasks.close();
        running.tasks.wait().await;
        // Anything that slipped in between the steps above.
        self.registry.disconnect_all();

        let (world, handlers, time) = joined?.into_parts();
        self.handlers = Some(handlers);
        self.time = Some(time);
        info!("Server stopped");
        Ok(Some(world))
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Fires when a deferred process asks the server to shut down.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Deposits login credentials from an in-process center link.
    pub fn add_handoff_info(
        &self,
        login_id: u32,
        account: impl Into<String>,
        character_name: impl Into<String>,
        auth_token: Vec<u8>,
    ) {
        self.registry.add_handoff_info(
            login_id,
            HandoffInfo::new(account.into(), character_name.into(), auth_token),
        );
    }

    pub fn stats(&self) -> NetworkStats {
        self.registry.stats()
    }
}

fn swept_time_system(registry: &Arc<SessionRegistry>, now: NaiveDateTime) -> TimeSystem {
    let mut time = TimeSystem::new(now);
    time.subscribe(Box::new(HandoffSweeper::new(Arc::clone(registry))));
    time
}

impl Drop for GameServer {
    fn drop(&mut self) {
        if let Some(running) = &self.running {
            running.tick_cancel.cancel();
            running.network_cancel.cancel();
        }
    }
}
