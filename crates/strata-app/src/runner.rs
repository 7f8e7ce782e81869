//! The three ways to run a world: offline, hosting, or joined to a host.
//!
//! Every mode drives the same fixed-step loop: the walker moves the focus,
//! network events are drained, the store (or session) is ticked, and every
//! so often a torch is dropped at the focus so entity ids get exercised.
//! The loop ends on the tick limit, on interrupt, or when the user aborts
//! after a corrupt chunk. Unsaved chunks are persisted on the way out.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use glam::Vec2;
use strata_config::{Config, ConfigError};
use strata_multiplayer::session::{StoreParts, hello, welcome_from};
use strata_multiplayer::{ClientSession, HostSession, IdAssigner, SessionError, SessionSettings};
use strata_net::{
    ClientConfig, GameServer, NetEvent, PeerId, ReconnectError, SendError, ServerConfig,
    Transport, Welcome, drain_events, event_channel, reconnect, reconnect_policy,
};
use strata_world::{
    ChunkFiles, ChunkSerializer, ChunkStore, EntityInstance, EntityRegistry, EntityState,
    FileProvider, LayeredTerrain, PoolError, ProviderError, RetryPolicy, StoreContext,
    StoreSettings, TerrainGenerator, TickOutcome, Torch, WorkerPool, WorldGeometry, world_dir,
};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::collab::{CountingPhysics, StdinUi};
use crate::game_loop::GameLoop;
use crate::walker::FocusWalker;

/// Events handled per simulation step.
const EVENTS_PER_STEP: usize = 256;
const EVENT_CAPACITY: usize = 4096;

/// Height of the walked row as a fraction of the world height.
const WALK_ROW: f32 = 0.6;
const WALK_CHUNKS_PER_SECOND: f32 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("worker pool: {0}")]
    Pool(#[from] PoolError),
    #[error("world storage: {0}")]
    Storage(#[from] ProviderError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Connect(#[from] ReconnectError),
    #[error("sending to host: {0}")]
    Send(#[from] SendError),
    #[error("network: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Stop after this many simulation steps.
    pub ticks: Option<u64>,
    /// Set from the Ctrl-C handler.
    pub stop: Arc<AtomicBool>,
    /// Drop a torch every this many steps. 0 never does.
    pub torch_every: u64,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ticks: None,
            stop: Arc::new(AtomicBool::new(false)),
            torch_every: 600,
        }
    }
}

impl RunOptions {
    fn places_torch(&self, step: u64) -> bool {
        self.torch_every > 0 && step % self.torch_every == 0
    }

    /// The same options with `done` steps already spent.
    fn after(&self, done: u64) -> Self {
        Self {
            ticks: self.ticks.map(|limit| limit.saturating_sub(done)),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    TickLimit,
    Interrupted,
    /// The user chose to abort after a corrupt chunk.
    Aborted,
    /// The host connection dropped. A join run rejoins instead of stopping.
    HostLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub steps: u64,
    pub reason: StopReason,
    /// Torches created by this process.
    pub spawned: u64,
    /// Entities in the window when the run ended.
    pub entities: usize,
}

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

/// Local pieces every mode builds its store from.
struct Local {
    geometry: WorldGeometry,
    seed: u64,
    pool: Arc<WorkerPool>,
    generator: Arc<dyn TerrainGenerator>,
    retry: RetryPolicy,
    store_settings: StoreSettings,
    config: Config,
}

impl Local {
    fn new(config: &Config) -> Result<Self, AppError> {
        config.validate()?;
        let pool = WorkerPool::with_threads(config.streaming.worker_threads)?;
        Ok(Self {
            geometry: WorldGeometry::from_config(&config.world),
            seed: config.world.seed,
            pool: Arc::new(pool),
            generator: Arc::new(LayeredTerrain::default()),
            retry: RetryPolicy::from_config(&config.streaming),
            store_settings: StoreSettings::from_config(&config.streaming),
            config: config.clone(),
        })
    }

    fn open_files(&self) -> Result<Arc<ChunkFiles>, AppError> {
        let serializer =
            ChunkSerializer::new(self.geometry, Arc::new(EntityRegistry::with_builtins()));
        let dir = world_dir(&self.config.world.save_root(), self.seed);
        Ok(Arc::new(ChunkFiles::open(dir, serializer)?))
    }

    fn walker(&self, geometry: WorldGeometry) -> FocusWalker {
        FocusWalker::eastward(geometry, WALK_ROW, WALK_CHUNKS_PER_SECOND)
    }

    fn parts(&self, focus: Vec2) -> StoreParts<CountingPhysics, StdinUi> {
        StoreParts {
            pool: Arc::clone(&self.pool),
            generator: Arc::clone(&self.generator),
            settings: self.store_settings.clone(),
            physics: CountingPhysics::default(),
            ui: StdinUi::stdin(self.config.streaming.on_corrupt_chunk),
            focus,
        }
    }

    fn session_settings(&self, name: &str) -> SessionSettings {
        SessionSettings::from_config(name, &self.config.network)
    }
}

fn torch() -> Box<dyn EntityState> {
    Box::new(Torch { lit: true })
}

/// Runs the fixed-step loop until `step` breaks, the tick limit is hit or
/// the stop flag is raised. Returns the steps run.
fn drive(
    options: &RunOptions,
    walker: &mut FocusWalker,
    mut step: impl FnMut(u64, Vec2, Instant) -> ControlFlow<StopReason>,
) -> (u64, StopReason) {
    if options.ticks == Some(0) {
        return (0, StopReason::TickLimit);
    }
    let mut game = GameLoop::new(Instant::now());
    let mut steps = 0u64;
    let mut reason = None;
    loop {
        if reason.is_none() && options.stop.load(Ordering::Relaxed) {
            reason = Some(StopReason::Interrupted);
        }
        if let Some(reason) = reason {
            return (steps, reason);
        }

        let now = Instant::now();
        let _ = game.advance(now, |dt, _| {
            let focus = walker.advance(dt);
            steps += 1;
            if let ControlFlow::Break(why) = step(steps, focus, now) {
                reason = Some(why);
                return ControlFlow::Break(());
            }
            if options.ticks.is_some_and(|limit| steps >= limit) {
                reason = Some(StopReason::TickLimit);
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        if reason.is_none() {
            std::thread::sleep(game.until_next_step());
        }
    }
}

// ---------------------------------------------------------------------------
// Offline
// ---------------------------------------------------------------------------

/// Single player straight from the world directory.
pub fn run_offline(config: &Config, options: &RunOptions) -> Result<RunSummary, AppError> {
    let local = Local::new(config)?;
    let files = local.open_files()?;
    let ids = IdAssigner::new(files.load_meta()?.unwrap_or(IdAssigner::FIRST_ID));
    info!(dir = %files.dir().display(), current_id = ids.current(), "opening world offline");

    let provider = FileProvider::new(
        Arc::clone(&files),
        Arc::clone(&local.pool),
        local.retry.clone(),
        local.seed,
    )
    .with_generator(Arc::clone(&local.generator));
    let mut walker = local.walker(local.geometry);
    let parts = local.parts(walker.position());
    let context = StoreContext {
        geometry: local.geometry,
        settings: parts.settings,
        seed: local.seed,
        provider: Arc::new(provider),
        pool: parts.pool,
        generator: parts.generator,
    };
    let mut store = ChunkStore::new(context, parts.physics, parts.ui, parts.focus);

    let mut spawned = 0;
    let (steps, reason) = drive(options, &mut walker, |step, focus, now| {
        match store.tick(focus, now) {
            TickOutcome::Aborted => return ControlFlow::Break(StopReason::Aborted),
            TickOutcome::Simulate if options.places_torch(step) => {
                let entity = EntityInstance::new(ids.allocate(), focus, torch());
                match store.insert_entity(entity) {
                    Ok(coord) => {
                        spawned += 1;
                        debug!(%coord, "torch placed");
                    }
                    Err(entity) => debug!(id = %entity.object_id, "no chunk for torch"),
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    });

    let entities = store.entities().count();
    store.shutdown(local.session_settings("offline").shutdown_timeout);
    files.save_meta(ids.current())?;
    info!(steps, ?reason, current_id = ids.current(), "offline run finished");
    Ok(RunSummary {
        steps,
        reason,
        spawned,
        entities,
    })
}

// ---------------------------------------------------------------------------
// Host
// ---------------------------------------------------------------------------

/// Plays while serving the world to clients.
pub fn run_host(
    runtime: &Runtime,
    config: &Config,
    options: &RunOptions,
) -> Result<RunSummary, AppError> {
    let local = Local::new(config)?;
    let files = local.open_files()?;

    let server_config = ServerConfig::from_config(&config.network);
    let listener = runtime.block_on(tokio::net::TcpListener::bind(&server_config.bind_addr))?;
    let (events_tx, mut events) = event_channel(EVENT_CAPACITY);
    let server = Arc::new(GameServer::new(server_config, events_tx));
    let accept = {
        let server = Arc::clone(&server);
        runtime.spawn(async move { server.run_with_listener(listener).await })
    };
    let transport: Arc<dyn Transport> = Arc::new(server.handle());

    let mut walker = local.walker(local.geometry);
    let mut session = HostSession::new(
        files,
        local.seed,
        local.retry.clone(),
        local.parts(walker.position()),
        transport,
        local.session_settings("host"),
    )?;

    let mut spawned = 0;
    let (steps, reason) = drive(options, &mut walker, |step, focus, now| {
        for event in drain_events(&mut events, EVENTS_PER_STEP) {
            session.handle_event(event, now);
        }
        match session.tick(focus, now) {
            TickOutcome::Aborted => return ControlFlow::Break(StopReason::Aborted),
            TickOutcome::Simulate if options.places_torch(step) => {
                match session.spawn(torch(), focus) {
                    Ok(id) => {
                        spawned += 1;
                        debug!(%id, "torch placed");
                    }
                    Err(e) => debug!(error = %e, "torch not placed"),
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    });

    let entities = session.store().entities().count();
    let saved = session.shutdown();
    server.shutdown();
    match runtime.block_on(accept) {
        Ok(Err(e)) => warn!(error = %e, "accept loop failed"),
        Err(e) => warn!(error = %e, "accept task panicked"),
        Ok(Ok(())) => {}
    }
    saved?;
    info!(steps, ?reason, peers = session.peers().len(), "host run finished");
    Ok(RunSummary {
        steps,
        reason,
        spawned,
        entities,
    })
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

/// Joins a host, rejoining with backoff whenever the connection drops.
pub fn run_join(
    runtime: &Runtime,
    config: &Config,
    options: &RunOptions,
) -> Result<RunSummary, AppError> {
    let local = Local::new(config)?;
    let client_config = ClientConfig::from_config(&config.network);
    let settings = local.session_settings(&format!("player-{}", std::process::id()));
    let welcome_timeout = Duration::from_secs(u64::from(config.network.timeout_seconds.max(1)));

    let mut walker: Option<FocusWalker> = None;
    let mut total = RunSummary {
        steps: 0,
        reason: StopReason::TickLimit,
        spawned: 0,
        entities: 0,
    };
    loop {
        let (events_tx, mut events) = event_channel(EVENT_CAPACITY);
        let client = runtime.block_on(reconnect(&client_config, &reconnect_policy(), events_tx))?;
        let transport: Arc<dyn Transport> = Arc::new(client.handle());
        transport.send(PeerId::HOST, hello(&settings.name))?;
        let (welcome, backlog) =
            runtime.block_on(await_welcome(&mut events, welcome_timeout))?;

        let walker =
            walker.get_or_insert_with(|| local.walker(welcome.world.geometry()));
        let mut session = ClientSession::new(
            welcome,
            local.parts(walker.position()),
            transport,
            settings.clone(),
        );
        for event in backlog {
            session.handle_event(event);
        }

        let mut spawned = 0;
        let (steps, reason) = drive(&options.after(total.steps), walker, |step, focus, now| {
            for event in drain_events(&mut events, EVENTS_PER_STEP) {
                session.handle_event(event);
            }
            if !session.is_active() {
                return ControlFlow::Break(StopReason::HostLost);
            }
            match session.tick(focus, now) {
                TickOutcome::Aborted => return ControlFlow::Break(StopReason::Aborted),
                TickOutcome::Simulate if options.places_torch(step) => {
                    match session.spawn(torch(), focus) {
                        Ok(id) => {
                            spawned += 1;
                            debug!(%id, "torch placed");
                        }
                        Err(e) => debug!(error = %e, "torch not placed"),
                    }
                }
                _ => {}
            }
            ControlFlow::Continue(())
        });
        total.steps += steps;
        total.spawned += spawned;
        total.reason = reason;
        total.entities = session.store().entities().count();

        if reason == StopReason::HostLost {
            warn!(steps = total.steps, "lost the host, rejoining");
            drop(session);
            runtime.block_on(client.close());
            continue;
        }
        session.shutdown();
        runtime.block_on(client.close());
        info!(steps = total.steps, ?reason, "join run finished");
        return Ok(total);
    }
}

/// Waits for the host's welcome, keeping whatever arrives before it.
async fn await_welcome(
    events: &mut mpsc::Receiver<NetEvent>,
    timeout: Duration,
) -> Result<(Welcome, Vec<NetEvent>), SessionError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut backlog = Vec::new();
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(SessionError::Rejected("connection closed".to_string())),
            Err(_) => return Err(SessionError::WelcomeTimeout(timeout)),
        };
        match welcome_from(event.clone())? {
            Some(welcome) => return Ok((welcome, backlog)),
            None => backlog.push(event),
        }
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
