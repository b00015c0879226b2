//! Authoritative world state, owned by the tick driver.
//!
//! Nothing outside the tick driver touches a [`World`]. Sessions reach it
//! through [`SessionEvent`]s drained at the top of every tick; deferred
//! processes reach it through their handlers.

use crate::config::ServerConfig;
use crate::entity::{EntityArena, EntityHandle, EntityId, InstanceToken};
use crate::error::ServerError;
use crate::network::{Intent, SessionEvent};
use crate::physics::{Vector2, WorldBounds};
use crate::process::{ProcessId, ProcessQueue, ProcessSpec};
use crate::session::{Login, SessionId};
use crate::session_registry::SessionRegistry;
use crate::time_system::game_time_bucket;
use chrono::NaiveDateTime;
use log::{debug, error, info, warn};
use realm_shared::Packet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

pub const PLAYER_SPEED: f32 = 200.0;
pub const MONSTER_SPEED: f32 = 120.0;
pub const PLAYER_MAX_HEALTH: f32 = 100.0;
/// Chasers stop this close to their target.
pub const FOLLOW_DISTANCE: f32 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Player,
    Npc,
    Monster,
    DroppedItem,
    ScriptedEvent,
}

#[derive(Debug)]
pub struct WorldEntity {
    pub id: EntityId,
    pub token: InstanceToken,
    pub kind: EntityKind,
    pub name: String,
    pub position: Vector2,
    pub velocity: Vector2,
    pub speed: f32,
    pub health: f32,
    pub max_health: f32,
    pub regen_per_sec: f32,
    pub expires_at: Option<Instant>,
    pub session: Option<SessionId>,
    /// Entity this one moves toward, if any.
    pub target: Option<EntityHandle>,
}

impl WorldEntity {
    fn new(id: EntityId, token: InstanceToken, kind: EntityKind, name: String, position: Vector2) -> Self {
        let (speed, max_health, regen_per_sec) = match kind {
            EntityKind::Player => (PLAYER_SPEED, PLAYER_MAX_HEALTH, 1.0),
            EntityKind::Monster => (MONSTER_SPEED, 50.0, 0.5),
            EntityKind::Npc => (0.0, 100.0, 0.0),
            EntityKind::DroppedItem | EntityKind::ScriptedEvent => (0.0, 1.0, 0.0),
        };
        Self {
            id,
            token,
            kind,
            name,
            position,
            velocity: Vector2::ZERO,
            speed,
            health: max_health,
            max_health,
            regen_per_sec,
            expires_at: None,
            session: None,
            target: None,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// What one entity pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EntityUpdate {
    pub moved: usize,
    pub expired: usize,
}

pub struct World {
    tick: u64,
    entities: EntityArena<WorldEntity>,
    processes: ProcessQueue,
    game_time: u8,
    players: HashMap<SessionId, EntityHandle>,
    registry: Arc<SessionRegistry>,
    bounds: WorldBounds,
    shutdown: CancellationToken,
}

impl World {
    /// Builds an empty world. Fails on unusable world dimensions.
    pub fn initialize(
        config: &ServerConfig,
        registry: Arc<SessionRegistry>,
        shutdown: CancellationToken,
        now: NaiveDateTime,
    ) -> Result<Self, ServerError> {
        let bounds = WorldBounds::new(config.world_width, config.world_height).ok_or_else(|| {
            ServerError::WorldInit(format!(
                "invalid world dimensions {}x{}",
                config.world_width, config.world_height
            ))
        })?;

        let game_time = game_time_bucket(&now);
        info!(
            "World initialized: {}x{}, game time bucket {}",
            bounds.width, bounds.height, game_time
        );

        Ok(Self {
            tick: 0,
            entities: EntityArena::new(),
            processes: ProcessQueue::new(),
            game_time,
            players: HashMap::new(),
            registry,
            bounds,
            shutdown,
        })
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub(crate) fn advance_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn bounds(&self) -> WorldBounds {
        self.bounds
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn processes(&self) -> &ProcessQueue {
        &self.processes
    }

    pub fn processes_mut(&mut self) -> &mut ProcessQueue {
        &mut self.processes
    }

    pub fn enqueue(&mut self, spec: ProcessSpec) -> ProcessId {
        self.processes.enqueue(spec, Instant::now())
    }

    pub fn cancel_process(&mut self, id: ProcessId) -> bool {
        self.processes.cancel(id)
    }

    pub fn entity(&self, id: EntityId) -> Option<&WorldEntity> {
        self.entities.get(id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut WorldEntity> {
        self.entities.get_mut(id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn entities(&self) -> &EntityArena<WorldEntity> {
        &self.entities
    }

    pub fn entities_mut(&mut self) -> &mut EntityArena<WorldEntity> {
        &mut self.entities
    }

    /// Places a new entity, clamped into the world.
    pub fn spawn(&mut self, kind: EntityKind, name: impl Into<String>, position: Vector2) -> EntityId {
        let name = name.into();
        let position = self.bounds.clamp(position);
        let id = self
            .entities
            .insert_with(|id, token| WorldEntity::new(id, token, kind, name, position));
        debug!("Spawned {:?} {} at ({}, {})", kind, id, position.x, position.y);
        id
    }

    /// Spawns an entity that removes itself once `lifetime` has passed.
    pub fn spawn_expiring(
        &mut self,
        kind: EntityKind,
        name: impl Into<String>,
        position: Vector2,
        lifetime: Duration,
        now: Instant,
    ) -> EntityId {
        let id = self.spawn(kind, name, position);
        if let Some(entity) = self.entities.get_mut(id) {
            entity.expires_at = Some(now + lifetime);
        }
        id
    }

    /// Destroys an entity. Handles other entities hold on it go stale.
    pub fn despawn(&mut self, id: EntityId) -> Option<WorldEntity> {
        let mut entity = self.entities.remove(id)?;

        if let Some(mut target) = entity.target.take() {
            if let Err(e) = target.unbind(&mut self.entities) {
                error!("Entity {} failed to drop its target handle: {}", id, e);
            }
        }

        if let Some(session_id) = entity.session {
            if let Some(mut handle) = self.players.remove(&session_id) {
                if let Err(e) = handle.unbind(&mut self.entities) {
                    error!("Session {} player handle release failed: {}", session_id, e);
                }
            }
        }

        debug!("Despawned {:?} {}", entity.kind, id);
        Some(entity)
    }

    /// Points `id` at `target`. Any previous target is released.
    pub fn set_target(&mut self, id: EntityId, target: EntityId) -> bool {
        if !self.entities.contains(id) {
            return false;
        }
        let Some(handle) = EntityHandle::bind(&mut self.entities, target) else {
            return false;
        };
        let previous = self
            .entities
            .get_mut(id)
            .and_then(|entity| entity.target.replace(handle));
        if let Some(mut previous) = previous {
            if let Err(e) = previous.unbind(&mut self.entities) {
                error!("Entity {} failed to drop previous target: {}", id, e);
            }
        }
        true
    }

    pub fn player_entity(&self, session_id: SessionId) -> Option<EntityId> {
        let handle = self.players.get(&session_id)?;
        handle.is_valid(&self.entities).then(|| handle.entity_id())
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// Spawns the player's character and greets the session.
    pub fn player_joined(&mut self, session_id: SessionId, login: Login) -> Option<EntityId> {
        if let Some(existing) = self.player_entity(session_id) {
            warn!(
                "Session {} joined twice, keeping entity {}",
                session_id, existing
            );
            return Some(existing);
        }

        let id = self.spawn(EntityKind::Player, login.character_name.clone(), self.bounds.center());
        if let Some(entity) = self.entities.get_mut(id) {
            entity.session = Some(session_id);
        }
        let handle = EntityHandle::bind(&mut self.entities, id)?;
        self.players.insert(session_id, handle);

        info!(
            "{} ({}) entered the world as entity {} on session {}",
            login.character_name, login.account, id, session_id
        );

        self.registry.send_to(
            session_id,
            Packet::Welcome {
                session_id,
                entity_id: id.0,
                character_name: login.character_name,
            },
        );
        self.registry.send_to(
            session_id,
            Packet::GameTime {
                bucket: self.game_time,
            },
        );
        Some(id)
    }

    pub fn player_left(&mut self, session_id: SessionId) {
        let Some(mut handle) = self.players.remove(&session_id) else {
            return;
        };
        let id = handle.entity_id();
        if let Err(e) = handle.unbind(&mut self.entities) {
            error!("Session {} player handle release failed: {}", session_id, e);
        }
        self.despawn(id);
        info!("Session {} left, entity {} removed", session_id, id);
    }

    pub fn apply_intent(&mut self, session_id: SessionId, intent: Intent) {
        let Some(handle) = self.players.get_mut(&session_id) else {
            debug!("Intent from session {} without a player, ignoring", session_id);
            return;
        };
        let Some(player) = handle.resolve(&mut self.entities) else {
            warn!("Session {} player handle went stale", session_id);
            self.players.remove(&session_id);
            return;
        };

        match intent {
            Intent::Move { dx, dy } => {
                let direction = Vector2::new(dx, dy);
                if !direction.is_finite() {
                    warn!("Session {} sent non-finite movement", session_id);
                    return;
                }
                player.velocity = direction.normalize().scale(player.speed);
            }
            Intent::Chat { text } => {
                let from = player.name.clone();
                self.registry.broadcast(&Packet::ChatRelay { from, text });
            }
        }
    }

    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Joined { session_id, login } => {
                self.player_joined(session_id, login);
            }
            SessionEvent::Intent { session_id, intent } => self.apply_intent(session_id, intent),
            SessionEvent::Left { session_id } => self.player_left(session_id),
        }
    }

    /// Moves, heals and expires entities, then publishes positions that
    /// changed.
    pub fn update_entities(&mut self, dt: f32, now: Instant) -> EntityUpdate {
        self.steer_followers();

        let bounds = self.bounds;
        let mut moved = Vec::new();
        let mut expired = Vec::new();

        for entity in self.entities.iter_mut() {
            if entity.is_expired(now) {
                expired.push(entity.id);
                continue;
            }

            if entity.velocity != Vector2::ZERO {
                let next = bounds.clamp(entity.position.add(&entity.velocity.scale(dt)));
                if next != entity.position {
                    entity.position = next;
                    moved.push((entity.id, next));
                }
            }

            if entity.health < entity.max_health && entity.regen_per_sec > 0.0 {
                entity.health = (entity.health + entity.regen_per_sec * dt).min(entity.max_health);
            }
        }

        for id in &expired {
            self.despawn(*id);
        }

        for (id, position) in &moved {
            self.registry.broadcast(&Packet::EntityState {
                entity_id: id.0,
                x: position.x,
                y: position.y,
            });
        }

        EntityUpdate {
            moved: moved.len(),
            expired: expired.len(),
        }
    }

    // Followers resolve their target handle and head for it. A stale
    // target is dropped and the follower stops.
    fn steer_followers(&mut self) {
        for id in self.entities.ids() {
            let Some(mut target) = self.entities.get_mut(id).and_then(|e| e.target.take()) else {
                continue;
            };
            let goal = target.resolve(&mut self.entities).map(|t| t.position);

            let Some(entity) = self.entities.get_mut(id) else {
                if let Err(e) = target.unbind(&mut self.entities) {
                    error!("Entity {} failed to drop its target handle: {}", id, e);
                }
                continue;
            };
            match goal {
                Some(goal) => {
                    let offset = goal.sub(&entity.position);
                    entity.velocity = if offset.magnitude() <= FOLLOW_DISTANCE {
                        Vector2::ZERO
                    } else {
                        offset.normalize().scale(entity.speed)
                    };
                    entity.target = Some(target);
                }
                None => {
                    debug!("Entity {} lost target {}", id, target.entity_id());
                    entity.velocity = Vector2::ZERO;
                }
            }
        }
    }

    pub fn broadcast_notice(&self, text: &str) -> usize {
        self.registry.broadcast(&Packet::Notice {
            text: text.to_string(),
        })
    }

    pub fn game_time(&self) -> u8 {
        self.game_time
    }

    pub fn set_game_time(&mut self, bucket: u8) {
        self.game_time = bucket;
        self.registry.broadcast(&Packet::GameTime { bucket });
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
