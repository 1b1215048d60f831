//! World graph and streaming.
//!
//! Worlds are identified by the relative path of their description file and
//! resolved through a [`WorldRegistry`] rooted at a content directory. Worlds
//! hold neighbor identifiers, never references; the registry is the only
//! owner. A [`StreamingContext`] tracks the active world, the interior
//! navigation stack, and the arena nest, and carries out every transition:
//! edge crossings, structure entry/exit, and arena fights.
//!
//! The streaming rule is one edge deep in both directions: activating a
//! world pre-loads its left and right neighbors so a crossing never waits on
//! the filesystem, and anything no longer reachable is saved and evicted.

use driftlands_core::{
    Entity, EntityId, EntityKind, MobKind, Player, Position, StructureKind, Tick, TradeTable,
    Weather, World, WorldConfig, WorldError, WorldStyle, hlines,
};
use driftlands_storage as storage;
use rand::rngs::SmallRng;
use roxmltree::{Document, Node};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Distance from a world edge within which a crossing becomes eligible.
#[must_use]
pub fn edge_threshold() -> f32 {
    hlines(15.0)
}

/// Width of generated arena worlds, in columns.
const ARENA_WIDTH: u32 = 800;

/// Errors raised while loading descriptions or resolving the world graph.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("cannot read world description {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed world description {}: {source}", path.display())]
    Xml {
        path: PathBuf,
        #[source]
        source: roxmltree::Error,
    },
    #[error("world description {}: {message}", path.display())]
    Description { path: PathBuf, message: String },
    #[error(transparent)]
    World(#[from] WorldError),
    #[error(transparent)]
    Storage(#[from] storage::StorageError),
    #[error("world `{0}` is not streamed in")]
    NotResident(String),
}

/// Result of a transition attempt: the world to be active afterwards and
/// where the player stands in it. A zero spawn on the current world is the
/// "no transition" sentinel.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldSwitch {
    pub world: String,
    pub spawn: Position,
}

impl WorldSwitch {
    /// The no-op sentinel: stay in `current` at the zero vector.
    #[must_use]
    pub fn stay(current: &str) -> Self {
        Self {
            world: current.to_string(),
            spawn: Position::default(),
        }
    }

    /// Whether this switch is the no-op sentinel for `current`.
    #[must_use]
    pub fn is_stay(&self, current: &str) -> bool {
        self.world == current && self.spawn == Position::default()
    }
}

/// Owner of every streamed-in world, keyed by description path.
pub struct WorldRegistry {
    root: PathBuf,
    config: WorldConfig,
    rng: SmallRng,
    worlds: HashMap<String, World>,
}

impl WorldRegistry {
    /// Create a registry rooted at the world-description directory.
    pub fn new(root: impl Into<PathBuf>, config: WorldConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let rng = config.seeded_rng();
        Ok(Self {
            root: root.into(),
            config,
            rng,
            worlds: HashMap::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Shared simulation RNG, also used by the tick loop.
    #[must_use]
    pub fn rng_mut(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.worlds.contains_key(id)
    }

    /// Number of resident worlds.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.worlds.len()
    }

    pub fn get(&self, id: &str) -> Result<&World, StreamError> {
        self.worlds
            .get(id)
            .ok_or_else(|| StreamError::NotResident(id.to_string()))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut World, StreamError> {
        self.worlds
            .get_mut(id)
            .ok_or_else(|| StreamError::NotResident(id.to_string()))
    }

    /// Register a world that has no backing description file (arenas).
    pub fn insert(&mut self, world: World) {
        self.worlds.insert(world.id().to_string(), world);
    }

    /// Arena worlds are synthesized, never saved or reloaded from disk.
    #[must_use]
    pub fn is_transient(id: &str) -> bool {
        id.starts_with("arena:")
    }

    fn description_path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn sidecar_path(&self, id: &str) -> PathBuf {
        let mut raw = self.root.join(id).into_os_string();
        raw.push(".dat");
        PathBuf::from(raw)
    }

    /// Stream a world in from its description file, applying any sidecar
    /// save. Already-resident worlds are left untouched.
    pub fn ensure_loaded(&mut self, id: &str) -> Result<(), StreamError> {
        if self.worlds.contains_key(id) || Self::is_transient(id) {
            return Ok(());
        }
        let path = self.description_path(id);
        let text = fs::read_to_string(&path).map_err(|source| StreamError::Io {
            path: path.clone(),
            source,
        })?;
        let mut world = parse_world(id, &text, &path, &mut self.rng)?;
        storage::load_world_from(&mut world, &self.sidecar_path(id))?;
        info!(world = id, entities = world.entities().len(), "world streamed in");
        self.worlds.insert(id.to_string(), world);
        Ok(())
    }

    /// Write a resident world's sidecar save.
    pub fn save(&self, id: &str) -> Result<(), StreamError> {
        if Self::is_transient(id) {
            return Ok(());
        }
        let world = self.get(id)?;
        storage::save_world_to(world, &self.sidecar_path(id))?;
        Ok(())
    }

    /// Save and drop every file-backed world not named in `keep`.
    fn evict_except(&mut self, keep: &HashSet<String>) -> Result<(), StreamError> {
        let doomed: Vec<String> = self
            .worlds
            .keys()
            .filter(|id| !keep.contains(*id) && !Self::is_transient(id))
            .cloned()
            .collect();
        for id in doomed {
            self.save(&id)?;
            self.worlds.remove(&id);
            debug!(world = %id, "world evicted");
        }
        Ok(())
    }

    /// Drop a transient world without saving.
    fn discard(&mut self, id: &str) {
        self.worlds.remove(id);
    }
}

struct ArenaNest {
    return_world: String,
    return_position: Position,
    arena_id: String,
    foe: EntityId,
}

/// Navigation state owned by the orchestrator: the active world plus the
/// interior and arena stacks. All transition operations live here.
pub struct StreamingContext {
    active: String,
    inside: Vec<String>,
    arena_nest: Vec<ArenaNest>,
    arena_serial: usize,
}

impl StreamingContext {
    /// Boot the context on `start`, streaming it and its neighbors in.
    pub fn new(registry: &mut WorldRegistry, start: &str) -> Result<Self, StreamError> {
        let mut ctx = Self {
            active: start.to_string(),
            inside: Vec::new(),
            arena_nest: Vec::new(),
            arena_serial: 0,
        };
        ctx.activate(registry, start)?;
        Ok(ctx)
    }

    /// Identifier of the active world.
    #[must_use]
    pub fn active(&self) -> &str {
        &self.active
    }

    /// Whether an arena fight is in progress.
    #[must_use]
    pub fn in_battle(&self) -> bool {
        !self.arena_nest.is_empty()
    }

    /// How many interiors deep the player currently is.
    #[must_use]
    pub fn inside_depth(&self) -> usize {
        self.inside.len()
    }

    pub fn active_world<'a>(&self, registry: &'a WorldRegistry) -> Result<&'a World, StreamError> {
        registry.get(&self.active)
    }

    pub fn active_world_mut<'a>(
        &self,
        registry: &'a mut WorldRegistry,
    ) -> Result<&'a mut World, StreamError> {
        registry.get_mut(&self.active)
    }

    /// Make `id` active: save the outgoing world, stream the incomer and its
    /// neighbors in, and evict whatever fell out of reach.
    fn activate(&mut self, registry: &mut WorldRegistry, id: &str) -> Result<(), StreamError> {
        if registry.contains(&self.active) && self.active != id {
            registry.save(&self.active)?;
        }
        registry.ensure_loaded(id)?;

        let neighbors: Vec<String> = {
            let world = registry.get(id)?;
            world
                .to_left()
                .into_iter()
                .chain(world.to_right())
                .map(String::from)
                .collect()
        };
        for neighbor in &neighbors {
            registry.ensure_loaded(neighbor)?;
        }
        self.active = id.to_string();

        let mut keep: HashSet<String> = neighbors.into_iter().collect();
        keep.insert(self.active.clone());
        keep.extend(self.inside.iter().cloned());
        keep.extend(self.arena_nest.iter().map(|n| n.return_world.clone()));
        registry.evict_except(&keep)?;
        Ok(())
    }

    /// Attempt a crossing into the left neighbor. Eligible when a neighbor
    /// exists and the player is inside the edge band; the player is rebased
    /// just inside the neighbor's right edge, standing on local terrain.
    pub fn go_world_left(
        &mut self,
        registry: &mut WorldRegistry,
        player: &mut Player,
    ) -> Result<WorldSwitch, StreamError> {
        let (neighbor, eligible) = {
            let world = self.active_world(registry)?;
            let band = world.terrain().world_start() + edge_threshold();
            (
                world.to_left().map(String::from),
                player.data.position.x < band,
            )
        };
        let Some(neighbor) = neighbor.filter(|_| eligible) else {
            return Ok(WorldSwitch::stay(&self.active));
        };

        self.activate(registry, &neighbor)?;
        let spawn = {
            let world = registry.get(&neighbor)?;
            let x = -world.terrain().world_start() - hlines(10.0) - player.data.width;
            let column = world.terrain().column_index(x, player.data.width);
            Position::new(x, world.terrain().ground_height(column))
        };
        player.data.position = spawn;
        debug!(world = %neighbor, "crossed left");
        Ok(WorldSwitch {
            world: neighbor,
            spawn,
        })
    }

    /// Attempt a crossing into the right neighbor; mirror of
    /// [`Self::go_world_left`].
    pub fn go_world_right(
        &mut self,
        registry: &mut WorldRegistry,
        player: &mut Player,
    ) -> Result<WorldSwitch, StreamError> {
        let (neighbor, eligible) = {
            let world = self.active_world(registry)?;
            let band = -world.terrain().world_start() - edge_threshold();
            (
                world.to_right().map(String::from),
                player.data.position.x + player.data.width > band,
            )
        };
        let Some(neighbor) = neighbor.filter(|_| eligible) else {
            return Ok(WorldSwitch::stay(&self.active));
        };

        self.activate(registry, &neighbor)?;
        let spawn = {
            let world = registry.get(&neighbor)?;
            let x = world.terrain().world_start() + hlines(10.0);
            let column = world.terrain().column_index(x, player.data.width);
            Position::new(x, world.terrain().ground_height(column))
        };
        player.data.position = spawn;
        debug!(world = %neighbor, "crossed right");
        Ok(WorldSwitch {
            world: neighbor,
            spawn,
        })
    }

    /// Move an NPC across the left edge. Unlike the player variant, the
    /// transfer is immediate: the entity leaves the active world's
    /// collections and joins the neighbor's in a single step.
    pub fn transfer_npc_left(
        &mut self,
        registry: &mut WorldRegistry,
        id: EntityId,
    ) -> Result<bool, StreamError> {
        self.transfer_npc(registry, id, Direction::Left)
    }

    /// Move an NPC across the right edge.
    pub fn transfer_npc_right(
        &mut self,
        registry: &mut WorldRegistry,
        id: EntityId,
    ) -> Result<bool, StreamError> {
        self.transfer_npc(registry, id, Direction::Right)
    }

    fn transfer_npc(
        &mut self,
        registry: &mut WorldRegistry,
        id: EntityId,
        direction: Direction,
    ) -> Result<bool, StreamError> {
        let (neighbor, eligible) = {
            let world = self.active_world(registry)?;
            let Some(entity) = world.entities().get(id) else {
                return Ok(false);
            };
            match direction {
                Direction::Left => (
                    world.to_left().map(String::from),
                    entity.data.position.x
                        < world.terrain().world_start() + edge_threshold(),
                ),
                Direction::Right => (
                    world.to_right().map(String::from),
                    entity.data.position.x + entity.data.width
                        > -world.terrain().world_start() - edge_threshold(),
                ),
            }
        };
        let Some(neighbor) = neighbor.filter(|_| eligible) else {
            return Ok(false);
        };
        registry.ensure_loaded(&neighbor)?;

        // Single atomic step: out of one arena, into the other, no
        // intermediate state observable between the two.
        let Some(mut entity) = registry.get_mut(&self.active)?.entities_mut().remove(id) else {
            return Ok(false);
        };
        if let EntityKind::Npc(npc) = &mut entity.kind {
            npc.out_and_about += match direction {
                Direction::Left => -1,
                Direction::Right => 1,
            };
        }
        let destination = registry.get_mut(&neighbor)?;
        entity.data.position.x = match direction {
            Direction::Left => {
                -destination.terrain().world_start() - hlines(10.0) - entity.data.width
            }
            Direction::Right => destination.terrain().world_start() + hlines(10.0),
        };
        destination.entities_mut().insert(entity);
        debug!(world = %neighbor, "npc wandered across");
        Ok(true)
    }

    /// Enter or leave a structure interior.
    ///
    /// Outside: the player's extent must sit fully inside a structure
    /// footprint that names an interior; the current world id is pushed so
    /// the exit knows where to return. Inside: pops back out through the
    /// structure whose recorded interior matches the current world, spawning
    /// centered on it; an unmatched interior is a silent no-op.
    pub fn go_inside_structure(
        &mut self,
        registry: &mut WorldRegistry,
        player: &mut Player,
    ) -> Result<WorldSwitch, StreamError> {
        if self.inside.is_empty() {
            let interior = {
                let world = self.active_world(registry)?;
                let arena = world.entities();
                arena.structures().iter().find_map(|&sid| {
                    let entity = arena.get(sid)?;
                    let EntityKind::Structure(s) = &entity.kind else {
                        return None;
                    };
                    let footprint = entity.data.position.x..entity.data.position.x
                        + entity.data.width;
                    let contained = player.data.position.x > footprint.start
                        && player.data.position.x + player.data.width < footprint.end;
                    contained.then(|| s.interior.clone()).flatten()
                })
            };
            let Some(interior) = interior else {
                return Ok(WorldSwitch::stay(&self.active));
            };

            let origin = self.active.clone();
            self.inside.push(origin);
            self.activate(registry, &interior)?;
            let spawn = {
                let world = registry.get(&interior)?;
                let column = world.terrain().column_index(0.0, player.data.width);
                Position::new(0.0, world.terrain().ground_height(column))
            };
            player.data.position = spawn;
            Ok(WorldSwitch {
                world: interior,
                spawn,
            })
        } else {
            let exterior = match self.inside.last() {
                Some(id) => id.clone(),
                None => return Ok(WorldSwitch::stay(&self.active)),
            };
            registry.ensure_loaded(&exterior)?;
            let spawn = {
                let world = registry.get(&exterior)?;
                let arena = world.entities();
                arena.structures().iter().find_map(|&sid| {
                    let entity = arena.get(sid)?;
                    let EntityKind::Structure(s) = &entity.kind else {
                        return None;
                    };
                    if s.interior.as_deref() != Some(self.active.as_str()) {
                        return None;
                    }
                    // First match wins when two structures share an interior.
                    Some(Position::new(
                        entity.data.position.x + entity.data.width / 2.0,
                        entity.data.position.y,
                    ))
                })
            };
            let Some(spawn) = spawn else {
                return Ok(WorldSwitch::stay(&self.active));
            };

            self.inside.pop();
            self.activate(registry, &exterior)?;
            player.data.position = spawn;
            Ok(WorldSwitch {
                world: exterior,
                spawn,
            })
        }
    }

    /// Begin an arena fight: synthesize an arena world, move the combat mob
    /// into it, and remember where to put the player back afterwards.
    pub fn fight(
        &mut self,
        registry: &mut WorldRegistry,
        player: &mut Player,
        mut foe: Entity,
    ) -> Result<WorldSwitch, StreamError> {
        let arena_id = format!("arena:{}", self.arena_serial);
        self.arena_serial += 1;

        let mut arena = World::generate(arena_id.clone(), ARENA_WIDTH, registry.rng_mut())?;
        arena.set_style(WorldStyle::default());
        arena.add_mob(MobKind::Door, Position::new(100.0, 100.0));
        if let EntityKind::Mob(mob) = &mut foe.kind {
            // Combat pacing is driven externally once the fight starts.
            mob.aggressive = false;
        }
        let foe_id = arena.entities_mut().insert(foe);

        self.arena_nest.push(ArenaNest {
            return_world: self.active.clone(),
            return_position: player.data.position,
            arena_id: arena_id.clone(),
            foe: foe_id,
        });
        registry.insert(arena);
        self.activate(registry, &arena_id)?;

        let spawn = {
            let world = registry.get(&arena_id)?;
            let column = world.terrain().column_index(0.0, player.data.width);
            Position::new(0.0, world.terrain().ground_height(column))
        };
        player.data.position = spawn;
        info!(arena = %arena_id, "arena fight started");
        Ok(WorldSwitch {
            world: arena_id,
            spawn,
        })
    }

    /// Leave the arena. Succeeds only once the designated foe is dead and
    /// the player stands in the door band; pops the nest and restores the
    /// saved world and position.
    pub fn exit_arena(
        &mut self,
        registry: &mut WorldRegistry,
        player: &mut Player,
    ) -> Result<WorldSwitch, StreamError> {
        let Some(nest) = self.arena_nest.last() else {
            return Ok(WorldSwitch::stay(&self.active));
        };

        let cleared = {
            let arena = registry.get(&nest.arena_id)?;
            let foe_dead = arena
                .entities()
                .get(nest.foe)
                .map_or(true, |foe| !foe.data.alive);
            let at_door = arena.entities().mobs().iter().any(|&mid| {
                let Some(mob) = arena.entities().get(mid) else {
                    return false;
                };
                let EntityKind::Mob(data) = &mob.kind else {
                    return false;
                };
                let center = player.data.position.x + player.data.width / 2.0;
                data.kind == MobKind::Door
                    && center > mob.data.position.x
                    && center < mob.data.position.x + hlines(12.0)
            });
            foe_dead && at_door
        };
        if !cleared {
            return Ok(WorldSwitch::stay(&self.active));
        }

        let nest = match self.arena_nest.pop() {
            Some(nest) => nest,
            None => return Ok(WorldSwitch::stay(&self.active)),
        };
        registry.discard(&nest.arena_id);
        self.activate(registry, &nest.return_world)?;
        player.data.position = nest.return_position;
        info!(world = %nest.return_world, "arena fight won");
        Ok(WorldSwitch {
            world: nest.return_world,
            spawn: nest.return_position,
        })
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Left,
    Right,
}

fn attr_f32(node: Node<'_, '_>, name: &str) -> Option<f32> {
    node.attribute(name)?.parse().ok()
}

fn attr_u32(node: Node<'_, '_>, name: &str) -> Option<u32> {
    node.attribute(name)?.parse().ok()
}

fn attr_bool(node: Node<'_, '_>, name: &str) -> Option<bool> {
    match node.attribute(name)? {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

fn mob_kind_for_tag(tag: &str) -> Option<MobKind> {
    match tag {
        "rabbit" => Some(MobKind::Rabbit),
        "bird" => Some(MobKind::Bird),
        "door" => Some(MobKind::Door),
        "page" => Some(MobKind::Page),
        "cat" => Some(MobKind::Cat),
        _ => None,
    }
}

/// Build a [`World`] from a description document.
fn parse_world(
    id: &str,
    text: &str,
    path: &Path,
    rng: &mut SmallRng,
) -> Result<World, StreamError> {
    let doc = Document::parse(text).map_err(|source| StreamError::Xml {
        path: path.to_path_buf(),
        source,
    })?;
    let root = doc.root_element();
    let indoor = match root.tag_name().name() {
        "World" => false,
        "IndoorWorld" => true,
        other => {
            return Err(StreamError::Description {
                path: path.to_path_buf(),
                message: format!("unknown root tag `{other}`"),
            })
        }
    };
    let fail = |message: String| StreamError::Description {
        path: path.to_path_buf(),
        message,
    };

    // Terrain comes first; everything else lands on top of it.
    let width = root
        .children()
        .filter(Node::is_element)
        .find_map(|node| match node.tag_name().name() {
            "floor" if indoor => attr_u32(node, "width"),
            "generation" => {
                (indoor || node.attribute("type") == Some("Random"))
                    .then(|| attr_u32(node, "width"))
                    .flatten()
            }
            _ => None,
        })
        .ok_or_else(|| fail("no usable generation/floor width".to_string()))?;
    let mut world = if indoor {
        World::indoor(id, width)?
    } else {
        World::generate(id, width, rng)?
    };

    for node in root.children().filter(Node::is_element) {
        match node.tag_name().name() {
            "link" => {
                if let Some(left) = node.attribute("left") {
                    world.set_to_left(Some(left.to_string()));
                } else if let Some(right) = node.attribute("right") {
                    world.set_to_right(Some(right.to_string()));
                } else if let Some(outside) = node.attribute("outside") {
                    world.set_outside(Some(outside.to_string()));
                } else {
                    return Err(fail("link tag names no direction".to_string()));
                }
            }
            "style" => {
                let folder = node.attribute("folder").unwrap_or_default();
                let theme_id = attr_u32(node, "background").unwrap_or(0);
                let bgm = node.attribute("bgm").map(String::from);
                world.set_style(WorldStyle::from_ids(folder, theme_id, bgm)?);
            }
            "generation" | "floor" => {}
            "npc" => {
                let x = attr_f32(node, "x").unwrap_or(0.0);
                let y = attr_f32(node, "y").unwrap_or(100.0);
                let nid = world.add_npc(Position::new(x, y));
                if let Some(entity) = world.entities_mut().get_mut(nid) {
                    if let Some(health) = attr_f32(node, "health") {
                        entity.data.health = health;
                    }
                    if let EntityKind::Npc(npc) = &mut entity.kind {
                        if let Some(name) = node.attribute("name") {
                            npc.name = name.to_string();
                        }
                        // No dialog marker parks the NPC's dialog cursor.
                        if !attr_bool(node, "hasDialog").unwrap_or(false) {
                            npc.dialog_index = 9999;
                        }
                    }
                }
            }
            "mob" => {
                let kind = MobKind::from_id(attr_u32(node, "type").unwrap_or(0));
                spawn_mob(&mut world, node, kind);
            }
            tag if mob_kind_for_tag(tag).is_some() => {
                let kind = mob_kind_for_tag(tag).unwrap_or(MobKind::Rabbit);
                spawn_mob(&mut world, node, kind);
            }
            "trigger" => {
                let x = attr_f32(node, "x").unwrap_or(0.0);
                let mid = world.add_mob(MobKind::Trigger, Position::new(x, 0.0));
                if let Some(entity) = world.entities_mut().get_mut(mid) {
                    if let EntityKind::Mob(mob) = &mut entity.kind {
                        mob.trigger_id = node.attribute("id").map(String::from);
                    }
                }
            }
            "structure" => {
                spawn_structure(&mut world, node, rng, None);
            }
            "hill" => {
                let x = attr_f32(node, "x").unwrap_or(0.0);
                let y = attr_f32(node, "y").unwrap_or(0.0);
                let span = attr_u32(node, "width").unwrap_or(0);
                world.terrain_mut().add_hill(Position::new(x, y), span);
            }
            "hole" => {
                let start = attr_u32(node, "start").unwrap_or(0) as usize;
                let end = attr_u32(node, "end").unwrap_or(0) as usize;
                world.terrain_mut().add_hole(start, end);
            }
            "time" => {
                if let Some(tick) = node.attribute("tick").and_then(|v| v.parse().ok()) {
                    world.set_tick(Tick(tick));
                }
                if let Some(weather) = node.attribute("weather").and_then(Weather::parse) {
                    world.set_weather(weather);
                }
            }
            "village" => {
                parse_village(&mut world, node, rng)?;
            }
            _ => {}
        }
    }

    Ok(world)
}

fn spawn_mob(world: &mut World, node: Node<'_, '_>, kind: MobKind) {
    let (x, y) = match attr_f32(node, "x") {
        Some(x) => (x, attr_f32(node, "y").unwrap_or(100.0)),
        None => (0.0, 100.0),
    };
    let mid = world.add_mob(kind, Position::new(x, y));
    if let Some(aggressive) = attr_bool(node, "aggressive") {
        if let Some(entity) = world.entities_mut().get_mut(mid) {
            if let EntityKind::Mob(mob) = &mut entity.kind {
                mob.aggressive = aggressive;
            }
        }
    }
}

fn spawn_structure(
    world: &mut World,
    node: Node<'_, '_>,
    rng: &mut SmallRng,
    forced_kind: Option<StructureKind>,
) -> EntityId {
    use rand::Rng as _;
    let kind = forced_kind
        .unwrap_or_else(|| StructureKind::from_id(attr_u32(node, "type").unwrap_or(1)));
    let x = attr_f32(node, "x")
        .unwrap_or_else(|| rng.random_range(0.0..(world.pixel_width() / 2.0).max(1.0)));
    let texture = node.attribute("texture").unwrap_or_default().to_string();
    let interior = node
        .attribute("inside")
        .filter(|s| !s.is_empty())
        .map(String::from);
    world.add_structure(kind, Position::new(x, 100.0), texture, interior)
}

/// Parse a `village` block: its structures and stalls, shrink-wrapping the
/// village interval around everything spawned inside it.
fn parse_village(
    world: &mut World,
    node: Node<'_, '_>,
    rng: &mut SmallRng,
) -> Result<(), StreamError> {
    let name = node.attribute("name").unwrap_or("village");
    let mut village = driftlands_core::Village::new(name, world.terrain());

    for child in node.children().filter(Node::is_element) {
        let spawned = match child.tag_name().name() {
            "structure" => Some(spawn_structure(world, child, rng, None)),
            "stall" => match child.attribute("type") {
                Some("market") => {
                    let sid = spawn_structure(world, child, rng, Some(StructureKind::MarketStall));
                    let table = parse_trade_table(child);
                    let stall_x = world
                        .entities()
                        .get(sid)
                        .map(|e| e.data.position.x)
                        .unwrap_or_default();
                    world.add_merchant(Position::new(stall_x, 100.0), table);
                    Some(sid)
                }
                Some("trader") => {
                    Some(spawn_structure(world, child, rng, Some(StructureKind::TradeStall)))
                }
                _ => None,
            },
            _ => None,
        };
        if let Some(sid) = spawned {
            if let Some(entity) = world.entities().get(sid) {
                village.cover(entity.data.position, entity.data.width);
            }
        }
    }

    world.add_village(village);
    Ok(())
}

fn parse_trade_table(stall: Node<'_, '_>) -> TradeTable {
    let mut table = TradeTable::default();
    for child in stall.children().filter(Node::is_element) {
        let body = || {
            child
                .attribute("item")
                .map(String::from)
                .or_else(|| child.text().map(|t| t.trim().to_string()))
                .unwrap_or_default()
        };
        match child.tag_name().name() {
            "buy" => table.buys.push(body()),
            "sell" => table.sells.push(body()),
            "trade" => {
                let give = child.attribute("give").unwrap_or_default().to_string();
                let take = child.attribute("take").unwrap_or_default().to_string();
                table.trades.push((give, take));
            }
            "text" => {
                if let Some(text) = child.text() {
                    table.text.push(text.trim().to_string());
                }
            }
            _ => {}
        }
    }
    table
}
