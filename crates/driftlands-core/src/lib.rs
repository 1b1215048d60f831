//! Simulation core for the Driftlands side-scrolling world.
//!
//! Owns the terrain model, entity registry, particle system, weather cycle,
//! and the per-tick `update`/`detect` pipeline. Rendering, audio, and input
//! are external collaborators; this crate only exposes the read accessors
//! they consume.

use ordered_float::OrderedFloat;
use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::fmt;
use thiserror::Error;
use tracing::debug;

new_key_type! {
    /// Stable handle for entities backed by a generational slot map.
    pub struct EntityId;
}

/// Base world-space unit length. Most spatial constants are multiples of it.
pub const HLINE: f32 = 3.0;

/// `n` world units expressed in world-space distance.
#[must_use]
pub const fn hlines(n: f32) -> f32 {
    HLINE * n
}

/// Height of the first terrain anchor.
pub const GROUND_HEIGHT_INITIAL: f32 = 80.0;
/// Lower clamp for generated ground; a height of exactly `0` marks a pit.
pub const GROUND_HEIGHT_MINIMUM: f32 = 60.0;
/// Upper clamp for generated ground.
pub const GROUND_HEIGHT_MAXIMUM: f32 = 110.0;
/// Spacing, in columns, between terrain height anchors.
pub const GROUND_HILLINESS: usize = 10;
/// Flat floor height used by interior worlds.
pub const INDOOR_FLOOR_HEIGHT: f32 = 100.0;
/// Tallest a blade of grass may grow, in world units.
pub const GRASS_HEIGHT_BASE: f32 = 4.0;
/// Number of stars allocated for the night sky.
pub const STAR_COUNT: usize = 100;
/// Per-world cap on light emitters.
pub const MAX_LIGHTS: usize = 64;

/// Errors raised while constructing or mutating world state.
#[derive(Debug, Error, PartialEq)]
pub enum WorldError {
    /// Terrain generation was asked for a non-positive width.
    #[error("invalid world dimensions: width must be positive, got {0}")]
    InvalidWidth(i64),
    /// A world description referenced an unknown background theme id.
    #[error("invalid world background type: {0}")]
    UnknownBackground(u32),
    /// A configuration value failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static tunables for the simulation, shared by every streamed world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldConfig {
    /// Downward acceleration applied per millisecond of delta.
    pub gravity: f32,
    /// Most negative vertical velocity an entity may reach.
    pub terminal_velocity: f32,
    /// Step height (world units) beyond which a ledge acts as a wall.
    pub ledge_step_maximum: f32,
    /// Entities falling below this height through a pit are dead.
    pub kill_plane: f32,
    /// Ticks in one full day/night period.
    pub day_cycle_ticks: u64,
    /// Ticks between seeded weather re-rolls.
    pub weather_roll_interval: u64,
    /// Hard cap on live particles per world.
    pub max_particles: usize,
    /// Columns on each side of the player that get their grass pressed.
    pub grass_flatten_radius: usize,
    /// Interaction radius for NPC/door queries, in world units.
    pub interact_radius: f32,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            gravity: 0.003,
            terminal_velocity: -2.0,
            ledge_step_maximum: 30.0,
            kill_plane: -200.0,
            day_cycle_ticks: 3_000,
            weather_roll_interval: 750,
            max_particles: 2_048,
            grass_flatten_radius: 6,
            interact_radius: hlines(40.0),
            rng_seed: None,
        }
    }
}

impl WorldConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), WorldError> {
        if self.gravity <= 0.0 {
            return Err(WorldError::InvalidConfig("gravity must be positive"));
        }
        if self.terminal_velocity >= 0.0 {
            return Err(WorldError::InvalidConfig(
                "terminal_velocity must be negative",
            ));
        }
        if self.ledge_step_maximum <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "ledge_step_maximum must be positive",
            ));
        }
        if self.day_cycle_ticks == 0 || self.weather_roll_interval == 0 {
            return Err(WorldError::InvalidConfig(
                "day cycle and weather intervals must be non-zero",
            ));
        }
        if self.max_particles == 0 {
            return Err(WorldError::InvalidConfig("max_particles must be non-zero"));
        }
        if self.interact_radius <= 0.0 {
            return Err(WorldError::InvalidConfig(
                "interact_radius must be positive",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy when no seed is set.
    #[must_use]
    pub fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::seed_from_u64(rand::random()),
        }
    }
}

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Axis-aligned 2D position.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Squared distance to another position.
    #[must_use]
    pub fn distance_sq(self, other: Self) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

/// World-space velocity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

impl Velocity {
    /// Construct a new velocity vector.
    #[must_use]
    pub const fn new(vx: f32, vy: f32) -> Self {
        Self { vx, vy }
    }
}

/// 8-bit RGB color used by particles and lights.
pub type Color = [u8; 3];

/// One unit-wide vertical slice of terrain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WorldColumn {
    /// Ground surface height; `0.0` marks a pit that entities fall through.
    pub ground_height: f32,
    /// Index into the dirt palette used by the renderer.
    pub ground_color: u8,
    /// Whether the grass on this column stands upright.
    pub grass_upright: bool,
    /// Heights of the column's two grass blades.
    pub grass_height: [f32; 2],
}

impl Default for WorldColumn {
    fn default() -> Self {
        Self {
            ground_height: 0.0,
            ground_color: 0,
            grass_upright: true,
            grass_height: [0.0, 0.0],
        }
    }
}

impl WorldColumn {
    /// Whether this column is a pit (fall-through).
    #[must_use]
    pub fn is_pit(&self) -> bool {
        self.ground_height == 0.0
    }
}

/// Column-indexed terrain for one world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Terrain {
    columns: Vec<WorldColumn>,
    world_start: f32,
}

impl Terrain {
    /// Procedurally generate outdoor terrain `width` columns wide.
    ///
    /// Height anchors are placed every [`GROUND_HILLINESS`] columns, each
    /// perturbed ±4 from the previous anchor; the columns between anchors are
    /// linearly interpolated, and every height is clamped into
    /// `[GROUND_HEIGHT_MINIMUM, GROUND_HEIGHT_MAXIMUM]`.
    pub fn generate(width: u32, rng: &mut dyn RngCore) -> Result<Self, WorldError> {
        if width == 0 {
            return Err(WorldError::InvalidWidth(i64::from(width)));
        }
        let line_count = width as usize + GROUND_HILLINESS;
        let mut columns = vec![WorldColumn::default(); line_count];

        // Anchor pass.
        columns[0].ground_height = GROUND_HEIGHT_INITIAL;
        let mut previous = GROUND_HEIGHT_INITIAL;
        let mut i = GROUND_HILLINESS;
        while i < line_count {
            let perturb = rng.random_range(0..8) as f32 - 4.0;
            columns[i].ground_height = previous + perturb;
            previous = columns[i].ground_height;
            i += GROUND_HILLINESS;
        }

        // Slope pass: interpolate between anchors, fill per-column decoration.
        let mut increment = 0.0f32;
        for i in 0..line_count {
            if columns[i].ground_height != 0.0 {
                let next_anchor = i + GROUND_HILLINESS;
                if next_anchor < line_count {
                    increment = (columns[next_anchor].ground_height - columns[i].ground_height)
                        / GROUND_HILLINESS as f32;
                }
            } else {
                columns[i].ground_height = columns[i - 1].ground_height + increment;
            }

            columns[i].ground_color = rng.random_range(0..32) / 8;
            columns[i].grass_upright = true;
            columns[i].grass_height = [
                (rng.random_range(0..16) / 3) as f32 + GRASS_HEIGHT_BASE / 2.0,
                (rng.random_range(0..16) / 3) as f32 + GRASS_HEIGHT_BASE / 2.0,
            ];

            columns[i].ground_height = columns[i]
                .ground_height
                .clamp(GROUND_HEIGHT_MINIMUM, GROUND_HEIGHT_MAXIMUM);
        }

        Ok(Self {
            columns,
            world_start: -((width as f32 - GROUND_HILLINESS as f32) * HLINE / 2.0),
        })
    }

    /// Generate a flat interior floor `width` columns wide.
    pub fn indoor(width: u32) -> Result<Self, WorldError> {
        if width == 0 {
            return Err(WorldError::InvalidWidth(i64::from(width)));
        }
        let line_count = width as usize + GROUND_HILLINESS;
        let column = WorldColumn {
            ground_height: INDOOR_FLOOR_HEIGHT,
            ..WorldColumn::default()
        };
        Ok(Self {
            columns: vec![column; line_count],
            world_start: -((width as f32 - GROUND_HILLINESS as f32) * HLINE / 2.0),
        })
    }

    /// Number of columns.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.columns.len()
    }

    /// Signed x-origin; the world extends `[world_start, -world_start]`.
    #[must_use]
    pub const fn world_start(&self) -> f32 {
        self.world_start
    }

    /// World width in pixels.
    #[must_use]
    pub fn pixel_width(&self) -> f32 {
        self.world_start * -2.0
    }

    /// Read access to the column array.
    #[must_use]
    pub fn columns(&self) -> &[WorldColumn] {
        &self.columns
    }

    /// Index of the column under world-space `x` for an entity `width` wide,
    /// clamped into the valid range.
    #[must_use]
    pub fn column_index(&self, x: f32, width: f32) -> usize {
        let raw = ((x + width / 2.0 - self.world_start) / HLINE).floor() as i64;
        raw.clamp(0, self.columns.len() as i64 - 1) as usize
    }

    /// Ground height at column `index`.
    #[must_use]
    pub fn ground_height(&self, index: usize) -> f32 {
        self.columns[index].ground_height
    }

    /// Zero the heights of columns in `[start, end)`, marking them as pits.
    /// The range is clipped to the column array.
    pub fn add_hole(&mut self, start: usize, end: usize) {
        let end = end.min(self.columns.len());
        for column in &mut self.columns[start.min(end)..end] {
            column.ground_height = 0.0;
        }
    }

    /// Raise a half-sine bump `width` columns wide centered on column
    /// `peak.x`, never lifting any column above `peak.y`. Indices falling
    /// outside the terrain are skipped.
    pub fn add_hill(&mut self, peak: Position, width: u32) {
        if width == 0 {
            return;
        }
        let first = (peak.x - width as f32 / 2.0).floor() as i64;
        for offset in 0..width as i64 {
            let index = first + offset;
            if index < 0 || index >= self.columns.len() as i64 {
                continue;
            }
            let t = (offset as f32 + 0.5) / width as f32 * std::f32::consts::PI;
            let lifted = (peak.y * t.sin()).min(peak.y);
            let column = &mut self.columns[index as usize];
            if lifted > column.ground_height {
                column.ground_height = lifted;
            }
        }
    }

    /// Press the grass beneath the player while they stand on the ground.
    pub fn flatten_grass(&mut self, player_column: usize, on_ground: bool, radius: usize) {
        let last = self.columns.len().saturating_sub(GROUND_HILLINESS);
        for (i, column) in self.columns[..last].iter_mut().enumerate() {
            column.grass_upright = if on_ground {
                i + radius < player_column || i > player_column + radius
            } else {
                true
            };
        }
    }
}

/// Structure subtypes, selecting sprite and behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StructureKind {
    TownHall,
    House,
    Fountain,
    LampPost,
    FirePit,
    MarketStall,
    TradeStall,
}

impl StructureKind {
    /// Map a world-description type id onto a structure kind.
    #[must_use]
    pub fn from_id(id: u32) -> Self {
        match id {
            0 => Self::TownHall,
            5 => Self::Fountain,
            6 => Self::LampPost,
            7 => Self::FirePit,
            70 => Self::MarketStall,
            71 => Self::TradeStall,
            _ => Self::House,
        }
    }

    /// Whether this structure carries its own light source.
    #[must_use]
    pub const fn emits_light(self) -> bool {
        matches!(self, Self::LampPost | Self::FirePit)
    }
}

/// Mob subtypes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MobKind {
    Rabbit,
    Bird,
    Trigger,
    Door,
    Page,
    Cat,
}

impl MobKind {
    /// Map a world-description type id onto a mob kind.
    #[must_use]
    pub fn from_id(id: u32) -> Self {
        match id {
            1 => Self::Bird,
            2 => Self::Trigger,
            3 => Self::Door,
            4 => Self::Page,
            5 => Self::Cat,
            _ => Self::Rabbit,
        }
    }
}

/// Merchant inventory and dialogue attached to stall NPCs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TradeTable {
    pub buys: Vec<String>,
    pub sells: Vec<String>,
    pub trades: Vec<(String, String)>,
    pub text: Vec<String>,
}

/// Scalar state common to every entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EntityData {
    pub position: Position,
    pub velocity: Velocity,
    pub width: f32,
    pub height: f32,
    pub health: f32,
    pub alive: bool,
    pub on_ground: bool,
    pub can_move: bool,
    pub facing_left: bool,
}

impl Default for EntityData {
    fn default() -> Self {
        Self {
            position: Position::default(),
            velocity: Velocity::default(),
            width: hlines(6.0),
            height: hlines(8.0),
            health: 1.0,
            alive: true,
            on_ground: false,
            can_move: true,
            facing_left: false,
        }
    }
}

/// Structure payload: footprint sprite and optional interior world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StructureData {
    pub kind: StructureKind,
    pub texture: String,
    pub interior: Option<String>,
}

/// NPC payload. Merchants are NPCs carrying a trade table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NpcData {
    pub name: String,
    pub dialog_index: i32,
    /// How many worlds away from home this NPC has wandered.
    pub out_and_about: i32,
    pub merchant: Option<TradeTable>,
}

impl Default for NpcData {
    fn default() -> Self {
        Self {
            name: String::new(),
            dialog_index: 0,
            out_and_about: 0,
            merchant: None,
        }
    }
}

/// Mob payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MobData {
    pub kind: MobKind,
    pub aggressive: bool,
    pub trigger_id: Option<String>,
}

/// Pickup object payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectData {
    pub item: String,
    pub pickup_dialog: String,
}

/// Closed set of entity capabilities; replaces type tags plus downcasts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum EntityKind {
    Structure(StructureData),
    Npc(NpcData),
    Mob(MobData),
    Object(ObjectData),
}

/// Coarse entity classification exposed to renderers and queries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EntityType {
    Structure,
    Npc,
    Mob,
    Object,
    Merchant,
}

/// A fully assembled entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub data: EntityData,
    pub kind: EntityKind,
}

impl Entity {
    /// Coarse classification of this entity.
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        match &self.kind {
            EntityKind::Structure(_) => EntityType::Structure,
            EntityKind::Npc(npc) if npc.merchant.is_some() => EntityType::Merchant,
            EntityKind::Npc(_) => EntityType::Npc,
            EntityKind::Mob(_) => EntityType::Mob,
            EntityKind::Object(_) => EntityType::Object,
        }
    }

    /// Whether physics should pin this entity to the ground surface.
    #[must_use]
    fn pinned_to_ground(&self) -> bool {
        matches!(self.kind, EntityKind::Structure(_))
    }

    /// Trigger mobs are sensors; the physics pass skips them.
    #[must_use]
    fn skips_physics(&self) -> bool {
        matches!(
            self.kind,
            EntityKind::Mob(MobData {
                kind: MobKind::Trigger,
                ..
            })
        )
    }
}

/// Per-world entity ownership: a slot map plus typed views and a flattened
/// iteration order.
///
/// Invariant: every id held by a typed list appears exactly once in `order`.
#[derive(Debug, Default, Clone)]
pub struct EntityArena {
    slots: SlotMap<EntityId, Entity>,
    order: Vec<EntityId>,
    npcs: Vec<EntityId>,
    mobs: Vec<EntityId>,
    structures: Vec<EntityId>,
    objects: Vec<EntityId>,
    merchants: Vec<EntityId>,
}

impl EntityArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert an entity, wiring it into its typed list and the flattened order.
    pub fn insert(&mut self, entity: Entity) -> EntityId {
        let entity_type = entity.entity_type();
        let id = self.slots.insert(entity);
        match entity_type {
            EntityType::Structure => self.structures.push(id),
            EntityType::Npc => self.npcs.push(id),
            EntityType::Merchant => {
                self.merchants.push(id);
                self.npcs.push(id);
            }
            EntityType::Mob => self.mobs.push(id),
            EntityType::Object => self.objects.push(id),
        }
        self.order.push(id);
        id
    }

    /// Remove an entity from every list, returning its final state.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.slots.remove(id)?;
        self.order.retain(|&e| e != id);
        self.npcs.retain(|&e| e != id);
        self.mobs.retain(|&e| e != id);
        self.structures.retain(|&e| e != id);
        self.objects.retain(|&e| e != id);
        self.merchants.retain(|&e| e != id);
        Some(entity)
    }

    #[must_use]
    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.slots.get(id)
    }

    #[must_use]
    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.slots.get_mut(id)
    }

    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.slots.contains_key(id)
    }

    /// Iterate entities in flattened order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Entity)> + '_ {
        self.order.iter().filter_map(|&id| Some((id, self.slots.get(id)?)))
    }

    /// Flattened iteration order (snapshot for the physics pass).
    #[must_use]
    pub fn order(&self) -> &[EntityId] {
        &self.order
    }

    #[must_use]
    pub fn npcs(&self) -> &[EntityId] {
        &self.npcs
    }

    #[must_use]
    pub fn mobs(&self) -> &[EntityId] {
        &self.mobs
    }

    #[must_use]
    pub fn structures(&self) -> &[EntityId] {
        &self.structures
    }

    #[must_use]
    pub fn objects(&self) -> &[EntityId] {
        &self.objects
    }

    #[must_use]
    pub fn merchants(&self) -> &[EntityId] {
        &self.merchants
    }
}

/// Time-bounded visual effect owned by a world.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Particle {
    pub position: Position,
    pub velocity: Velocity,
    pub width: f32,
    pub height: f32,
    pub color: Color,
    pub remaining_ms: f32,
    pub gravity: bool,
    pub bounce: bool,
    pub behind: bool,
    pub can_move: bool,
}

impl Particle {
    /// Count lifetime down; returns `true` once the particle should be erased.
    pub fn expired(&mut self, delta_ms: f32) -> bool {
        self.remaining_ms -= delta_ms;
        self.remaining_ms <= 0.0
    }
}

/// Point light attached to lamp posts, fire pits, and the like.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Light {
    pub position: Position,
    pub color: Color,
}

/// Named x-interval used purely for entry/exit notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Village {
    pub name: String,
    pub start_x: f32,
    pub end_x: f32,
    pub inside: bool,
}

impl Village {
    /// A village spanning the whole world until structures shrink-wrap it.
    #[must_use]
    pub fn new(name: impl Into<String>, terrain: &Terrain) -> Self {
        let half = terrain.pixel_width() / 2.0;
        Self {
            name: name.into(),
            start_x: half,
            end_x: -half,
            inside: false,
        }
    }

    /// Grow the interval to cover a structure footprint.
    pub fn cover(&mut self, position: Position, width: f32) {
        if position.x < self.start_x {
            self.start_x = position.x;
        }
        if position.x + width > self.end_x {
            self.end_x = position.x + width;
        }
    }
}

/// Weather and time-of-day state driving tint and particle emission.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Weather {
    #[default]
    Sunny,
    Dark,
    Rain,
    Snowy,
}

impl Weather {
    /// Human-readable name consumed by debug overlays.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sunny => "Sunny",
            Self::Dark => "Dark",
            Self::Rain => "Rain",
            Self::Snowy => "Snowy",
        }
    }

    /// Parse a weather name as written in world descriptions.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Sunny" => Some(Self::Sunny),
            "Dark" => Some(Self::Dark),
            "Rain" => Some(Self::Rain),
            "Snowy" => Some(Self::Snowy),
            _ => None,
        }
    }
}

/// Background theme selecting the texture layer set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackgroundTheme {
    Forest,
    WoodHouse,
}

impl BackgroundTheme {
    /// Resolve a world-description theme id.
    pub fn from_id(id: u32) -> Result<Self, WorldError> {
        match id {
            0 => Ok(Self::Forest),
            1 => Ok(Self::WoodHouse),
            other => Err(WorldError::UnknownBackground(other)),
        }
    }
}

const STRUCTURE_TEXTURES: [&str; 8] = [
    "townhall.png",
    "house1.png",
    "house2.png",
    "house1.png",
    "house1.png",
    "fountain1.png",
    "lampPost1.png",
    "brazzier.png",
];

const BG_LAYERS_FOREST: [&str; 9] = [
    "bg.png",
    "bgn.png",
    "bgFarMountain.png",
    "forestTileFar.png",
    "forestTileBack.png",
    "forestTileMid.png",
    "forestTileFront.png",
    "dirt.png",
    "grass.png",
];

const BG_LAYERS_WOODHOUSE: [&str; 9] = [
    "bgWoodTile.png",
    "bgWoodTile.png",
    "bgWoodTile.png",
    "bgWoodTile.png",
    "bgWoodTile.png",
    "bgWoodTile.png",
    "bgWoodTile.png",
    "bgWoodTile.png",
    "bgWoodTile.png",
];

/// Texture-path bundle derived from a style folder prefix and theme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldStyle {
    pub folder: String,
    pub theme: BackgroundTheme,
    pub structure_textures: Vec<String>,
    pub background_layers: Vec<String>,
    pub bgm: Option<String>,
}

impl WorldStyle {
    /// Assemble texture paths from a world-description theme id.
    pub fn from_ids(prefix: &str, theme_id: u32, bgm: Option<String>) -> Result<Self, WorldError> {
        Ok(Self::new(prefix, BackgroundTheme::from_id(theme_id)?, bgm))
    }

    /// Assemble texture paths for `prefix` (empty selects the classic set).
    #[must_use]
    pub fn new(prefix: &str, theme: BackgroundTheme, bgm: Option<String>) -> Self {
        let folder = if prefix.is_empty() {
            "assets/style/classic/".to_string()
        } else {
            prefix.to_string()
        };
        let structure_textures = STRUCTURE_TEXTURES
            .iter()
            .map(|name| format!("{folder}{name}"))
            .collect();
        let layer_names: &[&str] = match theme {
            BackgroundTheme::Forest => &BG_LAYERS_FOREST,
            BackgroundTheme::WoodHouse => &BG_LAYERS_WOODHOUSE,
        };
        let background_layers = layer_names
            .iter()
            .map(|name| format!("{folder}bg/{name}"))
            .collect();
        Self {
            folder,
            theme,
            structure_textures,
            background_layers,
            bgm,
        }
    }
}

impl Default for WorldStyle {
    fn default() -> Self {
        Self::new("", BackgroundTheme::Forest, None)
    }
}

/// Background-music cue produced for the (external) audio layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MusicCue {
    /// Start the given track fresh.
    Start(String),
    /// Crossfade from whatever is playing into the given track.
    Crossfade(String),
}

/// Player avatar. Lives outside any world's entity arena; worlds never own it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Player {
    pub data: EntityData,
    pub speed: f32,
    pub light: bool,
}

impl Default for Player {
    fn default() -> Self {
        Self {
            data: EntityData {
                height: hlines(12.0),
                ..EntityData::default()
            },
            speed: 1.0,
            light: false,
        }
    }
}

/// Events emitted by one world tick, consumed by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickEvents {
    pub tick: Tick,
    /// Village welcome notification, fired once per entry.
    pub village_entered: Option<String>,
}

/// Result of a physics pass: the player either survived the tick or not.
///
/// Player death is a propagated outcome, never a process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum SimOutcome {
    Alive,
    GameOver,
}

/// Summary of one physics pass.
#[derive(Debug, Clone, Copy, PartialEq)]
#[must_use]
pub struct DetectSummary {
    pub outcome: SimOutcome,
    /// Entities removed after dying this pass.
    pub deaths: usize,
    /// Particles spawned by emitters this pass.
    pub particles_emitted: usize,
}

/// Outcome of resolving one entity against the terrain.
#[derive(Debug, Clone, Copy)]
struct Resolved {
    data: EntityData,
    died: bool,
}

/// Pure per-entity collision resolution; shared by entities and the player.
fn resolve_body(
    terrain: &Terrain,
    mut data: EntityData,
    pinned: bool,
    config: &WorldConfig,
    delta_ms: f32,
) -> Resolved {
    let column = terrain.column_index(data.position.x, data.width);
    let ground = terrain.ground_height(column);
    let pit = terrain.columns()[column].is_pit();

    if pinned {
        // Structures never truly fall.
        data.position.y = ground;
        data.velocity.vy = 0.0;
        data.on_ground = true;
    } else if !pit && data.position.y < ground {
        // Embedded in the ground: either blocked by a steep step or snapped
        // up to the surface.
        let direction: i64 = if data.velocity.vx < 0.0 { -1 } else { 1 };
        let look = column as i64 + direction * 2;
        let adjacent = column as i64 + direction;
        let blocked = look >= 0
            && (look as usize) < terrain.line_count()
            && adjacent >= 0
            && terrain.ground_height(look as usize) - terrain.ground_height(adjacent as usize)
                > config.ledge_step_maximum;
        if blocked && data.velocity.vx != 0.0 {
            data.position.x -= data.velocity.vx * delta_ms * 2.0;
            data.velocity.vx = 0.0;
        } else {
            data.position.y = ground - 0.001 * delta_ms;
            data.on_ground = true;
            data.velocity.vy = 0.0;
        }
    } else {
        // Airborne (or over a pit): integrate gravity down to terminal.
        data.on_ground = false;
        if data.velocity.vy > config.terminal_velocity {
            data.velocity.vy -= config.gravity * delta_ms;
        }
    }

    // Keep the entity inside the world's horizontal extent.
    let start = terrain.world_start();
    if data.position.x < start {
        data.velocity.vx = 0.0;
        data.position.x = start + HLINE / 2.0;
    } else if data.position.x + data.width + HLINE > -start {
        data.velocity.vx = 0.0;
        data.position.x = -start - data.width - HLINE;
    }

    let died = data.health <= 0.0 || data.position.y < config.kill_plane;
    Resolved { data, died }
}

/// One streamed world: terrain, owned entities, particles, overlays.
pub struct World {
    id: String,
    indoor: bool,
    terrain: Terrain,
    entities: EntityArena,
    particles: Vec<Particle>,
    lights: Vec<Light>,
    villages: Vec<Village>,
    stars: Vec<Position>,
    weather: Weather,
    style: WorldStyle,
    /// Neighbor world identifiers, resolved lazily through the registry.
    to_left: Option<String>,
    to_right: Option<String>,
    /// Exterior world identifier, for interior worlds only.
    outside: Option<String>,
    tick: Tick,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("id", &self.id)
            .field("indoor", &self.indoor)
            .field("line_count", &self.terrain.line_count())
            .field("entities", &self.entities.len())
            .field("particles", &self.particles.len())
            .field("weather", &self.weather)
            .finish()
    }
}

impl World {
    /// Construct an outdoor world with procedurally generated terrain.
    pub fn generate(
        id: impl Into<String>,
        width: u32,
        rng: &mut dyn RngCore,
    ) -> Result<Self, WorldError> {
        let terrain = Terrain::generate(width, rng)?;
        let stars = Self::scatter_stars(&terrain, rng);
        Ok(Self::assemble(id.into(), false, terrain, stars))
    }

    /// Construct an interior world with a flat floor.
    pub fn indoor(id: impl Into<String>, width: u32) -> Result<Self, WorldError> {
        let terrain = Terrain::indoor(width)?;
        Ok(Self::assemble(id.into(), true, terrain, Vec::new()))
    }

    fn assemble(id: String, indoor: bool, terrain: Terrain, stars: Vec<Position>) -> Self {
        Self {
            id,
            indoor,
            terrain,
            entities: EntityArena::new(),
            particles: Vec::new(),
            lights: Vec::new(),
            villages: Vec::new(),
            stars,
            weather: Weather::default(),
            style: WorldStyle::default(),
            to_left: None,
            to_right: None,
            outside: None,
            tick: Tick::zero(),
        }
    }

    fn scatter_stars(terrain: &Terrain, rng: &mut dyn RngCore) -> Vec<Position> {
        let half = (terrain.pixel_width() / 2.0).max(hlines(1.0));
        (0..STAR_COUNT)
            .map(|_| {
                Position::new(
                    rng.random_range(-half..half),
                    rng.random_range(200.0..600.0),
                )
            })
            .collect()
    }

    /// Stable world identifier (the description file path).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this is an interior world.
    #[must_use]
    pub const fn is_indoor(&self) -> bool {
        self.indoor
    }

    #[must_use]
    pub fn terrain(&self) -> &Terrain {
        &self.terrain
    }

    #[must_use]
    pub fn terrain_mut(&mut self) -> &mut Terrain {
        &mut self.terrain
    }

    #[must_use]
    pub fn entities(&self) -> &EntityArena {
        &self.entities
    }

    #[must_use]
    pub fn entities_mut(&mut self) -> &mut EntityArena {
        &mut self.entities
    }

    #[must_use]
    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    #[must_use]
    pub fn lights(&self) -> &[Light] {
        &self.lights
    }

    #[must_use]
    pub fn stars(&self) -> &[Position] {
        &self.stars
    }

    #[must_use]
    pub fn villages(&self) -> &[Village] {
        &self.villages
    }

    #[must_use]
    pub const fn weather(&self) -> Weather {
        self.weather
    }

    /// Force the weather state (used by `time`/scripted description tags).
    pub fn set_weather(&mut self, weather: Weather) {
        self.weather = weather;
    }

    /// Human-readable weather name.
    #[must_use]
    pub const fn weather_name(&self) -> &'static str {
        self.weather.as_str()
    }

    #[must_use]
    pub fn style(&self) -> &WorldStyle {
        &self.style
    }

    /// Install the style bundle (texture prefix, background theme, music).
    pub fn set_style(&mut self, style: WorldStyle) {
        self.style = style;
    }

    /// World width in pixels.
    #[must_use]
    pub fn pixel_width(&self) -> f32 {
        self.terrain.pixel_width()
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Set the clock directly (description `time` tags and restored saves).
    pub fn set_tick(&mut self, tick: Tick) {
        self.tick = tick;
    }

    /// Left neighbor identifier, if the description declared one.
    #[must_use]
    pub fn to_left(&self) -> Option<&str> {
        self.to_left.as_deref()
    }

    /// Right neighbor identifier, if the description declared one.
    #[must_use]
    pub fn to_right(&self) -> Option<&str> {
        self.to_right.as_deref()
    }

    /// Exterior identifier for interior worlds.
    #[must_use]
    pub fn outside(&self) -> Option<&str> {
        self.outside.as_deref()
    }

    pub fn set_to_left(&mut self, id: Option<String>) {
        self.to_left = id;
    }

    pub fn set_to_right(&mut self, id: Option<String>) {
        self.to_right = id;
    }

    pub fn set_outside(&mut self, id: Option<String>) {
        self.outside = id;
    }

    /// Spawn a structure; lamp posts and fire pits also register a light.
    pub fn add_structure(
        &mut self,
        kind: StructureKind,
        position: Position,
        texture: impl Into<String>,
        interior: Option<String>,
    ) -> EntityId {
        let width = match kind {
            StructureKind::Fountain => hlines(12.0),
            StructureKind::LampPost | StructureKind::FirePit => hlines(4.0),
            _ => hlines(24.0),
        };
        let data = EntityData {
            position,
            width,
            height: hlines(20.0),
            can_move: false,
            ..EntityData::default()
        };
        if kind.emits_light() {
            self.add_light(
                Position::new(position.x + width / 2.0, position.y + hlines(10.0)),
                [255, 220, 170],
            );
        }
        self.entities.insert(Entity {
            data,
            kind: EntityKind::Structure(StructureData {
                kind,
                texture: texture.into(),
                interior,
            }),
        })
    }

    /// Spawn a plain NPC.
    pub fn add_npc(&mut self, position: Position) -> EntityId {
        self.entities.insert(Entity {
            data: EntityData {
                position,
                ..EntityData::default()
            },
            kind: EntityKind::Npc(NpcData::default()),
        })
    }

    /// Spawn a merchant NPC (kept in both the npc and merchant views).
    pub fn add_merchant(&mut self, position: Position, table: TradeTable) -> EntityId {
        self.entities.insert(Entity {
            data: EntityData {
                position,
                ..EntityData::default()
            },
            kind: EntityKind::Npc(NpcData {
                merchant: Some(table),
                ..NpcData::default()
            }),
        })
    }

    /// Spawn a mob of the given kind.
    pub fn add_mob(&mut self, kind: MobKind, position: Position) -> EntityId {
        self.entities.insert(Entity {
            data: EntityData {
                position,
                width: hlines(4.0),
                height: hlines(4.0),
                ..EntityData::default()
            },
            kind: EntityKind::Mob(MobData {
                kind,
                aggressive: false,
                trigger_id: None,
            }),
        })
    }

    /// Spawn a pickup object.
    pub fn add_object(
        &mut self,
        item: impl Into<String>,
        pickup_dialog: impl Into<String>,
        position: Position,
    ) -> EntityId {
        self.entities.insert(Entity {
            data: EntityData {
                position,
                width: hlines(2.0),
                height: hlines(2.0),
                ..EntityData::default()
            },
            kind: EntityKind::Object(ObjectData {
                item: item.into(),
                pickup_dialog: pickup_dialog.into(),
            }),
        })
    }

    /// Register a village interval.
    pub fn add_village(&mut self, village: Village) {
        self.villages.push(village);
    }

    #[must_use]
    pub fn villages_mut(&mut self) -> &mut Vec<Village> {
        &mut self.villages
    }

    /// Register a point light, silently dropped past [`MAX_LIGHTS`].
    pub fn add_light(&mut self, position: Position, color: Color) {
        if self.lights.len() < MAX_LIGHTS {
            self.lights.push(Light { position, color });
        }
    }

    /// Append a particle with movement enabled.
    #[allow(clippy::too_many_arguments)]
    pub fn add_particle(
        &mut self,
        position: Position,
        velocity: Velocity,
        width: f32,
        height: f32,
        color: Color,
        duration_ms: f32,
        gravity: bool,
        behind: bool,
    ) {
        self.particles.push(Particle {
            position,
            velocity,
            width,
            height,
            color,
            remaining_ms: duration_ms,
            gravity,
            bounce: false,
            behind,
            can_move: true,
        });
    }

    /// Produce the music cue for entering this world from `previous`.
    ///
    /// Matches the original crossfade contract: a fresh start on first entry,
    /// a crossfade when the incoming world plays a different track, silence
    /// otherwise.
    #[must_use]
    pub fn music_cue(&self, previous: Option<&World>) -> Option<MusicCue> {
        let bgm = self.style.bgm.as_ref()?;
        match previous {
            None => Some(MusicCue::Start(bgm.clone())),
            Some(prev) if prev.style.bgm.as_deref() != Some(bgm.as_str()) => {
                Some(MusicCue::Crossfade(bgm.clone()))
            }
            Some(_) => None,
        }
    }

    /// Integrate velocities and advance overlay state for one tick.
    ///
    /// Structures never move; other entities update their facing from the
    /// sign of their horizontal velocity. Expired particles are erased, the
    /// survivors integrate, and any droplet crossing a fountain basin is
    /// culled.
    pub fn update(
        &mut self,
        player: &mut Player,
        config: &WorldConfig,
        delta_ms: f32,
        rng: &mut dyn RngCore,
    ) -> TickEvents {
        self.tick = self.tick.next();
        let mut events = TickEvents {
            tick: self.tick,
            ..TickEvents::default()
        };

        // Player integration; horizontal motion is speed-scaled.
        player.data.position.y += player.data.velocity.vy * delta_ms;
        player.data.position.x += player.data.velocity.vx * player.speed * delta_ms;

        let order = self.entities.order.clone();
        for id in order {
            let Some(entity) = self.entities.get_mut(id) else {
                continue;
            };
            entity.data.position.y += entity.data.velocity.vy * delta_ms;
            if !entity.pinned_to_ground() && entity.data.can_move {
                entity.data.position.x += entity.data.velocity.vx * delta_ms;
                if entity.data.velocity.vx < 0.0 {
                    entity.data.facing_left = true;
                } else if entity.data.velocity.vx > 0.0 {
                    entity.data.facing_left = false;
                }
            }
        }

        // Particle lifecycle: expire, integrate, cull fountain-bound drops.
        self.particles.retain_mut(|part| !part.expired(delta_ms));
        let basins: Vec<(Position, f32, f32)> = self
            .entities
            .structures
            .iter()
            .filter_map(|&id| {
                let entity = self.entities.get(id)?;
                match &entity.kind {
                    EntityKind::Structure(s) if s.kind == StructureKind::Fountain => Some((
                        entity.data.position,
                        entity.data.width,
                        entity.data.height,
                    )),
                    _ => None,
                }
            })
            .collect();
        self.particles.retain_mut(|part| {
            if !part.can_move {
                return true;
            }
            part.position.y += part.velocity.vy * delta_ms;
            part.position.x += part.velocity.vx * delta_ms;
            for &(pos, width, height) in &basins {
                if part.position.x >= pos.x
                    && part.position.x <= pos.x + width
                    && part.position.y <= pos.y + height * 0.25
                {
                    return false;
                }
            }
            true
        });

        self.advance_weather(config, rng);

        events.village_entered = self.check_villages(player);
        events
    }

    /// Roll day/night and weather on the configured cadence.
    fn advance_weather(&mut self, config: &WorldConfig, rng: &mut dyn RngCore) {
        if self.indoor {
            return;
        }
        let phase = self.tick.0 % config.day_cycle_ticks;
        let night = phase >= config.day_cycle_ticks / 2;
        if night && self.weather == Weather::Sunny {
            self.weather = Weather::Dark;
        } else if !night && self.weather == Weather::Dark {
            self.weather = Weather::Sunny;
        }
        if self.tick.0 % config.weather_roll_interval == 0 {
            self.weather = match rng.random_range(0..6u32) {
                0 => Weather::Rain,
                1 => Weather::Snowy,
                _ if night => Weather::Dark,
                _ => Weather::Sunny,
            };
        }
    }

    /// Shade factor in `[0, 255]` used by the renderer to fade day into night.
    #[must_use]
    pub fn ambient_shade(&self, config: &WorldConfig) -> u8 {
        let phase = self.tick.0 % config.day_cycle_ticks;
        let half = config.day_cycle_ticks as f32 / 2.0;
        let t = (phase as f32 - half).abs() / half;
        (255.0 * (1.0 - t)) as u8
    }

    /// One-shot welcome notification when the player crosses into a village.
    fn check_villages(&mut self, player: &Player) -> Option<String> {
        let x = player.data.position.x;
        let mut entered = None;
        for village in &mut self.villages {
            if x > village.start_x && x < village.end_x {
                if !village.inside {
                    village.inside = true;
                    entered = Some(village.name.clone());
                }
            } else {
                village.inside = false;
            }
        }
        entered
    }

    /// Run the physics/collision pass over the player and every entity.
    ///
    /// Entities are resolved in parallel against an immutable snapshot and
    /// the results applied afterwards; removals happen at the end of the
    /// pass. Player death is reported, never terminal.
    pub fn detect(
        &mut self,
        player: &mut Player,
        config: &WorldConfig,
        delta_ms: f32,
        rng: &mut dyn RngCore,
    ) -> DetectSummary {
        // Snapshot-then-mutate: stable ids plus copies of the scalar state.
        let snapshot: Vec<(EntityId, EntityData, bool, bool)> = self
            .entities
            .iter()
            .map(|(id, entity)| {
                (
                    id,
                    entity.data,
                    entity.pinned_to_ground(),
                    entity.skips_physics(),
                )
            })
            .collect();

        let terrain = &self.terrain;
        let resolved: Vec<(EntityId, Option<Resolved>)> = snapshot
            .par_iter()
            .map(|&(id, data, pinned, skip)| {
                if skip || !data.alive {
                    return (id, None);
                }
                (id, Some(resolve_body(terrain, data, pinned, config, delta_ms)))
            })
            .collect();

        let mut dead = Vec::new();
        for (id, outcome) in resolved {
            let Some(outcome) = outcome else { continue };
            if let Some(entity) = self.entities.get_mut(id) {
                entity.data = outcome.data;
                if outcome.died {
                    entity.data.alive = false;
                    dead.push(id);
                }
            }
        }
        for id in &dead {
            if let Some(entity) = self.entities.remove(*id) {
                debug!(kind = ?entity.entity_type(), "entity died");
            }
        }

        // Particles run the simplified variant: clamp to ground, then rest.
        for part in &mut self.particles {
            let column = self.terrain.column_index(part.position.x, part.width);
            let ground = self.terrain.ground_height(column);
            if !self.terrain.columns()[column].is_pit() && part.position.y < ground {
                part.position.y = ground;
                part.velocity = Velocity::default();
                part.can_move = false;
            } else if part.gravity && part.velocity.vy > config.terminal_velocity {
                part.velocity.vy -= config.gravity * delta_ms;
            }
        }

        let emitted = self.run_emitters(config, rng);

        // Grass squish under the player.
        let player_column = self
            .terrain
            .column_index(player.data.position.x, player.data.width);
        let on_ground = player.data.on_ground;
        self.terrain
            .flatten_grass(player_column, on_ground, config.grass_flatten_radius);

        // The player resolves against the same rules as everything else.
        let resolved = resolve_body(&self.terrain, player.data, false, config, delta_ms);
        player.data = resolved.data;
        let outcome = if resolved.died {
            player.data.alive = false;
            SimOutcome::GameOver
        } else {
            SimOutcome::Alive
        };
        DetectSummary {
            outcome,
            deaths: dead.len(),
            particles_emitted: emitted,
        }
    }

    /// Table-driven particle emission for structures and weather.
    fn run_emitters(&mut self, config: &WorldConfig, rng: &mut dyn RngCore) -> usize {
        let mut emitted = 0usize;
        let sources: Vec<(StructureKind, Position, f32, f32)> = self
            .entities
            .structures
            .iter()
            .filter_map(|&id| {
                let entity = self.entities.get(id)?;
                match &entity.kind {
                    EntityKind::Structure(s)
                        if matches!(s.kind, StructureKind::Fountain | StructureKind::FirePit) =>
                    {
                        Some((
                            s.kind,
                            entity.data.position,
                            entity.data.width,
                            entity.data.height,
                        ))
                    }
                    _ => None,
                }
            })
            .collect();

        for (kind, position, width, height) in sources {
            match kind {
                StructureKind::Fountain => {
                    let burst = rng.random_range(10..35);
                    for _ in 0..burst {
                        if self.particles.len() >= config.max_particles {
                            break;
                        }
                        let jitter = rng.random_range(0.0..hlines(3.0));
                        let vx = if rng.random_bool(0.5) {
                            -(rng.random_range(0..7) as f32) * 0.01
                        } else {
                            rng.random_range(0..7) as f32 * 0.01
                        };
                        let vy = (4 + rng.random_range(0..6)) as f32 * 0.05;
                        self.add_particle(
                            Position::new(position.x + width / 2.0 + jitter, position.y + height),
                            Velocity::new(vx, vy),
                            HLINE * 1.25,
                            HLINE * 1.25,
                            [0, 0, 255],
                            2_500.0,
                            true,
                            false,
                        );
                        emitted += 1;
                    }
                }
                StructureKind::FirePit => {
                    let burst = rng.random_range(10..30);
                    for _ in 0..burst {
                        if self.particles.len() >= config.max_particles {
                            break;
                        }
                        let jitter = rng.random_range(0.0..(width / 2.0).max(0.5));
                        let vx = if rng.random_bool(0.5) {
                            -(rng.random_range(0..3) as f32) * 0.01
                        } else {
                            rng.random_range(0..3) as f32 * 0.01
                        };
                        let vy = (4 + rng.random_range(0..6)) as f32 * 0.005;
                        self.add_particle(
                            Position::new(position.x + width / 4.0 + jitter, position.y + hlines(3.0)),
                            Velocity::new(vx, vy),
                            HLINE,
                            HLINE,
                            [255, 0, 0],
                            400.0,
                            false,
                            true,
                        );
                        emitted += 1;
                    }
                }
                _ => {}
            }
        }

        if !self.indoor {
            let half = (self.pixel_width() / 2.0).max(hlines(1.0));
            match self.weather {
                Weather::Rain => {
                    let burst = rng.random_range(6..14);
                    for _ in 0..burst {
                        if self.particles.len() >= config.max_particles {
                            break;
                        }
                        self.add_particle(
                            Position::new(rng.random_range(-half..half), 500.0),
                            Velocity::new(0.0, -(rng.random_range(10..30) as f32) * 0.02),
                            HLINE / 2.0,
                            hlines(1.5),
                            [80, 80, 255],
                            8_000.0,
                            true,
                            false,
                        );
                        emitted += 1;
                    }
                }
                Weather::Snowy => {
                    let burst = rng.random_range(2..8);
                    for _ in 0..burst {
                        if self.particles.len() >= config.max_particles {
                            break;
                        }
                        self.add_particle(
                            Position::new(rng.random_range(-half..half), 500.0),
                            Velocity::new(rng.random_range(-5..5) as f32 * 0.002, -0.01),
                            HLINE,
                            HLINE,
                            [255, 255, 255],
                            30_000.0,
                            false,
                            false,
                        );
                        emitted += 1;
                    }
                }
                _ => {}
            }
        }

        emitted
    }

    /// Nearest NPC or door mob within the interaction radius of `pos`.
    #[must_use]
    pub fn nearest_interactable(&self, pos: Position, config: &WorldConfig) -> Option<EntityId> {
        let radius_sq = config.interact_radius * config.interact_radius;
        self.entities
            .iter()
            .filter(|(_, entity)| {
                matches!(
                    &entity.kind,
                    EntityKind::Npc(_)
                        | EntityKind::Mob(MobData {
                            kind: MobKind::Door,
                            ..
                        })
                )
            })
            .map(|(id, entity)| (id, entity.data.position.distance_sq(pos)))
            .filter(|&(_, d)| d <= radius_sq)
            .min_by_key(|&(_, d)| OrderedFloat(d))
            .map(|(id, _)| id)
    }

    /// Nearest living mob to `pos`, if any exist.
    #[must_use]
    pub fn nearest_mob(&self, pos: Position) -> Option<EntityId> {
        self.entities
            .mobs
            .iter()
            .filter_map(|&id| {
                let entity = self.entities.get(id)?;
                entity
                    .data
                    .alive
                    .then(|| (id, entity.data.position.distance_sq(pos)))
            })
            .min_by_key(|&(_, d)| OrderedFloat(d))
            .map(|(id, _)| id)
    }

    /// Position of the `index`th structure in spawn order.
    #[must_use]
    pub fn structure_position(&self, index: usize) -> Option<Position> {
        let id = *self.entities.structures.get(index)?;
        Some(self.entities.get(id)?.data.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> SmallRng {
        SmallRng::seed_from_u64(seed)
    }

    fn test_world(width: u32, seed: u64) -> World {
        let mut rng = seeded(seed);
        World::generate("test/world.xml", width, &mut rng).expect("world")
    }

    #[test]
    fn generate_rejects_zero_width() {
        let mut rng = seeded(1);
        assert_eq!(
            Terrain::generate(0, &mut rng).unwrap_err(),
            WorldError::InvalidWidth(0)
        );
    }

    #[test]
    fn generated_heights_respect_clamp_for_many_seeds() {
        for seed in 0..32u64 {
            let mut rng = seeded(seed);
            let terrain = Terrain::generate(200, &mut rng).expect("terrain");
            for (i, column) in terrain.columns().iter().enumerate() {
                assert!(
                    (GROUND_HEIGHT_MINIMUM..=GROUND_HEIGHT_MAXIMUM)
                        .contains(&column.ground_height),
                    "seed {seed} column {i} height {} out of range",
                    column.ground_height
                );
            }
        }
    }

    #[test]
    fn generation_is_deterministic_per_seed() {
        let mut a = seeded(0xD1F7);
        let mut b = seeded(0xD1F7);
        let ta = Terrain::generate(100, &mut a).expect("terrain");
        let tb = Terrain::generate(100, &mut b).expect("terrain");
        assert_eq!(ta.columns(), tb.columns());

        let mut c = seeded(0xD1F8);
        let tc = Terrain::generate(100, &mut c).expect("terrain");
        assert_ne!(ta.columns(), tc.columns());
    }

    #[test]
    fn hole_zeroes_range_and_leaves_rest() {
        let mut rng = seeded(3);
        let mut terrain = Terrain::generate(100, &mut rng).expect("terrain");
        let before: Vec<f32> = terrain.columns().iter().map(|c| c.ground_height).collect();
        terrain.add_hole(20, 30);
        for (i, column) in terrain.columns().iter().enumerate() {
            if (20..30).contains(&i) {
                assert_eq!(column.ground_height, 0.0);
                assert!(column.is_pit());
            } else {
                assert_eq!(column.ground_height, before[i]);
            }
        }
    }

    #[test]
    fn hole_range_is_clipped_to_bounds() {
        let mut rng = seeded(4);
        let mut terrain = Terrain::generate(50, &mut rng).expect("terrain");
        let count = terrain.line_count();
        terrain.add_hole(count - 5, count + 50);
        assert!(terrain.columns()[count - 1].is_pit());
    }

    #[test]
    fn hill_raises_exactly_its_span_and_respects_peak() {
        let mut rng = seeded(5);
        let mut terrain = Terrain::generate(100, &mut rng).expect("terrain");
        let before: Vec<f32> = terrain.columns().iter().map(|c| c.ground_height).collect();
        terrain.add_hill(Position::new(50.0, 150.0), 20);
        for (i, column) in terrain.columns().iter().enumerate() {
            assert!(column.ground_height <= 150.0, "column {i} exceeds peak");
            if !(40..60).contains(&i) {
                assert_eq!(column.ground_height, before[i], "column {i} changed");
            }
        }
        // The center of the bump should have actually risen.
        assert!(terrain.columns()[50].ground_height > before[50]);
    }

    #[test]
    fn hill_clips_when_foot_extends_past_left_edge() {
        let mut rng = seeded(6);
        let mut terrain = Terrain::generate(100, &mut rng).expect("terrain");
        terrain.add_hill(Position::new(2.0, 140.0), 20);
        assert!(terrain.columns()[0].ground_height <= 140.0);
    }

    #[test]
    fn indoor_floor_is_flat() {
        let terrain = Terrain::indoor(40).expect("terrain");
        assert!(terrain
            .columns()
            .iter()
            .all(|c| c.ground_height == INDOOR_FLOOR_HEIGHT));
    }

    #[test]
    fn arena_typed_lists_mirror_flat_order() {
        let mut world = test_world(100, 7);
        let npc = world.add_npc(Position::new(0.0, 100.0));
        let merchant = world.add_merchant(Position::new(10.0, 100.0), TradeTable::default());
        let mob = world.add_mob(MobKind::Rabbit, Position::new(20.0, 100.0));
        let build = world.add_structure(
            StructureKind::House,
            Position::new(30.0, 100.0),
            "house1.png",
            None,
        );

        let arena = world.entities();
        assert_eq!(arena.len(), 4);
        assert_eq!(arena.npcs(), &[npc, merchant]);
        assert_eq!(arena.merchants(), &[merchant]);
        assert_eq!(arena.mobs(), &[mob]);
        assert_eq!(arena.structures(), &[build]);
        for &id in arena.npcs() {
            assert_eq!(arena.order().iter().filter(|&&e| e == id).count(), 1);
        }

        world.entities_mut().remove(merchant);
        let arena = world.entities();
        assert_eq!(arena.len(), 3);
        assert!(arena.merchants().is_empty());
        assert_eq!(arena.npcs(), &[npc]);
        assert!(!arena.order().contains(&merchant));
    }

    #[test]
    fn embedded_entity_snaps_to_surface() {
        let mut world = test_world(100, 8);
        let config = WorldConfig::default();
        let mut rng = seeded(8);
        let id = world.add_npc(Position::new(0.0, 100.0));
        let width = world.entities().get(id).expect("entity").data.width;
        let column = world.terrain().column_index(0.0, width);
        let ground = world.terrain().ground_height(column);
        {
            let entity = world.entities_mut().get_mut(id).expect("entity");
            entity.data.position.y = ground - 10.0;
            entity.data.velocity = Velocity::new(0.0, -0.5);
        }
        let mut player = Player::default();
        player.data.position.y = 500.0;
        let summary = world.detect(&mut player, &config, 10.0, &mut rng);
        assert_eq!(summary.outcome, SimOutcome::Alive);

        let entity = world.entities().get(id).expect("entity");
        let column = world
            .terrain()
            .column_index(entity.data.position.x, entity.data.width);
        let ground = world.terrain().ground_height(column);
        assert!(entity.data.on_ground);
        assert_eq!(entity.data.velocity.vy, 0.0);
        assert!((entity.data.position.y - (ground - 0.001 * 10.0)).abs() < 1e-3);
    }

    #[test]
    fn steep_ledge_blocks_and_pushes_back() {
        let mut world = test_world(100, 9);
        let config = WorldConfig::default();
        let mut rng = seeded(9);

        let id = world.add_npc(Position::new(0.0, 0.0));
        let (column, start_x) = {
            let entity = world.entities().get(id).expect("entity");
            let column = world
                .terrain()
                .column_index(entity.data.position.x, entity.data.width);
            (column, entity.data.position.x)
        };
        // Build a wall two columns ahead of the standing column.
        world
            .terrain_mut()
            .add_hill(Position::new(column as f32 + 2.5, 150.0), 1);
        {
            let entity = world.entities_mut().get_mut(id).expect("entity");
            entity.data.position.y = 10.0; // embedded below the surface
            entity.data.velocity = Velocity::new(0.4, 0.0);
        }

        let mut player = Player::default();
        player.data.position.y = 500.0;
        let _ = world.detect(&mut player, &config, 10.0, &mut rng);

        let entity = world.entities().get(id).expect("entity");
        assert_eq!(entity.data.velocity.vx, 0.0, "wall must stop the walker");
        assert!(!entity.data.on_ground, "must not snap up the wall");
        assert!(entity.data.position.x < start_x, "must be displaced back");
    }

    #[test]
    fn gravity_integrates_down_to_terminal_velocity() {
        let config = WorldConfig::default();
        let mut world = test_world(100, 10);
        let mut rng = seeded(10);
        let id = world.add_npc(Position::new(0.0, 4_000.0));
        let mut player = Player::default();
        player.data.position.y = 500.0;

        for _ in 0..50 {
            let _ = world.detect(&mut player, &config, 50.0, &mut rng);
        }
        let entity = world.entities().get(id).expect("entity");
        assert!(entity.data.velocity.vy <= 0.0);
        assert!(entity.data.velocity.vy >= config.terminal_velocity - config.gravity * 50.0);
    }

    #[test]
    fn structures_are_always_pinned() {
        let mut world = test_world(100, 11);
        let config = WorldConfig::default();
        let mut rng = seeded(11);
        let id = world.add_structure(
            StructureKind::House,
            Position::new(0.0, 5_000.0),
            "house1.png",
            None,
        );
        let mut player = Player::default();
        player.data.position.y = 500.0;
        let _ = world.detect(&mut player, &config, 10.0, &mut rng);

        let entity = world.entities().get(id).expect("entity");
        let column = world
            .terrain()
            .column_index(entity.data.position.x, entity.data.width);
        assert_eq!(entity.data.position.y, world.terrain().ground_height(column));
        assert!(entity.data.on_ground);
    }

    #[test]
    fn horizontal_bounds_clamp_and_zero_velocity() {
        let mut world = test_world(100, 12);
        let config = WorldConfig::default();
        let mut rng = seeded(12);
        let start = world.terrain().world_start();

        let id = world.add_npc(Position::new(start - 50.0, 200.0));
        {
            let entity = world.entities_mut().get_mut(id).expect("entity");
            entity.data.velocity.vx = -1.0;
        }
        let mut player = Player::default();
        player.data.position.y = 500.0;
        let _ = world.detect(&mut player, &config, 10.0, &mut rng);
        {
            let entity = world.entities().get(id).expect("entity");
            assert_eq!(entity.data.velocity.vx, 0.0);
            assert_eq!(entity.data.position.x, start + HLINE / 2.0);
        }

        {
            let entity = world.entities_mut().get_mut(id).expect("entity");
            entity.data.position.x = -start + 50.0;
            entity.data.velocity.vx = 1.0;
        }
        let _ = world.detect(&mut player, &config, 10.0, &mut rng);
        let entity = world.entities().get(id).expect("entity");
        assert_eq!(entity.data.velocity.vx, 0.0);
        assert_eq!(
            entity.data.position.x,
            -start - entity.data.width - HLINE
        );
    }

    #[test]
    fn trigger_mobs_skip_physics() {
        let mut world = test_world(100, 13);
        let config = WorldConfig::default();
        let mut rng = seeded(13);
        let id = world.add_mob(MobKind::Trigger, Position::new(0.0, 400.0));
        {
            let entity = world.entities_mut().get_mut(id).expect("entity");
            if let EntityKind::Mob(mob) = &mut entity.kind {
                mob.trigger_id = Some("cutscene_1".into());
            }
        }
        let mut player = Player::default();
        player.data.position.y = 500.0;
        let _ = world.detect(&mut player, &config, 10.0, &mut rng);
        let entity = world.entities().get(id).expect("entity");
        assert_eq!(entity.data.position.y, 400.0);
        assert_eq!(entity.data.velocity.vy, 0.0);
    }

    #[test]
    fn dead_entities_are_removed_after_the_pass() {
        let mut world = test_world(100, 14);
        let config = WorldConfig::default();
        let mut rng = seeded(14);
        let doomed = world.add_mob(MobKind::Rabbit, Position::new(0.0, 200.0));
        let survivor = world.add_npc(Position::new(20.0, 200.0));
        world
            .entities_mut()
            .get_mut(doomed)
            .expect("entity")
            .data
            .health = 0.0;

        let mut player = Player::default();
        player.data.position.y = 500.0;
        let summary = world.detect(&mut player, &config, 10.0, &mut rng);
        assert_eq!(summary.outcome, SimOutcome::Alive);
        assert_eq!(summary.deaths, 1);
        assert!(!world.entities().contains(doomed));
        assert!(world.entities().contains(survivor));
        assert!(world.entities().mobs().is_empty());
    }

    #[test]
    fn player_death_reports_game_over() {
        let mut world = test_world(100, 15);
        let config = WorldConfig::default();
        let mut rng = seeded(15);
        let mut player = Player::default();
        player.data.health = 0.0;
        player.data.position.y = 500.0;
        let summary = world.detect(&mut player, &config, 10.0, &mut rng);
        assert_eq!(summary.outcome, SimOutcome::GameOver);
        assert!(!player.data.alive);
    }

    #[test]
    fn falling_through_a_pit_is_fatal() {
        let mut world = test_world(100, 16);
        let config = WorldConfig::default();
        let mut rng = seeded(16);
        let count = world.terrain().line_count();
        world.terrain_mut().add_hole(0, count);

        let mut player = Player::default();
        player.data.position.y = 50.0;
        player.data.velocity.vy = -1.0;
        let mut outcome = SimOutcome::Alive;
        for _ in 0..200 {
            let _ = world.update(&mut player, &config, 50.0, &mut rng);
            outcome = world.detect(&mut player, &config, 50.0, &mut rng).outcome;
            if outcome == SimOutcome::GameOver {
                break;
            }
        }
        assert_eq!(outcome, SimOutcome::GameOver);
    }

    #[test]
    fn particle_lives_exactly_its_duration() {
        let mut world = test_world(100, 17);
        let config = WorldConfig::default();
        let mut rng = seeded(17);
        world.add_particle(
            Position::new(0.0, 300.0),
            Velocity::default(),
            HLINE,
            HLINE,
            [255, 255, 255],
            50.0 * 4.0,
            false,
            false,
        );
        let mut player = Player::default();
        player.data.position.y = 500.0;

        for tick in 0..4 {
            assert_eq!(world.particles().len(), 1, "missing at tick {tick}");
            let _ = world.update(&mut player, &config, 50.0, &mut rng);
        }
        assert!(world.particles().is_empty(), "must expire at duration");
    }

    #[test]
    fn fountain_basin_culls_crossing_particles() {
        let mut world = test_world(100, 18);
        let config = WorldConfig::default();
        let mut rng = seeded(18);
        let fountain = world.add_structure(
            StructureKind::Fountain,
            Position::new(0.0, 80.0),
            "fountain1.png",
            None,
        );
        let (pos, width) = {
            let entity = world.entities().get(fountain).expect("entity");
            (entity.data.position, entity.data.width)
        };
        // A droplet inside the basin's horizontal extent, below the band.
        world.add_particle(
            Position::new(pos.x + width / 2.0, pos.y),
            Velocity::new(0.0, -0.1),
            HLINE,
            HLINE,
            [0, 0, 255],
            100_000.0,
            false,
            false,
        );
        let mut player = Player::default();
        player.data.position.y = 500.0;
        let _ = world.update(&mut player, &config, 50.0, &mut rng);
        assert!(world.particles().is_empty());
    }

    #[test]
    fn fountain_emits_bounded_bursts() {
        let mut world = test_world(100, 19);
        let config = WorldConfig::default();
        let mut rng = seeded(19);
        world.add_structure(
            StructureKind::Fountain,
            Position::new(0.0, 80.0),
            "fountain1.png",
            None,
        );
        let mut player = Player::default();
        player.data.position.y = 500.0;
        let _ = world.detect(&mut player, &config, 10.0, &mut rng);
        let count = world.particles().len();
        assert!((10..35).contains(&count), "burst of {count} out of range");
        assert!(world.particles().iter().all(|p| p.color == [0, 0, 255]));
    }

    #[test]
    fn particle_cap_is_enforced() {
        let mut world = test_world(100, 20);
        let config = WorldConfig {
            max_particles: 16,
            ..WorldConfig::default()
        };
        let mut rng = seeded(20);
        world.add_structure(
            StructureKind::Fountain,
            Position::new(0.0, 80.0),
            "fountain1.png",
            None,
        );
        let mut player = Player::default();
        player.data.position.y = 500.0;
        for _ in 0..10 {
            let _ = world.detect(&mut player, &config, 10.0, &mut rng);
        }
        assert!(world.particles().len() <= 16);
    }

    #[test]
    fn village_welcome_fires_once_per_entry() {
        let mut world = test_world(100, 21);
        let config = WorldConfig::default();
        let mut rng = seeded(21);
        world.add_village(Village {
            name: "Gladeholm".into(),
            start_x: -50.0,
            end_x: 50.0,
            inside: false,
        });

        let mut player = Player::default();
        player.data.position = Position::new(-200.0, 500.0);
        let events = world.update(&mut player, &config, 10.0, &mut rng);
        assert_eq!(events.village_entered, None);

        player.data.position.x = 0.0;
        let events = world.update(&mut player, &config, 10.0, &mut rng);
        assert_eq!(events.village_entered.as_deref(), Some("Gladeholm"));

        let events = world.update(&mut player, &config, 10.0, &mut rng);
        assert_eq!(events.village_entered, None, "welcome is one-shot");

        player.data.position.x = -200.0;
        let _ = world.update(&mut player, &config, 10.0, &mut rng);
        player.data.position.x = 0.0;
        let events = world.update(&mut player, &config, 10.0, &mut rng);
        assert_eq!(
            events.village_entered.as_deref(),
            Some("Gladeholm"),
            "re-entry fires again"
        );
    }

    #[test]
    fn nearest_queries_prefer_the_closest() {
        let mut world = test_world(200, 22);
        let config = WorldConfig::default();
        let near = world.add_npc(Position::new(10.0, 100.0));
        let _far = world.add_npc(Position::new(200.0, 100.0));
        let near_mob = world.add_mob(MobKind::Rabbit, Position::new(-5.0, 100.0));
        let _far_mob = world.add_mob(MobKind::Bird, Position::new(150.0, 100.0));

        let origin = Position::new(0.0, 100.0);
        assert_eq!(world.nearest_interactable(origin, &config), Some(near));
        assert_eq!(world.nearest_mob(origin), Some(near_mob));
    }

    #[test]
    fn interactable_query_respects_radius() {
        let mut world = test_world(400, 23);
        let config = WorldConfig {
            interact_radius: hlines(2.0),
            ..WorldConfig::default()
        };
        world.add_npc(Position::new(300.0, 100.0));
        assert_eq!(
            world.nearest_interactable(Position::new(0.0, 100.0), &config),
            None
        );
    }

    #[test]
    fn music_cue_crossfades_only_on_track_change() {
        let mut rng = seeded(24);
        let mut a = World::generate("a.xml", 50, &mut rng).expect("world");
        let mut b = World::generate("b.xml", 50, &mut rng).expect("world");
        a.set_style(WorldStyle::new("", BackgroundTheme::Forest, Some("forest.wav".into())));
        b.set_style(WorldStyle::new("", BackgroundTheme::Forest, Some("forest.wav".into())));

        assert_eq!(
            a.music_cue(None),
            Some(MusicCue::Start("forest.wav".into()))
        );
        assert_eq!(b.music_cue(Some(&a)), None, "same track keeps playing");

        b.set_style(WorldStyle::new("", BackgroundTheme::Forest, Some("town.wav".into())));
        assert_eq!(
            b.music_cue(Some(&a)),
            Some(MusicCue::Crossfade("town.wav".into()))
        );
    }

    #[test]
    fn grass_flattens_under_grounded_player() {
        let mut world = test_world(100, 25);
        let config = WorldConfig::default();
        let mut rng = seeded(25);
        let mut player = Player::default();
        // Put the player just below the surface so detect snaps and grounds.
        let column = world.terrain().column_index(0.0, player.data.width);
        player.data.position = Position::new(0.0, world.terrain().ground_height(column) - 1.0);
        let _ = world.detect(&mut player, &config, 10.0, &mut rng);
        assert!(player.data.on_ground);
        let _ = world.detect(&mut player, &config, 10.0, &mut rng);

        let columns = world.terrain().columns();
        assert!(!columns[column].grass_upright, "pressed under the player");
        assert!(columns[column + 20].grass_upright, "untouched further away");
    }

    #[test]
    fn weather_turns_dark_at_night() {
        let mut world = test_world(100, 26);
        let config = WorldConfig {
            day_cycle_ticks: 10,
            weather_roll_interval: 1_000_000,
            ..WorldConfig::default()
        };
        let mut rng = seeded(26);
        let mut player = Player::default();
        player.data.position.y = 500.0;
        for _ in 0..6 {
            let _ = world.update(&mut player, &config, 10.0, &mut rng);
        }
        assert_eq!(world.weather(), Weather::Dark);
        for _ in 0..5 {
            let _ = world.update(&mut player, &config, 10.0, &mut rng);
        }
        assert_eq!(world.weather(), Weather::Sunny);
    }

    #[test]
    fn unknown_background_theme_is_fatal() {
        assert_eq!(
            WorldStyle::from_ids("", 9, None).unwrap_err(),
            WorldError::UnknownBackground(9)
        );
    }

    #[test]
    fn config_validation_catches_bad_values() {
        let mut config = WorldConfig::default();
        assert!(config.validate().is_ok());
        config.gravity = 0.0;
        assert!(config.validate().is_err());
        config = WorldConfig {
            terminal_velocity: 1.0,
            ..WorldConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn lamp_posts_register_a_light() {
        let mut world = test_world(100, 27);
        world.add_structure(
            StructureKind::LampPost,
            Position::new(0.0, 80.0),
            "lampPost1.png",
            None,
        );
        assert_eq!(world.lights().len(), 1);
    }

    #[test]
    fn light_cap_is_respected() {
        let mut world = test_world(100, 28);
        for i in 0..(MAX_LIGHTS + 10) {
            world.add_light(Position::new(i as f32, 100.0), [255, 255, 255]);
        }
        assert_eq!(world.lights().len(), MAX_LIGHTS);
    }
}
