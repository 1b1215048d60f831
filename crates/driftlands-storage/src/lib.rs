//! World save-file persistence.
//!
//! Worlds persist their mutable entity state to a plain-text sidecar next to
//! the world description: one integer-truncated field per line, in fixed
//! iteration order (NPCs, then structures, then mobs), sealed by a literal
//! `dOnE` line. The format is order-dependent on disk, so this crate models
//! it internally as an ordered list of typed records and only flattens to
//! bare fields at the file boundary. Terrain and static layout are never
//! saved; they are rebuilt from the description, and the sidecar only
//! restores what the player changed.

use driftlands_core::{EntityKind, World};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Final line of every save file; reading stops here.
pub const END_SENTINEL: &str = "dOnE";

/// Errors raised while reading or writing save files. Short or malformed
/// content is deliberately not an error (partial-success contract); only the
/// filesystem can fail.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("save io failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One persisted entity fact. Fields carry the format's truncated-integer
/// precision; fractional position is lost by design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveRecord {
    /// NPC dialog progress and position.
    Npc { dialog_index: i32, x: i32, y: i32 },
    /// Structure position.
    Structure { x: i32, y: i32 },
    /// Mob position and liveness.
    Mob { x: i32, y: i32, alive: bool },
}

/// Entity counts that shape a save file. The on-disk format is untyped, so
/// decoding needs the counts of the world the file was written against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveSchema {
    pub npcs: usize,
    pub structures: usize,
    pub mobs: usize,
}

impl SaveSchema {
    /// The schema a save of `world` would follow right now.
    #[must_use]
    pub fn of(world: &World) -> Self {
        let arena = world.entities();
        Self {
            npcs: arena.npcs().len(),
            structures: arena.structures().len(),
            mobs: arena.mobs().len(),
        }
    }
}

/// Counts from applying decoded records onto a live world.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreStats {
    /// Records matched to a live entity and applied.
    pub applied: usize,
    /// Records with no matching entity, skipped.
    pub skipped: usize,
}

/// Sidecar save path for a world: the description path plus `.dat`.
#[must_use]
pub fn save_path(world_id: &str) -> PathBuf {
    PathBuf::from(format!("{world_id}.dat"))
}

/// Capture the mutable state of a world's entities, in typed-list order:
/// NPCs first, then structures, then mobs. Coordinates truncate toward zero.
#[must_use]
pub fn snapshot(world: &World) -> Vec<SaveRecord> {
    let arena = world.entities();
    let mut records = Vec::with_capacity(
        arena.npcs().len() + arena.structures().len() + arena.mobs().len(),
    );
    for &id in arena.npcs() {
        if let Some(entity) = arena.get(id) {
            let dialog_index = match &entity.kind {
                EntityKind::Npc(npc) => npc.dialog_index,
                _ => 0,
            };
            records.push(SaveRecord::Npc {
                dialog_index,
                x: entity.data.position.x as i32,
                y: entity.data.position.y as i32,
            });
        }
    }
    for &id in arena.structures() {
        if let Some(entity) = arena.get(id) {
            records.push(SaveRecord::Structure {
                x: entity.data.position.x as i32,
                y: entity.data.position.y as i32,
            });
        }
    }
    for &id in arena.mobs() {
        if let Some(entity) = arena.get(id) {
            records.push(SaveRecord::Mob {
                x: entity.data.position.x as i32,
                y: entity.data.position.y as i32,
                alive: entity.data.alive,
            });
        }
    }
    records
}

/// Flatten records into the line-per-field text format.
#[must_use]
pub fn encode(records: &[SaveRecord]) -> String {
    let mut out = String::new();
    for record in records {
        match *record {
            SaveRecord::Npc { dialog_index, x, y } => {
                let _ = writeln!(out, "{dialog_index}\n{x}\n{y}");
            }
            SaveRecord::Structure { x, y } => {
                let _ = writeln!(out, "{x}\n{y}");
            }
            SaveRecord::Mob { x, y, alive } => {
                let _ = writeln!(out, "{x}\n{y}\n{}", i32::from(alive));
            }
        }
    }
    out.push_str(END_SENTINEL);
    out.push('\n');
    out
}

/// Parse the text format back into records, shaped by `schema`.
///
/// Reading stops silently at the sentinel, at end of input, or at the first
/// malformed line; whatever parsed before that point is returned. A stale or
/// short file degrades to a partial restore rather than an error.
#[must_use]
pub fn decode(text: &str, schema: SaveSchema) -> Vec<SaveRecord> {
    let mut fields = text.lines().map(str::trim);
    let mut next = || -> Option<i32> {
        let line = fields.next()?;
        if line == END_SENTINEL {
            return None;
        }
        line.parse().ok()
    };

    let mut records = Vec::new();
    for _ in 0..schema.npcs {
        let (Some(dialog_index), Some(x), Some(y)) = (next(), next(), next()) else {
            return records;
        };
        records.push(SaveRecord::Npc { dialog_index, x, y });
    }
    for _ in 0..schema.structures {
        let (Some(x), Some(y)) = (next(), next()) else {
            return records;
        };
        records.push(SaveRecord::Structure { x, y });
    }
    for _ in 0..schema.mobs {
        let (Some(x), Some(y), Some(alive)) = (next(), next(), next()) else {
            return records;
        };
        records.push(SaveRecord::Mob {
            x,
            y,
            alive: alive != 0,
        });
    }
    records
}

/// Apply records back onto a freshly loaded world.
///
/// Records pair up with the world's typed lists in order. Excess records
/// (written against a larger world) are skipped; a short record list leaves
/// the remaining entities at their description defaults. Load never creates
/// or removes entities.
pub fn restore(world: &mut World, records: &[SaveRecord]) -> RestoreStats {
    let mut stats = RestoreStats::default();
    let mut npc_cursor = 0usize;
    let mut structure_cursor = 0usize;
    let mut mob_cursor = 0usize;

    for record in records {
        let arena = world.entities_mut();
        let applied = match *record {
            SaveRecord::Npc { dialog_index, x, y } => {
                let id = arena.npcs().get(npc_cursor).copied();
                npc_cursor += 1;
                id.and_then(|id| arena.get_mut(id)).map(|entity| {
                    entity.data.position.x = x as f32;
                    entity.data.position.y = y as f32;
                    if let EntityKind::Npc(npc) = &mut entity.kind {
                        npc.dialog_index = dialog_index;
                    }
                })
            }
            SaveRecord::Structure { x, y } => {
                let id = arena.structures().get(structure_cursor).copied();
                structure_cursor += 1;
                id.and_then(|id| arena.get_mut(id)).map(|entity| {
                    entity.data.position.x = x as f32;
                    entity.data.position.y = y as f32;
                })
            }
            SaveRecord::Mob { x, y, alive } => {
                let id = arena.mobs().get(mob_cursor).copied();
                mob_cursor += 1;
                id.and_then(|id| arena.get_mut(id)).map(|entity| {
                    entity.data.position.x = x as f32;
                    entity.data.position.y = y as f32;
                    entity.data.alive = alive;
                })
            }
        };
        match applied {
            Some(()) => stats.applied += 1,
            None => stats.skipped += 1,
        }
    }
    if stats.skipped > 0 {
        warn!(
            world = world.id(),
            skipped = stats.skipped,
            "stale save records ignored"
        );
    }
    stats
}

/// Persist a world's entity state next to its description file.
pub fn save_world(world: &World) -> Result<PathBuf, StorageError> {
    let path = save_path(world.id());
    save_world_to(world, &path)?;
    Ok(path)
}

/// As [`save_world`], writing to an explicit path.
pub fn save_world_to(world: &World, path: &Path) -> Result<(), StorageError> {
    let records = snapshot(world);
    fs::write(path, encode(&records))?;
    debug!(world = world.id(), records = records.len(), "world saved");
    Ok(())
}

/// Restore a world's entity state from its sidecar, if one exists.
///
/// A missing sidecar is not an error; it just means the world has never
/// been visited before.
pub fn load_world(world: &mut World) -> Result<Option<RestoreStats>, StorageError> {
    let path = save_path(world.id());
    load_world_from(world, &path)
}

/// As [`load_world`], reading from an explicit path.
pub fn load_world_from(
    world: &mut World,
    path: &Path,
) -> Result<Option<RestoreStats>, StorageError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let records = decode(&text, SaveSchema::of(world));
    let stats = restore(world, &records);
    debug!(
        world = world.id(),
        applied = stats.applied,
        skipped = stats.skipped,
        "world restored"
    );
    Ok(Some(stats))
}
