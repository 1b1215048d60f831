//! End-to-end save/restore against real world state on disk.

use driftlands_core::{EntityKind, MobKind, Position, StructureKind, TradeTable, World};
use driftlands_storage::{
    RestoreStats, SaveSchema, decode, encode, load_world_from, restore, save_path, save_world_to,
    snapshot,
};
use rand::{SeedableRng, rngs::SmallRng};
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_sidecar(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!(
        "driftlands-{label}-{}-{nanos}.dat",
        std::process::id()
    ))
}

fn populated_world(seed: u64) -> World {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut world = World::generate("town", 100, &mut rng).expect("world");
    world.add_npc(Position::new(-40.0, 90.0));
    world.add_merchant(Position::new(10.0, 90.0), TradeTable::default());
    world.add_structure(
        StructureKind::House,
        Position::new(60.0, 85.0),
        "house1.png",
        None,
    );
    world.add_mob(MobKind::Rabbit, Position::new(-10.0, 90.0));
    world
}

#[test]
fn snapshot_restore_roundtrips_at_integer_precision() {
    let mut world = populated_world(1);

    // Disturb everything a play session would disturb. Fractional parts are
    // expected to be shed by the format.
    {
        let arena = world.entities_mut();
        let npc = arena.npcs()[0];
        let entity = arena.get_mut(npc).expect("npc");
        entity.data.position = Position::new(-123.75, 77.25);
        if let EntityKind::Npc(npc) = &mut entity.kind {
            npc.dialog_index = 4;
        }
        let mob = arena.mobs()[0];
        arena.get_mut(mob).expect("mob").data.alive = false;
    }
    let records = snapshot(&world);

    // A fresh copy of the same world, as if the description were reloaded.
    let mut reloaded = populated_world(1);
    let stats = restore(&mut reloaded, &records);
    assert_eq!(
        stats,
        RestoreStats {
            applied: records.len(),
            skipped: 0
        }
    );

    let arena = reloaded.entities();
    let npc = arena.get(arena.npcs()[0]).expect("npc");
    assert_eq!(npc.data.position, Position::new(-123.0, 77.0));
    match &npc.kind {
        EntityKind::Npc(data) => assert_eq!(data.dialog_index, 4),
        other => panic!("expected npc, got {other:?}"),
    }
    let mob = arena.get(arena.mobs()[0]).expect("mob");
    assert!(!mob.data.alive);
}

#[test]
fn file_roundtrip_through_disk() {
    let world = populated_world(2);
    let records = snapshot(&world);
    let path = temp_sidecar("roundtrip");
    save_world_to(&world, &path).expect("save");

    let mut reloaded = populated_world(2);
    let stats = load_world_from(&mut reloaded, &path)
        .expect("load")
        .expect("sidecar present");
    assert_eq!(stats.applied, records.len());
    assert_eq!(snapshot(&reloaded), records);

    let _ = fs::remove_file(&path);
}

#[test]
fn missing_sidecar_is_not_an_error() {
    let mut world = populated_world(3);
    let path = temp_sidecar("missing");
    assert!(load_world_from(&mut world, &path).expect("load").is_none());
}

#[test]
fn stale_records_are_skipped_not_fatal() {
    // A save written against a larger world than the one being restored.
    let big = {
        let mut world = populated_world(4);
        world.add_mob(MobKind::Bird, Position::new(30.0, 95.0));
        world.add_mob(MobKind::Cat, Position::new(35.0, 95.0));
        world
    };
    let records = snapshot(&big);

    let mut small = populated_world(4);
    let stats = restore(&mut small, &records);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.applied, records.len() - 2);
}

#[test]
fn truncated_file_leaves_later_entities_at_defaults() {
    let mut world = populated_world(5);
    let before = snapshot(&world);
    // Seal the file after the first NPC record; everyone else keeps their
    // description defaults.
    let records = decode(&encode(&before[..1]), SaveSchema::of(&world));
    let stats = restore(&mut world, &records);
    assert_eq!(stats.applied, 1);
    assert_eq!(snapshot(&world)[1..], before[1..]);
}

#[test]
fn corrupt_sidecar_degrades_to_partial_restore() {
    let mut world = populated_world(6);
    let before = snapshot(&world);
    let path = temp_sidecar("corrupt");
    // First NPC record intact, then garbage.
    fs::write(&path, "4\n-9\n88\nnot-a-number\n1\ndOnE\n").expect("write");
    let stats = load_world_from(&mut world, &path)
        .expect("load")
        .expect("sidecar present");
    assert_eq!(stats.applied, 1);
    // The structure and mob were never touched.
    assert_eq!(snapshot(&world)[2..], before[2..]);
    let _ = fs::remove_file(&path);
}

#[test]
fn save_path_appends_dat_to_the_world_id() {
    assert_eq!(
        save_path("assets/world/town.xml"),
        PathBuf::from("assets/world/town.xml.dat")
    );
}
