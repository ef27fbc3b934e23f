use foxhare_core::{
    Cell, Direction, EntityKind, FoxMode, HareMode, SimConfig, Species, TerrainGrid, World,
};

fn base_config() -> SimConfig {
    SimConfig {
        width: 30,
        height: 30,
        rng_seed: Some(0xDEAD_BEEF),
        ..SimConfig::default()
    }
}

fn forest_strip(width: u32, height: u32) -> TerrainGrid {
    let mut forest = Vec::new();
    for y in 0..height as i32 {
        for x in (2 * width as i32 / 3)..width as i32 {
            forest.push(Cell::new(x, y));
        }
    }
    TerrainGrid::with_forest(width, height, &forest).expect("terrain")
}

#[test]
fn seeded_worlds_advance_identically() {
    let config = SimConfig {
        iterations: 60,
        ..base_config()
    };
    let mut world_a = World::with_terrain(config.clone(), forest_strip(30, 30)).expect("world_a");
    let mut world_b = World::with_terrain(config, forest_strip(30, 30)).expect("world_b");
    world_a.populate().expect("populate a");
    world_b.populate().expect("populate b");

    for _ in 0..60 {
        world_a.step();
        world_b.step();
    }

    let history_a: Vec<_> = world_a.history().cloned().collect();
    let history_b: Vec<_> = world_b.history().cloned().collect();
    assert_eq!(history_a, history_b);
    assert_eq!(world_a.snapshot_entities(), world_b.snapshot_entities());
}

#[test]
fn populate_requires_forest_for_fox_habitats() {
    let config = SimConfig {
        fox_habitats: 2,
        ..base_config()
    };
    let mut world = World::new(config).expect("world");
    assert!(world.populate().is_err(), "all-meadow terrain cannot host fox habitats");
}

#[test]
fn habitat_spawns_litters_on_a_fixed_cadence() {
    let config = SimConfig {
        hare_mating_season: 10,
        hare_mating_range: (3, 5),
        ..base_config()
    };
    let mut world = World::new(config).expect("world");
    let habitat = world.spawn_hare_habitat(Cell::new(5, 5)).expect("habitat");

    for _ in 0..9 {
        world.step();
    }
    assert_eq!(world.population().hares, 0, "no litter before the season ends");

    world.step();
    let first_litter = world.population().hares;
    assert!(
        (3..5).contains(&first_litter),
        "litter size drawn from [3, 5), got {first_litter}"
    );
    match world.entity(habitat) {
        Some(EntityKind::HareHabitat(h)) => assert_eq!(h.countdown, 10, "countdown resets, never drifts"),
        other => panic!("expected habitat, got {other:?}"),
    }

    for _ in 0..10 {
        world.step();
    }
    let second_litter = world.population().hares - first_litter;
    assert!(
        (3..5).contains(&second_litter),
        "second litter arrives exactly one season later, got {second_litter}"
    );
}

#[test]
fn entities_spawned_mid_tick_first_act_next_tick() {
    let config = SimConfig {
        hare_mating_season: 10,
        hare_mating_range: (2, 3),
        ..base_config()
    };
    let mut world = World::new(config.clone()).expect("world");
    world.spawn_hare_habitat(Cell::new(5, 5)).expect("habitat");

    for _ in 0..10 {
        world.step();
    }
    assert_eq!(world.population().hares, 2);
    for (_, kind) in world.iter_entities() {
        if let EntityKind::Hare(h) = kind {
            assert_eq!(
                h.lifetime, config.hare_lifetime,
                "a litter spawned this tick has not been stepped yet"
            );
        }
    }

    world.step();
    for (_, kind) in world.iter_entities() {
        if let EntityKind::Hare(h) = kind {
            assert_eq!(h.lifetime, config.hare_lifetime - 1);
        }
    }
}

#[test]
fn focused_fox_sprints_inside_attack_range_and_sneaks_beyond_it() {
    // Attack case: Chebyshev distance 3 with attack_range 3.
    let mut world = World::new(base_config()).expect("world");
    let fox = world.spawn_fox(Cell::new(10, 10), true, None).expect("fox");
    let hare = world.spawn_hare(Cell::new(13, 13)).expect("hare");
    if let Some(EntityKind::Fox(f)) = world.entity_mut(fox) {
        f.target = Some(hare);
    }
    world.step();
    match world.entity(fox) {
        Some(EntityKind::Fox(f)) => assert_eq!(f.mode, FoxMode::Sprinting),
        other => panic!("expected fox, got {other:?}"),
    }
    assert!(!world.is_alive(hare), "the rush landed on the target's cell");

    // Sneak case: Chebyshev distance 4, inside view range 6.
    let mut world = World::new(base_config()).expect("world");
    let fox = world.spawn_fox(Cell::new(10, 10), true, None).expect("fox");
    let hare = world.spawn_hare(Cell::new(14, 14)).expect("hare");
    if let Some(EntityKind::Fox(f)) = world.entity_mut(fox) {
        f.target = Some(hare);
    }
    world.step();
    match world.entity(fox) {
        Some(EntityKind::Fox(f)) => {
            assert_eq!(f.mode, FoxMode::Sneaking);
            assert_eq!(f.target, Some(hare), "focus survives a stalking tick");
        }
        other => panic!("expected fox, got {other:?}"),
    }
    assert!(world.is_alive(hare));
}

#[test]
fn kill_surplus_is_banked_and_delivered_home() {
    let config = SimConfig {
        fox_consumption: 4,
        ..base_config()
    };
    let mut world = World::new(config).expect("world");
    let habitat = world.spawn_fox_habitat(Cell::new(9, 9)).expect("habitat");
    let fox = world
        .spawn_fox(Cell::new(10, 10), true, Some(habitat))
        .expect("fox");
    let hare = world.spawn_hare(Cell::new(12, 12)).expect("hare");
    if let Some(EntityKind::Fox(f)) = world.entity_mut(fox) {
        f.facing = Direction::NorthEast;
        f.target = Some(hare);
    }

    world.step();
    assert!(!world.is_alive(hare));
    match world.entity(fox) {
        Some(EntityKind::Fox(f)) => {
            assert_eq!(f.eaten, 4, "the counter caps at the weekly requirement");
            assert_eq!(f.leftovers, 1, "the kill surplus is banked");
            assert!(!f.hunting, "a sated fox turns for home");
        }
        other => panic!("expected fox, got {other:?}"),
    }

    // Walk home and deposit.
    for _ in 0..4 {
        world.step();
    }
    match world.entity(fox) {
        Some(EntityKind::Fox(f)) => {
            assert_eq!(f.leftovers, 0);
            assert!(f.hunting, "the delivery flips the fox back to hunting");
        }
        other => panic!("expected fox, got {other:?}"),
    }
    match world.entity(habitat) {
        Some(EntityKind::FoxHabitat(h)) => assert_eq!(h.storage, 1),
        other => panic!("expected habitat, got {other:?}"),
    }
}

#[test]
fn fox_reaches_a_visible_vaccine_and_gains_lifetime() {
    let mut world = World::new(base_config()).expect("world");
    let fox = world.spawn_fox(Cell::new(10, 10), true, None).expect("fox");
    let vaccine = world.spawn_vaccine(Cell::new(12, 10)).expect("vaccine");
    if let Some(EntityKind::Fox(f)) = world.entity_mut(fox) {
        f.facing = Direction::East;
    }

    world.step();
    assert!(!world.is_alive(vaccine), "the pickup is consumed on arrival");
    match world.entity(fox) {
        Some(EntityKind::Fox(f)) => {
            let expected = 160 - 1 + 15;
            assert_eq!(f.lifetime, expected, "effectiveness extends the lifetime");
        }
        other => panic!("expected fox, got {other:?}"),
    }
}

#[test]
fn juveniles_feed_from_storage_and_graduate_on_schedule() {
    let config = SimConfig {
        one_week: 5,
        fox_maturity_weeks: 1,
        fox_consumption: 4,
        ..base_config()
    };
    let mut world = World::new(config).expect("world");
    let habitat = world.spawn_fox_habitat(Cell::new(8, 8)).expect("habitat");
    if let Some(EntityKind::FoxHabitat(h)) = world.entity_mut(habitat) {
        h.storage = 10;
    }
    let cub = world
        .spawn_fox(Cell::new(8, 8), false, Some(habitat))
        .expect("cub");

    world.step();
    match world.entity(cub) {
        Some(EntityKind::Fox(f)) => {
            assert!(!f.adult);
            assert_eq!(f.eaten, 2, "juveniles draw at half the adult rate");
        }
        other => panic!("expected cub, got {other:?}"),
    }
    match world.entity(habitat) {
        Some(EntityKind::FoxHabitat(h)) => assert_eq!(h.storage, 8),
        other => panic!("expected habitat, got {other:?}"),
    }

    // The juvenile week is judged at the juvenile rate, then the cub
    // graduates and starts hunting.
    for _ in 0..4 {
        world.step();
    }
    match world.entity(cub) {
        Some(EntityKind::Fox(f)) => {
            assert!(f.adult);
            assert!(f.hunting);
            assert_eq!(f.eaten, 0, "the weekly check reset the counter");
        }
        other => panic!("expected adult fox, got {other:?}"),
    }
}

#[test]
fn hare_freezes_at_mid_distance_and_sprints_up_close() {
    // Freeze: the fox sits beyond sprint range but within the startle range.
    let mut world = World::new(base_config()).expect("world");
    let hare = world.spawn_hare(Cell::new(10, 10)).expect("hare");
    world.spawn_fox(Cell::new(15, 15), true, None).expect("fox");
    if let Some(EntityKind::Hare(h)) = world.entity_mut(hare) {
        h.facing = Direction::NorthEast;
    }
    world.step();
    match world.entity(hare) {
        Some(EntityKind::Hare(h)) => assert_eq!(h.mode, HareMode::NoMovement),
        other => panic!("expected hare, got {other:?}"),
    }
    assert_eq!(
        world.position_of(hare),
        Some(Cell::new(10, 10)),
        "a frozen hare does not move"
    );

    // Sprint: the fox closes to within sprint_distance.
    let mut world = World::new(base_config()).expect("world");
    let hare = world.spawn_hare(Cell::new(10, 10)).expect("hare");
    let fox = world.spawn_fox(Cell::new(14, 10), true, None).expect("fox");
    if let Some(EntityKind::Hare(h)) = world.entity_mut(hare) {
        h.facing = Direction::East;
    }
    world.step();
    match world.entity(hare) {
        Some(EntityKind::Hare(h)) => assert_eq!(h.mode, HareMode::Sprinting),
        other => panic!("expected hare, got {other:?}"),
    }
    let fled_to = world.position_of(hare).expect("hare placed");
    let fox_cell = world.position_of(fox).expect("fox placed");
    assert!(
        fled_to.euclidean(fox_cell) > Cell::new(10, 10).euclidean(Cell::new(14, 10)),
        "the sprint opened distance to the threat"
    );
}

#[test]
fn edge_wavefronts_widen_once_then_travel_straight() {
    let mut world = World::new(base_config()).expect("world");
    world
        .emit_sound(Cell::new(10, 10), 1, Direction::East, true, None)
        .expect("sound");

    world.step();
    let sounds: Vec<_> = world
        .snapshot_entities()
        .into_iter()
        .filter(|view| view.species == Species::Sound)
        .collect();
    assert_eq!(sounds.len(), 2, "the edge instance spawned one flanking copy");
    assert!(sounds.iter().any(|v| (v.x, v.y) == (11, 10)));
    assert!(sounds.iter().any(|v| (v.x, v.y) == (11, 11)));
    for view in &sounds {
        assert_eq!(view.sound_radius, Some(2));
        assert!((view.sound_force.unwrap() - 2.5).abs() < 1e-9);
    }

    world.step();
    let sounds: Vec<_> = world
        .snapshot_entities()
        .into_iter()
        .filter(|view| view.species == Species::Sound)
        .collect();
    assert_eq!(sounds.len(), 2, "non-edge instances never widen again");
    assert!(sounds.iter().any(|v| (v.x, v.y) == (12, 10)));
    assert!(sounds.iter().any(|v| (v.x, v.y) == (12, 11)));
}

#[test]
fn prowling_fox_emits_gait_noise_around_itself() {
    let mut world = World::new(base_config()).expect("world");
    world.spawn_fox(Cell::new(15, 15), true, None).expect("fox");
    world.step();
    let sounds = world
        .snapshot_entities()
        .into_iter()
        .filter(|view| view.species == Species::Sound)
        .count();
    assert_eq!(sounds, 8, "one wavefront per octant around the fox");
}

#[test]
fn factories_produce_on_their_configured_frequency() {
    let config = SimConfig {
        food_frequency: 4,
        food_amount: 6,
        vaccine_frequency: 5,
        vaccine_amount: 2,
        ..base_config()
    };
    let mut world = World::new(config).expect("world");
    world.spawn_food_factory();
    world.spawn_vaccine_factory();

    for _ in 0..3 {
        world.step();
    }
    let food = |world: &World| {
        world
            .iter_entities()
            .filter(|(_, kind)| matches!(kind, EntityKind::HareFood(_)))
            .count()
    };
    let vaccines = |world: &World| {
        world
            .iter_entities()
            .filter(|(_, kind)| matches!(kind, EntityKind::Vaccine(_)))
            .count()
    };
    assert_eq!(food(&world), 0);
    assert_eq!(vaccines(&world), 0);

    world.step();
    assert_eq!(food(&world), 6, "food batch lands on the fourth tick");
    world.step();
    assert_eq!(vaccines(&world), 2, "vaccine batch lands on the fifth tick");
}

#[test]
fn metrics_history_reports_population_counts() {
    let mut world = World::with_terrain(base_config(), forest_strip(30, 30)).expect("world");
    world.populate().expect("populate");
    let before = world.population();
    assert_eq!(before.hares, 10);
    assert_eq!(before.foxes, 3);

    world.step();
    let latest = world.history().last().cloned().expect("summary");
    assert_eq!(latest.tick.0, 1);
    assert!(latest.total >= latest.hares + latest.foxes);
}
