//! Core engine for the fox/hare predation ecosystem.
//!
//! A bounded 2-D grid carries every live entity: animals (hares, foxes),
//! environmental fields (scent marks, propagating sound wavefronts),
//! consumables (plants, vaccines), and the spawner agents that replenish
//! them. A single-threaded scheduler steps every live entity exactly once
//! per tick in stable activation order, which keeps runs reproducible for a
//! fixed seed.

pub use foxhare_index::{Cell, GridError, OccupancyGrid};
use ordered_float::OrderedFloat;
use rand::seq::IndexedRandom;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use slotmap::{new_key_type, SlotMap};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for simulation entities backed by a generational slot map.
    ///
    /// A removed entity's handle never resolves again, so holding a stale
    /// `EntityId` (e.g. a fox's hunting focus after the hare died) is safe:
    /// every dereference goes through a liveness check.
    pub struct EntityId;
}

/// Acoustic force of a wavefront at radius 1.
pub const SOUND_BASE_FORCE: f64 = 10.0;
/// Force threshold below which a wavefront dissipates.
pub const SOUND_MIN_FORCE: f64 = 0.1;
/// Intensity threshold below which a scent mark evaporates completely.
pub const PHEROMONE_MIN_VALUE: f64 = 0.1;
/// Food units credited to a fox for a successful kill.
pub const KILL_NUTRITION: u32 = 5;

const SNEAK_SOUND_FORCE: f64 = 1.0;
const WALK_SOUND_FORCE: f64 = 10.0;
const SPRINT_SOUND_FORCE: f64 = 20.0;

/// High level simulation clock (ticks processed since boot).
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
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

/// One of the eight compass octants used for facing and sound travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

impl Direction {
    /// Every octant, in clockwise order starting from north.
    pub const ALL: [Direction; 8] = [
        Direction::North,
        Direction::NorthEast,
        Direction::East,
        Direction::SouthEast,
        Direction::South,
        Direction::SouthWest,
        Direction::West,
        Direction::NorthWest,
    ];

    /// Classify an arbitrary displacement into an octant.
    ///
    /// Components are reduced to their sign, so any non-zero displacement
    /// maps onto one of the eight facings. A zero displacement has no
    /// direction and yields `None` (callers leave facing unchanged).
    #[must_use]
    pub fn from_delta(dx: i32, dy: i32) -> Option<Direction> {
        match (dx.signum(), dy.signum()) {
            (0, 1) => Some(Direction::North),
            (1, 1) => Some(Direction::NorthEast),
            (1, 0) => Some(Direction::East),
            (1, -1) => Some(Direction::SouthEast),
            (0, -1) => Some(Direction::South),
            (-1, -1) => Some(Direction::SouthWest),
            (-1, 0) => Some(Direction::West),
            (-1, 1) => Some(Direction::NorthWest),
            _ => None,
        }
    }

    /// Facing angle in degrees, east = 0, counter-clockwise positive.
    #[must_use]
    pub const fn degrees(self) -> f64 {
        match self {
            Direction::East => 0.0,
            Direction::NorthEast => 45.0,
            Direction::North => 90.0,
            Direction::NorthWest => 135.0,
            Direction::West => 180.0,
            Direction::SouthWest => -135.0,
            Direction::South => -90.0,
            Direction::SouthEast => -45.0,
        }
    }

    /// Unit cell offset along this octant.
    #[must_use]
    pub const fn offset(self) -> (i32, i32) {
        match self {
            Direction::North => (0, 1),
            Direction::NorthEast => (1, 1),
            Direction::East => (1, 0),
            Direction::SouthEast => (1, -1),
            Direction::South => (0, -1),
            Direction::SouthWest => (-1, -1),
            Direction::West => (-1, 0),
            Direction::NorthWest => (-1, 1),
        }
    }

    /// Offset, relative to a wavefront's post-move cell, of the flanking cell
    /// an edge instance widens the front into.
    #[must_use]
    pub const fn flank_offset(self) -> (i32, i32) {
        match self {
            Direction::North => (-1, 0),
            Direction::East => (0, 1),
            Direction::South => (1, 0),
            Direction::West => (0, -1),
            Direction::NorthWest => (0, 1),
            Direction::NorthEast => (1, 0),
            Direction::SouthEast => (0, -1),
            Direction::SouthWest => (-1, 0),
        }
    }
}

/// Bearing from `from` to `to` in degrees, normalized into [0, 360).
///
/// A zero displacement yields bearing 0; callers that care exclude the
/// degenerate case before asking.
#[must_use]
pub fn bearing_degrees(from: Cell, to: Cell) -> f64 {
    let dx = f64::from(to.x - from.x);
    let dy = f64::from(to.y - from.y);
    dy.atan2(dx).to_degrees().rem_euclid(360.0)
}

/// Signed angular difference between a bearing and a facing, in [-180, 180).
#[must_use]
pub fn angle_difference(bearing: f64, facing: f64) -> f64 {
    (bearing - facing + 180.0).rem_euclid(360.0) - 180.0
}

/// Snap the direction from `from` toward `to` onto octant axes.
///
/// The unit vector toward the target is compared against fixed angular
/// thresholds (sin 22.5 deg / cos 67.5 deg) per axis, so diagonal versus
/// axis-aligned movement is chosen consistently. A zero vector snaps to
/// (0, 0): no direction.
fn octant_toward(from: Cell, to: Cell) -> (i32, i32) {
    let dx = f64::from(to.x - from.x);
    let dy = f64::from(to.y - from.y);
    let norm = (dx * dx + dy * dy).sqrt();
    if norm == 0.0 {
        return (0, 0);
    }
    let ux = dx / norm;
    let uy = dy / norm;
    let threshold = 22.5_f64.to_radians().sin();
    let sx = if ux > threshold {
        1
    } else if ux < -threshold {
        -1
    } else {
        0
    };
    let sy = if uy > threshold {
        1
    } else if uy < -threshold {
        -1
    } else {
        0
    };
    (sx, sy)
}

/// Species tag for grid occupants; the closed set of entity variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Species {
    Hare,
    Fox,
    Pheromone,
    Sound,
    HareFood,
    Vaccine,
    HareHabitat,
    FoxHabitat,
    HareFoodFactory,
    VaccineFactory,
}

/// Behavioral state of a hare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HareMode {
    Normal,
    Sprinting,
    NoMovement,
}

/// Behavioral state of a fox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FoxMode {
    Walking,
    Sneaking,
    Sprinting,
}

/// Grazing prey. Forages along quiet routes, freezes or sprints when a fox
/// enters its view cone, and marks its path with scent.
#[derive(Debug, Clone, PartialEq)]
pub struct Hare {
    pub lifetime: i64,
    pub consumption: u32,
    pub speed: u32,
    pub trace: f64,
    pub view_range: u32,
    pub view_angle: u32,
    pub facing: Direction,
    pub eaten: u32,
    pub hearing_range: u32,
    pub sprint_speed: u32,
    pub sprint_duration: u32,
    pub sprint_cooldown: u32,
    pub sprint_distance: u32,
    pub no_movement_distance: u32,
    pub no_movement_duration: u32,
    pub mode: HareMode,
    /// Ticks left in the current sprint or freeze.
    pub mode_ticks_left: u32,
    /// Ticks left before another sprint may trigger.
    pub cooldown_left: u32,
}

impl Hare {
    fn from_config(config: &SimConfig, facing: Direction) -> Self {
        Self {
            lifetime: config.hare_lifetime,
            consumption: config.hare_consumption,
            speed: config.hare_speed,
            trace: config.hare_trace,
            view_range: config.hare_view_range,
            view_angle: config.hare_view_angle,
            facing,
            eaten: 0,
            hearing_range: config.hare_hearing_range,
            sprint_speed: config.hare_sprint_speed,
            sprint_duration: config.hare_sprint_duration,
            sprint_cooldown: config.hare_sprint_cooldown,
            sprint_distance: config.hare_sprint_distance,
            no_movement_distance: config.hare_no_movement_distance,
            no_movement_duration: config.hare_no_movement_duration,
            mode: HareMode::Normal,
            mode_ticks_left: 0,
            cooldown_left: 0,
        }
    }
}

/// Hunting predator. Stalks hares by sight and scent, banks surplus kills as
/// leftovers for the juveniles back at its home habitat.
#[derive(Debug, Clone, PartialEq)]
pub struct Fox {
    pub lifetime: i64,
    pub consumption: u32,
    pub speed: u32,
    pub trace: f64,
    pub view_range: u32,
    pub view_angle: u32,
    pub facing: Direction,
    pub eaten: u32,
    pub smelling_range: u32,
    pub attack_range: u32,
    pub sprint_speed: u32,
    pub sneak_speed: u32,
    pub mode: FoxMode,
    /// Hunting, as opposed to hauling leftovers home.
    pub hunting: bool,
    /// Currently focused hare; liveness-checked before every use.
    pub target: Option<EntityId>,
    /// Home habitat; liveness-checked before every use.
    pub home: Option<EntityId>,
    pub leftovers: u32,
    pub adult: bool,
    /// Ticks since birth, for maturity accounting.
    pub age_ticks: u64,
}

impl Fox {
    fn from_config(config: &SimConfig, facing: Direction, adult: bool, home: Option<EntityId>) -> Self {
        Self {
            lifetime: config.fox_lifetime,
            consumption: config.fox_consumption,
            speed: config.fox_speed,
            trace: config.fox_trace,
            view_range: config.fox_view_range,
            view_angle: config.fox_view_angle,
            facing,
            eaten: 0,
            smelling_range: config.fox_smelling_range,
            attack_range: config.fox_attack_range,
            sprint_speed: config.fox_sprint_speed,
            sneak_speed: config.fox_sneak_speed,
            mode: FoxMode::Walking,
            hunting: adult,
            target: None,
            home,
            leftovers: 0,
            adult,
            age_ticks: 0,
        }
    }

    /// Weekly food requirement; juveniles consume at half the adult rate.
    #[must_use]
    pub fn weekly_requirement(&self) -> u32 {
        if self.adult {
            self.consumption
        } else {
            self.consumption.div_ceil(2)
        }
    }
}

/// Scent mark deposited by hares; evaporates and diffuses each tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Pheromone {
    pub value: f64,
    pub evaporation_rate: f64,
    pub diffusion_rate: f64,
}

/// One propagating unit of an expanding directional sound wavefront.
#[derive(Debug, Clone, PartialEq)]
pub struct Sound {
    pub radius: u32,
    pub force: f64,
    /// Travel direction, fixed at creation.
    pub direction: Direction,
    /// Whether this instance is the originating edge of its wavefront and
    /// still owes one perpendicular spawn.
    pub edge: bool,
}

/// Plant matter for hares. Consumed food stays inert on the grid until its
/// lifetime expires.
#[derive(Debug, Clone, PartialEq)]
pub struct HareFood {
    pub lifetime: i64,
    pub eaten: bool,
}

/// Lifetime bonus pickup for foxes.
#[derive(Debug, Clone, PartialEq)]
pub struct Vaccine {
    pub lifetime: i64,
    pub effectiveness: i64,
}

/// Hare spawn point; produces a litter every mating season.
#[derive(Debug, Clone, PartialEq)]
pub struct HareHabitat {
    pub countdown: u32,
    pub season: u32,
    pub litter_min: u32,
    pub litter_max: u32,
}

/// Fox spawn point; produces juvenile litters and stores the leftovers that
/// feed them.
#[derive(Debug, Clone, PartialEq)]
pub struct FoxHabitat {
    pub countdown: u32,
    pub season: u32,
    pub litter_min: u32,
    pub litter_max: u32,
    pub storage: u32,
}

/// Periodic producer of hare food on meadow cells.
#[derive(Debug, Clone, PartialEq)]
pub struct HareFoodFactory {
    pub batch: u32,
    pub frequency: u32,
    pub iteration: u32,
}

/// Periodic producer of vaccines on arbitrary cells.
#[derive(Debug, Clone, PartialEq)]
pub struct VaccineFactory {
    pub batch: u32,
    pub frequency: u32,
    pub iteration: u32,
}

/// Closed tagged variant over every grid occupant.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityKind {
    Hare(Hare),
    Fox(Fox),
    Pheromone(Pheromone),
    Sound(Sound),
    HareFood(HareFood),
    Vaccine(Vaccine),
    HareHabitat(HareHabitat),
    FoxHabitat(FoxHabitat),
    HareFoodFactory(HareFoodFactory),
    VaccineFactory(VaccineFactory),
}

impl EntityKind {
    /// The species tag of this variant.
    #[must_use]
    pub const fn species(&self) -> Species {
        match self {
            EntityKind::Hare(_) => Species::Hare,
            EntityKind::Fox(_) => Species::Fox,
            EntityKind::Pheromone(_) => Species::Pheromone,
            EntityKind::Sound(_) => Species::Sound,
            EntityKind::HareFood(_) => Species::HareFood,
            EntityKind::Vaccine(_) => Species::Vaccine,
            EntityKind::HareHabitat(_) => Species::HareHabitat,
            EntityKind::FoxHabitat(_) => Species::FoxHabitat,
            EntityKind::HareFoodFactory(_) => Species::HareFoodFactory,
            EntityKind::VaccineFactory(_) => Species::VaccineFactory,
        }
    }
}

/// Errors that can occur when constructing world state.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Static configuration for a simulation run.
///
/// A flat set of named numeric parameters, supplied at construction and
/// immutable thereafter. Defaults follow the original experiment's tuning
/// for a 20x20 grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Grid width in cells.
    pub width: u32,
    /// Grid height in cells.
    pub height: u32,
    /// Length of one week in ticks; cadence of the consumption checks.
    pub one_week: u32,
    /// Total ticks a full run executes.
    pub iterations: u64,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
    /// Hares placed at habitats during initial population.
    pub initial_hares: u32,
    /// Foxes placed at habitats during initial population.
    pub initial_foxes: u32,
    /// Hare habitats placed on meadow cells.
    pub hare_habitats: u32,
    /// Fox habitats placed on forest cells.
    pub fox_habitats: u32,
    /// Food instances placed during initial population.
    pub initial_food: u32,
    /// Food instances created per factory batch.
    pub food_amount: u32,
    /// Ticks between food factory batches.
    pub food_frequency: u32,
    /// Ticks a food instance persists.
    pub food_lifetime: i64,

    pub hare_lifetime: i64,
    pub hare_consumption: u32,
    pub hare_speed: u32,
    pub hare_trace: f64,
    pub hare_view_range: u32,
    pub hare_view_angle: u32,
    pub hare_hearing_range: u32,
    pub hare_sprint_speed: u32,
    pub hare_sprint_duration: u32,
    pub hare_sprint_cooldown: u32,
    pub hare_sprint_distance: u32,
    pub hare_no_movement_distance: u32,
    pub hare_no_movement_duration: u32,
    pub hare_mating_season: u32,
    /// Litter size range, min inclusive, max exclusive.
    pub hare_mating_range: (u32, u32),

    pub fox_lifetime: i64,
    pub fox_consumption: u32,
    pub fox_speed: u32,
    pub fox_trace: f64,
    pub fox_view_range: u32,
    pub fox_view_angle: u32,
    pub fox_smelling_range: u32,
    pub fox_attack_range: u32,
    pub fox_sprint_speed: u32,
    pub fox_sneak_speed: u32,
    pub fox_mating_season: u32,
    /// Litter size range, min inclusive, max exclusive.
    pub fox_mating_range: (u32, u32),
    /// Weeks before a juvenile fox graduates to adulthood.
    pub fox_maturity_weeks: u32,

    pub pheromone_evaporation_rate: f64,
    pub pheromone_diffusion_rate: f64,

    pub vaccine_amount: u32,
    pub vaccine_frequency: u32,
    pub vaccine_lifetime: i64,
    /// Lifetime bonus granted to the fox that reaches a vaccine.
    pub vaccine_effectiveness: i64,

    /// Maximum number of recent population summaries retained in memory.
    pub history_capacity: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            width: 20,
            height: 20,
            one_week: 70,
            iterations: 1_000,
            rng_seed: None,
            initial_hares: 10,
            initial_foxes: 3,
            hare_habitats: 3,
            fox_habitats: 2,
            initial_food: 25,
            food_amount: 25,
            food_frequency: 10,
            food_lifetime: 350,
            hare_lifetime: 200,
            hare_consumption: 5,
            hare_speed: 2,
            hare_trace: 1.0,
            hare_view_range: 5,
            hare_view_angle: 350,
            hare_hearing_range: 20,
            hare_sprint_speed: 4,
            hare_sprint_duration: 10,
            hare_sprint_cooldown: 20,
            hare_sprint_distance: 4,
            hare_no_movement_distance: 8,
            hare_no_movement_duration: 10,
            hare_mating_season: 100,
            hare_mating_range: (3, 5),
            fox_lifetime: 160,
            fox_consumption: 5,
            fox_speed: 2,
            fox_trace: 5.0,
            fox_view_range: 6,
            fox_view_angle: 135,
            fox_smelling_range: 10,
            fox_attack_range: 3,
            fox_sprint_speed: 3,
            fox_sneak_speed: 1,
            fox_mating_season: 365,
            fox_mating_range: (1, 11),
            fox_maturity_weeks: 2,
            pheromone_evaporation_rate: 0.1,
            pheromone_diffusion_rate: 0.1,
            vaccine_amount: 10,
            vaccine_frequency: 100,
            vaccine_lifetime: 50,
            vaccine_effectiveness: 15,
            history_capacity: 256,
        }
    }
}

impl SimConfig {
    /// Validates the configuration before any tick runs.
    pub fn validate(&self) -> Result<(), WorldError> {
        if self.width == 0 || self.height == 0 {
            return Err(WorldError::InvalidConfig("grid dimensions must be non-zero"));
        }
        if self.one_week == 0 {
            return Err(WorldError::InvalidConfig("one_week must be non-zero"));
        }
        if self.hare_view_angle == 0
            || self.hare_view_angle > 360
            || self.fox_view_angle == 0
            || self.fox_view_angle > 360
        {
            return Err(WorldError::InvalidConfig("view angles must lie in 1..=360"));
        }
        if self.hare_view_range == 0 || self.fox_view_range == 0 {
            return Err(WorldError::InvalidConfig("view ranges must be non-zero"));
        }
        if self.hare_speed == 0
            || self.hare_sprint_speed == 0
            || self.fox_speed == 0
            || self.fox_sprint_speed == 0
            || self.fox_sneak_speed == 0
        {
            return Err(WorldError::InvalidConfig("movement speeds must be non-zero"));
        }
        if self.hare_trace < 0.0 || self.fox_trace < 0.0 {
            return Err(WorldError::InvalidConfig("trace strengths must be non-negative"));
        }
        if self.hare_mating_range.0 >= self.hare_mating_range.1
            || self.fox_mating_range.0 >= self.fox_mating_range.1
        {
            return Err(WorldError::InvalidConfig(
                "mating ranges must be non-empty half-open intervals",
            ));
        }
        if self.hare_mating_season == 0 || self.fox_mating_season == 0 {
            return Err(WorldError::InvalidConfig("mating seasons must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.pheromone_evaporation_rate)
            || !(0.0..=1.0).contains(&self.pheromone_diffusion_rate)
        {
            return Err(WorldError::InvalidConfig(
                "pheromone rates must lie in [0, 1]",
            ));
        }
        if self.food_frequency == 0 || self.vaccine_frequency == 0 {
            return Err(WorldError::InvalidConfig("factory frequencies must be non-zero"));
        }
        if self.hare_lifetime <= 0
            || self.fox_lifetime <= 0
            || self.food_lifetime <= 0
            || self.vaccine_lifetime <= 0
        {
            return Err(WorldError::InvalidConfig("lifetimes must be positive"));
        }
        if self.vaccine_effectiveness < 0 {
            return Err(WorldError::InvalidConfig(
                "vaccine effectiveness must be non-negative",
            ));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig("history_capacity must be non-zero"));
        }
        Ok(())
    }

    /// Returns the configured RNG, generating a seed from entropy if absent.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Terrain classification of a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Terrain {
    Meadow,
    Forest,
}

/// Static terrain classification of the whole grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerrainGrid {
    width: u32,
    height: u32,
    cells: Vec<Terrain>,
}

impl TerrainGrid {
    /// An all-meadow terrain of the given dimensions.
    pub fn open_meadow(width: u32, height: u32) -> Result<Self, WorldError> {
        if width == 0 || height == 0 {
            return Err(WorldError::InvalidConfig(
                "terrain dimensions must be non-zero",
            ));
        }
        Ok(Self {
            width,
            height,
            cells: vec![Terrain::Meadow; (width as usize) * (height as usize)],
        })
    }

    /// A meadow terrain with the listed cells marked as forest.
    pub fn with_forest(width: u32, height: u32, forest: &[Cell]) -> Result<Self, WorldError> {
        let mut grid = Self::open_meadow(width, height)?;
        for &cell in forest {
            let idx = grid
                .index_of(cell)
                .ok_or(WorldError::InvalidConfig("forest cell outside the terrain"))?;
            grid.cells[idx] = Terrain::Forest;
        }
        Ok(grid)
    }

    fn index_of(&self, cell: Cell) -> Option<usize> {
        if cell.x < 0 || cell.y < 0 || cell.x >= self.width as i32 || cell.y >= self.height as i32 {
            return None;
        }
        Some((cell.y as usize) * (self.width as usize) + (cell.x as usize))
    }

    /// Terrain width in cells.
    #[must_use]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Terrain height in cells.
    #[must_use]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// The terrain at `cell`, if in bounds.
    #[must_use]
    pub fn get(&self, cell: Cell) -> Option<Terrain> {
        self.index_of(cell).map(|idx| self.cells[idx])
    }

    /// All cells carrying the given terrain, in row-major order.
    #[must_use]
    pub fn cells_matching(&self, terrain: Terrain) -> Vec<Cell> {
        let mut cells = Vec::new();
        for y in 0..self.height as i32 {
            for x in 0..self.width as i32 {
                let cell = Cell::new(x, y);
                if self.get(cell) == Some(terrain) {
                    cells.push(cell);
                }
            }
        }
        cells
    }
}

/// Per-tick population counts exposed to external collectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulationSummary {
    pub tick: Tick,
    pub hares: usize,
    pub foxes: usize,
    pub total: usize,
}

/// Display-relevant state of one entity, for external renderers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityView {
    pub species: Species,
    pub x: i32,
    pub y: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pheromone_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_radius: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_force: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub food_eaten: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hare_mode: Option<HareMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fox_mode: Option<FoxMode>,
}

/// Metrics sink invoked after each tick.
pub trait MetricsSink: Send {
    fn on_tick(&mut self, summary: &PopulationSummary);
}

/// No-op metrics sink.
#[derive(Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn on_tick(&mut self, _summary: &PopulationSummary) {}
}

/// Pick the candidate minimizing `score` lexicographically, breaking exact
/// ties uniformly at random.
fn choose_best_cell(
    rng: &mut SmallRng,
    candidates: &[Cell],
    score: impl Fn(Cell) -> (f64, f64),
) -> Option<Cell> {
    let mut best: Option<(OrderedFloat<f64>, OrderedFloat<f64>)> = None;
    for &cell in candidates {
        let (a, b) = score(cell);
        let key = (OrderedFloat(a), OrderedFloat(b));
        if best.is_none_or(|current| key < current) {
            best = Some(key);
        }
    }
    let best = best?;
    let ties: Vec<Cell> = candidates
        .iter()
        .copied()
        .filter(|&cell| {
            let (a, b) = score(cell);
            (OrderedFloat(a), OrderedFloat(b)) == best
        })
        .collect();
    ties.choose(rng).copied()
}

fn noise_at(noise: &HashMap<Cell, f64>, cell: Cell) -> f64 {
    noise.get(&cell).copied().unwrap_or(0.0)
}

const fn gait_force(mode: FoxMode) -> f64 {
    match mode {
        FoxMode::Sneaking => SNEAK_SOUND_FORCE,
        FoxMode::Walking => WALK_SOUND_FORCE,
        FoxMode::Sprinting => SPRINT_SOUND_FORCE,
    }
}

/// Aggregate world state: grid, entity store, scheduler roster, RNG, clock.
///
/// Exactly one `World` drives a run; behaviors receive it explicitly rather
/// than reaching for globals. Stepping is strictly single-threaded.
pub struct World {
    config: SimConfig,
    terrain: TerrainGrid,
    tick: Tick,
    rng: SmallRng,
    entities: SlotMap<EntityId, EntityKind>,
    /// Stable activation order; compacted (order preserved) after each tick.
    roster: Vec<EntityId>,
    grid: OccupancyGrid<EntityId>,
    meadow_cells: Vec<Cell>,
    forest_cells: Vec<Cell>,
    sink: Box<dyn MetricsSink>,
    history: VecDeque<PopulationSummary>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("tick", &self.tick)
            .field("entity_count", &self.entities.len())
            .field("width", &self.config.width)
            .field("height", &self.config.height)
            .finish()
    }
}

impl World {
    /// Instantiate a world on all-meadow terrain.
    pub fn new(config: SimConfig) -> Result<Self, WorldError> {
        let terrain = TerrainGrid::open_meadow(config.width, config.height)?;
        Self::with_sink(config, terrain, Box::new(NullSink))
    }

    /// Instantiate a world on the supplied terrain.
    pub fn with_terrain(config: SimConfig, terrain: TerrainGrid) -> Result<Self, WorldError> {
        Self::with_sink(config, terrain, Box::new(NullSink))
    }

    /// Instantiate a world with a metrics sink receiving per-tick summaries.
    pub fn with_sink(
        config: SimConfig,
        terrain: TerrainGrid,
        sink: Box<dyn MetricsSink>,
    ) -> Result<Self, WorldError> {
        config.validate()?;
        if terrain.width() != config.width || terrain.height() != config.height {
            return Err(WorldError::InvalidConfig(
                "terrain dimensions must match the configured grid",
            ));
        }
        let grid = OccupancyGrid::new(config.width, config.height)
            .map_err(|_| WorldError::InvalidConfig("grid dimensions must be non-zero"))?;
        let rng = config.seeded_rng();
        let meadow_cells = terrain.cells_matching(Terrain::Meadow);
        let forest_cells = terrain.cells_matching(Terrain::Forest);
        let history_capacity = config.history_capacity;
        Ok(Self {
            config,
            terrain,
            tick: Tick::zero(),
            rng,
            entities: SlotMap::with_key(),
            roster: Vec::new(),
            grid,
            meadow_cells,
            forest_cells,
            sink,
            history: VecDeque::with_capacity(history_capacity),
        })
    }

    /// Immutable access to the configuration.
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Immutable access to the terrain classification.
    #[must_use]
    pub fn terrain(&self) -> &TerrainGrid {
        &self.terrain
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Borrow the world RNG mutably for deterministic sampling.
    #[must_use]
    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Number of live entities of any species.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Whether `id` refers to a live entity.
    #[must_use]
    pub fn is_alive(&self, id: EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Borrow a live entity's state.
    #[must_use]
    pub fn entity(&self, id: EntityId) -> Option<&EntityKind> {
        self.entities.get(id)
    }

    /// Iterate over every live entity and its state.
    pub fn iter_entities(&self) -> impl Iterator<Item = (EntityId, &EntityKind)> {
        self.entities.iter()
    }

    /// Mutably borrow a live entity's state.
    #[must_use]
    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut EntityKind> {
        self.entities.get_mut(id)
    }

    /// The cell currently holding `id`, if it is placed on the grid.
    #[must_use]
    pub fn position_of(&self, id: EntityId) -> Option<Cell> {
        self.grid.position_of(id)
    }

    /// Read-only access to the occupancy grid.
    #[must_use]
    pub fn grid(&self) -> &OccupancyGrid<EntityId> {
        &self.grid
    }

    /// Iterate over retained population summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &PopulationSummary> {
        self.history.iter()
    }

    /// Current population counts.
    #[must_use]
    pub fn population(&self) -> PopulationSummary {
        let mut hares = 0;
        let mut foxes = 0;
        for kind in self.entities.values() {
            match kind {
                EntityKind::Hare(_) => hares += 1,
                EntityKind::Fox(_) => foxes += 1,
                _ => {}
            }
        }
        PopulationSummary {
            tick: self.tick,
            hares,
            foxes,
            total: self.entities.len(),
        }
    }

    /// Display-relevant state for every placed entity, in activation order.
    #[must_use]
    pub fn snapshot_entities(&self) -> Vec<EntityView> {
        let mut views = Vec::new();
        for &id in &self.roster {
            let kind = match self.entities.get(id) {
                Some(kind) => kind,
                None => continue,
            };
            let cell = match self.grid.position_of(id) {
                Some(cell) => cell,
                None => continue,
            };
            let mut view = EntityView {
                species: kind.species(),
                x: cell.x,
                y: cell.y,
                pheromone_value: None,
                sound_radius: None,
                sound_force: None,
                food_eaten: None,
                hare_mode: None,
                fox_mode: None,
            };
            match kind {
                EntityKind::Pheromone(p) => view.pheromone_value = Some(p.value),
                EntityKind::Sound(s) => {
                    view.sound_radius = Some(s.radius);
                    view.sound_force = Some(s.force);
                }
                EntityKind::HareFood(f) => view.food_eaten = Some(f.eaten),
                EntityKind::Hare(h) => view.hare_mode = Some(h.mode),
                EntityKind::Fox(f) => view.fox_mode = Some(f.mode),
                _ => {}
            }
            views.push(view);
        }
        views
    }

    // ---- lifecycle -------------------------------------------------------

    /// Register a new entity at `cell` with the grid and scheduler together.
    ///
    /// Out-of-bounds requests are declined, not errors.
    fn insert_entity(&mut self, kind: EntityKind, cell: Cell) -> Option<EntityId> {
        if !self.grid.contains(cell) {
            return None;
        }
        let id = self.entities.insert(kind);
        if self.grid.place(id, cell).is_err() {
            self.entities.remove(id);
            return None;
        }
        self.roster.push(id);
        Some(id)
    }

    /// Register a steppable entity that occupies no grid cell.
    fn insert_unplaced(&mut self, kind: EntityKind) -> EntityId {
        let id = self.entities.insert(kind);
        self.roster.push(id);
        id
    }

    /// Deregister an entity from the grid and scheduler together.
    pub fn remove_entity(&mut self, id: EntityId) -> bool {
        if self.entities.remove(id).is_some() {
            self.grid.remove(id);
            true
        } else {
            false
        }
    }

    fn random_facing(&mut self) -> Direction {
        Direction::ALL
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(Direction::North)
    }

    /// Spawn a hare at `cell` with configured parameters and random facing.
    pub fn spawn_hare(&mut self, cell: Cell) -> Option<EntityId> {
        let facing = self.random_facing();
        let hare = Hare::from_config(&self.config, facing);
        self.insert_entity(EntityKind::Hare(hare), cell)
    }

    /// Spawn a fox at `cell`. Juveniles do not hunt until maturity.
    pub fn spawn_fox(&mut self, cell: Cell, adult: bool, home: Option<EntityId>) -> Option<EntityId> {
        let facing = self.random_facing();
        let fox = Fox::from_config(&self.config, facing, adult, home);
        self.insert_entity(EntityKind::Fox(fox), cell)
    }

    /// Spawn a food instance at `cell`.
    pub fn spawn_food(&mut self, cell: Cell) -> Option<EntityId> {
        let food = HareFood {
            lifetime: self.config.food_lifetime,
            eaten: false,
        };
        self.insert_entity(EntityKind::HareFood(food), cell)
    }

    /// Spawn a vaccine at `cell`.
    pub fn spawn_vaccine(&mut self, cell: Cell) -> Option<EntityId> {
        let vaccine = Vaccine {
            lifetime: self.config.vaccine_lifetime,
            effectiveness: self.config.vaccine_effectiveness,
        };
        self.insert_entity(EntityKind::Vaccine(vaccine), cell)
    }

    /// Spawn a hare habitat at `cell`.
    pub fn spawn_hare_habitat(&mut self, cell: Cell) -> Option<EntityId> {
        let habitat = HareHabitat {
            countdown: self.config.hare_mating_season,
            season: self.config.hare_mating_season,
            litter_min: self.config.hare_mating_range.0,
            litter_max: self.config.hare_mating_range.1,
        };
        self.insert_entity(EntityKind::HareHabitat(habitat), cell)
    }

    /// Spawn a fox habitat at `cell`.
    pub fn spawn_fox_habitat(&mut self, cell: Cell) -> Option<EntityId> {
        let habitat = FoxHabitat {
            countdown: self.config.fox_mating_season,
            season: self.config.fox_mating_season,
            litter_min: self.config.fox_mating_range.0,
            litter_max: self.config.fox_mating_range.1,
            storage: 0,
        };
        self.insert_entity(EntityKind::FoxHabitat(habitat), cell)
    }

    /// Spawn the food factory. Factories are steppable but hold no cell.
    pub fn spawn_food_factory(&mut self) -> EntityId {
        let factory = HareFoodFactory {
            batch: self.config.food_amount,
            frequency: self.config.food_frequency,
            iteration: 0,
        };
        self.insert_unplaced(EntityKind::HareFoodFactory(factory))
    }

    /// Spawn the vaccine factory. Factories are steppable but hold no cell.
    pub fn spawn_vaccine_factory(&mut self) -> EntityId {
        let factory = VaccineFactory {
            batch: self.config.vaccine_amount,
            frequency: self.config.vaccine_frequency,
            iteration: 0,
        };
        self.insert_unplaced(EntityKind::VaccineFactory(factory))
    }

    /// Spawn a pheromone carrying `value` with configured rates.
    pub fn spawn_pheromone(&mut self, cell: Cell, value: f64) -> Option<EntityId> {
        let pheromone = Pheromone {
            value,
            evaporation_rate: self.config.pheromone_evaporation_rate,
            diffusion_rate: self.config.pheromone_diffusion_rate,
        };
        self.insert_entity(EntityKind::Pheromone(pheromone), cell)
    }

    /// Create a sound wavefront instance at `cell`.
    ///
    /// `force` overrides the inverse-square default (used for gait noise).
    /// Out-of-bounds requests are silently dropped.
    pub fn emit_sound(
        &mut self,
        cell: Cell,
        radius: u32,
        direction: Direction,
        edge: bool,
        force: Option<f64>,
    ) -> Option<EntityId> {
        let r = radius.max(1);
        let sound = Sound {
            radius: r,
            force: force.unwrap_or(SOUND_BASE_FORCE / f64::from(r * r)),
            direction,
            edge,
        };
        self.insert_entity(EntityKind::Sound(sound), cell)
    }

    /// Deposit or refresh a scent mark at `cell`.
    ///
    /// An existing mark is reset to `trace` rather than stacked.
    pub fn refresh_pheromone(&mut self, cell: Cell, trace: f64) {
        let existing = self
            .grid
            .occupants(cell)
            .iter()
            .copied()
            .find(|oid| matches!(self.entities.get(*oid), Some(EntityKind::Pheromone(_))));
        match existing {
            Some(pid) => {
                if let Some(EntityKind::Pheromone(p)) = self.entities.get_mut(pid) {
                    p.value = trace;
                }
            }
            None => {
                self.spawn_pheromone(cell, trace);
            }
        }
    }

    // ---- initial placement ----------------------------------------------

    /// Seed the initial population onto the terrain.
    ///
    /// Habitats land on their terrain class (hares on meadow, foxes on
    /// forest), initial animals at their habitats round-robin, initial food
    /// on meadow cells, and one factory of each kind is scheduled.
    pub fn populate(&mut self) -> Result<(), WorldError> {
        let meadow = self.meadow_cells.clone();
        let forest = self.forest_cells.clone();
        if self.config.hare_habitats > 0 && meadow.is_empty() {
            return Err(WorldError::InvalidConfig(
                "terrain has no meadow cells for hare habitats",
            ));
        }
        if self.config.fox_habitats > 0 && forest.is_empty() {
            return Err(WorldError::InvalidConfig(
                "terrain has no forest cells for fox habitats",
            ));
        }
        if self.config.initial_hares > 0 && self.config.hare_habitats == 0 {
            return Err(WorldError::InvalidConfig(
                "initial hares require at least one hare habitat",
            ));
        }
        if self.config.initial_foxes > 0 && self.config.fox_habitats == 0 {
            return Err(WorldError::InvalidConfig(
                "initial foxes require at least one fox habitat",
            ));
        }

        let mut hare_homes = Vec::new();
        for _ in 0..self.config.hare_habitats {
            let cell = meadow.choose(&mut self.rng).copied();
            if let Some(cell) = cell {
                if let Some(id) = self.spawn_hare_habitat(cell) {
                    hare_homes.push((id, cell));
                }
            }
        }
        let mut fox_homes = Vec::new();
        for _ in 0..self.config.fox_habitats {
            let cell = forest.choose(&mut self.rng).copied();
            if let Some(cell) = cell {
                if let Some(id) = self.spawn_fox_habitat(cell) {
                    fox_homes.push((id, cell));
                }
            }
        }

        for i in 0..self.config.initial_hares {
            let (_, cell) = hare_homes[(i as usize) % hare_homes.len()];
            self.spawn_hare(cell);
        }
        for i in 0..self.config.initial_foxes {
            let (home, cell) = fox_homes[(i as usize) % fox_homes.len()];
            self.spawn_fox(cell, true, Some(home));
        }
        for _ in 0..self.config.initial_food {
            let cell = meadow.choose(&mut self.rng).copied();
            if let Some(cell) = cell {
                self.spawn_food(cell);
            }
        }

        self.spawn_food_factory();
        self.spawn_vaccine_factory();
        Ok(())
    }

    // ---- perception ------------------------------------------------------

    /// Grid occupants inside the observer's view cone.
    ///
    /// Candidates within `view_range` (Chebyshev) are accepted when the
    /// absolute angular difference between their bearing and the observer's
    /// facing is at most half the view angle (integer division, so an odd
    /// angle rounds the half-cone down). The observer itself and occupants
    /// of its own cell are excluded.
    #[must_use]
    pub fn field_of_view(
        &self,
        observer: EntityId,
        cell: Cell,
        facing: Direction,
        view_range: u32,
        view_angle: u32,
    ) -> Vec<(EntityId, Cell)> {
        let half = f64::from(view_angle / 2);
        let facing_deg = facing.degrees();
        let mut seen = Vec::new();
        for oid in self.grid.neighbors(cell, view_range, false) {
            if oid == observer {
                continue;
            }
            let ocell = match self.grid.position_of(oid) {
                Some(c) => c,
                None => continue,
            };
            let bearing = bearing_degrees(cell, ocell);
            if angle_difference(bearing, facing_deg).abs() <= half {
                seen.push((oid, ocell));
            }
        }
        seen
    }

    /// Whether `other` appears in `observer`'s field of view.
    ///
    /// Used for the fox sneak check: a stalking fox only closes in while the
    /// hare cannot see it.
    #[must_use]
    pub fn sees(&self, observer: EntityId, other: EntityId) -> bool {
        let (view_range, view_angle, facing) = match self.entities.get(observer) {
            Some(EntityKind::Hare(h)) => (h.view_range, h.view_angle, h.facing),
            Some(EntityKind::Fox(f)) => (f.view_range, f.view_angle, f.facing),
            _ => return false,
        };
        let (ocell, tcell) = match (self.grid.position_of(observer), self.grid.position_of(other)) {
            (Some(a), Some(b)) => (a, b),
            _ => return false,
        };
        if ocell == tcell || ocell.chebyshev(tcell) > view_range {
            return false;
        }
        let bearing = bearing_degrees(ocell, tcell);
        angle_difference(bearing, facing.degrees()).abs() <= f64::from(view_angle / 2)
    }

    /// Summed sound force per cell within hearing range of `center`.
    fn sound_noise_map(&self, center: Cell, range: u32) -> HashMap<Cell, f64> {
        let mut levels = HashMap::new();
        for cell in self.grid.neighborhood(center, range, true) {
            let mut sum = 0.0;
            for oid in self.grid.occupants(cell) {
                if let Some(EntityKind::Sound(s)) = self.entities.get(*oid) {
                    sum += s.force;
                }
            }
            if sum > 0.0 {
                levels.insert(cell, sum);
            }
        }
        levels
    }

    /// Summed pheromone intensity per cell within smelling range of `center`.
    fn smell_map(&self, center: Cell, range: u32) -> HashMap<Cell, f64> {
        let mut intensities = HashMap::new();
        for cell in self.grid.neighborhood(center, range, true) {
            let mut sum = 0.0;
            for oid in self.grid.occupants(cell) {
                if let Some(EntityKind::Pheromone(p)) = self.entities.get(*oid) {
                    sum += p.value;
                }
            }
            if sum > 0.0 {
                intensities.insert(cell, sum);
            }
        }
        intensities
    }

    // ---- scheduling ------------------------------------------------------

    /// Whether the tick currently being processed falls on a week boundary.
    fn week_boundary(&self) -> bool {
        let processing = self.tick.0 + 1;
        processing % u64::from(self.config.one_week) == 0
    }

    /// Execute one simulation tick.
    ///
    /// Every entity alive at tick start is stepped exactly once in
    /// activation order. Entities spawned during the tick join the roster
    /// but first act on the next tick; entities removed mid-tick are skipped
    /// for the remainder of the tick.
    pub fn step(&mut self) -> PopulationSummary {
        let scheduled: Vec<EntityId> = self.roster.clone();
        for id in scheduled {
            if !self.entities.contains_key(id) {
                continue;
            }
            self.step_entity(id);
        }
        let entities = &self.entities;
        self.roster.retain(|id| entities.contains_key(*id));
        self.tick = self.tick.next();

        let summary = self.population();
        self.sink.on_tick(&summary);
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary.clone());
        summary
    }

    fn step_entity(&mut self, id: EntityId) {
        let species = match self.entities.get(id) {
            Some(kind) => kind.species(),
            None => return,
        };
        match species {
            Species::Hare => self.step_hare(id),
            Species::Fox => self.step_fox(id),
            Species::Pheromone => self.step_pheromone(id),
            Species::Sound => self.step_sound(id),
            Species::HareFood => self.step_food(id),
            Species::Vaccine => self.step_vaccine(id),
            Species::HareHabitat => self.step_hare_habitat(id),
            Species::FoxHabitat => self.step_fox_habitat(id),
            Species::HareFoodFactory => self.step_food_factory(id),
            Species::VaccineFactory => self.step_vaccine_factory(id),
        }
    }

    // ---- field behaviors -------------------------------------------------

    fn step_sound(&mut self, id: EntityId) {
        let mut sound = match self.entities.get(id) {
            Some(EntityKind::Sound(s)) => s.clone(),
            _ => return,
        };
        let cell = match self.grid.position_of(id) {
            Some(c) => c,
            None => return,
        };

        sound.radius += 1;
        sound.force = SOUND_BASE_FORCE / f64::from(sound.radius * sound.radius);
        if sound.force < SOUND_MIN_FORCE {
            self.remove_entity(id);
            return;
        }

        let (dx, dy) = sound.direction.offset();
        let dest = cell.offset(dx, dy);
        if sound.edge {
            // Widen the front once: spawn a non-edge copy in the flanking
            // cell perpendicular to the travel direction.
            let (fx, fy) = sound.direction.flank_offset();
            self.emit_sound(dest.offset(fx, fy), sound.radius, sound.direction, false, None);
        }
        sound.edge = false;

        if self.grid.contains(dest) {
            let _ = self.grid.relocate(id, dest);
            if let Some(entry) = self.entities.get_mut(id) {
                *entry = EntityKind::Sound(sound);
            }
        } else {
            self.remove_entity(id);
        }
    }

    fn step_pheromone(&mut self, id: EntityId) {
        let mut pheromone = match self.entities.get(id) {
            Some(EntityKind::Pheromone(p)) => p.clone(),
            _ => return,
        };
        let cell = match self.grid.position_of(id) {
            Some(c) => c,
            None => return,
        };

        let mut sum = 0.0;
        let mut count = 0_u32;
        for neighbor in self.grid.neighborhood(cell, 1, false) {
            for oid in self.grid.occupants(neighbor) {
                if let Some(EntityKind::Pheromone(other)) = self.entities.get(*oid) {
                    sum += other.value;
                    count += 1;
                }
            }
        }
        // No neighboring marks: the average is defined as zero.
        let average = if count == 0 { 0.0 } else { sum / f64::from(count) };
        pheromone.value = (1.0 - pheromone.evaporation_rate) * pheromone.value
            + pheromone.diffusion_rate * (average - pheromone.value);
        if pheromone.value < PHEROMONE_MIN_VALUE {
            self.remove_entity(id);
            return;
        }

        // Diffusive spreading into fully vacant neighbor cells.
        let vacant: Vec<Cell> = self
            .grid
            .neighborhood(cell, 1, false)
            .into_iter()
            .filter(|n| self.grid.occupants(*n).is_empty())
            .collect();
        let seeded = pheromone.value;
        for cell in vacant {
            self.spawn_pheromone(cell, seeded);
        }

        if let Some(entry) = self.entities.get_mut(id) {
            *entry = EntityKind::Pheromone(pheromone);
        }
    }

    fn step_food(&mut self, id: EntityId) {
        let mut food = match self.entities.get(id) {
            Some(EntityKind::HareFood(f)) => f.clone(),
            _ => return,
        };
        if food.lifetime <= 0 {
            self.remove_entity(id);
            return;
        }
        food.lifetime -= 1;
        if let Some(entry) = self.entities.get_mut(id) {
            *entry = EntityKind::HareFood(food);
        }
    }

    fn step_vaccine(&mut self, id: EntityId) {
        let mut vaccine = match self.entities.get(id) {
            Some(EntityKind::Vaccine(v)) => v.clone(),
            _ => return,
        };
        if vaccine.lifetime <= 0 {
            self.remove_entity(id);
            return;
        }
        vaccine.lifetime -= 1;
        if let Some(entry) = self.entities.get_mut(id) {
            *entry = EntityKind::Vaccine(vaccine);
        }
    }

    // ---- hare behavior ---------------------------------------------------

    fn step_hare(&mut self, id: EntityId) {
        let mut hare = match self.entities.get(id) {
            Some(EntityKind::Hare(h)) => h.clone(),
            _ => return,
        };
        let cell = match self.grid.position_of(id) {
            Some(c) => c,
            None => return,
        };

        hare.lifetime -= 1;
        if hare.lifetime <= 0 {
            self.remove_entity(id);
            return;
        }
        if self.week_boundary() {
            if hare.eaten < hare.consumption {
                self.remove_entity(id);
                return;
            }
            hare.eaten = 0;
        }
        if hare.cooldown_left > 0 {
            hare.cooldown_left -= 1;
        }

        let visible = self.field_of_view(id, cell, hare.facing, hare.view_range, hare.view_angle);
        let mut threat: Option<(Cell, f64)> = None;
        for (oid, ocell) in &visible {
            if matches!(self.entities.get(*oid), Some(EntityKind::Fox(_))) {
                let dist = cell.euclidean(*ocell);
                if threat.is_none_or(|(_, best)| dist < best) {
                    threat = Some((*ocell, dist));
                }
            }
        }
        let noise = self.sound_noise_map(cell, hare.hearing_range);

        let mut pos = cell;
        match hare.mode {
            HareMode::Normal => match threat {
                Some((tcell, dist))
                    if hare.cooldown_left == 0 && dist <= f64::from(hare.sprint_distance) =>
                {
                    hare.mode = HareMode::Sprinting;
                    hare.mode_ticks_left = hare.sprint_duration.saturating_sub(1);
                    pos = self.hare_flee(id, cell, hare.sprint_speed, tcell, &noise, &mut hare.facing);
                }
                Some((_, dist))
                    if dist > f64::from(hare.sprint_distance)
                        && dist <= f64::from(hare.no_movement_distance) =>
                {
                    // Freeze as camouflage: the fox is close enough to worry
                    // about but too far to outrun.
                    hare.mode = HareMode::NoMovement;
                    hare.mode_ticks_left = hare.no_movement_duration;
                }
                _ => {
                    pos = self.hare_forage(id, cell, &mut hare, &visible, &noise);
                }
            },
            HareMode::Sprinting => {
                if hare.mode_ticks_left > 0 {
                    hare.mode_ticks_left -= 1;
                    pos = match threat {
                        Some((tcell, _)) => {
                            self.hare_flee(id, cell, hare.sprint_speed, tcell, &noise, &mut hare.facing)
                        }
                        None => self.hare_sprint_straight(id, cell, hare.sprint_speed, hare.facing),
                    };
                } else {
                    hare.mode = HareMode::Normal;
                    hare.cooldown_left = hare.sprint_cooldown;
                    pos = self.hare_forage(id, cell, &mut hare, &visible, &noise);
                }
            }
            HareMode::NoMovement => {
                let sprint_trigger = threat
                    .filter(|(_, dist)| {
                        hare.cooldown_left == 0 && *dist <= f64::from(hare.sprint_distance)
                    })
                    .map(|(tcell, _)| tcell);
                if let Some(tcell) = sprint_trigger {
                    hare.mode = HareMode::Sprinting;
                    hare.mode_ticks_left = hare.sprint_duration.saturating_sub(1);
                    pos = self.hare_flee(id, cell, hare.sprint_speed, tcell, &noise, &mut hare.facing);
                } else if hare.mode_ticks_left > 0 {
                    hare.mode_ticks_left -= 1;
                } else {
                    hare.mode = HareMode::Normal;
                    pos = self.hare_forage(id, cell, &mut hare, &visible, &noise);
                }
            }
        }

        self.refresh_pheromone(pos, hare.trace);
        if let Some(entry) = self.entities.get_mut(id) {
            *entry = EntityKind::Hare(hare);
        }
    }

    /// One fleeing step: maximize distance from the threat, prefer quiet
    /// cells among equally distant ones.
    fn hare_flee(
        &mut self,
        id: EntityId,
        cell: Cell,
        speed: u32,
        threat: Cell,
        noise: &HashMap<Cell, f64>,
        facing: &mut Direction,
    ) -> Cell {
        let candidates = self.grid.neighborhood(cell, speed, false);
        match choose_best_cell(&mut self.rng, &candidates, |c| {
            (-threat.euclidean(c), noise_at(noise, c))
        }) {
            Some(dest) => {
                self.apply_move(id, cell, dest, facing);
                dest
            }
            None => cell,
        }
    }

    /// Continue a sprint along the current facing when no threat is visible.
    fn hare_sprint_straight(&mut self, id: EntityId, cell: Cell, speed: u32, facing: Direction) -> Cell {
        let (dx, dy) = facing.offset();
        let r = speed as i32;
        let dest = Cell::new(
            (cell.x + dx * r).clamp(0, self.grid.width() - 1),
            (cell.y + dy * r).clamp(0, self.grid.height() - 1),
        );
        if dest == cell || self.grid.relocate(id, dest).is_err() {
            return cell;
        }
        dest
    }

    /// Graze or move: eat food underfoot, else head for the nearest visible
    /// uneaten food along the quietest route, else take a random quiet step.
    fn hare_forage(
        &mut self,
        id: EntityId,
        cell: Cell,
        hare: &mut Hare,
        visible: &[(EntityId, Cell)],
        noise: &HashMap<Cell, f64>,
    ) -> Cell {
        let food_here = self.grid.occupants(cell).iter().copied().find(|oid| {
            matches!(self.entities.get(*oid), Some(EntityKind::HareFood(f)) if !f.eaten)
        });
        if let Some(fid) = food_here {
            if let Some(EntityKind::HareFood(food)) = self.entities.get_mut(fid) {
                food.eaten = true;
            }
            hare.eaten += 1;
            return cell;
        }

        let food_cells: Vec<Cell> = visible
            .iter()
            .filter(|(oid, _)| {
                matches!(self.entities.get(*oid), Some(EntityKind::HareFood(f)) if !f.eaten)
            })
            .map(|(_, c)| *c)
            .collect();
        let candidates = self.grid.neighborhood(cell, hare.speed, false);
        let goal = choose_best_cell(&mut self.rng, &food_cells, |c| {
            (cell.euclidean(c), noise_at(noise, c))
        });
        let dest = match goal {
            Some(goal) => choose_best_cell(&mut self.rng, &candidates, |c| {
                (goal.euclidean(c), noise_at(noise, c))
            }),
            None => choose_best_cell(&mut self.rng, &candidates, |c| (noise_at(noise, c), 0.0)),
        };
        match dest {
            Some(dest) if dest != cell => {
                self.apply_move(id, cell, dest, &mut hare.facing);
                dest
            }
            _ => cell,
        }
    }

    /// Relocate `id` and turn its facing toward the movement direction.
    fn apply_move(&mut self, id: EntityId, from: Cell, to: Cell, facing: &mut Direction) {
        if from == to || self.grid.relocate(id, to).is_err() {
            return;
        }
        if let Some(direction) = Direction::from_delta(to.x - from.x, to.y - from.y) {
            *facing = direction;
        }
    }

    // ---- fox behavior ----------------------------------------------------

    fn step_fox(&mut self, id: EntityId) {
        let mut fox = match self.entities.get(id) {
            Some(EntityKind::Fox(f)) => f.clone(),
            _ => return,
        };
        let cell = match self.grid.position_of(id) {
            Some(c) => c,
            None => return,
        };

        fox.lifetime -= 1;
        fox.age_ticks += 1;
        if fox.lifetime <= 0 {
            self.remove_entity(id);
            return;
        }
        // The weekly check runs before any graduation: the week that just
        // ended is judged at the rate that applied while it was lived.
        if self.week_boundary() {
            if fox.eaten < fox.weekly_requirement() {
                self.remove_entity(id);
                return;
            }
            fox.eaten = 0;
        }
        if !fox.adult {
            let weeks = fox.age_ticks / u64::from(self.config.one_week);
            if weeks >= u64::from(self.config.fox_maturity_weeks) {
                fox.adult = true;
                fox.hunting = true;
            }
        }

        if !fox.adult {
            // Juveniles draw from the habitat's stored leftovers and do
            // nothing else.
            let need = fox.weekly_requirement().saturating_sub(fox.eaten);
            if need > 0 {
                if let Some(home_id) = fox.home {
                    if let Some(EntityKind::FoxHabitat(habitat)) = self.entities.get_mut(home_id) {
                        let drawn = need.min(habitat.storage);
                        habitat.storage -= drawn;
                        fox.eaten += drawn;
                    }
                }
            }
            if let Some(entry) = self.entities.get_mut(id) {
                *entry = EntityKind::Fox(fox);
            }
            return;
        }

        let mut pos = cell;
        if fox.hunting {
            let mut engaged = false;
            if let Some(target) = fox.target {
                let target_cell = if matches!(self.entities.get(target), Some(EntityKind::Hare(_)))
                {
                    self.grid.position_of(target)
                } else {
                    None
                };
                match target_cell {
                    Some(tcell) => {
                        let range = cell.chebyshev(tcell);
                        if range <= fox.attack_range {
                            pos = self.fox_attack(id, cell, &mut fox, target, tcell);
                            engaged = true;
                        } else if range <= fox.view_range {
                            pos = self.fox_sneak(id, cell, &mut fox, target, tcell);
                            engaged = true;
                        } else {
                            fox.target = None;
                        }
                    }
                    None => fox.target = None,
                }
            }
            if !engaged {
                pos = self.fox_acquire(id, cell, &mut fox);
            }
        } else {
            pos = self.fox_return_home(id, cell, &mut fox);
        }

        self.emit_gait_sound(pos, gait_force(fox.mode));
        if let Some(entry) = self.entities.get_mut(id) {
            *entry = EntityKind::Fox(fox);
        }
    }

    /// Close at sprint speed and kill if the rush lands on the target's cell.
    fn fox_attack(
        &mut self,
        id: EntityId,
        cell: Cell,
        fox: &mut Fox,
        target: EntityId,
        tcell: Cell,
    ) -> Cell {
        fox.mode = FoxMode::Sprinting;
        let dest = self.pursuit_step(id, cell, tcell, fox.sprint_speed, &mut fox.facing);
        if dest == tcell {
            if self.entities.contains_key(target) {
                self.remove_entity(target);
                fox.eaten += KILL_NUTRITION;
                if fox.eaten > fox.consumption {
                    fox.leftovers += fox.eaten - fox.consumption;
                    fox.eaten = fox.consumption;
                    fox.hunting = false;
                }
            }
            fox.target = None;
        }
        dest
    }

    /// Stalk: approach at sneak speed, but only while the target cannot see
    /// the fox.
    fn fox_sneak(
        &mut self,
        id: EntityId,
        cell: Cell,
        fox: &mut Fox,
        target: EntityId,
        tcell: Cell,
    ) -> Cell {
        fox.mode = FoxMode::Sneaking;
        if self.sees(target, id) {
            return cell;
        }
        self.pursuit_step(id, cell, tcell, fox.sneak_speed, &mut fox.facing)
    }

    /// Pick something to chase: a vaccine first, then a hare in attack or
    /// sneak range, else prowl by scent.
    fn fox_acquire(&mut self, id: EntityId, cell: Cell, fox: &mut Fox) -> Cell {
        let visible = self.field_of_view(id, cell, fox.facing, fox.view_range, fox.view_angle);

        let mut vaccine: Option<(EntityId, Cell, f64)> = None;
        for (oid, ocell) in &visible {
            if matches!(self.entities.get(*oid), Some(EntityKind::Vaccine(_))) {
                let dist = cell.euclidean(*ocell);
                if vaccine.is_none_or(|(_, _, best)| dist < best) {
                    vaccine = Some((*oid, *ocell, dist));
                }
            }
        }
        if let Some((vid, vcell, _)) = vaccine {
            fox.mode = FoxMode::Walking;
            let dest = self.pursuit_step(id, cell, vcell, fox.speed, &mut fox.facing);
            if dest == vcell {
                if let Some(EntityKind::Vaccine(v)) = self.entities.get(vid) {
                    fox.lifetime += v.effectiveness;
                }
                self.remove_entity(vid);
            }
            return dest;
        }

        let mut attack_list = Vec::new();
        let mut sneak_list = Vec::new();
        for (oid, ocell) in &visible {
            if matches!(self.entities.get(*oid), Some(EntityKind::Hare(_))) {
                if cell.chebyshev(*ocell) <= fox.attack_range {
                    attack_list.push((*oid, *ocell));
                } else {
                    sneak_list.push((*oid, *ocell));
                }
            }
        }
        let attack_pick = attack_list.choose(&mut self.rng).copied();
        if let Some((tid, tcell)) = attack_pick {
            fox.target = Some(tid);
            return self.fox_attack(id, cell, fox, tid, tcell);
        }
        let sneak_pick = sneak_list.choose(&mut self.rng).copied();
        if let Some((tid, tcell)) = sneak_pick {
            fox.target = Some(tid);
            return self.fox_sneak(id, cell, fox, tid, tcell);
        }

        fox.mode = FoxMode::Walking;
        self.fox_prowl(id, cell, fox)
    }

    /// Follow the strongest nearby scent gradient, or wander.
    fn fox_prowl(&mut self, id: EntityId, cell: Cell, fox: &mut Fox) -> Cell {
        let smell = self.smell_map(cell, fox.smelling_range);
        let mut best: Option<(Cell, f64)> = None;
        for neighbor in self.grid.neighborhood(cell, 1, false) {
            let mut ring_sum = 0.0;
            for ring in self.grid.neighborhood(neighbor, 1, false) {
                ring_sum += smell.get(&ring).copied().unwrap_or(0.0);
            }
            match best {
                Some((_, top)) if ring_sum <= top => {}
                _ => best = Some((neighbor, ring_sum)),
            }
        }
        if let Some((goal, top)) = best {
            if top > 0.0 {
                return self.pursuit_step(id, cell, goal, fox.speed, &mut fox.facing);
            }
        }
        let candidates = self.grid.neighborhood(cell, fox.speed, false);
        let dest = candidates.choose(&mut self.rng).copied();
        match dest {
            Some(dest) => {
                self.apply_move(id, cell, dest, &mut fox.facing);
                dest
            }
            None => cell,
        }
    }

    /// Carry leftovers back to the home habitat and deposit them on arrival.
    fn fox_return_home(&mut self, id: EntityId, cell: Cell, fox: &mut Fox) -> Cell {
        fox.mode = FoxMode::Walking;
        let Some(home_id) = fox.home else {
            fox.hunting = true;
            return cell;
        };
        let Some(home_cell) = self.grid.position_of(home_id) else {
            fox.home = None;
            fox.hunting = true;
            return cell;
        };
        let dest = self.pursuit_step(id, cell, home_cell, fox.speed, &mut fox.facing);
        if dest == home_cell {
            if let Some(EntityKind::FoxHabitat(habitat)) = self.entities.get_mut(home_id) {
                habitat.storage += fox.leftovers;
            }
            fox.leftovers = 0;
            fox.hunting = true;
        }
        dest
    }

    /// One movement step toward `toward`, octant-snapped and clamped to
    /// `speed` cells per axis and to the grid bounds.
    fn pursuit_step(
        &mut self,
        id: EntityId,
        from: Cell,
        toward: Cell,
        speed: u32,
        facing: &mut Direction,
    ) -> Cell {
        let (sx, sy) = octant_toward(from, toward);
        if sx == 0 && sy == 0 {
            return from;
        }
        let span_x = (toward.x - from.x).unsigned_abs().min(speed) as i32;
        let span_y = (toward.y - from.y).unsigned_abs().min(speed) as i32;
        let dest = Cell::new(
            (from.x + sx * span_x).clamp(0, self.grid.width() - 1),
            (from.y + sy * span_y).clamp(0, self.grid.height() - 1),
        );
        if dest == from || self.grid.relocate(id, dest).is_err() {
            return from;
        }
        if let Some(direction) = Direction::from_delta(dest.x - from.x, dest.y - from.y) {
            *facing = direction;
        }
        dest
    }

    /// Emit pursuit noise in all eight directions around `center`.
    fn emit_gait_sound(&mut self, center: Cell, force: f64) {
        for direction in Direction::ALL {
            let (dx, dy) = direction.offset();
            self.emit_sound(center.offset(dx, dy), 1, direction, true, Some(force));
        }
    }

    // ---- habitats & factories --------------------------------------------

    fn step_hare_habitat(&mut self, id: EntityId) {
        let mut habitat = match self.entities.get(id) {
            Some(EntityKind::HareHabitat(h)) => h.clone(),
            _ => return,
        };
        let cell = match self.grid.position_of(id) {
            Some(c) => c,
            None => return,
        };
        habitat.countdown = habitat.countdown.saturating_sub(1);
        if habitat.countdown == 0 {
            habitat.countdown = habitat.season;
            let litter = self.rng.random_range(habitat.litter_min..habitat.litter_max);
            for _ in 0..litter {
                self.spawn_hare(cell);
            }
        }
        if let Some(entry) = self.entities.get_mut(id) {
            *entry = EntityKind::HareHabitat(habitat);
        }
    }

    fn step_fox_habitat(&mut self, id: EntityId) {
        let mut habitat = match self.entities.get(id) {
            Some(EntityKind::FoxHabitat(h)) => h.clone(),
            _ => return,
        };
        let cell = match self.grid.position_of(id) {
            Some(c) => c,
            None => return,
        };
        habitat.countdown = habitat.countdown.saturating_sub(1);
        if habitat.countdown == 0 {
            habitat.countdown = habitat.season;
            let litter = self.rng.random_range(habitat.litter_min..habitat.litter_max);
            for _ in 0..litter {
                self.spawn_fox(cell, false, Some(id));
            }
        }
        if let Some(entry) = self.entities.get_mut(id) {
            *entry = EntityKind::FoxHabitat(habitat);
        }
    }

    fn step_food_factory(&mut self, id: EntityId) {
        let mut factory = match self.entities.get(id) {
            Some(EntityKind::HareFoodFactory(f)) => f.clone(),
            _ => return,
        };
        factory.iteration += 1;
        if factory.iteration >= factory.frequency {
            factory.iteration = 0;
            for _ in 0..factory.batch {
                // Food only grows on non-forest cells.
                let cell = self.meadow_cells.choose(&mut self.rng).copied();
                if let Some(cell) = cell {
                    self.spawn_food(cell);
                }
            }
        }
        if let Some(entry) = self.entities.get_mut(id) {
            *entry = EntityKind::HareFoodFactory(factory);
        }
    }

    fn step_vaccine_factory(&mut self, id: EntityId) {
        let mut factory = match self.entities.get(id) {
            Some(EntityKind::VaccineFactory(f)) => f.clone(),
            _ => return,
        };
        factory.iteration += 1;
        if factory.iteration >= factory.frequency {
            factory.iteration = 0;
            for _ in 0..factory.batch {
                let x = self.rng.random_range(0..self.grid.width());
                let y = self.rng.random_range(0..self.grid.height());
                self.spawn_vaccine(Cell::new(x, y));
            }
        }
        if let Some(entry) = self.entities.get_mut(id) {
            *entry = EntityKind::VaccineFactory(factory);
        }
    }
}
