//! Geometry value types shared by the kinematic model, the solver and the
//! firmware codec.

use serde::{Deserialize, Serialize};
use std::{fmt, ops::Index, str::FromStr};

pub const ALPHA: usize = 0;
pub const BETA: usize = 1;
pub const GAMMA: usize = 2;
pub const TOWERS: [usize; 3] = [ALPHA, BETA, GAMMA];

pub const DEFAULT_STEPS_PER_UNIT: f64 = 80.0;

/// A position in machine coordinates, in millimetres.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3D {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance(&self, other: &Point3D) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Motor steps each carriage sits below its homed position, ordered alpha,
/// beta, gamma.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CarriagePositions(pub [f64; 3]);

impl CarriagePositions {
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|c| c.is_finite())
    }
}

impl Index<usize> for CarriagePositions {
    type Output = f64;

    fn index(&self, tower: usize) -> &f64 {
        &self.0[tower]
    }
}

fn default_steps_per_unit() -> [f64; 3] {
    [DEFAULT_STEPS_PER_UNIT; 3]
}

/// Geometry of a delta printer as the firmware sees it.
///
/// Lengths are millimetres, tower angle offsets are degrees. Endstop offsets
/// are kept normalised by the solver (smallest offset zero) so that `height`
/// is the homed nozzle height above the bed centre for the lowest tower.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KinematicParameters {
    pub diagonal_rod: f64,
    pub radius: f64,
    pub height: f64,
    #[serde(default)]
    pub tower_angle_offsets: [f64; 3],
    #[serde(default)]
    pub radius_offsets: [f64; 3],
    #[serde(default)]
    pub rod_offsets: [f64; 3],
    #[serde(default)]
    pub endstop_offsets: [f64; 3],
    #[serde(default = "default_steps_per_unit")]
    pub steps_per_unit: [f64; 3],
}

impl KinematicParameters {
    pub fn new(diagonal_rod: f64, radius: f64, height: f64) -> Self {
        Self {
            diagonal_rod,
            radius,
            height,
            tower_angle_offsets: [0.0; 3],
            radius_offsets: [0.0; 3],
            rod_offsets: [0.0; 3],
            endstop_offsets: [0.0; 3],
            steps_per_unit: default_steps_per_unit(),
        }
    }

    pub fn with_steps_per_unit(mut self, steps_per_unit: [f64; 3]) -> Self {
        self.steps_per_unit = steps_per_unit;
        self
    }

    pub fn with_endstop_offsets(mut self, endstop_offsets: [f64; 3]) -> Self {
        self.endstop_offsets = endstop_offsets;
        self
    }

    pub fn with_tower_angle_offsets(mut self, tower_angle_offsets: [f64; 3]) -> Self {
        self.tower_angle_offsets = tower_angle_offsets;
        self
    }

    pub fn with_radius_offsets(mut self, radius_offsets: [f64; 3]) -> Self {
        self.radius_offsets = radius_offsets;
        self
    }

    pub fn with_rod_offsets(mut self, rod_offsets: [f64; 3]) -> Self {
        self.rod_offsets = rod_offsets;
        self
    }

    pub fn factor(&self, factor: Factor) -> f64 {
        match factor {
            Factor::EndstopA => self.endstop_offsets[ALPHA],
            Factor::EndstopB => self.endstop_offsets[BETA],
            Factor::EndstopC => self.endstop_offsets[GAMMA],
            Factor::Radius => self.radius,
            Factor::TowerAngleA => self.tower_angle_offsets[ALPHA],
            Factor::TowerAngleB => self.tower_angle_offsets[BETA],
            Factor::DiagonalRod => self.diagonal_rod,
            Factor::StepsA => self.steps_per_unit[ALPHA],
            Factor::StepsB => self.steps_per_unit[BETA],
            Factor::StepsC => self.steps_per_unit[GAMMA],
            Factor::RadiusOffsetA => self.radius_offsets[ALPHA],
            Factor::RadiusOffsetB => self.radius_offsets[BETA],
            Factor::RadiusOffsetC => self.radius_offsets[GAMMA],
            Factor::RodOffsetA => self.rod_offsets[ALPHA],
            Factor::RodOffsetB => self.rod_offsets[BETA],
            Factor::RodOffsetC => self.rod_offsets[GAMMA],
        }
    }

    pub fn factor_mut(&mut self, factor: Factor) -> &mut f64 {
        match factor {
            Factor::EndstopA => &mut self.endstop_offsets[ALPHA],
            Factor::EndstopB => &mut self.endstop_offsets[BETA],
            Factor::EndstopC => &mut self.endstop_offsets[GAMMA],
            Factor::Radius => &mut self.radius,
            Factor::TowerAngleA => &mut self.tower_angle_offsets[ALPHA],
            Factor::TowerAngleB => &mut self.tower_angle_offsets[BETA],
            Factor::DiagonalRod => &mut self.diagonal_rod,
            Factor::StepsA => &mut self.steps_per_unit[ALPHA],
            Factor::StepsB => &mut self.steps_per_unit[BETA],
            Factor::StepsC => &mut self.steps_per_unit[GAMMA],
            Factor::RadiusOffsetA => &mut self.radius_offsets[ALPHA],
            Factor::RadiusOffsetB => &mut self.radius_offsets[BETA],
            Factor::RadiusOffsetC => &mut self.radius_offsets[GAMMA],
            Factor::RodOffsetA => &mut self.rod_offsets[ALPHA],
            Factor::RodOffsetB => &mut self.rod_offsets[BETA],
            Factor::RodOffsetC => &mut self.rod_offsets[GAMMA],
        }
    }

    /// Returns a new snapshot with `deltas` added to the free `factors`, in
    /// factor order, and the endstops renormalised.
    pub fn adjusted(&self, factors: FactorSet, deltas: &[f64]) -> Self {
        let mut next = self.clone();
        for (factor, delta) in factors.iter().zip(deltas) {
            *next.factor_mut(factor) += delta;
        }
        next.normalise_endstops();
        next
    }

    /// Shifts the endstop offsets so the smallest is zero and moves the shift
    /// into `height`. Every tower's homed carriage height is unchanged.
    pub fn normalise_endstops(&mut self) {
        let min = self
            .endstop_offsets
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        if !min.is_finite() {
            return;
        }
        for offset in &mut self.endstop_offsets {
            *offset -= min;
        }
        self.height += min;
    }

    pub fn is_finite(&self) -> bool {
        self.values().all(f64::is_finite)
    }

    /// Largest absolute difference between any two corresponding values.
    pub fn max_deviation(&self, other: &KinematicParameters) -> f64 {
        self.values()
            .zip(other.values())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        [self.diagonal_rod, self.radius, self.height]
            .into_iter()
            .chain(self.tower_angle_offsets)
            .chain(self.radius_offsets)
            .chain(self.rod_offsets)
            .chain(self.endstop_offsets)
            .chain(self.steps_per_unit)
    }
}

/// A single adjustable parameter of the geometry.
///
/// The gamma tower angle is deliberately absent: rotating every tower by the
/// same angle only rotates the machine frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Factor {
    EndstopA,
    EndstopB,
    EndstopC,
    Radius,
    TowerAngleA,
    TowerAngleB,
    DiagonalRod,
    StepsA,
    StepsB,
    StepsC,
    RadiusOffsetA,
    RadiusOffsetB,
    RadiusOffsetC,
    RodOffsetA,
    RodOffsetB,
    RodOffsetC,
}

impl Factor {
    pub const ALL: [Factor; 16] = [
        Factor::EndstopA,
        Factor::EndstopB,
        Factor::EndstopC,
        Factor::Radius,
        Factor::TowerAngleA,
        Factor::TowerAngleB,
        Factor::DiagonalRod,
        Factor::StepsA,
        Factor::StepsB,
        Factor::StepsC,
        Factor::RadiusOffsetA,
        Factor::RadiusOffsetB,
        Factor::RadiusOffsetC,
        Factor::RodOffsetA,
        Factor::RodOffsetB,
        Factor::RodOffsetC,
    ];

    const fn bit(self) -> u32 {
        1 << self as u32
    }

    pub fn name(self) -> &'static str {
        match self {
            Factor::EndstopA => "endstop_a",
            Factor::EndstopB => "endstop_b",
            Factor::EndstopC => "endstop_c",
            Factor::Radius => "radius",
            Factor::TowerAngleA => "tower_angle_a",
            Factor::TowerAngleB => "tower_angle_b",
            Factor::DiagonalRod => "diagonal_rod",
            Factor::StepsA => "steps_a",
            Factor::StepsB => "steps_b",
            Factor::StepsC => "steps_c",
            Factor::RadiusOffsetA => "radius_offset_a",
            Factor::RadiusOffsetB => "radius_offset_b",
            Factor::RadiusOffsetC => "radius_offset_c",
            Factor::RodOffsetA => "rod_offset_a",
            Factor::RodOffsetB => "rod_offset_b",
            Factor::RodOffsetC => "rod_offset_c",
        }
    }
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Factor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Factor::ALL
            .into_iter()
            .find(|factor| factor.name() == s)
            .ok_or_else(|| format!("unknown factor '{s}'"))
    }
}

/// Set of factors the solver is allowed to adjust.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FactorSpec", into = "Vec<Factor>")]
pub struct FactorSet(u32);

impl FactorSet {
    /// Endstop offsets only.
    pub const THREE: Self = Self::empty()
        .with(Factor::EndstopA)
        .with(Factor::EndstopB)
        .with(Factor::EndstopC);
    /// Endstops and delta radius.
    pub const FOUR: Self = Self::THREE.with(Factor::Radius);
    /// Endstops, radius and two tower angles.
    pub const SIX: Self = Self::FOUR
        .with(Factor::TowerAngleA)
        .with(Factor::TowerAngleB);
    /// Endstops, radius, two tower angles and diagonal rod length.
    pub const SEVEN: Self = Self::SIX.with(Factor::DiagonalRod);
    /// Every factor that can be fitted at once; see
    /// [`solvable`](Self::solvable).
    pub const ALL: Self = Self::EVERY.solvable();
    const EVERY: Self = Self((1 << Factor::ALL.len()) - 1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn with(mut self, factor: Factor) -> Self {
        self.0 |= factor.bit();
        self
    }

    pub const fn without(mut self, factor: Factor) -> Self {
        self.0 &= !factor.bit();
        self
    }

    pub const fn contains(&self, factor: Factor) -> bool {
        self.0 & factor.bit() != 0
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Drops factors that duplicate a motion already covered by others, so
    /// the normal equations stay full rank on a flat bed.
    ///
    /// Probing only sees heights, so moving or turning the whole tower frame
    /// is invisible: the radius, two tower angles and per-tower radius
    /// offsets together cover at most three tower motions. A common radius
    /// or rod length takes the place of the gamma tower's offset, and scaling
    /// all three steps per unit mimics changing both radius and rod length.
    pub const fn solvable(self) -> Self {
        let mut set = self;
        if set.contains(Factor::Radius) {
            set = set.without(Factor::RadiusOffsetC);
        }
        if set.contains(Factor::DiagonalRod) {
            set = set.without(Factor::RodOffsetC);
        }
        if set.contains(Factor::TowerAngleA) || set.contains(Factor::TowerAngleB) {
            set = set
                .without(Factor::RadiusOffsetA)
                .without(Factor::RadiusOffsetB)
                .without(Factor::RadiusOffsetC);
        }
        if set.contains(Factor::Radius)
            && set.contains(Factor::DiagonalRod)
            && set.contains(Factor::StepsA)
            && set.contains(Factor::StepsB)
            && set.contains(Factor::StepsC)
        {
            set = set.without(Factor::StepsC);
        }
        set
    }

    pub const fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Free factors in solver column order.
    pub fn iter(&self) -> impl Iterator<Item = Factor> + '_ {
        Factor::ALL
            .into_iter()
            .filter(move |factor| self.contains(*factor))
    }
}

impl FromIterator<Factor> for FactorSet {
    fn from_iter<I: IntoIterator<Item = Factor>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}

impl From<FactorSet> for Vec<Factor> {
    fn from(set: FactorSet) -> Self {
        set.iter().collect()
    }
}

impl FromStr for FactorSet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "three" | "3" => Ok(Self::THREE),
            "four" | "4" => Ok(Self::FOUR),
            "six" | "6" => Ok(Self::SIX),
            "seven" | "7" => Ok(Self::SEVEN),
            "all" => Ok(Self::ALL),
            other => other
                .split(',')
                .map(|name| name.trim().parse::<Factor>())
                .collect::<Result<Self, _>>()
                .map(Self::solvable),
        }
    }
}

/// Configuration form of a factor set: a preset name or an explicit list.
#[derive(Deserialize)]
#[serde(untagged)]
enum FactorSpec {
    Preset(String),
    List(Vec<Factor>),
}

impl TryFrom<FactorSpec> for FactorSet {
    type Error = String;

    fn try_from(spec: FactorSpec) -> Result<Self, Self::Error> {
        match spec {
            FactorSpec::Preset(name) => name.parse(),
            FactorSpec::List(factors) => Ok(factors.into_iter().collect::<Self>().solvable()),
        }
    }
}
