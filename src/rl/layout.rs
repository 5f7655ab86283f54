//! Observation layouts emitted by the simulation engine
//!
//! Two schemes exist for the same data. The entity-embedding layout lists
//! every entity slot explicitly and ends with a grid of map cell codes; the
//! multi-hot layout packs five categorical factors into every map cell and
//! ends with the active drone's scalar fields.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of drones the engine simulates
pub const MAX_DRONES: usize = 4;
/// Number of weapon types known to the engine
pub const NUM_WEAPONS: usize = 5;
/// Number of wall types known to the engine
pub const NUM_WALL_TYPES: usize = 3;
/// Largest map the engine emits
pub const MAX_MAP_COLUMNS: usize = 21;
pub const MAX_MAP_ROWS: usize = 21;
/// Active drone fields (position, velocity, aim, ammo, cooldown, charge)
pub const DRONE_OBS_SIZE: usize = 9;
/// Active drone fields + weapon one-hot + padding slot
pub const SCALAR_OBS_SIZE: usize = DRONE_OBS_SIZE + NUM_WEAPONS + 1;
/// Continuous action width: move x/y, aim x/y, fire
pub const ACTION_SIZE: usize = 5;
pub const ACTION_LOW: f32 = -1.0;
pub const ACTION_HIGH: f32 = 1.0;

/// Smallest map side the convolution stack can reduce to a non-empty output
/// (kernel 5 stride 2, then kernel 3 stride 2).
pub const MIN_MAP_SIDE: usize = 9;

/// Number of categorical factors packed in a multi-hot map cell
pub const MAP_CELL_FACTORS: usize = 5;

#[derive(Debug, Error, PartialEq)]
pub enum LayoutError {
    #[error("num_drones must be in 1..={max}, got {got}")]
    InvalidDroneCount { got: usize, max: usize },
    #[error("{region} entity width must be at least 1 (the leading type code)")]
    EmptyEntity { region: &'static str },
    #[error("{vocab} vocabulary must contain at least one type")]
    EmptyVocabulary { vocab: &'static str },
    #[error("map must be at least {min}x{min}, got {columns}x{rows}")]
    MapTooSmall {
        columns: usize,
        rows: usize,
        min: usize,
    },
    #[error("observation has length {got}, layout expects {expected}")]
    LengthMismatch { got: usize, expected: usize },
    #[error("observation batch of length {len} is not a positive multiple of width {width}")]
    RaggedBatch { len: usize, width: usize },
    #[error("{region} code {code} at index {index} is outside vocabulary of size {vocab}")]
    CodeOutOfRange {
        region: &'static str,
        index: usize,
        code: f32,
        vocab: usize,
    },
}

/// Entity-embedding layout:
/// `[scalar | drones x N | projectiles x M | floating walls x K | map cells]`.
///
/// Every drone and projectile slot starts with a weapon code, every floating
/// wall slot with a wall code. Code 0 is the empty-slot sentinel, so each
/// embedding table reserves one extra row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObsLayout {
    pub scalar_size: usize,
    pub num_drones: usize,
    pub drone_size: usize,
    pub num_projectiles: usize,
    pub projectile_size: usize,
    pub num_floating_walls: usize,
    pub floating_wall_size: usize,
    pub map_columns: usize,
    pub map_rows: usize,
    pub weapon_types: usize,
    pub wall_types: usize,
    pub map_cell_types: usize,
}

impl Default for ObsLayout {
    fn default() -> Self {
        Self {
            scalar_size: SCALAR_OBS_SIZE,
            num_drones: 2,
            drone_size: 8,
            num_projectiles: 20,
            projectile_size: 5,
            num_floating_walls: 12,
            floating_wall_size: 5,
            map_columns: MAX_MAP_COLUMNS,
            map_rows: MAX_MAP_ROWS,
            weapon_types: NUM_WEAPONS,
            wall_types: NUM_WALL_TYPES,
            map_cell_types: NUM_WALL_TYPES + 1,
        }
    }
}

impl ObsLayout {
    /// Reject layouts the encoder cannot be built for
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.num_drones == 0 || self.num_drones > MAX_DRONES {
            return Err(LayoutError::InvalidDroneCount {
                got: self.num_drones,
                max: MAX_DRONES,
            });
        }
        for (region, size) in [
            ("drone", self.drone_size),
            ("projectile", self.projectile_size),
            ("floating wall", self.floating_wall_size),
        ] {
            if size == 0 {
                return Err(LayoutError::EmptyEntity { region });
            }
        }
        for (vocab, size) in [
            ("weapon", self.weapon_types),
            ("wall", self.wall_types),
            ("map cell", self.map_cell_types),
        ] {
            if size == 0 {
                return Err(LayoutError::EmptyVocabulary { vocab });
            }
        }
        check_map(self.map_columns, self.map_rows)
    }

    pub fn drone_offset(&self) -> usize {
        self.scalar_size
    }

    pub fn projectile_offset(&self) -> usize {
        self.drone_offset() + self.num_drones * self.drone_size
    }

    pub fn floating_wall_offset(&self) -> usize {
        self.projectile_offset() + self.num_projectiles * self.projectile_size
    }

    pub fn map_offset(&self) -> usize {
        self.floating_wall_offset() + self.num_floating_walls * self.floating_wall_size
    }

    pub fn map_cells(&self) -> usize {
        self.map_columns * self.map_rows
    }

    /// Declared total observation length; all regions sum to this
    pub fn total_len(&self) -> usize {
        self.map_offset() + self.map_cells()
    }

    /// Rows in the weapon embedding table (sentinel included)
    pub fn weapon_vocab(&self) -> usize {
        self.weapon_types + 1
    }

    pub fn wall_vocab(&self) -> usize {
        self.wall_types + 1
    }

    pub fn map_cell_vocab(&self) -> usize {
        self.map_cell_types + 1
    }

    /// Check one flat observation against the layout, reporting the first
    /// categorical code that would index outside its embedding table.
    pub fn check_observation(&self, obs: &[f32]) -> Result<(), LayoutError> {
        if obs.len() != self.total_len() {
            return Err(LayoutError::LengthMismatch {
                got: obs.len(),
                expected: self.total_len(),
            });
        }

        let slots = [
            ("drone", self.drone_offset(), self.num_drones, self.drone_size, self.weapon_vocab()),
            (
                "projectile",
                self.projectile_offset(),
                self.num_projectiles,
                self.projectile_size,
                self.weapon_vocab(),
            ),
            (
                "floating wall",
                self.floating_wall_offset(),
                self.num_floating_walls,
                self.floating_wall_size,
                self.wall_vocab(),
            ),
        ];
        for (region, offset, count, size, vocab) in slots {
            for slot in 0..count {
                let index = offset + slot * size;
                check_code(region, index, obs[index], vocab)?;
            }
        }

        let map_offset = self.map_offset();
        for (i, &code) in obs[map_offset..].iter().enumerate() {
            check_code("map cell", map_offset + i, code, self.map_cell_vocab())?;
        }
        Ok(())
    }
}

/// Multi-hot layout: `[map cells x 5 factor codes | scalar]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiHotLayout {
    pub map_columns: usize,
    pub map_rows: usize,
    /// Cardinality of each factor in cell order: wall type, weapon pickup,
    /// projectile weapon, floating wall type, drone weapon
    pub cardinalities: [usize; MAP_CELL_FACTORS],
    pub scalar_size: usize,
}

impl Default for MultiHotLayout {
    fn default() -> Self {
        Self {
            map_columns: MAX_MAP_COLUMNS,
            map_rows: MAX_MAP_ROWS,
            cardinalities: [
                NUM_WALL_TYPES + 1,
                NUM_WEAPONS + 1,
                NUM_WEAPONS + 1,
                NUM_WALL_TYPES + 1,
                NUM_WEAPONS + 1,
            ],
            scalar_size: SCALAR_OBS_SIZE,
        }
    }
}

impl MultiHotLayout {
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.cardinalities.contains(&0) {
            return Err(LayoutError::EmptyVocabulary { vocab: "map cell factor" });
        }
        check_map(self.map_columns, self.map_rows)
    }

    /// Exclusive prefix sum of the factor cardinalities
    pub fn offsets(&self) -> [usize; MAP_CELL_FACTORS] {
        let mut offsets = [0; MAP_CELL_FACTORS];
        for i in 1..MAP_CELL_FACTORS {
            offsets[i] = offsets[i - 1] + self.cardinalities[i - 1];
        }
        offsets
    }

    /// Width of the shared multi-hot channel axis
    pub fn width(&self) -> usize {
        self.cardinalities.iter().sum()
    }

    pub fn map_cells(&self) -> usize {
        self.map_columns * self.map_rows
    }

    pub fn scalar_offset(&self) -> usize {
        self.map_cells() * MAP_CELL_FACTORS
    }

    pub fn total_len(&self) -> usize {
        self.scalar_offset() + self.scalar_size
    }

    /// Channel indices set for one cell's factor codes
    pub fn cell_indices(
        &self,
        codes: [usize; MAP_CELL_FACTORS],
    ) -> Result<[usize; MAP_CELL_FACTORS], LayoutError> {
        let offsets = self.offsets();
        let mut indices = [0; MAP_CELL_FACTORS];
        for factor in 0..MAP_CELL_FACTORS {
            if codes[factor] >= self.cardinalities[factor] {
                return Err(LayoutError::CodeOutOfRange {
                    region: "map cell factor",
                    index: factor,
                    code: codes[factor] as f32,
                    vocab: self.cardinalities[factor],
                });
            }
            indices[factor] = codes[factor] + offsets[factor];
        }
        Ok(indices)
    }

    pub fn check_observation(&self, obs: &[f32]) -> Result<(), LayoutError> {
        if obs.len() != self.total_len() {
            return Err(LayoutError::LengthMismatch {
                got: obs.len(),
                expected: self.total_len(),
            });
        }
        for (i, &code) in obs[..self.scalar_offset()].iter().enumerate() {
            let vocab = self.cardinalities[i % MAP_CELL_FACTORS];
            check_code("map cell factor", i, code, vocab)?;
        }
        Ok(())
    }
}

fn check_map(columns: usize, rows: usize) -> Result<(), LayoutError> {
    if columns < MIN_MAP_SIDE || rows < MIN_MAP_SIDE {
        return Err(LayoutError::MapTooSmall {
            columns,
            rows,
            min: MIN_MAP_SIDE,
        });
    }
    Ok(())
}

fn check_code(region: &'static str, index: usize, code: f32, vocab: usize) -> Result<(), LayoutError> {
    if code < 0.0 || code.fract() != 0.0 || code as usize >= vocab {
        return Err(LayoutError::CodeOutOfRange {
            region,
            index,
            code,
            vocab,
        });
    }
    Ok(())
}
