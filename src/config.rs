//! Grid configuration and the tiling plan derived from it
//!
//! Each of N and M is split into four nested factors:
//!
//! ```text
//! N = outer_tiles_n * grid_rows * inner_tiles_n * pack_width_n
//! M = outer_tiles_m * grid_cols * inner_tiles_m * pack_width_m
//! ```
//!
//! K is not tiled; every outer tile reduces over the whole of K. A
//! configuration is validated exactly once, by [`GemmConfig::plan`], and the
//! resulting [`TilingPlan`] is what every stage of the grid runs against.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GemmError, GemmResult};

/// Depths of the bounded channels and the stall watchdog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Depth of the A/B/C pipes between processing elements
    pub pipe_depth: Option<usize>,
    /// Depth of the feed chains and adapter streams
    pub feed_depth: Option<usize>,
    /// Depth of each transpose split stream
    pub transpose_depth: Option<usize>,
    /// How long a push or pop may block before the run is declared stalled
    pub stall_timeout_ms: Option<u64>,
    /// Reject channel depths below their deadlock-free lower bound
    pub enforce_bounds: Option<bool>,
}

/// Static configuration of one systolic GEMM build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GemmConfig {
    /// Rows of A and C
    pub size_n: usize,
    /// Columns of A, rows of B
    pub size_k: usize,
    /// Columns of B and C
    pub size_m: usize,
    pub outer_tiles_n: usize,
    pub outer_tiles_m: usize,
    /// Processing elements along N
    pub grid_rows: usize,
    /// Processing elements along M
    pub grid_cols: usize,
    pub inner_tiles_n: usize,
    pub inner_tiles_m: usize,
    /// Width of the A operand packs fed to the grid
    pub pack_width_n: usize,
    /// Width of the B operand and C result packs
    pub pack_width_m: usize,
    /// Width of the storage packs read and written by the boundary adapters
    #[serde(default = "default_memory_width")]
    pub memory_width: usize,
    #[serde(default)]
    pub channels: ChannelConfig,
}

fn default_memory_width() -> usize {
    1
}

const DEFAULT_STALL_TIMEOUT_MS: u64 = 10_000;

impl GemmConfig {
    /// One processing element, no sub-tiling: a single pack spans all of N
    /// and all of M.
    pub fn single_pe(size_n: usize, size_k: usize, size_m: usize) -> Self {
        Self {
            size_n,
            size_k,
            size_m,
            outer_tiles_n: 1,
            outer_tiles_m: 1,
            grid_rows: 1,
            grid_cols: 1,
            inner_tiles_n: 1,
            inner_tiles_m: 1,
            pack_width_n: size_n,
            pack_width_m: size_m,
            memory_width: 1,
            channels: ChannelConfig::default(),
        }
    }

    /// Derive the problem size from the tiling factors.
    pub fn from_tiling(
        size_k: usize,
        outer: (usize, usize),
        grid: (usize, usize),
        inner: (usize, usize),
        packs: (usize, usize),
    ) -> Self {
        Self {
            size_n: outer.0 * grid.0 * inner.0 * packs.0,
            size_k,
            size_m: outer.1 * grid.1 * inner.1 * packs.1,
            outer_tiles_n: outer.0,
            outer_tiles_m: outer.1,
            grid_rows: grid.0,
            grid_cols: grid.1,
            inner_tiles_n: inner.0,
            inner_tiles_m: inner.1,
            pack_width_n: packs.0,
            pack_width_m: packs.1,
            memory_width: 1,
            channels: ChannelConfig::default(),
        }
    }

    pub fn with_memory_width(mut self, width: usize) -> Self {
        self.memory_width = width;
        self
    }

    pub fn with_channels(mut self, channels: ChannelConfig) -> Self {
        self.channels = channels;
        self
    }

    pub fn from_json(json: &str) -> GemmResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Validate the configuration and resolve every derived size.
    pub fn plan(&self) -> GemmResult<TilingPlan> {
        let factors = [
            ("outer_tiles_n", self.outer_tiles_n),
            ("outer_tiles_m", self.outer_tiles_m),
            ("grid_rows", self.grid_rows),
            ("grid_cols", self.grid_cols),
            ("inner_tiles_n", self.inner_tiles_n),
            ("inner_tiles_m", self.inner_tiles_m),
            ("pack_width_n", self.pack_width_n),
            ("pack_width_m", self.pack_width_m),
            ("memory_width", self.memory_width),
        ];
        if let Some((name, _)) = factors.iter().find(|(_, value)| *value == 0) {
            return Err(GemmError::invalid_config(format!("{} must be positive", name)));
        }

        let outer_tile_size_n = product(
            "outer tile along N",
            &[self.grid_rows, self.inner_tiles_n, self.pack_width_n],
        )?;
        let outer_tile_size_m = product(
            "outer tile along M",
            &[self.grid_cols, self.inner_tiles_m, self.pack_width_m],
        )?;

        let tiled_n = product("N", &[self.outer_tiles_n, outer_tile_size_n])?;
        if tiled_n != self.size_n {
            return Err(GemmError::TilingMismatch {
                axis: 'N',
                expected: tiled_n,
                got: self.size_n,
            });
        }
        let tiled_m = product("M", &[self.outer_tiles_m, outer_tile_size_m])?;
        if tiled_m != self.size_m {
            return Err(GemmError::TilingMismatch {
                axis: 'M',
                expected: tiled_m,
                got: self.size_m,
            });
        }

        if self.size_k % self.memory_width != 0 {
            return Err(GemmError::invalid_config(format!(
                "memory_width {} does not divide K = {}",
                self.memory_width, self.size_k
            )));
        }
        if outer_tile_size_m % self.memory_width != 0 {
            return Err(GemmError::invalid_config(format!(
                "memory_width {} does not divide the outer tile width {} along M",
                self.memory_width, outer_tile_size_m
            )));
        }

        // Element counts and per-PE step counts are derived later without checks
        product("A", &[self.size_n, self.size_k])?;
        product("B", &[self.size_k, self.size_m])?;
        product("C", &[self.size_n, self.size_m])?;
        let compute_tile = product("compute tile", &[self.inner_tiles_n, self.inner_tiles_m])?;
        product(
            "steps",
            &[self.outer_tiles_n, self.outer_tiles_m, self.size_k, compute_tile],
        )?;

        let pipe_depth = self.channels.pipe_depth.unwrap_or(compute_tile);
        let feed_depth = match self.channels.feed_depth {
            Some(depth) => depth,
            None => product("feed depth", &[self.grid_rows.max(self.grid_cols), compute_tile])?,
        };
        let transpose_depth = self.channels.transpose_depth.unwrap_or(outer_tile_size_n);

        for (channel, depth) in [
            ("pipe", pipe_depth),
            ("feed", feed_depth),
            ("transpose split", transpose_depth),
        ] {
            if depth == 0 {
                return Err(GemmError::InsufficientCapacity {
                    channel: channel.to_string(),
                    depth,
                    required: 1,
                });
            }
        }

        // The transpose drains one split completely before touching the next,
        // so every other split has to buffer a full outer tile column of A.
        let enforce_bounds = self.channels.enforce_bounds.unwrap_or(true);
        if enforce_bounds && self.memory_width > 1 && transpose_depth < outer_tile_size_n {
            return Err(GemmError::InsufficientCapacity {
                channel: "transpose split".to_string(),
                depth: transpose_depth,
                required: outer_tile_size_n,
            });
        }

        Ok(TilingPlan {
            size_n: self.size_n,
            size_k: self.size_k,
            size_m: self.size_m,
            outer_tiles_n: self.outer_tiles_n,
            outer_tiles_m: self.outer_tiles_m,
            grid_rows: self.grid_rows,
            grid_cols: self.grid_cols,
            inner_tiles_n: self.inner_tiles_n,
            inner_tiles_m: self.inner_tiles_m,
            pack_width_n: self.pack_width_n,
            pack_width_m: self.pack_width_m,
            memory_width: self.memory_width,
            outer_tile_size_n,
            outer_tile_size_m,
            pipe_depth,
            feed_depth,
            transpose_depth,
            stall_timeout_ms: self
                .channels
                .stall_timeout_ms
                .unwrap_or(DEFAULT_STALL_TIMEOUT_MS),
        })
    }
}

/// Multiply tiling factors, rejecting products that do not fit a `usize`.
fn product(what: &str, factors: &[usize]) -> GemmResult<usize> {
    factors
        .iter()
        .try_fold(1usize, |acc, &factor| acc.checked_mul(factor))
        .ok_or_else(|| GemmError::invalid_config(format!("{} overflows: {:?}", what, factors)))
}

impl Default for GemmConfig {
    fn default() -> Self {
        Self::from_tiling(8, (2, 2), (2, 2), (2, 2), (2, 2))
    }
}

/// Validated, fully resolved tiling of one build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TilingPlan {
    pub size_n: usize,
    pub size_k: usize,
    pub size_m: usize,
    pub outer_tiles_n: usize,
    pub outer_tiles_m: usize,
    pub grid_rows: usize,
    pub grid_cols: usize,
    pub inner_tiles_n: usize,
    pub inner_tiles_m: usize,
    pub pack_width_n: usize,
    pub pack_width_m: usize,
    pub memory_width: usize,
    pub outer_tile_size_n: usize,
    pub outer_tile_size_m: usize,
    pub pipe_depth: usize,
    pub feed_depth: usize,
    pub transpose_depth: usize,
    pub stall_timeout_ms: u64,
}

impl TilingPlan {
    pub fn outer_tiles(&self) -> usize {
        self.outer_tiles_n * self.outer_tiles_m
    }

    /// Inner tile pairs visited per k
    pub fn compute_tiles(&self) -> usize {
        self.inner_tiles_n * self.inner_tiles_m
    }

    /// `(n0, m0, k, n1, m1)` combinations; each PE pops one A and one B pack
    /// per step.
    pub fn steps(&self) -> usize {
        self.outer_tiles() * self.size_k * self.compute_tiles()
    }

    /// Result packs a single PE drains per outer tile
    pub fn tile_packs(&self) -> usize {
        self.inner_tiles_n * self.pack_width_n * self.inner_tiles_m
    }

    /// Rows owned by one grid row within an outer tile
    pub fn block_rows(&self) -> usize {
        self.inner_tiles_n * self.pack_width_n
    }

    /// Columns owned by one grid column within an outer tile
    pub fn block_cols(&self) -> usize {
        self.inner_tiles_m * self.pack_width_m
    }

    pub fn processing_elements(&self) -> usize {
        self.grid_rows * self.grid_cols
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_pe_plan() {
        let plan = GemmConfig::single_pe(4, 2, 4).plan().unwrap();
        assert_eq!(plan.outer_tile_size_n, 4);
        assert_eq!(plan.outer_tile_size_m, 4);
        assert_eq!(plan.steps(), 2);
        assert_eq!(plan.tile_packs(), 4);
        assert_eq!(plan.processing_elements(), 1);
    }

    #[test]
    fn test_default_depths() {
        let config = GemmConfig::from_tiling(6, (1, 2), (3, 2), (2, 3), (2, 1));
        let plan = config.plan().unwrap();
        assert_eq!(plan.size_n, 12);
        assert_eq!(plan.size_m, 12);
        assert_eq!(plan.pipe_depth, 6);
        assert_eq!(plan.feed_depth, 18);
        assert_eq!(plan.transpose_depth, 12);
        assert_eq!(plan.stall_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_tiling_mismatch() {
        let mut config = GemmConfig::default();
        config.size_n += 1;
        match config.plan() {
            Err(GemmError::TilingMismatch { axis, expected, got }) => {
                assert_eq!(axis, 'N');
                assert_eq!(expected, 16);
                assert_eq!(got, 17);
            }
            other => panic!("Expected TilingMismatch, got {:?}", other),
        }

        let mut config = GemmConfig::default();
        config.size_m = 8;
        assert!(matches!(
            config.plan(),
            Err(GemmError::TilingMismatch { axis: 'M', .. })
        ));
    }

    #[test]
    fn test_rejects_zero_factor() {
        let mut config = GemmConfig::default();
        config.grid_cols = 0;
        let err = config.plan().unwrap_err();
        assert_eq!(err.to_string(), "Invalid configuration: grid_cols must be positive");
    }

    #[test]
    fn test_rejects_overflowing_factors() {
        let json = format!(
            r#"{{
                "size_n": 4, "size_k": 2, "size_m": 4,
                "outer_tiles_n": 1, "outer_tiles_m": 1,
                "grid_rows": {}, "grid_cols": 1,
                "inner_tiles_n": 4, "inner_tiles_m": 1,
                "pack_width_n": 1, "pack_width_m": 4
            }}"#,
            usize::MAX / 2
        );
        let config = GemmConfig::from_json(&json).unwrap();
        assert!(matches!(config.plan(), Err(GemmError::InvalidConfig { .. })));

        // Each axis fits, the operand element count does not
        let big = 1usize << (usize::BITS / 2);
        let config = GemmConfig::single_pe(big, big, 1);
        assert!(matches!(config.plan(), Err(GemmError::InvalidConfig { .. })));
    }

    #[test]
    fn test_rejects_memory_width() {
        // K = 8 is not a multiple of 3
        let config = GemmConfig::default().with_memory_width(3);
        assert!(matches!(config.plan(), Err(GemmError::InvalidConfig { .. })));

        // K = 4 is fine but the outer tile along M is 2 * 1 * 3 = 6 wide
        let config =
            GemmConfig::from_tiling(4, (1, 1), (1, 2), (1, 1), (2, 3)).with_memory_width(4);
        assert!(matches!(config.plan(), Err(GemmError::InvalidConfig { .. })));
    }

    #[test]
    fn test_transpose_bound() {
        let channels = ChannelConfig {
            transpose_depth: Some(3),
            ..Default::default()
        };
        let config = GemmConfig::default()
            .with_memory_width(2)
            .with_channels(channels.clone());
        match config.plan() {
            Err(GemmError::InsufficientCapacity { depth, required, .. }) => {
                assert_eq!(depth, 3);
                assert_eq!(required, 8);
            }
            other => panic!("Expected InsufficientCapacity, got {:?}", other),
        }

        // A single split never waits on its siblings
        let config = GemmConfig::default().with_channels(channels.clone());
        assert!(config.plan().is_ok());

        let unchecked = ChannelConfig {
            enforce_bounds: Some(false),
            ..channels
        };
        let config = GemmConfig::default()
            .with_memory_width(2)
            .with_channels(unchecked);
        assert_eq!(config.plan().unwrap().transpose_depth, 3);
    }

    #[test]
    fn test_rejects_zero_depth() {
        let channels = ChannelConfig {
            pipe_depth: Some(0),
            enforce_bounds: Some(false),
            ..Default::default()
        };
        let config = GemmConfig::default().with_channels(channels);
        assert!(matches!(
            config.plan(),
            Err(GemmError::InsufficientCapacity { required: 1, .. })
        ));
    }

    #[test]
    fn test_empty_k_is_allowed() {
        let plan = GemmConfig::from_tiling(0, (1, 1), (2, 2), (1, 1), (1, 1))
            .with_memory_width(2)
            .plan()
            .unwrap();
        assert_eq!(plan.steps(), 0);
    }

    #[test]
    fn test_json_round_trip_defaults() {
        let json = r#"{
            "size_n": 4, "size_k": 2, "size_m": 4,
            "outer_tiles_n": 1, "outer_tiles_m": 1,
            "grid_rows": 1, "grid_cols": 1,
            "inner_tiles_n": 1, "inner_tiles_m": 1,
            "pack_width_n": 4, "pack_width_m": 4
        }"#;
        let config = GemmConfig::from_json(json).unwrap();
        assert_eq!(config, GemmConfig::single_pe(4, 2, 4));
    }
}
