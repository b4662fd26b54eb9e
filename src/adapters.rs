//! Boundary adapters between row-major storage and the compute grid
//!
//! Storage is read and written in packs of `memory_width` elements. On the
//! way in, A is transposed so it reaches the grid K-major, and both operands
//! are regrouped into compute packs and sequenced in the order the feed
//! chains expect: one pack per grid position for every
//! `(n0, m0, k, n1, m1)` step. On the way out, finished result packs are
//! regrouped into storage packs and placed row-major.
//!
//! A and B are re-read once per outer tile of the other operand.

use crate::config::TilingPlan;
use crate::error::GemmResult;
use crate::ops::Element;
use crate::pack::Pack;
use crate::stream::{StreamReader, StreamWriter};

/// Read A row by row and scatter each storage pack across the split streams,
/// lane `w` going to split `w`.
pub fn read_a<T: Element>(
    plan: &TilingPlan,
    a: &[T],
    splits: &[StreamWriter<T>],
) -> GemmResult<()> {
    let width = plan.memory_width;
    for n0 in 0..plan.outer_tiles_n {
        for _m0 in 0..plan.outer_tiles_m {
            for k0 in 0..plan.size_k / width {
                for r in 0..plan.outer_tile_size_n {
                    let row = n0 * plan.outer_tile_size_n + r;
                    let start = row * plan.size_k + k0 * width;
                    let pack = Pack::from_slice(&a[start..start + width]);
                    for (lane, split) in splits.iter().enumerate() {
                        split.push(pack[lane])?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Drain the splits one lane at a time, turning each `outer_tile_size_n`
/// rows by `memory_width` block of A into columns.
pub fn transpose_a<T: Element>(
    plan: &TilingPlan,
    splits: &[StreamReader<T>],
    out: &StreamWriter<T>,
) -> GemmResult<()> {
    let blocks = plan.outer_tiles() * (plan.size_k / plan.memory_width);
    for _ in 0..blocks {
        for split in splits {
            for _ in 0..plan.outer_tile_size_n {
                out.push(split.pop()?)?;
            }
        }
    }
    Ok(())
}

/// Group each column of an outer tile of A into `pack_width_n` packs and
/// replay them for every inner tile pair, one per grid row.
pub fn convert_width_a<T: Element>(
    plan: &TilingPlan,
    input: &StreamReader<T>,
    out: &StreamWriter<Pack<T>>,
) -> GemmResult<()> {
    let mut column = Vec::with_capacity(plan.outer_tile_size_n);
    for _ in 0..plan.outer_tiles() * plan.size_k {
        column.clear();
        for _ in 0..plan.outer_tile_size_n {
            column.push(input.pop()?);
        }
        // Pack index is row * inner_tiles_n + n1
        let packs: Vec<Pack<T>> = column
            .chunks(plan.pack_width_n)
            .map(Pack::from_slice)
            .collect();

        for n1 in 0..plan.inner_tiles_n {
            for _m1 in 0..plan.inner_tiles_m {
                for row in 0..plan.grid_rows {
                    out.push(packs[row * plan.inner_tiles_n + n1].clone())?;
                }
            }
        }
    }
    Ok(())
}

/// Read the row segment of B that one outer tile needs, for every k.
pub fn read_b<T: Element>(
    plan: &TilingPlan,
    b: &[T],
    out: &StreamWriter<Pack<T>>,
) -> GemmResult<()> {
    let width = plan.memory_width;
    for _n0 in 0..plan.outer_tiles_n {
        for m0 in 0..plan.outer_tiles_m {
            for k in 0..plan.size_k {
                for c0 in 0..plan.outer_tile_size_m / width {
                    let start = k * plan.size_m + m0 * plan.outer_tile_size_m + c0 * width;
                    out.push(Pack::from_slice(&b[start..start + width]))?;
                }
            }
        }
    }
    Ok(())
}

/// Regroup B row segments into `pack_width_m` packs and replay them for
/// every inner tile pair, one per grid column.
pub fn convert_width_b<T: Element>(
    plan: &TilingPlan,
    input: &StreamReader<Pack<T>>,
    out: &StreamWriter<Pack<T>>,
) -> GemmResult<()> {
    let mut segment = Vec::with_capacity(plan.outer_tile_size_m);
    for _ in 0..plan.outer_tiles() * plan.size_k {
        segment.clear();
        for _ in 0..plan.outer_tile_size_m / plan.memory_width {
            segment.extend(input.pop()?.iter().copied());
        }
        // Pack index is col * inner_tiles_m + m1
        let packs: Vec<Pack<T>> = segment
            .chunks(plan.pack_width_m)
            .map(Pack::from_slice)
            .collect();

        for _n1 in 0..plan.inner_tiles_n {
            for m1 in 0..plan.inner_tiles_m {
                for col in 0..plan.grid_cols {
                    out.push(packs[col * plan.inner_tiles_m + m1].clone())?;
                }
            }
        }
    }
    Ok(())
}

/// Collect result packs from the top of every grid column so that each
/// outer tile comes out row-major.
pub fn fan_in_c<T: Element>(
    plan: &TilingPlan,
    tops: &[StreamReader<Pack<T>>],
    out: &StreamWriter<Pack<T>>,
) -> GemmResult<()> {
    for _ in 0..plan.outer_tiles() {
        // Rows arrive grid row by grid row, then by n1, then by n2
        for _ in 0..plan.outer_tile_size_n {
            for top in tops {
                for _ in 0..plan.inner_tiles_m {
                    out.push(top.pop()?)?;
                }
            }
        }
    }
    Ok(())
}

/// Regroup `pack_width_m` result packs into `memory_width` storage packs.
pub fn convert_width_c<T: Element>(
    plan: &TilingPlan,
    input: &StreamReader<Pack<T>>,
    out: &StreamWriter<Pack<T>>,
) -> GemmResult<()> {
    let packs_in = plan.size_n * plan.size_m / plan.pack_width_m;
    let mut pending = Vec::with_capacity(plan.memory_width);
    for _ in 0..packs_in {
        for &value in input.pop()?.iter() {
            pending.push(value);
            if pending.len() == plan.memory_width {
                out.push(Pack::from_slice(&pending))?;
                pending.clear();
            }
        }
    }
    debug_assert!(pending.is_empty());
    Ok(())
}

/// Place storage packs of C into the row-major output.
pub fn write_c<T: Element>(
    plan: &TilingPlan,
    input: &StreamReader<Pack<T>>,
    c: &mut [T],
) -> GemmResult<()> {
    let width = plan.memory_width;
    for n0 in 0..plan.outer_tiles_n {
        for m0 in 0..plan.outer_tiles_m {
            for r in 0..plan.outer_tile_size_n {
                let row = n0 * plan.outer_tile_size_n + r;
                for c0 in 0..plan.outer_tile_size_m / width {
                    let start = row * plan.size_m + m0 * plan.outer_tile_size_m + c0 * width;
                    let pack = input.pop()?;
                    c[start..start + width].copy_from_slice(pack.as_slice());
                }
            }
        }
    }
    Ok(())
}
