//! The systolic processing element
//!
//! A PE at grid position `(row, col)` owns one `block_rows x block_cols`
//! block of every outer tile. For each outer tile it runs three phases:
//!
//! 1. **Reducing**: for every `k` and every inner tile pair `(n1, m1)`, pop
//!    one A pack and one B pack, pass them on to the right and downwards,
//!    and fold their outer product into the private accumulation buffer.
//! 2. **Draining**: push the buffer onto the C output in `(n1, n2, m1)`
//!    order.
//! 3. **Forwarding**: relay the finished tiles of every PE below this one,
//!    a whole tile at a time, towards the top edge of the grid.

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;

use crate::config::TilingPlan;
use crate::error::GemmResult;
use crate::ops::{Element, MapOperator, ReduceOperator};
use crate::pack::Pack;
use crate::stream::{StreamReader, StreamWriter};
use crate::topology::StageId;

/// Phase of a processing element within one outer tile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PePhase {
    Reducing,
    Draining,
    Forwarding,
    Done,
}

impl fmt::Display for PePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PePhase::Reducing => write!(f, "REDUCING"),
            PePhase::Draining => write!(f, "DRAINING"),
            PePhase::Forwarding => write!(f, "FORWARDING"),
            PePhase::Done => write!(f, "DONE"),
        }
    }
}

/// Channel endpoints of one processing element
///
/// Outputs are absent on the grid edges: the last column passes no A on,
/// the last row passes no B down and has no C input from below.
pub struct PePorts<T> {
    pub a_in: StreamReader<Pack<T>>,
    pub a_out: Option<StreamWriter<Pack<T>>>,
    pub b_in: StreamReader<Pack<T>>,
    pub b_out: Option<StreamWriter<Pack<T>>>,
    pub c_in: Option<StreamReader<Pack<T>>>,
    pub c_out: StreamWriter<Pack<T>>,
}

/// Traffic counters of one processing element
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PeReport {
    pub row: usize,
    pub col: usize,
    pub outer_tiles: usize,
    pub packs_reduced: usize,
    pub packs_drained: usize,
    pub packs_forwarded: usize,
}

/// Private partial sums of one outer tile, indexed by
/// `(n1 * inner_tiles_m + m1, n2)`.
struct AccumulationBuffer<T> {
    entries: Vec<Pack<T>>,
    slots: usize,
}

impl<T: Element> AccumulationBuffer<T> {
    fn new<R: ReduceOperator<T>>(tiles: usize, slots: usize, width: usize) -> Self {
        Self {
            entries: vec![Pack::splat(R::identity(), width); tiles * slots],
            slots,
        }
    }

    /// Fold the outer product of `a` and `b` into tile `tile`.
    ///
    /// On the first k the previous value is the reduce identity, not
    /// whatever the last outer tile left behind.
    fn accumulate<M, R>(&mut self, tile: usize, a: &Pack<T>, b: &Pack<T>, first: bool)
    where
        M: MapOperator<T>,
        R: ReduceOperator<T>,
    {
        for n2 in 0..self.slots {
            let entry = &mut self.entries[tile * self.slots + n2];
            for m2 in 0..b.width() {
                let prev = if first { R::identity() } else { entry[m2] };
                entry[m2] = R::apply(prev, M::apply(a[n2], b[m2]));
            }
        }
    }

    fn reset<R: ReduceOperator<T>>(&mut self) {
        for entry in &mut self.entries {
            for m2 in 0..entry.width() {
                entry[m2] = R::identity();
            }
        }
    }

    fn get(&self, tile: usize, n2: usize) -> &Pack<T> {
        &self.entries[tile * self.slots + n2]
    }
}

pub struct ProcessingElement<T, M, R> {
    row: usize,
    col: usize,
    plan: TilingPlan,
    ports: PePorts<T>,
    buffer: AccumulationBuffer<T>,
    report: PeReport,
    _ops: PhantomData<fn() -> (M, R)>,
}

impl<T, M, R> ProcessingElement<T, M, R>
where
    T: Element,
    M: MapOperator<T>,
    R: ReduceOperator<T>,
{
    pub fn new(row: usize, col: usize, plan: TilingPlan, ports: PePorts<T>) -> Self {
        debug_assert_eq!(ports.a_out.is_some(), col + 1 < plan.grid_cols);
        debug_assert_eq!(ports.b_out.is_some(), row + 1 < plan.grid_rows);
        debug_assert_eq!(ports.c_in.is_some(), row + 1 < plan.grid_rows);
        Self {
            row,
            col,
            plan,
            ports,
            buffer: AccumulationBuffer::new::<R>(
                plan.compute_tiles(),
                plan.pack_width_n,
                plan.pack_width_m,
            ),
            report: PeReport {
                row,
                col,
                ..Default::default()
            },
            _ops: PhantomData,
        }
    }

    pub fn stage(&self) -> StageId {
        StageId::ProcessingElement(self.row, self.col)
    }

    pub fn run(mut self) -> GemmResult<PeReport> {
        let stage = self.stage();
        log::trace!("{} started", stage);

        for n0 in 0..self.plan.outer_tiles_n {
            for m0 in 0..self.plan.outer_tiles_m {
                self.enter(PePhase::Reducing, n0, m0);
                self.reduce()?;
                self.enter(PePhase::Draining, n0, m0);
                self.drain()?;
                if self.ports.c_in.is_some() {
                    self.enter(PePhase::Forwarding, n0, m0);
                    self.forward()?;
                }
                self.report.outer_tiles += 1;
            }
        }

        log::trace!("{} entered {}", stage, PePhase::Done);
        Ok(self.report)
    }

    fn enter(&self, phase: PePhase, n0: usize, m0: usize) {
        log::trace!("{} outer tile ({}, {}): {}", self.stage(), n0, m0, phase);
    }

    fn reduce(&mut self) -> GemmResult<()> {
        if self.plan.size_k == 0 {
            self.buffer.reset::<R>();
            return Ok(());
        }

        for k in 0..self.plan.size_k {
            for n1 in 0..self.plan.inner_tiles_n {
                for m1 in 0..self.plan.inner_tiles_m {
                    let a = self.ports.a_in.pop()?;
                    if let Some(a_out) = &self.ports.a_out {
                        a_out.push(a.clone())?;
                    }
                    let b = self.ports.b_in.pop()?;
                    if let Some(b_out) = &self.ports.b_out {
                        b_out.push(b.clone())?;
                    }

                    let tile = n1 * self.plan.inner_tiles_m + m1;
                    self.buffer.accumulate::<M, R>(tile, &a, &b, k == 0);
                    self.report.packs_reduced += 1;
                }
            }
        }
        Ok(())
    }

    fn drain(&mut self) -> GemmResult<()> {
        for n1 in 0..self.plan.inner_tiles_n {
            for n2 in 0..self.plan.pack_width_n {
                for m1 in 0..self.plan.inner_tiles_m {
                    let tile = n1 * self.plan.inner_tiles_m + m1;
                    self.ports.c_out.push(self.buffer.get(tile, n2).clone())?;
                    self.report.packs_drained += 1;
                }
            }
        }
        Ok(())
    }

    /// Rows below this one each send one full tile, nearest first.
    fn forward(&mut self) -> GemmResult<()> {
        let Some(c_in) = &self.ports.c_in else {
            return Ok(());
        };
        let below = self.plan.grid_rows - self.row - 1;
        for _ in 0..below * self.plan.tile_packs() {
            self.ports.c_out.push(c_in.pop()?)?;
            self.report.packs_forwarded += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GemmConfig;
    use crate::ops::{Add, Max, Multiply};
    use crate::stream::{stream, Watchdog};
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Duration;

    fn watchdog() -> Watchdog {
        Watchdog::new(Duration::from_secs(10))
    }

    fn lone_ports<T: Element>(
        plan: &TilingPlan,
    ) -> (
        PePorts<T>,
        StreamWriter<Pack<T>>,
        StreamWriter<Pack<T>>,
        StreamReader<Pack<T>>,
    ) {
        let (a_tx, a_in) = stream("a_pipe[0][0]", plan.pipe_depth, &watchdog());
        let (b_tx, b_in) = stream("b_pipe[0][0]", plan.pipe_depth, &watchdog());
        let (c_out, c_rx) = stream("c_pipe[0][0]", plan.pipe_depth, &watchdog());
        let ports = PePorts {
            a_in,
            a_out: None,
            b_in,
            b_out: None,
            c_in: None,
            c_out,
        };
        (ports, a_tx, b_tx, c_rx)
    }

    #[test]
    fn test_buffer_starts_from_identity() {
        let mut buffer = AccumulationBuffer::<i32>::new::<Add>(1, 2, 2);
        let a = Pack::from_slice(&[1, 2]);
        let b = Pack::from_slice(&[3, 4]);
        buffer.accumulate::<Multiply, Add>(0, &a, &b, true);
        buffer.accumulate::<Multiply, Add>(0, &a, &b, false);
        assert_eq!(buffer.get(0, 0).as_slice(), &[6, 8]);
        assert_eq!(buffer.get(0, 1).as_slice(), &[12, 16]);

        // A new reduction ignores stale contents
        buffer.accumulate::<Multiply, Add>(0, &a, &b, true);
        assert_eq!(buffer.get(0, 1).as_slice(), &[6, 8]);
    }

    #[test]
    fn test_single_pe_outer_product() {
        let plan = GemmConfig::single_pe(4, 2, 4).plan().unwrap();
        let (ports, a_tx, b_tx, c_rx) = lone_ports::<i64>(&plan);
        let pe = ProcessingElement::<i64, Multiply, Add>::new(0, 0, plan, ports);

        let (report, rows) = thread::scope(|scope| {
            let handle = scope.spawn(move || pe.run().unwrap());
            // Columns of A and rows of B for k = 0, 1
            for (a, b) in [([1, 3, 5, 7], [1, 0, 0, 0]), ([2, 4, 6, 8], [0, 1, 0, 0])] {
                a_tx.push(Pack::from_slice(&a)).unwrap();
                b_tx.push(Pack::from_slice(&b)).unwrap();
            }
            let rows: Vec<Vec<i64>> =
                (0..4).map(|_| c_rx.pop().unwrap().as_slice().to_vec()).collect();
            (handle.join().unwrap(), rows)
        });

        assert_eq!(
            rows,
            vec![
                vec![1, 2, 0, 0],
                vec![3, 4, 0, 0],
                vec![5, 6, 0, 0],
                vec![7, 8, 0, 0],
            ]
        );
        assert_eq!(report.packs_reduced, 2);
        assert_eq!(report.packs_drained, 4);
        assert_eq!(report.packs_forwarded, 0);
        assert_eq!(report.outer_tiles, 1);
    }

    #[test]
    fn test_drain_order_with_inner_tiles() {
        // One PE, 2x2 inner tiles of 1x1 packs, K = 1, max-plus
        let plan = GemmConfig::from_tiling(1, (1, 1), (1, 1), (2, 2), (1, 1))
            .plan()
            .unwrap();
        let (ports, a_tx, b_tx, c_rx) = lone_ports::<i32>(&plan);
        let pe = ProcessingElement::<i32, Add, Max>::new(0, 0, plan, ports);

        let drained = thread::scope(|scope| {
            scope.spawn(move || pe.run().unwrap());
            // (n1, m1) = (0,0), (0,1), (1,0), (1,1)
            for (a, b) in [(10, 1), (10, 2), (20, 1), (20, 2)] {
                a_tx.push(Pack::splat(a, 1)).unwrap();
                b_tx.push(Pack::splat(b, 1)).unwrap();
            }
            (0..4).map(|_| c_rx.pop().unwrap()[0]).collect::<Vec<i32>>()
        });

        assert_eq!(drained, vec![11, 12, 21, 22]);
    }

    #[test]
    fn test_top_row_forwards_tile_from_below() {
        // Two grid rows, one column: PE (0, 0) passes B down and relays
        // the tile of PE (1, 0) after its own.
        let plan = GemmConfig::from_tiling(1, (1, 1), (2, 1), (1, 1), (1, 2))
            .plan()
            .unwrap();
        let (a_tx, a_in) = stream("a_pipe[0][0]", 1, &watchdog());
        let (b_tx, b_in) = stream("b_pipe[0][0]", 1, &watchdog());
        let (b_out, b_rx) = stream("b_pipe[1][0]", 1, &watchdog());
        let (c_below, c_in) = stream("c_pipe[1][0]", 1, &watchdog());
        let (c_out, c_rx) = stream("c_pipe[0][0]", 1, &watchdog());
        let ports = PePorts {
            a_in,
            a_out: None,
            b_in,
            b_out: Some(b_out),
            c_in: Some(c_in),
            c_out,
        };
        let pe = ProcessingElement::<i32, Multiply, Add>::new(0, 0, plan, ports);

        let (report, passed, relayed) = thread::scope(|scope| {
            let handle = scope.spawn(move || pe.run().unwrap());
            a_tx.push(Pack::splat(3, 1)).unwrap();
            b_tx.push(Pack::from_slice(&[1, 2])).unwrap();
            let passed = b_rx.pop().unwrap();
            scope.spawn(move || c_below.push(Pack::from_slice(&[-1, -2])).unwrap());
            let relayed = (0..2).map(|_| c_rx.pop().unwrap()).collect::<Vec<_>>();
            (handle.join().unwrap(), passed, relayed)
        });

        assert_eq!(passed.as_slice(), &[1, 2]);
        assert_eq!(relayed[0].as_slice(), &[3, 6]);
        assert_eq!(relayed[1].as_slice(), &[-1, -2]);
        assert_eq!(report.packs_forwarded, 1);
    }

    #[test]
    fn test_empty_k_drains_identity() {
        let plan = GemmConfig::single_pe(2, 0, 3).plan().unwrap();
        let (ports, _a_tx, _b_tx, c_rx) = lone_ports::<f32>(&plan);
        let pe = ProcessingElement::<f32, Add, Max>::new(0, 0, plan, ports);
        let report = thread::scope(|scope| {
            let handle = scope.spawn(move || pe.run().unwrap());
            for _ in 0..2 {
                assert_eq!(c_rx.pop().unwrap().as_slice(), &[f32::NEG_INFINITY; 3]);
            }
            handle.join().unwrap()
        });
        assert_eq!(report.packs_drained, 2);
        assert_eq!(report.packs_reduced, 0);
    }
}
