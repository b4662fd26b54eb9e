//! Compute grid assembly and execution
//!
//! Wires an `R x S` array of processing elements: A flows left to right, B
//! top to bottom, C bottom to top, with the top row handing finished tiles
//! to the fan-in. Every stage of the graph runs on its own scoped thread
//! and talks to its neighbours only through bounded streams.

use std::fmt;
use std::marker::PhantomData;
use std::thread;
use std::time::Instant;

use serde::Serialize;

use crate::adapters::{
    convert_width_a, convert_width_b, convert_width_c, fan_in_c, read_a, read_b, transpose_a,
    write_c,
};
use crate::config::{GemmConfig, TilingPlan};
use crate::error::{GemmError, GemmResult};
use crate::feed::OperandFeed;
use crate::matrix::Matrix;
use crate::ops::{Add, Element, MapOperator, Multiply, ReduceOperator};
use crate::pack::Pack;
use crate::pe::{PePorts, PeReport, ProcessingElement};
use crate::stream::{StreamReader, StreamWriter, Watchdog};
use crate::topology::{ChannelArena, ChannelId, ChannelKind, StageId, Topology};

/// Outcome of one complete run of the grid
#[derive(Debug, Clone, Serialize)]
pub struct GridReport {
    pub plan: TilingPlan,
    pub stages: usize,
    pub channels: usize,
    pub elapsed_ms: f64,
    pub processing_elements: Vec<PeReport>,
}

impl GridReport {
    pub fn packs_reduced(&self) -> usize {
        self.processing_elements.iter().map(|pe| pe.packs_reduced).sum()
    }

    pub fn packs_forwarded(&self) -> usize {
        self.processing_elements
            .iter()
            .map(|pe| pe.packs_forwarded)
            .sum()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for GridReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Grid Report")?;
        writeln!(f, "===========")?;
        writeln!(
            f,
            "Problem: {}x{} @ {}x{}",
            self.plan.size_n, self.plan.size_k, self.plan.size_k, self.plan.size_m
        )?;
        writeln!(f, "Grid: {}x{}", self.plan.grid_rows, self.plan.grid_cols)?;
        writeln!(f, "Stages: {}, channels: {}", self.stages, self.channels)?;
        writeln!(f, "Elapsed: {:.3} ms", self.elapsed_ms)?;
        for pe in &self.processing_elements {
            writeln!(
                f,
                "  pe[{}][{}]: {} reduced, {} drained, {} forwarded",
                pe.row, pe.col, pe.packs_reduced, pe.packs_drained, pe.packs_forwarded
            )?;
        }
        Ok(())
    }
}

/// Every stage of one run with its channel endpoints already claimed
struct Wiring<T, M, R> {
    a_splits_in: Vec<StreamWriter<T>>,
    a_splits_out: Vec<StreamReader<T>>,
    a_convert_in: StreamWriter<T>,
    a_convert_out: StreamReader<T>,
    a_head: StreamWriter<Pack<T>>,
    b_memory_in: StreamWriter<Pack<T>>,
    b_memory_out: StreamReader<Pack<T>>,
    b_head: StreamWriter<Pack<T>>,
    feeds: Vec<OperandFeed<T>>,
    pes: Vec<ProcessingElement<T, M, R>>,
    c_tops: Vec<StreamReader<Pack<T>>>,
    c_convert_in: StreamWriter<Pack<T>>,
    c_convert_out: StreamReader<Pack<T>>,
    c_memory_in: StreamWriter<Pack<T>>,
    c_memory_out: StreamReader<Pack<T>>,
    topology: Topology,
}

type StageOutcome = GemmResult<Option<PeReport>>;

/// A systolic GEMM engine for one fixed configuration
///
/// `M` combines an A value with a B value and `R` folds the results along K;
/// the defaults give the ordinary matrix product.
pub struct SystolicGemm<T, M = Multiply, R = Add> {
    config: GemmConfig,
    plan: TilingPlan,
    _ops: PhantomData<fn() -> (T, M, R)>,
}

impl<T, M, R> SystolicGemm<T, M, R>
where
    T: Element,
    M: MapOperator<T>,
    R: ReduceOperator<T>,
{
    pub fn new(config: GemmConfig) -> GemmResult<Self> {
        let plan = config.plan()?;
        Ok(Self {
            config,
            plan,
            _ops: PhantomData,
        })
    }

    pub fn config(&self) -> &GemmConfig {
        &self.config
    }

    pub fn plan(&self) -> &TilingPlan {
        &self.plan
    }

    /// Wire the graph without running it.
    pub fn topology(&self) -> GemmResult<Topology> {
        Ok(self.wire()?.topology)
    }

    /// Multiply row-major `a` (N x K) by row-major `b` (K x M).
    pub fn multiply(&self, a: &[T], b: &[T]) -> GemmResult<Vec<T>> {
        let mut c = vec![R::identity(); self.plan.size_n * self.plan.size_m];
        self.multiply_into(a, b, &mut c)?;
        Ok(c)
    }

    pub fn multiply_matrices(&self, a: &Matrix<T>, b: &Matrix<T>) -> GemmResult<Matrix<T>> {
        let expected_a = (self.plan.size_n, self.plan.size_k);
        let expected_b = (self.plan.size_k, self.plan.size_m);
        if a.shape() != expected_a {
            return Err(GemmError::invalid_config(format!(
                "A is {:?} but the grid is built for {:?}",
                a.shape(),
                expected_a
            )));
        }
        if b.shape() != expected_b {
            return Err(GemmError::invalid_config(format!(
                "B is {:?} but the grid is built for {:?}",
                b.shape(),
                expected_b
            )));
        }
        let data = self.multiply(a.data(), b.data())?;
        Matrix::new(self.plan.size_n, self.plan.size_m, data)
    }

    /// Run the whole pipeline once, writing the product into `c`.
    pub fn multiply_into(&self, a: &[T], b: &[T], c: &mut [T]) -> GemmResult<GridReport> {
        let plan = &self.plan;
        check_len("A", a, plan.size_n * plan.size_k)?;
        check_len("B", b, plan.size_k * plan.size_m)?;
        check_len("C", c, plan.size_n * plan.size_m)?;

        let Wiring {
            a_splits_in,
            a_splits_out,
            a_convert_in,
            a_convert_out,
            a_head,
            b_memory_in,
            b_memory_out,
            b_head,
            feeds,
            pes,
            c_tops,
            c_convert_in,
            c_convert_out,
            c_memory_in,
            c_memory_out,
            topology,
        } = self.wire()?;

        log::debug!(
            "running {}x{} grid: {} stages, {} channels",
            plan.grid_rows,
            plan.grid_cols,
            topology.stages.len(),
            topology.channels.len()
        );
        let started = Instant::now();

        let outcomes: Vec<(StageId, thread::Result<StageOutcome>)> = thread::scope(|scope| {
            let mut handles = Vec::with_capacity(topology.stages.len());

            handles.push((
                StageId::ReadA,
                scope.spawn(move || adapter(StageId::ReadA, || read_a(plan, a, &a_splits_in))),
            ));
            handles.push((
                StageId::TransposeA,
                scope.spawn(move || {
                    adapter(StageId::TransposeA, || {
                        transpose_a(plan, &a_splits_out, &a_convert_in)
                    })
                }),
            ));
            handles.push((
                StageId::ConvertWidthA,
                scope.spawn(move || {
                    adapter(StageId::ConvertWidthA, || {
                        convert_width_a(plan, &a_convert_out, &a_head)
                    })
                }),
            ));
            handles.push((
                StageId::ReadB,
                scope.spawn(move || adapter(StageId::ReadB, || read_b(plan, b, &b_memory_in))),
            ));
            handles.push((
                StageId::ConvertWidthB,
                scope.spawn(move || {
                    adapter(StageId::ConvertWidthB, || {
                        convert_width_b(plan, &b_memory_out, &b_head)
                    })
                }),
            ));

            for feed in feeds {
                handles.push((feed.stage(), scope.spawn(move || feed.run().map(|_| None))));
            }
            for pe in pes {
                handles.push((pe.stage(), scope.spawn(move || pe.run().map(Some))));
            }

            handles.push((
                StageId::FanInC,
                scope.spawn(move || {
                    adapter(StageId::FanInC, || fan_in_c(plan, &c_tops, &c_convert_in))
                }),
            ));
            handles.push((
                StageId::ConvertWidthC,
                scope.spawn(move || {
                    adapter(StageId::ConvertWidthC, || {
                        convert_width_c(plan, &c_convert_out, &c_memory_in)
                    })
                }),
            ));
            handles.push((
                StageId::WriteC,
                scope.spawn(move || adapter(StageId::WriteC, || write_c(plan, &c_memory_out, c))),
            ));

            handles
                .into_iter()
                .map(|(stage, handle)| (stage, handle.join()))
                .collect()
        });

        let mut processing_elements = Vec::with_capacity(plan.processing_elements());
        let mut failure: Option<GemmError> = None;
        for (stage, outcome) in outcomes {
            let result = outcome.unwrap_or_else(|_| {
                Err(GemmError::StagePanicked {
                    stage: stage.to_string(),
                })
            });
            match result {
                Ok(Some(report)) => processing_elements.push(report),
                Ok(None) => {}
                Err(err) => {
                    log::debug!("{} failed: {}", stage, err);
                    let worse = failure
                        .as_ref()
                        .map_or(true, |current| err.severity() > current.severity());
                    if worse {
                        failure = Some(err);
                    }
                }
            }
        }
        if let Some(err) = failure {
            log::warn!("grid run failed: {}", err);
            return Err(err);
        }

        let report = GridReport {
            plan: *plan,
            stages: topology.stages.len(),
            channels: topology.channels.len(),
            elapsed_ms: started.elapsed().as_secs_f64() * 1e3,
            processing_elements,
        };
        log::info!(
            "{}x{}x{} product on a {}x{} grid finished in {:.3} ms",
            plan.size_n,
            plan.size_k,
            plan.size_m,
            plan.grid_rows,
            plan.grid_cols,
            report.elapsed_ms
        );
        Ok(report)
    }

    fn wire(&self) -> GemmResult<Wiring<T, M, R>> {
        let plan = self.plan;
        let (rows, cols) = (plan.grid_rows, plan.grid_cols);
        let watchdog = Watchdog::new(plan.stall_timeout());
        let mut scalars = ChannelArena::<T>::new(&watchdog);
        let mut packs = ChannelArena::<Pack<T>>::new(&watchdog);
        let mut stages = Vec::new();

        // Open every channel
        for lane in 0..plan.memory_width {
            scalars.open(ChannelId::line(ChannelKind::ASplit, lane), plan.transpose_depth)?;
        }
        scalars.open(ChannelId::single(ChannelKind::AConvert), plan.feed_depth)?;
        packs.open(ChannelId::single(ChannelKind::BMemory), plan.feed_depth)?;
        packs.open(ChannelId::single(ChannelKind::CConvert), plan.feed_depth)?;
        packs.open(ChannelId::single(ChannelKind::CMemory), plan.feed_depth)?;
        for n in 0..rows {
            packs.open(ChannelId::line(ChannelKind::AFeed, n), plan.feed_depth)?;
        }
        for m in 0..cols {
            packs.open(ChannelId::line(ChannelKind::BFeed, m), plan.feed_depth)?;
        }
        for n in 0..rows {
            for m in 0..cols {
                for kind in [ChannelKind::APipe, ChannelKind::BPipe, ChannelKind::CPipe] {
                    packs.open(ChannelId::grid(kind, n, m), plan.pipe_depth)?;
                }
            }
        }

        // A path
        let a_splits_in = (0..plan.memory_width)
            .map(|lane| scalars.writer(ChannelId::line(ChannelKind::ASplit, lane), StageId::ReadA))
            .collect::<GemmResult<Vec<_>>>()?;
        stages.push(StageId::ReadA);
        let a_splits_out = (0..plan.memory_width)
            .map(|lane| {
                scalars.reader(ChannelId::line(ChannelKind::ASplit, lane), StageId::TransposeA)
            })
            .collect::<GemmResult<Vec<_>>>()?;
        let a_convert_in =
            scalars.writer(ChannelId::single(ChannelKind::AConvert), StageId::TransposeA)?;
        stages.push(StageId::TransposeA);
        let a_convert_out =
            scalars.reader(ChannelId::single(ChannelKind::AConvert), StageId::ConvertWidthA)?;
        let a_head = packs.writer(ChannelId::line(ChannelKind::AFeed, 0), StageId::ConvertWidthA)?;
        stages.push(StageId::ConvertWidthA);

        // B path
        let b_memory_in = packs.writer(ChannelId::single(ChannelKind::BMemory), StageId::ReadB)?;
        stages.push(StageId::ReadB);
        let b_memory_out =
            packs.reader(ChannelId::single(ChannelKind::BMemory), StageId::ConvertWidthB)?;
        let b_head = packs.writer(ChannelId::line(ChannelKind::BFeed, 0), StageId::ConvertWidthB)?;
        stages.push(StageId::ConvertWidthB);

        // Feed chains
        let mut feeds = Vec::with_capacity(rows + cols);
        for n in 0..rows {
            let stage = StageId::FeedA(n);
            let input = packs.reader(ChannelId::line(ChannelKind::AFeed, n), stage)?;
            let local = packs.writer(ChannelId::grid(ChannelKind::APipe, n, 0), stage)?;
            let next = if n + 1 < rows {
                Some(packs.writer(ChannelId::line(ChannelKind::AFeed, n + 1), stage)?)
            } else {
                None
            };
            feeds.push(OperandFeed::new(stage, n, rows, plan.steps(), input, local, next));
            stages.push(stage);
        }
        for m in 0..cols {
            let stage = StageId::FeedB(m);
            let input = packs.reader(ChannelId::line(ChannelKind::BFeed, m), stage)?;
            let local = packs.writer(ChannelId::grid(ChannelKind::BPipe, 0, m), stage)?;
            let next = if m + 1 < cols {
                Some(packs.writer(ChannelId::line(ChannelKind::BFeed, m + 1), stage)?)
            } else {
                None
            };
            feeds.push(OperandFeed::new(stage, m, cols, plan.steps(), input, local, next));
            stages.push(stage);
        }

        // Processing elements
        let mut pes = Vec::with_capacity(plan.processing_elements());
        for n in 0..rows {
            for m in 0..cols {
                let stage = StageId::ProcessingElement(n, m);
                let last_col = m + 1 == cols;
                let last_row = n + 1 == rows;
                let ports = PePorts {
                    a_in: packs.reader(ChannelId::grid(ChannelKind::APipe, n, m), stage)?,
                    a_out: if last_col {
                        None
                    } else {
                        Some(packs.writer(ChannelId::grid(ChannelKind::APipe, n, m + 1), stage)?)
                    },
                    b_in: packs.reader(ChannelId::grid(ChannelKind::BPipe, n, m), stage)?,
                    b_out: if last_row {
                        None
                    } else {
                        Some(packs.writer(ChannelId::grid(ChannelKind::BPipe, n + 1, m), stage)?)
                    },
                    c_in: if last_row {
                        None
                    } else {
                        Some(packs.reader(ChannelId::grid(ChannelKind::CPipe, n + 1, m), stage)?)
                    },
                    c_out: packs.writer(ChannelId::grid(ChannelKind::CPipe, n, m), stage)?,
                };
                pes.push(ProcessingElement::new(n, m, plan, ports));
                stages.push(stage);
            }
        }

        // C path
        let c_tops = (0..cols)
            .map(|m| packs.reader(ChannelId::grid(ChannelKind::CPipe, 0, m), StageId::FanInC))
            .collect::<GemmResult<Vec<_>>>()?;
        let c_convert_in = packs.writer(ChannelId::single(ChannelKind::CConvert), StageId::FanInC)?;
        stages.push(StageId::FanInC);
        let c_convert_out =
            packs.reader(ChannelId::single(ChannelKind::CConvert), StageId::ConvertWidthC)?;
        let c_memory_in =
            packs.writer(ChannelId::single(ChannelKind::CMemory), StageId::ConvertWidthC)?;
        stages.push(StageId::ConvertWidthC);
        let c_memory_out = packs.reader(ChannelId::single(ChannelKind::CMemory), StageId::WriteC)?;
        stages.push(StageId::WriteC);

        let mut channels = scalars.finish()?;
        channels.extend(packs.finish()?);
        let topology = Topology::new(stages, channels);

        Ok(Wiring {
            a_splits_in,
            a_splits_out,
            a_convert_in,
            a_convert_out,
            a_head,
            b_memory_in,
            b_memory_out,
            b_head,
            feeds,
            pes,
            c_tops,
            c_convert_in,
            c_convert_out,
            c_memory_in,
            c_memory_out,
            topology,
        })
    }
}

fn check_len<T>(operand: &str, values: &[T], expected: usize) -> GemmResult<()> {
    if values.len() != expected {
        return Err(GemmError::shape(operand, expected, values.len()));
    }
    Ok(())
}

/// Run one boundary adapter stage with start/finish tracing.
fn adapter(stage: StageId, body: impl FnOnce() -> GemmResult<()>) -> StageOutcome {
    log::trace!("{} started", stage);
    body()?;
    log::trace!("{} finished", stage);
    Ok(None)
}
