//! Static channel topology of the dataflow graph
//!
//! Every channel of the grid is opened in a [`ChannelArena`] under a
//! [`ChannelId`]. Stages then claim the writer and reader halves by name.
//! Claiming an endpoint twice, claiming one that was never opened, or
//! leaving one unclaimed is a wiring defect reported before any stage runs.

use std::collections::BTreeMap;
use std::fmt;
use serde::Serialize;

use crate::error::{GemmError, GemmResult};
use crate::stream::{stream, StreamReader, StreamWriter, Watchdog};

/// A concurrently running stage of the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum StageId {
    ReadA,
    TransposeA,
    ConvertWidthA,
    ReadB,
    ConvertWidthB,
    FeedA(usize),
    FeedB(usize),
    ProcessingElement(usize, usize),
    FanInC,
    ConvertWidthC,
    WriteC,
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageId::ReadA => write!(f, "read_a"),
            StageId::TransposeA => write!(f, "transpose_a"),
            StageId::ConvertWidthA => write!(f, "convert_width_a"),
            StageId::ReadB => write!(f, "read_b"),
            StageId::ConvertWidthB => write!(f, "convert_width_b"),
            StageId::FeedA(row) => write!(f, "feed_a[{}]", row),
            StageId::FeedB(col) => write!(f, "feed_b[{}]", col),
            StageId::ProcessingElement(row, col) => write!(f, "pe[{}][{}]", row, col),
            StageId::FanInC => write!(f, "fan_in_c"),
            StageId::ConvertWidthC => write!(f, "convert_width_c"),
            StageId::WriteC => write!(f, "write_c"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// One per storage pack lane, between the A reader and the transpose
    ASplit,
    AConvert,
    /// Link `i` enters feed stage `i`
    AFeed,
    /// Link `[n][m]` enters the PE at `(n, m)` from the left
    APipe,
    BMemory,
    BFeed,
    /// Link `[n][m]` enters the PE at `(n, m)` from above
    BPipe,
    /// Link `[n][m]` leaves the PE at `(n, m)` upwards
    CPipe,
    CConvert,
    CMemory,
}

impl ChannelKind {
    fn label(&self) -> &'static str {
        match self {
            ChannelKind::ASplit => "a_split",
            ChannelKind::AConvert => "a_convert",
            ChannelKind::AFeed => "a_feed",
            ChannelKind::APipe => "a_pipe",
            ChannelKind::BMemory => "b_memory",
            ChannelKind::BFeed => "b_feed",
            ChannelKind::BPipe => "b_pipe",
            ChannelKind::CPipe => "c_pipe",
            ChannelKind::CConvert => "c_convert",
            ChannelKind::CMemory => "c_memory",
        }
    }
}

/// Position of a channel in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ChannelIndex {
    Single,
    Line(usize),
    Grid(usize, usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ChannelId {
    pub kind: ChannelKind,
    pub index: ChannelIndex,
}

impl ChannelId {
    pub fn single(kind: ChannelKind) -> Self {
        Self {
            kind,
            index: ChannelIndex::Single,
        }
    }

    pub fn line(kind: ChannelKind, i: usize) -> Self {
        Self {
            kind,
            index: ChannelIndex::Line(i),
        }
    }

    pub fn grid(kind: ChannelKind, row: usize, col: usize) -> Self {
        Self {
            kind,
            index: ChannelIndex::Grid(row, col),
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            ChannelIndex::Single => write!(f, "{}", self.kind.label()),
            ChannelIndex::Line(i) => write!(f, "{}[{}]", self.kind.label(), i),
            ChannelIndex::Grid(row, col) => write!(f, "{}[{}][{}]", self.kind.label(), row, col),
        }
    }
}

/// Description of one wired channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSpec {
    pub id: ChannelId,
    pub name: String,
    pub capacity: usize,
    pub producer: StageId,
    pub consumer: StageId,
}

struct Slot<Item> {
    capacity: usize,
    writer: Option<StreamWriter<Item>>,
    reader: Option<StreamReader<Item>>,
    producer: Option<StageId>,
    consumer: Option<StageId>,
}

/// Owner of every channel carrying one item type, until stages claim them
pub struct ChannelArena<Item> {
    slots: BTreeMap<ChannelId, Slot<Item>>,
    watchdog: Watchdog,
}

impl<Item: Send> ChannelArena<Item> {
    pub fn new(watchdog: &Watchdog) -> Self {
        Self {
            slots: BTreeMap::new(),
            watchdog: watchdog.clone(),
        }
    }

    pub fn open(&mut self, id: ChannelId, capacity: usize) -> GemmResult<()> {
        if self.slots.contains_key(&id) {
            return Err(GemmError::miswired(id, "opened twice"));
        }
        let (writer, reader) = stream(id.to_string(), capacity, &self.watchdog);
        self.slots.insert(
            id,
            Slot {
                capacity,
                writer: Some(writer),
                reader: Some(reader),
                producer: None,
                consumer: None,
            },
        );
        Ok(())
    }

    /// Claim the producing end of `id` for `stage`.
    pub fn writer(&mut self, id: ChannelId, stage: StageId) -> GemmResult<StreamWriter<Item>> {
        let slot = self.slots.get_mut(&id).ok_or_else(|| {
            GemmError::miswired(id, format!("{} writes to a channel that was never opened", stage))
        })?;
        if let Some(owner) = slot.producer {
            return Err(GemmError::miswired(
                id,
                format!("{} and {} both produce into it", owner, stage),
            ));
        }
        slot.producer = Some(stage);
        slot.writer
            .take()
            .ok_or_else(|| GemmError::miswired(id, "writer already taken"))
    }

    /// Claim the consuming end of `id` for `stage`.
    pub fn reader(&mut self, id: ChannelId, stage: StageId) -> GemmResult<StreamReader<Item>> {
        let slot = self.slots.get_mut(&id).ok_or_else(|| {
            GemmError::miswired(id, format!("{} reads from a channel that was never opened", stage))
        })?;
        if let Some(owner) = slot.consumer {
            return Err(GemmError::miswired(
                id,
                format!("{} and {} both consume from it", owner, stage),
            ));
        }
        slot.consumer = Some(stage);
        slot.reader
            .take()
            .ok_or_else(|| GemmError::miswired(id, "reader already taken"))
    }

    /// Check that every opened channel has exactly one producer and one
    /// consumer and describe the result.
    pub fn finish(self) -> GemmResult<Vec<ChannelSpec>> {
        self.slots
            .into_iter()
            .map(|(id, slot)| {
                let producer = slot
                    .producer
                    .ok_or_else(|| GemmError::miswired(id, "no producer"))?;
                let consumer = slot
                    .consumer
                    .ok_or_else(|| GemmError::miswired(id, "no consumer"))?;
                Ok(ChannelSpec {
                    id,
                    name: id.to_string(),
                    capacity: slot.capacity,
                    producer,
                    consumer,
                })
            })
            .collect()
    }
}

/// The complete, validated dataflow graph of one build
#[derive(Debug, Clone, Serialize)]
pub struct Topology {
    pub stages: Vec<StageId>,
    pub channels: Vec<ChannelSpec>,
}

impl Topology {
    pub fn new(mut stages: Vec<StageId>, mut channels: Vec<ChannelSpec>) -> Self {
        stages.sort();
        channels.sort_by_key(|c| c.id);
        Self { stages, channels }
    }

    pub fn channels_of(&self, kind: ChannelKind) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(move |c| c.id.kind == kind)
    }

    /// Channels flowing out of `stage`
    pub fn outputs(&self, stage: StageId) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(move |c| c.producer == stage)
    }

    /// Channels flowing into `stage`
    pub fn inputs(&self, stage: StageId) -> impl Iterator<Item = &ChannelSpec> {
        self.channels.iter().filter(move |c| c.consumer == stage)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dataflow Topology")?;
        writeln!(f, "=================")?;
        writeln!(f, "Stages: {}", self.stages.len())?;
        writeln!(f, "Channels: {}", self.channels.len())?;
        writeln!(f)?;
        for channel in &self.channels {
            writeln!(
                f,
                "  {:<18} {:>5}  {} -> {}",
                channel.name, channel.capacity, channel.producer, channel.consumer
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn watchdog() -> Watchdog {
        Watchdog::new(Duration::from_secs(1))
    }

    #[test]
    fn test_names() {
        assert_eq!(ChannelId::grid(ChannelKind::CPipe, 1, 2).to_string(), "c_pipe[1][2]");
        assert_eq!(ChannelId::line(ChannelKind::ASplit, 3).to_string(), "a_split[3]");
        assert_eq!(ChannelId::single(ChannelKind::CMemory).to_string(), "c_memory");
        assert_eq!(StageId::ProcessingElement(0, 1).to_string(), "pe[0][1]");
    }

    #[test]
    fn test_wiring_round_trip() {
        let id = ChannelId::line(ChannelKind::AFeed, 0);
        let mut arena = ChannelArena::<u32>::new(&watchdog());
        arena.open(id, 2).unwrap();
        let tx = arena.writer(id, StageId::ConvertWidthA).unwrap();
        let rx = arena.reader(id, StageId::FeedA(0)).unwrap();
        tx.push(5).unwrap();
        assert_eq!(rx.pop().unwrap(), 5);

        let specs = arena.finish().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].producer, StageId::ConvertWidthA);
        assert_eq!(specs[0].consumer, StageId::FeedA(0));
        assert_eq!(specs[0].capacity, 2);
    }

    #[test]
    fn test_double_claim_is_miswired() {
        let id = ChannelId::grid(ChannelKind::APipe, 0, 1);
        let mut arena = ChannelArena::<u32>::new(&watchdog());
        arena.open(id, 1).unwrap();
        arena.writer(id, StageId::ProcessingElement(0, 0)).unwrap();
        let err = arena.writer(id, StageId::FeedA(0)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Miswired channel a_pipe[0][1]: pe[0][0] and feed_a[0] both produce into it"
        );
    }

    #[test]
    fn test_dangling_endpoint_is_miswired() {
        let id = ChannelId::grid(ChannelKind::CPipe, 2, 0);
        let mut arena = ChannelArena::<u32>::new(&watchdog());
        arena.open(id, 1).unwrap();
        let _tx = arena.writer(id, StageId::ProcessingElement(2, 0)).unwrap();
        assert!(matches!(
            arena.finish(),
            Err(GemmError::MiswiredChannel { .. })
        ));

        let mut arena = ChannelArena::<u32>::new(&watchdog());
        assert!(arena.reader(id, StageId::FanInC).is_err());
    }
}
