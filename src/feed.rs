//! Operand feed chains
//!
//! One chain per operand: A is fed along the grid rows, B along the grid
//! columns. Each step of the stream carries one pack per chain position in
//! position order. Position `i` keeps the first pack it pops for its own grid
//! row/column and forwards the remaining ones, unchanged and in order, to
//! position `i + 1`. The last position forwards nothing.

use crate::error::GemmResult;
use crate::ops::Element;
use crate::pack::Pack;
use crate::stream::{StreamReader, StreamWriter};
use crate::topology::StageId;

pub struct OperandFeed<T> {
    stage: StageId,
    position: usize,
    chain_len: usize,
    steps: usize,
    input: StreamReader<Pack<T>>,
    local: StreamWriter<Pack<T>>,
    next: Option<StreamWriter<Pack<T>>>,
}

impl<T: Element> OperandFeed<T> {
    /// `next` must be present exactly when `position` is not the last one.
    pub fn new(
        stage: StageId,
        position: usize,
        chain_len: usize,
        steps: usize,
        input: StreamReader<Pack<T>>,
        local: StreamWriter<Pack<T>>,
        next: Option<StreamWriter<Pack<T>>>,
    ) -> Self {
        debug_assert!(position < chain_len);
        debug_assert_eq!(next.is_some(), position + 1 < chain_len);
        Self {
            stage,
            position,
            chain_len,
            steps,
            input,
            local,
            next,
        }
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub fn run(self) -> GemmResult<()> {
        log::trace!("{} started", self.stage);
        let downstream = self.chain_len - self.position - 1;

        for _ in 0..self.steps {
            self.local.push(self.input.pop()?)?;
            if let Some(next) = &self.next {
                for _ in 0..downstream {
                    next.push(self.input.pop()?)?;
                }
            }
        }

        log::trace!("{} finished after {} steps", self.stage, self.steps);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{stream, Watchdog};
    use pretty_assertions::assert_eq;
    use std::thread;
    use std::time::Duration;

    fn watchdog() -> Watchdog {
        Watchdog::new(Duration::from_secs(10))
    }

    #[test]
    fn test_chain_splits_by_position() {
        let chain_len = 3;
        let steps = 4;

        let (head_tx, mut upstream) = stream::<Pack<i32>>("a_feed[0]", 2, &watchdog());
        let mut feeds = Vec::new();
        let mut locals = Vec::new();
        for i in 0..chain_len {
            let (local_tx, local_rx) = stream(format!("a_pipe[{}][0]", i), 2, &watchdog());
            let (next, following) = if i + 1 < chain_len {
                let (tx, rx) = stream(format!("a_feed[{}]", i + 1), 1, &watchdog());
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };
            feeds.push(OperandFeed::new(
                StageId::FeedA(i),
                i,
                chain_len,
                steps,
                upstream,
                local_tx,
                next,
            ));
            locals.push(local_rx);
            match following {
                Some(rx) => upstream = rx,
                None => break,
            }
        }

        let received = thread::scope(|scope| {
            for feed in feeds {
                scope.spawn(move || feed.run().unwrap());
            }
            scope.spawn(move || {
                for step in 0..steps {
                    for position in 0..chain_len {
                        let tag = (step * 10 + position) as i32;
                        head_tx.push(Pack::splat(tag, 2)).unwrap();
                    }
                }
            });

            let readers: Vec<_> = locals
                .into_iter()
                .map(|rx| {
                    scope.spawn(move || {
                        (0..steps)
                            .map(|_| rx.pop().unwrap()[0])
                            .collect::<Vec<i32>>()
                    })
                })
                .collect();
            readers
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });

        assert_eq!(
            received,
            vec![
                vec![0, 10, 20, 30],
                vec![1, 11, 21, 31],
                vec![2, 12, 22, 32],
            ]
        );
    }
}
