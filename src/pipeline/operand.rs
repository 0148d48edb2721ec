//! Operand pipeline: copy engine -> MMA engine
//!
//! Every unit owns a ring of "full" and "empty" barriers, one pair per
//! stage. The leader of an MMA pair announces the bytes it expects on its
//! own full barrier; copies from any unit in the cluster complete those
//! bytes. Empty barriers collect one release from every leader that reads
//! data the unit loaded.

use std::sync::Arc;

use super::{AsyncArrive, Mbarrier, PipelineState};

/// Barrier rings of one unit
#[derive(Debug)]
pub struct OperandBarriers {
    full: Vec<Arc<Mbarrier>>,
    empty: Vec<Arc<Mbarrier>>,
}

impl OperandBarriers {
    pub fn new(stages: usize, consumers: usize) -> Self {
        Self {
            full: (0..stages).map(|_| Arc::new(Mbarrier::new(1))).collect(),
            empty: (0..stages)
                .map(|_| Arc::new(Mbarrier::new(consumers as u32)))
                .collect(),
        }
    }

    pub fn full(&self, index: usize) -> &Arc<Mbarrier> {
        &self.full[index]
    }

    pub fn empty(&self, index: usize) -> &Arc<Mbarrier> {
        &self.empty[index]
    }

    pub fn stages(&self) -> usize {
        self.full.len()
    }

    /// Slot releases completed so far, over every stage
    pub fn released(&self) -> usize {
        self.empty.iter().map(|bar| bar.phase() as usize).sum()
    }

    pub fn barriers(&self) -> impl Iterator<Item = &Arc<Mbarrier>> {
        self.full.iter().chain(self.empty.iter())
    }
}

/// One unit's view of the operand pipeline
pub struct OperandPipeline {
    is_leader: bool,
    /// Bytes the full barrier of a leader expects per stage
    tx_bytes: usize,
    own: Arc<OperandBarriers>,
    release_targets: Vec<Arc<OperandBarriers>>,
}

impl OperandPipeline {
    pub fn new(
        is_leader: bool,
        tx_bytes: usize,
        own: Arc<OperandBarriers>,
        release_targets: Vec<Arc<OperandBarriers>>,
    ) -> Self {
        Self {
            is_leader,
            tx_bytes,
            own,
            release_targets,
        }
    }

    pub fn stages(&self) -> usize {
        self.own.stages()
    }

    /// Slots loaded by this unit that the consumers have not yet released,
    /// counting the one acquired at `state`
    pub fn occupancy(&self, state: &PipelineState) -> usize {
        (state.count() + 1).saturating_sub(self.own.released())
    }

    pub fn producer_try_acquire(&self, state: &PipelineState) -> bool {
        self.own.empty(state.index()).try_wait(state.phase())
    }

    /// Wait for the slot to be empty unless an earlier peek already saw it
    /// empty, then (leader only) announce the bytes about to land.
    pub fn producer_acquire(&self, state: &PipelineState, try_acquire_token: bool) {
        if !try_acquire_token {
            self.own.empty(state.index()).wait(state.phase());
        }
        if self.is_leader {
            self.own.full(state.index()).arrive_and_expect_tx(self.tx_bytes);
        }
    }

    pub fn consumer_try_wait(&self, state: &PipelineState) -> bool {
        self.own.full(state.index()).try_wait(state.phase())
    }

    pub fn consumer_wait(&self, state: &PipelineState, try_wait_token: bool) {
        if !try_wait_token {
            self.own.full(state.index()).wait(state.phase());
        }
    }

    /// Release the slot on every unit whose data the leader read, once the
    /// MMAs reading it have retired.
    pub fn consumer_release(&self, state: &PipelineState, agent: &dyn AsyncArrive) {
        let barriers = self
            .release_targets
            .iter()
            .map(|target| Arc::clone(target.empty(state.index())))
            .collect();
        agent.arrive_after_issued(barriers);
    }

    /// Block until every slot this unit loaded has been released.
    pub fn producer_tail(&self, mut state: PipelineState) {
        for _ in 0..self.stages() {
            self.own.empty(state.index()).wait(state.phase());
            state.advance();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ImmediateArrive;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    const STAGES: usize = 3;
    const BLOCKS: usize = 50;

    #[test_log::test]
    fn test_bounded_buffer_single_unit() {
        let barriers = Arc::new(OperandBarriers::new(STAGES, 1));
        let pipeline = Arc::new(OperandPipeline::new(true, 16, Arc::clone(&barriers), vec![Arc::clone(&barriers)]));
        let slots: Arc<Vec<AtomicUsize>> = Arc::new((0..STAGES).map(|_| AtomicUsize::new(usize::MAX)).collect());
        let produced = Arc::new(AtomicUsize::new(0));
        let consumed = Arc::new(AtomicUsize::new(0));

        let producer = {
            let (pipeline, slots, produced, barriers) = (
                Arc::clone(&pipeline),
                Arc::clone(&slots),
                Arc::clone(&produced),
                Arc::clone(&barriers),
            );
            thread::spawn(move || {
                let mut state = PipelineState::producer(STAGES);
                for k in 0..BLOCKS {
                    let token = pipeline.producer_try_acquire(&state);
                    pipeline.producer_acquire(&state, token);
                    let in_flight = pipeline.occupancy(&state);
                    assert!(in_flight <= STAGES, "{} stages in flight", in_flight);
                    slots[state.index()].store(k, Ordering::SeqCst);
                    produced.fetch_add(1, Ordering::SeqCst);
                    barriers.full(state.index()).complete_tx(16);
                    state.advance();
                }
                pipeline.producer_tail(state);
            })
        };

        let mut state = PipelineState::consumer(STAGES);
        for k in 0..BLOCKS {
            let token = pipeline.consumer_try_wait(&state);
            pipeline.consumer_wait(&state, token);
            assert!(consumed.load(Ordering::SeqCst) < produced.load(Ordering::SeqCst));
            assert_eq!(slots[state.index()].load(Ordering::SeqCst), k);
            consumed.fetch_add(1, Ordering::SeqCst);
            pipeline.consumer_release(&state, &ImmediateArrive);
            state.advance();
        }

        producer.join().unwrap();
        assert_eq!(produced.load(Ordering::SeqCst), consumed.load(Ordering::SeqCst));
    }

    /// Two leaders read every slot of one loading unit; a slot is reused
    /// only after both have released it.
    #[test_log::test]
    fn test_slot_reuse_waits_for_both_consumers() {
        const CONSUMERS: usize = 2;
        let barriers = Arc::new(OperandBarriers::new(STAGES, CONSUMERS));
        let producer = OperandPipeline::new(true, 16, Arc::clone(&barriers), vec![]);
        let slots: Arc<Vec<AtomicUsize>> = Arc::new((0..STAGES).map(|_| AtomicUsize::new(usize::MAX)).collect());
        let max_in_flight = AtomicUsize::new(0);

        thread::scope(|s| {
            for consumer in 0..CONSUMERS {
                let pipeline = OperandPipeline::new(false, 0, Arc::clone(&barriers), vec![Arc::clone(&barriers)]);
                let slots = Arc::clone(&slots);
                s.spawn(move || {
                    let mut state = PipelineState::consumer(STAGES);
                    for k in 0..BLOCKS {
                        let token = pipeline.consumer_try_wait(&state);
                        pipeline.consumer_wait(&state, token);
                        if consumer == 1 && k % 3 == 0 {
                            thread::sleep(std::time::Duration::from_millis(1));
                        }
                        assert_eq!(slots[state.index()].load(Ordering::SeqCst), k, "consumer {}", consumer);
                        pipeline.consumer_release(&state, &ImmediateArrive);
                        state.advance();
                    }
                });
            }

            let mut state = PipelineState::producer(STAGES);
            for k in 0..BLOCKS {
                let token = producer.producer_try_acquire(&state);
                producer.producer_acquire(&state, token);
                max_in_flight.fetch_max(producer.occupancy(&state), Ordering::SeqCst);
                slots[state.index()].store(k, Ordering::SeqCst);
                barriers.full(state.index()).complete_tx(16);
                state.advance();
            }
            producer.producer_tail(state);
        });

        let max_in_flight = max_in_flight.load(Ordering::SeqCst);
        assert!(max_in_flight >= 1);
        assert!(max_in_flight <= STAGES, "{} stages in flight", max_in_flight);
        assert_eq!(barriers.released(), BLOCKS);
    }

    #[test]
    fn test_empty_waits_for_every_consumer() {
        let barriers = Arc::new(OperandBarriers::new(2, 2));
        let pipeline = OperandPipeline::new(false, 0, Arc::clone(&barriers), vec![]);
        let mut state = PipelineState::producer(2);
        // fresh slots are empty
        assert!(pipeline.producer_try_acquire(&state));
        state.advance();
        state.advance();
        assert!(!pipeline.producer_try_acquire(&state));
        barriers.empty(0).arrive();
        assert!(!pipeline.producer_try_acquire(&state));
        barriers.empty(0).arrive();
        assert!(pipeline.producer_try_acquire(&state));
    }
}
