//! In-process communication group for running tensor-parallel ranks as
//! threads of one process.
//!
//! Every collective is one round of a shared barrier: each rank deposits
//! its buffers, the last rank to arrive combines the deposits in rank order
//! and publishes one outcome, and every rank picks it up before the next
//! round may start. Combining in rank order makes every rank observe
//! bit-identical results regardless of arrival order.
//!
//! A rank that calls [`Communicator::abort`] sits out its next round: that
//! round fails with `Internal` on every rank and the group carries on. A
//! timeout or a mismatched collective poisons the group for good.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tessera::comm::{Communicator, CustomAllReduce, CustomAllReduceConfig};
use tessera::params::{AllReduceParams, BroadcastParams};
use tessera::tensor::Tensor;
use tessera::{OpError, Result};
use tracing::{trace, warn};

use crate::tensor::CpuTensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collective {
    AllReduce,
    Broadcast { root: usize },
    Gather,
}

/// A rank's slot in the round being collected.
#[derive(Default)]
enum Slot {
    #[default]
    Empty,
    Ready(Deposit),
    Aborted,
}

/// One rank's side of a round.
struct Deposit {
    collective: Collective,
    buffers: Vec<CpuTensor>,
}

/// What the combining rank publishes for a round.
enum Outcome {
    Sums(Vec<Vec<f32>>),
    Buffers(Vec<CpuTensor>),
    Gathered(Vec<Deposit>),
}

#[derive(Default)]
struct State {
    slots: Vec<Slot>,
    arrived: usize,
    /// Why the round being collected will fail, if a rank sat it out.
    abort_reason: Option<String>,
    published: Option<std::result::Result<Arc<Outcome>, String>>,
    picked_up: usize,
    poisoned: Option<String>,
}

struct Group {
    world_size: usize,
    timeout: Duration,
    state: Mutex<State>,
    cv: Condvar,
}

impl Group {
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| OpError::internal("communicator state lock poisoned"))
    }

    fn poison(&self, state: &mut State, reason: &str) {
        if state.poisoned.is_none() {
            warn!(reason, "communicator group poisoned");
            state.poisoned = Some(reason.to_string());
        }
        self.cv.notify_all();
    }

    fn check(state: &State) -> Result<()> {
        match &state.poisoned {
            Some(reason) => Err(OpError::internal(format!(
                "communicator group failed: {reason}"
            ))),
            None => Ok(()),
        }
    }

    /// Block until notified or `deadline`. Timing out poisons the group.
    fn wait<'a>(
        &self,
        mut state: MutexGuard<'a, State>,
        rank: usize,
        deadline: Instant,
    ) -> Result<MutexGuard<'a, State>> {
        let now = Instant::now();
        if now >= deadline {
            self.poison(
                &mut state,
                &format!("rank {rank} timed out after {:?}", self.timeout),
            );
            return Err(OpError::internal(format!(
                "collective timed out on rank {rank}"
            )));
        }
        let (state, _) = self
            .cv
            .wait_timeout(state, deadline - now)
            .map_err(|_| OpError::internal("communicator state lock poisoned"))?;
        Ok(state)
    }

    /// Run one round. `combine` is called once, by the last rank to arrive,
    /// with every deposit in rank order.
    fn round(
        &self,
        rank: usize,
        deposit: Deposit,
        combine: fn(Vec<Deposit>) -> Result<Outcome>,
    ) -> Result<Arc<Outcome>> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.lock()?;

        // The previous round is still being picked up, or this rank sits
        // out the round being collected.
        while state.published.is_some() || !matches!(state.slots[rank], Slot::Empty) {
            Self::check(&state)?;
            state = self.wait(state, rank, deadline)?;
        }
        Self::check(&state)?;

        state.slots[rank] = Slot::Ready(deposit);
        state.arrived += 1;
        if state.arrived == self.world_size {
            self.close_round(&mut state, combine);
        } else {
            while state.published.is_none() {
                Self::check(&state)?;
                state = self.wait(state, rank, deadline)?;
            }
        }

        let outcome = state.published.clone().unwrap_or_else(|| Err("round lost".to_string()));
        self.pick_up(&mut state, 1);
        drop(state);
        outcome.map_err(OpError::internal)
    }

    /// Publish the outcome of a round every rank has reached. Ranks that sat
    /// the round out count as having picked it up already.
    fn close_round(&self, state: &mut State, combine: fn(Vec<Deposit>) -> Result<Outcome>) {
        let mut deposits = Vec::with_capacity(self.world_size);
        let mut aborted = 0;
        for slot in &mut state.slots {
            match std::mem::take(slot) {
                Slot::Ready(d) => deposits.push(d),
                Slot::Aborted => aborted += 1,
                Slot::Empty => {}
            }
        }
        state.arrived = 0;
        let outcome = match state.abort_reason.take() {
            Some(reason) => Err(reason),
            None => match combine(deposits) {
                Ok(outcome) => Ok(Arc::new(outcome)),
                Err(e) => {
                    let reason = e.message().to_string();
                    self.poison(state, &reason);
                    Err(reason)
                }
            },
        };
        state.published = Some(outcome);
        self.cv.notify_all();
        self.pick_up(state, aborted);
    }

    fn pick_up(&self, state: &mut State, ranks: usize) {
        state.picked_up += ranks;
        if state.picked_up >= self.world_size {
            state.picked_up = 0;
            state.published = None;
            self.cv.notify_all();
        }
    }

    /// Sit out the next round on behalf of `rank`, failing it on every
    /// rank that joins it.
    fn abort_round(&self, rank: usize, reason: String) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.lock()?;
        while state.published.is_some() {
            Self::check(&state)?;
            state = self.wait(state, rank, deadline)?;
        }
        Self::check(&state)?;
        if !matches!(state.slots[rank], Slot::Empty) {
            return Ok(());
        }
        warn!(rank, reason = %reason, "collective round aborted");
        state.slots[rank] = Slot::Aborted;
        state.abort_reason.get_or_insert(reason);
        state.arrived += 1;
        if state.arrived == self.world_size {
            self.close_round(&mut state, combine_sum);
        } else {
            self.cv.notify_all();
        }
        Ok(())
    }
}

/// Every deposit must describe the same collective over buffers of the same
/// dtypes and sizes.
fn check_agreement(deposits: &[Deposit]) -> Result<()> {
    let first = &deposits[0];
    for (rank, d) in deposits.iter().enumerate().skip(1) {
        if d.collective != first.collective {
            return Err(OpError::internal(format!(
                "rank {rank} issued {:?} while rank 0 issued {:?}",
                d.collective, first.collective
            )));
        }
        if d.buffers.len() != first.buffers.len() {
            return Err(OpError::internal(format!(
                "rank {rank} contributed {} buffers, rank 0 contributed {}",
                d.buffers.len(),
                first.buffers.len()
            )));
        }
        for (i, (a, b)) in first.buffers.iter().zip(&d.buffers).enumerate() {
            if a.dtype() != b.dtype() || a.numel() != b.numel() {
                return Err(OpError::internal(format!(
                    "buffer {i}: rank {rank} has {} x {}, rank 0 has {} x {}",
                    b.numel(),
                    b.dtype(),
                    a.numel(),
                    a.dtype()
                )));
            }
        }
    }
    Ok(())
}

/// Element-wise sums of each buffer position, accumulated in rank order.
fn sum_in_rank_order(deposits: &[Deposit]) -> Vec<Vec<f32>> {
    let mut sums: Vec<Vec<f32>> = deposits[0].buffers.iter().map(CpuTensor::to_f32_vec).collect();
    for d in &deposits[1..] {
        for (acc, buf) in sums.iter_mut().zip(&d.buffers) {
            for (a, v) in acc.iter_mut().zip(buf.to_f32_vec()) {
                *a += v;
            }
        }
    }
    sums
}

fn combine_sum(deposits: Vec<Deposit>) -> Result<Outcome> {
    check_agreement(&deposits)?;
    Ok(Outcome::Sums(sum_in_rank_order(&deposits)))
}

fn combine_broadcast(mut deposits: Vec<Deposit>) -> Result<Outcome> {
    check_agreement(&deposits)?;
    let Collective::Broadcast { root } = deposits[0].collective else {
        return Err(OpError::internal("broadcast round without a root"));
    };
    Ok(Outcome::Buffers(std::mem::take(&mut deposits[root].buffers)))
}

fn combine_gather(deposits: Vec<Deposit>) -> Result<Outcome> {
    check_agreement(&deposits)?;
    Ok(Outcome::Gathered(deposits))
}

fn write_sums(buffers: &mut [CpuTensor], sums: &[Vec<f32>]) {
    for (buf, sum) in buffers.iter_mut().zip(sums) {
        buf.write_f32(sum);
    }
}

/// One rank's handle on an in-process group.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    group: Arc<Group>,
}

impl LocalComm {
    /// Create a group of `world_size` ranks. Handle `i` is rank `i`.
    /// A collective waits at most `timeout` for its peers.
    #[must_use]
    pub fn group(world_size: usize, timeout: Duration) -> Vec<Self> {
        let group = Arc::new(Group {
            world_size,
            timeout,
            state: Mutex::new(State {
                slots: (0..world_size).map(|_| Slot::Empty).collect(),
                ..State::default()
            }),
            cv: Condvar::new(),
        });
        (0..world_size)
            .map(|rank| Self {
                rank,
                group: Arc::clone(&group),
            })
            .collect()
    }

    fn deposit(collective: Collective, buffers: &[CpuTensor]) -> Deposit {
        Deposit {
            collective,
            buffers: buffers.to_vec(),
        }
    }
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("world_size", &self.group.world_size)
            .finish_non_exhaustive()
    }
}

impl Communicator<CpuTensor> for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn broadcast(&self, params: BroadcastParams<'_, CpuTensor>) -> Result<()> {
        params.validate(self.group.world_size)?;
        let root = params.root;
        trace!(rank = self.rank, root, buffers = params.buffers.len(), "broadcast");
        let deposit = Self::deposit(Collective::Broadcast { root }, params.buffers);
        let outcome = self.group.round(self.rank, deposit, combine_broadcast)?;
        if self.rank != root {
            let Outcome::Buffers(src) = outcome.as_ref() else {
                return Err(OpError::internal("broadcast round published no buffers"));
            };
            for (dst, src) in params.buffers.iter_mut().zip(src) {
                dst.as_bytes_mut().copy_from_slice(src.as_bytes());
            }
        }
        Ok(())
    }

    fn all_reduce(&self, params: AllReduceParams<'_, CpuTensor>) -> Result<()> {
        trace!(rank = self.rank, bytes = params.size_in_bytes(), "all_reduce");
        let deposit = Self::deposit(Collective::AllReduce, params.buffers);
        let outcome = self.group.round(self.rank, deposit, combine_sum)?;
        let Outcome::Sums(sums) = outcome.as_ref() else {
            return Err(OpError::internal("all-reduce round published no sums"));
        };
        write_sums(params.buffers, sums);
        Ok(())
    }

    fn abort(&self, reason: &str) {
        let reason = format!("rank {} aborted: {reason}", self.rank);
        if let Err(e) = self.group.abort_round(self.rank, reason) {
            warn!(rank = self.rank, error = %e, "abort found the group already failed");
        }
    }
}

/// Custom all-reduce over a [`LocalComm`] group that exchanges raw
/// contributions in one round and reduces locally on every rank.
pub struct OneShotAllReduce {
    comm: LocalComm,
    config: CustomAllReduceConfig,
}

impl OneShotAllReduce {
    #[must_use]
    pub fn new(comm: &LocalComm, config: CustomAllReduceConfig) -> Self {
        Self {
            comm: comm.clone(),
            config,
        }
    }
}

impl CustomAllReduce<CpuTensor> for OneShotAllReduce {
    fn config(&self) -> &CustomAllReduceConfig {
        &self.config
    }

    fn all_reduce(&self, params: AllReduceParams<'_, CpuTensor>) -> Result<()> {
        trace!(rank = self.comm.rank, bytes = params.size_in_bytes(), "one-shot all_reduce");
        let deposit = LocalComm::deposit(Collective::Gather, params.buffers);
        let outcome = self.comm.group.round(self.comm.rank, deposit, combine_gather)?;
        let Outcome::Gathered(deposits) = outcome.as_ref() else {
            return Err(OpError::internal("one-shot round published no contributions"));
        };
        write_sums(params.buffers, &sum_in_rank_order(deposits));
        Ok(())
    }
}
