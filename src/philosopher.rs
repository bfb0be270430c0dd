use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use log::{debug, error, info, trace};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    arbitrator::{Acquire, Arbitrator},
    error::Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Thinking,
    Hungry,
    Eating,
}

/// 待ち時間の範囲。min..=max から一様に選ぶ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub min: Duration,
    pub max: Duration,
}

impl Span {
    pub const ZERO: Span = Span::fixed(Duration::ZERO);

    pub const fn new(min: Duration, max: Duration) -> Self {
        Span { min, max }
    }

    pub const fn fixed(d: Duration) -> Self {
        Span { min: d, max: d }
    }

    fn sample<R: Rng>(&self, rng: &mut R) -> Duration {
        if self.min >= self.max {
            return self.min;
        }
        rng.gen_range(self.min..=self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub think: Span,
    pub eat: Span,
    // MustRetry の後に待つ時間
    pub backoff: Span,
}

impl Timing {
    pub const ZERO: Timing = Timing {
        think: Span::ZERO,
        eat: Span::ZERO,
        backoff: Span::ZERO,
    };
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            think: Span::new(Duration::ZERO, Duration::from_millis(2)),
            eat: Span::new(Duration::ZERO, Duration::from_millis(2)),
            backoff: Span::new(Duration::ZERO, Duration::from_millis(1)),
        }
    }
}

/// 哲学者ごとの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub id: usize,
    pub meals: usize,
    pub retries: u64,
}

/// 手に持っているフォーク 2 本
///
/// release を呼ばずに drop された場合 (停止、パニック) でも必ず返却する。
#[derive(Debug)]
pub(crate) struct ForkPair {
    arbitrator: Arbitrator,
    agent: usize,
    left: usize,
    right: usize,
    released: bool,
}

impl ForkPair {
    fn new(arbitrator: Arbitrator, agent: usize, left: usize, right: usize) -> Self {
        ForkPair {
            arbitrator,
            agent,
            left,
            right,
            released: false,
        }
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.arbitrator
            .release_pair(self.agent, self.left, self.right)
    }
}

impl Drop for ForkPair {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // drop からはエラーを返せないのでログに残すだけ
        match self
            .arbitrator
            .release_pair(self.agent, self.left, self.right)
        {
            Ok(()) => debug!(
                "philosopher {}: forks ({}, {}) returned on unwind",
                self.agent, self.left, self.right
            ),
            Err(e) => error!("philosopher {}: {e}", self.agent),
        }
    }
}

pub struct Philosopher {
    id: usize,
    left: usize,
    right: usize,
    state: State,
    arbitrator: Arbitrator,
    stop: Arc<AtomicBool>,
    timing: Timing,
    rng: StdRng,
    // k 回目の食事中にパニックさせる (障害のシミュレーション)
    crash_after: Option<usize>,
    meals: usize,
    retries: u64,
}

impl Philosopher {
    pub fn new(
        id: usize,
        arbitrator: Arbitrator,
        stop: Arc<AtomicBool>,
        timing: Timing,
        seed: u64,
    ) -> Result<Self> {
        let n = arbitrator.len()?;
        Ok(Philosopher {
            id,
            left: id,
            right: (id + 1) % n,
            state: State::Thinking,
            arbitrator,
            stop,
            timing,
            rng: StdRng::seed_from_u64(seed),
            crash_after: None,
            meals: 0,
            retries: 0,
        })
    }

    pub fn crash_after(mut self, meals: usize) -> Self {
        self.crash_after = Some(meals);
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// meals 回食べるか、停止要求が来るまで回る
    pub fn run(mut self, meals: Option<usize>) -> Result<Tally> {
        // held はここで持つので、dine がパニックしても drop で返却される
        let mut held = None;
        let outcome = self.dine(meals, &mut held);
        let cleanup = self.leave(held);
        outcome.and(cleanup)?;

        Ok(Tally {
            id: self.id,
            meals: self.meals,
            retries: self.retries,
        })
    }

    fn dine(&mut self, meals: Option<usize>, held: &mut Option<ForkPair>) -> Result<()> {
        loop {
            // 停止要求は毎回の先頭で確認する
            if self.stop.load(Ordering::Acquire) {
                debug!("philosopher {}: stop requested while {:?}", self.id, self.state);
                return Ok(());
            }
            if meals.is_some_and(|m| self.meals >= m) {
                return Ok(());
            }

            match self.state {
                State::Thinking => {
                    self.pause(self.timing.think);
                    self.enter(State::Hungry);
                }
                State::Hungry => {
                    match self
                        .arbitrator
                        .acquire_pair(self.id, self.left, self.right)?
                    {
                        Acquire::Granted => {
                            *held = Some(ForkPair::new(
                                self.arbitrator.clone(),
                                self.id,
                                self.left,
                                self.right,
                            ));
                            self.enter(State::Eating);
                        }
                        Acquire::MustRetry => {
                            self.retries += 1;
                            self.pause(self.timing.backoff);
                        }
                    }
                }
                State::Eating => {
                    self.pause(self.timing.eat);
                    if self.crash_after.is_some_and(|k| self.meals + 1 >= k) {
                        panic!(
                            "philosopher {} choked on meal {}",
                            self.id,
                            self.meals + 1
                        );
                    }

                    if let Some(pair) = held.take() {
                        pair.release()?;
                    }
                    self.meals += 1;
                    debug!("philosopher {}: meal {}", self.id, self.meals);
                    self.enter(State::Thinking);
                }
            }
        }
    }

    // 食事中ならフォークを返し、ウェイターの列に並んでいれば抜ける
    fn leave(&mut self, held: Option<ForkPair>) -> Result<()> {
        if let Some(pair) = held {
            info!("philosopher {}: putting forks down before leaving", self.id);
            pair.release()?;
        }
        self.arbitrator.withdraw(self.id)
    }

    fn enter(&mut self, state: State) {
        trace!("philosopher {}: {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
    }

    fn pause(&mut self, span: Span) {
        let d = span.sample(&mut self.rng);
        if d.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(d);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arbitrator::Policy;

    fn arbitrator(n: usize, policy: Policy) -> Arbitrator {
        Arbitrator::new(n, policy, Duration::from_millis(5), true).unwrap()
    }

    fn philosopher(
        id: usize,
        arb: &Arbitrator,
        stop: &Arc<AtomicBool>,
        timing: Timing,
    ) -> Philosopher {
        Philosopher::new(id, arb.clone(), stop.clone(), timing, id as u64).unwrap()
    }

    #[test]
    fn test_span_sample_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let span = Span::new(Duration::from_micros(10), Duration::from_micros(20));
        for _ in 0..1000 {
            let d = span.sample(&mut rng);
            assert!(d >= span.min && d <= span.max);
        }
        let fixed = Span::fixed(Duration::from_millis(3));
        assert_eq!(fixed.sample(&mut rng), Duration::from_millis(3));
    }

    #[test]
    fn test_neighbours_follow_ring() {
        let arb = arbitrator(5, Policy::Hierarchy);
        let stop = Arc::new(AtomicBool::new(false));
        let p = philosopher(4, &arb, &stop, Timing::ZERO);
        assert_eq!((p.left, p.right), (4, 0));
        assert_eq!(p.state(), State::Thinking);
        assert_eq!(p.id(), 4);
    }

    #[test]
    fn test_single_philosopher_eats_requested_meals() {
        let arb = arbitrator(3, Policy::Waiter);
        let stop = Arc::new(AtomicBool::new(false));
        let tally = philosopher(1, &arb, &stop, Timing::ZERO)
            .run(Some(10))
            .unwrap();

        assert_eq!(tally.meals, 10);
        assert_eq!(tally.retries, 0);
        assert_eq!(arb.snapshot().unwrap().grants, 10);
    }

    #[test]
    fn test_two_philosophers_share_both_forks() {
        let arb = arbitrator(2, Policy::Hierarchy);
        let stop = Arc::new(AtomicBool::new(false));

        let mut v = Vec::new();
        for id in 0..2 {
            let p = philosopher(id, &arb, &stop, Timing::ZERO);
            v.push(thread::spawn(move || p.run(Some(50))));
        }
        for t in v {
            assert_eq!(t.join().unwrap().unwrap().meals, 50);
        }
        assert_eq!(arb.snapshot().unwrap().max_eating, 1);
    }

    #[test]
    fn test_stop_before_start_eats_nothing() {
        let arb = arbitrator(5, Policy::Hierarchy);
        let stop = Arc::new(AtomicBool::new(true));
        let tally = philosopher(0, &arb, &stop, Timing::ZERO).run(None).unwrap();
        assert_eq!(tally.meals, 0);
    }

    #[test]
    fn test_stop_leaves_no_fork_behind() {
        let arb = arbitrator(5, Policy::Waiter);
        let stop = Arc::new(AtomicBool::new(false));
        let timing = Timing {
            eat: Span::fixed(Duration::from_millis(20)),
            ..Timing::ZERO
        };
        let p = philosopher(2, &arb, &stop, timing);
        let t = thread::spawn(move || p.run(None));

        while arb.holder(2).unwrap() != Some(2) {
            thread::yield_now();
        }
        stop.store(true, Ordering::Release);
        t.join().unwrap().unwrap();

        let snap = arb.snapshot().unwrap();
        assert!(snap.holders.iter().all(Option::is_none));
        assert!(snap.pending.is_empty());
        assert_eq!(snap.eating, 0);
    }

    #[test]
    fn test_dropped_pair_returns_forks() {
        let arb = arbitrator(5, Policy::Hierarchy);
        assert_eq!(arb.acquire_pair(3, 3, 4).unwrap(), Acquire::Granted);
        {
            let _pair = ForkPair::new(arb.clone(), 3, 3, 4);
        }
        assert_eq!(arb.holder(3).unwrap(), None);
        assert_eq!(arb.holder(4).unwrap(), None);
    }

    #[test]
    fn test_crash_while_eating_returns_forks() {
        let arb = arbitrator(5, Policy::Hierarchy);
        let stop = Arc::new(AtomicBool::new(false));
        let p = philosopher(0, &arb, &stop, Timing::ZERO).crash_after(3);

        let t = thread::spawn(move || p.run(Some(10)));
        assert!(t.join().is_err());

        let snap = arb.snapshot().unwrap();
        assert_eq!(snap.grants, 3);
        assert!(snap.holders.iter().all(Option::is_none));
        assert_eq!(snap.eating, 0);
    }
}
