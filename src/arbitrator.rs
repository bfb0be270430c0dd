use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use log::{error, trace};

use crate::error::{Error, Result};

/// デッドロック回避の方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Policy {
    /// 番号の小さいフォークから順に取る。取れなければ即座に手放して MustRetry
    Hierarchy,
    /// ウェイターが同時に食事できる人数を floor(N/2) に制限し、2本まとめて渡す
    Waiter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    Granted,
    MustRetry,
}

/// 観測用のスナップショット
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub holders: Vec<Option<usize>>,
    pub eating: usize,
    pub max_eating: usize,
    pub pending: Vec<usize>,
    pub grants: u64,
    pub retries: u64,
}

// 哲学者 i は左にフォーク i、右にフォーク (i+1) % N を持つ
#[derive(Debug)]
struct Forks {
    policy: Policy,
    // フォークごとの持ち主
    holders: Vec<Option<usize>>,
    // 同時に食事できる人数の上限 (ウェイター方式のみ適用)
    limit: usize,
    // 食事中の人数
    eating: usize,
    max_eating: usize,
    // 哲学者ごとに 2 本とも渡されているか
    granted: Vec<bool>,
    // ウェイター方式の待ち行列。到着順
    queue: VecDeque<usize>,
    pending: Vec<bool>,
    grants: u64,
    retries: u64,
}

impl Forks {
    fn new(n: usize, policy: Policy) -> Self {
        Forks {
            policy,
            holders: vec![None; n],
            limit: n / 2,
            eating: 0,
            max_eating: 0,
            granted: vec![false; n],
            queue: VecDeque::new(),
            pending: vec![false; n],
            grants: 0,
            retries: 0,
        }
    }

    fn len(&self) -> usize {
        self.holders.len()
    }

    fn forks_of(&self, agent: usize) -> (usize, usize) {
        (agent, (agent + 1) % self.len())
    }

    fn validate(&self, agent: usize, first: usize, second: usize) -> Result<()> {
        let n = self.len();
        let invalid = |reason: String| Error::InvalidRequest { agent, reason };

        if agent >= n {
            return Err(invalid(format!("no such philosopher (table of {n})")));
        }
        if first >= n || second >= n {
            return Err(invalid(format!("fork {first} or {second} out of range")));
        }

        let (left, right) = self.forks_of(agent);
        let adjacent = (first == left && second == right) || (first == right && second == left);
        if !adjacent {
            return Err(invalid(format!(
                "forks ({first}, {second}) are not ({left}, {right})"
            )));
        }
        Ok(())
    }

    // 資源階層方式。小さい番号 -> 大きい番号の順に取る
    // 2本目が取れなかったら1本目を即座に戻す (hold and wait をしない)
    fn take_ordered(&mut self, agent: usize, first: usize, second: usize) -> Result<Acquire> {
        if self.granted[agent] {
            return Err(Error::InvalidRequest {
                agent,
                reason: "already holding both forks".into(),
            });
        }

        let (low, high) = if first < second {
            (first, second)
        } else {
            (second, first)
        };

        if self.holders[low].is_some() {
            return Ok(Acquire::MustRetry);
        }
        self.holders[low] = Some(agent);

        if self.holders[high].is_some() {
            self.holders[low] = None;
            return Ok(Acquire::MustRetry);
        }
        self.holders[high] = Some(agent);

        self.seat(agent);
        Ok(Acquire::Granted)
    }

    fn enqueue(&mut self, agent: usize) -> Result<()> {
        if self.granted[agent] {
            return Err(Error::InvalidRequest {
                agent,
                reason: "already holding both forks".into(),
            });
        }
        if !self.pending[agent] {
            self.pending[agent] = true;
            self.queue.push_back(agent);
        }
        Ok(())
    }

    fn dequeue(&mut self, agent: usize) -> bool {
        if !self.pending[agent] {
            return false;
        }
        self.pending[agent] = false;
        self.queue.retain(|&a| a != agent);
        true
    }

    // ウェイター方式で今すぐ渡せるか
    // 両方空いている & 上限未満 & 自分より前に並んでいる隣人がいない
    fn is_eligible(&self, agent: usize) -> bool {
        let (left, right) = self.forks_of(agent);
        if self.holders[left].is_some() || self.holders[right].is_some() {
            return false;
        }
        if self.eating >= self.limit {
            return false;
        }

        self.queue
            .iter()
            .take_while(|&&a| a != agent)
            .all(|&a| {
                let (l, r) = self.forks_of(a);
                l != left && l != right && r != left && r != right
            })
    }

    fn grant(&mut self, agent: usize) {
        let (left, right) = self.forks_of(agent);
        self.dequeue(agent);
        self.holders[left] = Some(agent);
        self.holders[right] = Some(agent);
        self.seat(agent);
    }

    fn seat(&mut self, agent: usize) {
        self.granted[agent] = true;
        self.eating += 1;
        self.max_eating = self.max_eating.max(self.eating);
    }

    // 2本とも呼び出し元が持っていることを確認してからまとめて戻す
    fn release(&mut self, agent: usize, first: usize, second: usize) -> Result<()> {
        for fork in [first, second] {
            if self.holders[fork] != Some(agent) {
                return Err(Error::NotHolder {
                    agent,
                    fork,
                    holder: self.holders[fork],
                });
            }
        }

        self.holders[first] = None;
        self.holders[second] = None;
        self.granted[agent] = false;
        self.eating -= 1;
        Ok(())
    }

    fn check(&self) -> Result<()> {
        let n = self.len();
        let violation = |msg: String| Err(Error::InvariantViolation(msg));

        for (fork, holder) in self.holders.iter().enumerate() {
            if let Some(h) = *holder {
                // フォーク f を使えるのは哲学者 f と (f-1) だけ
                if h != fork && h != (fork + n - 1) % n {
                    return violation(format!("fork {fork} held by non-neighbour {h}"));
                }
            }
        }

        let mut seated = 0;
        for agent in 0..n {
            let (left, right) = self.forks_of(agent);
            let has_left = self.holders[left] == Some(agent);
            let has_right = self.holders[right] == Some(agent);
            if has_left != has_right {
                return violation(format!("philosopher {agent} holds a single fork"));
            }
            if has_left != self.granted[agent] {
                return violation(format!(
                    "philosopher {agent} granted={} but holding={has_left}",
                    self.granted[agent]
                ));
            }
            if self.pending[agent] && self.granted[agent] {
                return violation(format!("philosopher {agent} both pending and eating"));
            }
            if has_left {
                seated += 1;
            }
        }

        if seated != self.eating {
            return violation(format!("eating count {} != {seated}", self.eating));
        }
        if self.policy == Policy::Waiter && self.eating > self.limit {
            return violation(format!(
                "{} eating with admission limit {}",
                self.eating, self.limit
            ));
        }
        if self.queue.len() != self.pending.iter().filter(|p| **p).count() {
            return violation("waiter queue out of sync with pending flags".into());
        }
        Ok(())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            holders: self.holders.clone(),
            eating: self.eating,
            max_eating: self.max_eating,
            pending: self.queue.iter().copied().collect(),
            grants: self.grants,
            retries: self.retries,
        }
    }
}

/// フォークの割り当てを決める唯一の窓口
///
/// 全ての acquire / release は 1 つの Mutex の中で直列化される。
/// clone したハンドルは同じテーブルを指す。
#[derive(Clone, Debug)]
pub struct Arbitrator {
    forks: Arc<Mutex<Forks>>,
    cond: Arc<Condvar>,
    // ウェイター方式で 1 回の acquire_pair が待つ最大時間
    patience: Duration,
    // true なら毎回不変条件を検査する
    instrumented: bool,
}

impl Arbitrator {
    pub fn new(n: usize, policy: Policy, patience: Duration, instrumented: bool) -> Result<Self> {
        if n < 2 {
            return Err(Error::Config(format!(
                "a table needs at least 2 philosophers, got {n}"
            )));
        }
        Ok(Arbitrator {
            forks: Arc::new(Mutex::new(Forks::new(n, policy))),
            cond: Arc::new(Condvar::new()),
            patience,
            instrumented,
        })
    }

    pub fn acquire_pair(&self, agent: usize, first: usize, second: usize) -> Result<Acquire> {
        let mut forks = self.forks.lock()?;
        forks.validate(agent, first, second)?;

        let result = match forks.policy {
            Policy::Hierarchy => forks.take_ordered(agent, first, second)?,
            Policy::Waiter => {
                forks.enqueue(agent)?;
                let deadline = Instant::now() + self.patience;
                loop {
                    if forks.is_eligible(agent) {
                        forks.grant(agent);
                        // 後ろに並んでいる人が自分を追い越せるようになったかもしれない
                        self.cond.notify_all();
                        break Acquire::Granted;
                    }

                    let now = Instant::now();
                    if now >= deadline {
                        // 列の位置は保持したまま戻る
                        break Acquire::MustRetry;
                    }
                    let (guard, _) = self.cond.wait_timeout(forks, deadline - now)?;
                    forks = guard;
                }
            }
        };

        match result {
            Acquire::Granted => forks.grants += 1,
            Acquire::MustRetry => forks.retries += 1,
        }
        trace!("philosopher {agent}: acquire ({first}, {second}) -> {result:?}");

        self.verify(&forks)?;
        Ok(result)
    }

    pub fn release_pair(&self, agent: usize, first: usize, second: usize) -> Result<()> {
        let mut forks = self.forks.lock()?;
        forks.validate(agent, first, second)?;
        forks.release(agent, first, second)?;
        self.cond.notify_all();

        trace!("philosopher {agent}: release ({first}, {second})");
        self.verify(&forks)
    }

    /// ウェイターの列から抜ける。並んでいなければ何もしない
    pub fn withdraw(&self, agent: usize) -> Result<()> {
        let mut forks = self.forks.lock()?;
        if agent < forks.len() && forks.dequeue(agent) {
            self.cond.notify_all();
            trace!("philosopher {agent}: withdrew from waiter queue");
        }
        self.verify(&forks)
    }

    pub fn holder(&self, fork: usize) -> Result<Option<usize>> {
        let forks = self.forks.lock()?;
        Ok(forks.holders.get(fork).copied().flatten())
    }

    pub fn snapshot(&self) -> Result<Snapshot> {
        Ok(self.forks.lock()?.snapshot())
    }

    pub fn policy(&self) -> Result<Policy> {
        Ok(self.forks.lock()?.policy)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.forks.lock()?.len())
    }

    fn verify(&self, forks: &Forks) -> Result<()> {
        if !self.instrumented {
            return Ok(());
        }
        forks.check().inspect_err(|e| error!("{e}: {forks:?}"))
    }
}
