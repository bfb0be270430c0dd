use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use log::{error, info, warn};

use crate::{
    arbitrator::{Arbitrator, Snapshot},
    config::Config,
    error::Result,
    philosopher::{Philosopher, Tally},
};

// 実行時間で打ち切る場合の監視間隔
const POLL: Duration = Duration::from_millis(5);

/// 外部から食事会を止めるためのハンドル
#[derive(Clone, Debug, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn flag(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    // 正常に終わった哲学者の結果。id 順
    pub tallies: Vec<Tally>,
    // パニックで落ちた哲学者
    pub crashed: Vec<usize>,
    pub snapshot: Snapshot,
}

impl Report {
    pub fn total_meals(&self) -> usize {
        self.tallies.iter().map(|t| t.meals).sum()
    }

    pub fn meals_of(&self, id: usize) -> Option<usize> {
        self.tallies.iter().find(|t| t.id == id).map(|t| t.meals)
    }
}

/// 円卓。N 人の哲学者を 1 つの Arbitrator の周りに座らせて走らせる
pub struct Table {
    config: Config,
    arbitrator: Arbitrator,
    stop: StopHandle,
    crashes: HashMap<usize, usize>,
}

impl Table {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let arbitrator = Arbitrator::new(
            config.philosophers,
            config.policy,
            config.patience(),
            config.checks_invariants(),
        )?;
        Ok(Table {
            config,
            arbitrator,
            stop: StopHandle::default(),
            crashes: HashMap::new(),
        })
    }

    /// 哲学者 agent を meals 回目の食事中に落とす
    pub fn crash_after(mut self, agent: usize, meals: usize) -> Self {
        self.crashes.insert(agent, meals);
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn arbitrator(&self) -> &Arbitrator {
        &self.arbitrator
    }

    /// 食事会は 1 回きり。停止フラグと統計は Table ごとに使い捨て
    pub fn run(self) -> Result<Report> {
        let n = self.config.philosophers;
        info!(
            "{n} philosophers sit down ({:?} policy, meals: {:?}, duration: {:?})",
            self.arbitrator.policy()?,
            self.config.meal_limit(),
            self.config.duration()
        );

        let mut v = Vec::new();
        for id in 0..n {
            let mut p = Philosopher::new(
                id,
                self.arbitrator.clone(),
                self.stop.flag(),
                self.config.timing(),
                self.config.seed.wrapping_add(id as u64),
            )?;
            if let Some(&k) = self.crashes.get(&id) {
                p = p.crash_after(k);
            }

            let meals = self.config.meal_limit();
            let stop = self.stop.clone();
            let t = thread::spawn(move || {
                let result = p.run(meals);
                if result.is_err() {
                    // 不変条件違反などは致命的なので全員止める
                    stop.stop();
                }
                result
            });
            v.push((id, t));
        }

        if let Some(limit) = self.config.duration() {
            let deadline = Instant::now() + limit;
            loop {
                let now = Instant::now();
                if now >= deadline
                    || self.stop.is_stopped()
                    || v.iter().all(|(_, t)| t.is_finished())
                {
                    break;
                }
                thread::sleep(POLL.min(deadline - now));
            }
            self.stop.stop();
        }

        let mut tallies = Vec::new();
        let mut crashed = Vec::new();
        let mut failure = None;
        for (id, t) in v {
            match t.join() {
                Ok(Ok(tally)) => tallies.push(tally),
                Ok(Err(e)) => {
                    error!("philosopher {id}: {e}");
                    failure.get_or_insert(e);
                }
                Err(_) => {
                    warn!("philosopher {id} crashed");
                    crashed.push(id);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        let report = Report {
            tallies,
            crashed,
            snapshot: self.arbitrator.snapshot()?,
        };
        info!(
            "table cleared: {} meals, {} retries, at most {} eating at once",
            report.total_meals(),
            report.snapshot.retries,
            report.snapshot.max_eating
        );
        Ok(report)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        arbitrator::{Acquire, Policy},
        error::Error,
    };

    fn quick(policy: Policy) -> Config {
        Config {
            policy,
            meals: 20,
            think_max_us: 100,
            eat_max_us: 100,
            backoff_max_us: 50,
            patience_ms: 5,
            instrumented: true,
            ..Config::default()
        }
    }

    #[test]
    fn test_meal_bounded_run() {
        let report = Table::new(quick(Policy::Hierarchy)).unwrap().run().unwrap();
        assert_eq!(report.total_meals(), 100);
        for id in 0..5 {
            assert_eq!(report.meals_of(id), Some(20));
        }
        assert!(report.crashed.is_empty());
    }

    #[test]
    fn test_duration_bounded_run_stops() {
        let config = Config {
            meals: 0,
            duration_ms: Some(50),
            ..quick(Policy::Waiter)
        };
        let table = Table::new(config).unwrap();
        let stop = table.stop_handle();
        let report = table.run().unwrap();

        assert!(stop.is_stopped());
        assert_eq!(report.tallies.len(), 5);
        assert!(report.snapshot.holders.iter().all(Option::is_none));
        assert!(report.snapshot.pending.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Config {
            philosophers: 0,
            ..Config::default()
        };
        assert!(Table::new(config).is_err());
    }

    #[test]
    fn test_crashed_philosopher_is_reported() {
        let table = Table::new(quick(Policy::Hierarchy))
            .unwrap()
            .crash_after(2, 3);
        let report = table.run().unwrap();

        assert_eq!(report.crashed, vec![2]);
        assert_eq!(report.meals_of(2), None);
        for id in [0, 1, 3, 4] {
            assert_eq!(report.meals_of(id), Some(20));
        }
        assert_eq!(report.snapshot.eating, 0);
    }

    #[test]
    fn test_philosopher_error_fails_whole_run() {
        let table = Table::new(quick(Policy::Hierarchy)).unwrap();
        // 哲学者 0 の分を先に取ってしまうと、0 の最初の要求が InvalidRequest になる
        assert_eq!(
            table.arbitrator().acquire_pair(0, 0, 1).unwrap(),
            Acquire::Granted
        );
        let stop = table.stop_handle();

        let err = table.run().unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { agent: 0, .. }));
        assert!(stop.is_stopped());
    }
}
