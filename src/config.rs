use std::time::Duration;

use clap::Parser;

use crate::{
    arbitrator::Policy,
    error::{Error, Result},
    philosopher::{Span, Timing},
};

/// 食事する哲学者のシミュレーション
///
/// N 人の哲学者が円卓を囲み、隣り合う 2 本のフォークを Arbitrator から借りて食事する。
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "dining")]
#[command(version, about, long_about = None)]
pub struct Config {
    /// 哲学者 (= フォーク) の数
    #[arg(short = 'n', long, default_value_t = 5)]
    pub philosophers: usize,

    /// デッドロック回避の方式
    #[arg(short, long, value_enum, default_value_t = Policy::Hierarchy)]
    pub policy: Policy,

    /// 1 人あたりの食事回数。0 なら無制限
    #[arg(short, long, default_value_t = 100)]
    pub meals: usize,

    /// 実行時間の上限 (ミリ秒)
    #[arg(short, long)]
    pub duration_ms: Option<u64>,

    #[arg(long, default_value_t = 0)]
    pub think_min_us: u64,
    #[arg(long, default_value_t = 2000)]
    pub think_max_us: u64,

    #[arg(long, default_value_t = 0)]
    pub eat_min_us: u64,
    #[arg(long, default_value_t = 2000)]
    pub eat_max_us: u64,

    #[arg(long, default_value_t = 0)]
    pub backoff_min_us: u64,
    #[arg(long, default_value_t = 1000)]
    pub backoff_max_us: u64,

    /// ウェイター方式で 1 回の要求が待つ最大時間 (ミリ秒)
    #[arg(long, default_value_t = 50)]
    pub patience_ms: u64,

    /// 乱数のシード。哲学者 i は seed + i を使う
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// 不変条件を毎回検査する (debug ビルドでは常に有効)
    #[arg(long)]
    pub instrumented: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            philosophers: 5,
            policy: Policy::Hierarchy,
            meals: 100,
            duration_ms: None,
            think_min_us: 0,
            think_max_us: 2000,
            eat_min_us: 0,
            eat_max_us: 2000,
            backoff_min_us: 0,
            backoff_max_us: 1000,
            patience_ms: 50,
            seed: 0,
            instrumented: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.philosophers < 2 {
            return Err(Error::Config(format!(
                "need at least 2 philosophers, got {}",
                self.philosophers
            )));
        }

        for (name, min, max) in [
            ("think", self.think_min_us, self.think_max_us),
            ("eat", self.eat_min_us, self.eat_max_us),
            ("backoff", self.backoff_min_us, self.backoff_max_us),
        ] {
            if min > max {
                return Err(Error::Config(format!(
                    "{name} range is inverted: {min}us > {max}us"
                )));
            }
        }

        if self.meal_limit().is_none() && self.duration().is_none() {
            return Err(Error::Config(
                "either --meals or --duration-ms must bound the run".into(),
            ));
        }
        Ok(())
    }

    pub fn meal_limit(&self) -> Option<usize> {
        (self.meals > 0).then_some(self.meals)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }

    pub fn patience(&self) -> Duration {
        Duration::from_millis(self.patience_ms)
    }

    pub fn checks_invariants(&self) -> bool {
        self.instrumented || cfg!(debug_assertions)
    }

    pub fn timing(&self) -> Timing {
        let span = |min: u64, max: u64| Span::new(Duration::from_micros(min), Duration::from_micros(max));
        Timing {
            think: span(self.think_min_us, self.think_max_us),
            eat: span(self.eat_min_us, self.eat_max_us),
            backoff: span(self.backoff_min_us, self.backoff_max_us),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_matches_cli_defaults() {
        let parsed = Config::parse_from(["dining"]);
        assert_eq!(parsed, Config::default());
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.timing(), Timing::default());
    }

    #[test]
    fn test_parse_waiter_run() {
        let config = Config::parse_from([
            "dining", "-n", "7", "--policy", "waiter", "--meals", "0", "-d", "250",
        ]);
        assert_eq!(config.philosophers, 7);
        assert_eq!(config.policy, Policy::Waiter);
        assert_eq!(config.meal_limit(), None);
        assert_eq!(config.duration(), Some(Duration::from_millis(250)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_lonely_philosopher() {
        let config = Config {
            philosophers: 1,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_range() {
        let config = Config {
            eat_min_us: 10,
            eat_max_us: 5,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_unbounded_run() {
        let config = Config {
            meals: 0,
            duration_ms: None,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
