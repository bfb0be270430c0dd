//! 食事する哲学者問題。フォークの割り当てを Arbitrator 1 か所に集めて、
//! 資源階層方式かウェイター方式でデッドロックを避ける。

pub mod arbitrator;
pub mod config;
pub mod error;
pub mod philosopher;
pub mod table;

pub use arbitrator::{Acquire, Arbitrator, Policy, Snapshot};
pub use config::Config;
pub use error::{Error, Result};
pub use philosopher::{Philosopher, Span, State, Tally, Timing};
pub use table::{Report, StopHandle, Table};
