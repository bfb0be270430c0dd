use std::thread;

use anyhow::anyhow;
use clap::Parser;
use dining::{Config, Table};
use libc::{SIGINT, SIGTERM};
use log::info;
use signal_hook::iterator::Signals;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    let table = Table::new(config)?;

    // Ctrl-C で食事会を終わらせる。食事中の哲学者はフォークを置いてから抜ける
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signal_handle = signals.handle();
    let stop = table.stop_handle();
    let watcher = thread::spawn(move || {
        for sig in signals.forever() {
            info!("received signal: {:?}", sig);
            stop.stop();
        }
    });

    let report = table.run();
    signal_handle.close();
    watcher
        .join()
        .map_err(|_| anyhow!("signal watcher panicked"))?;
    let report = report?;

    for tally in &report.tallies {
        println!(
            "{}: ate {} times ({} retries)",
            tally.id, tally.meals, tally.retries
        );
    }
    for id in &report.crashed {
        println!("{id}: crashed");
    }
    println!(
        "TOTAL {} meals (at most {} eating at once)",
        report.total_meals(),
        report.snapshot.max_eating
    );
    Ok(())
}
