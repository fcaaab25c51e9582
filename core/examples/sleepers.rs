//! Simple demonstration of the polling supervisor
//!
//! Launches ten `sleep` children with staggered durations and polls until
//! every one of them has exited, printing each exit as it is observed.

use chaperone_core::supervisor::{ProcessCallbacks, ProcessSupervisor};
use chaperone_core::{ProcessOptions, Result};
use std::time::{Duration, Instant};
use tracing::info;

fn main() -> Result<()> {
    chaperone_core::utils::init_tracing("info")?;

    info!("🚀 Starting sleepers demo");
    let started = Instant::now();
    let mut supervisor = ProcessSupervisor::named("sleepers");

    for i in 0..10u32 {
        let seconds = format!("{:.1}", 0.2 * f64::from(10 - i));
        let label = format!("sleeper-{} ({}s)", i, seconds);
        let callbacks = ProcessCallbacks::new()
            .on_started({
                let label = label.clone();
                move |ops| info!("📋 {} started as pid {}", label, ops.pid())
            })
            .on_exit(move |status| {
                println!(
                    "{} exited with {} after {:?}",
                    label,
                    status,
                    started.elapsed()
                );
            });
        supervisor.run_program("sleep", &[seconds.as_str()], &ProcessOptions::default(), callbacks)?;
    }

    info!("⏳ Waiting for {} children", supervisor.len());
    supervisor.wait(Duration::from_millis(50), None);

    info!("✅ All sleepers finished in {:?}", started.elapsed());
    Ok(())
}
