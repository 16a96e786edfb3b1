use anyhow::Context;
use crossterm::tty::IsTty;
use eg_bench::{Bench, BenchConfig, ExternalTool, TEST_VECTORS};
use log::warn;
use std::io::{self, Write};

// The main entry point: sweeps the bench vectors and prints the result table.
fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = BenchConfig::default();
    let tool = ExternalTool::new(&config);
    let stdout = io::stdout();
    let mut bench = Bench::new(config, tool).with_styling(stdout.is_tty());

    let mut out = stdout.lock();
    let summary = bench
        .run(&TEST_VECTORS, &mut out)
        .with_context(|| {
            format!(
                "Envelope sweep aborted (tool: {})",
                bench.config().tool_path().display()
            )
        })?;
    out.flush().context("Failed to flush sweep table")?;

    if summary.failures() > 0 {
        warn!(
            "{} of {} vectors have no measurement",
            summary.failures(),
            summary.rows.len()
        );
    }
    Ok(())
}
