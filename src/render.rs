use std::io::{self, Write};

use crate::config::{RunConfig, RunPlan};
use crate::stats::{FinalReport, LiveStats, StopReason};
use crate::targets::TargetSet;

pub fn print_config(config: &RunConfig, targets: &TargetSet) {
    println!("Configuration:");
    println!("  Intensity: {}%", config.intensity);
    println!("  Threads:   {}", config.thread_count);
    println!("  Delay:     {}ms", config.base_delay.as_millis());
    match config.duration {
        Some(d) => println!("  Duration:  {}s", d.as_secs()),
        None => println!("  Duration:  unlimited"),
    }
    println!("  Mode:      {:?}", config.mode);
    println!("  Targets:   {}", targets.len());
    println!();
}

pub fn print_plan(plan: &RunPlan, active_workers: usize) {
    println!(
        "Running {} workers ({} requested) with {:.3}s between requests",
        active_workers,
        plan.workers,
        plan.delay.as_secs_f64()
    );
    println!("Press Ctrl+C to stop");
    println!();
}

/// Overwrites the current terminal line.
pub fn print_live(live: &LiveStats) {
    print!(
        "\rReq: {:>6} | Err: {:>4} | Rate: {:>5.1}/s | Recent: {:>5.1}/s | \
         Avg: {:>6.0}ms | Min: {:>6.0}ms | Max: {:>6.0}ms | Time: {:>6.1}s",
        live.requests,
        live.errors,
        live.overall_rate,
        live.recent_rate,
        live.avg_ms,
        live.min_ms,
        live.max_ms,
        live.elapsed.as_secs_f64()
    );
    let _ = io::stdout().flush();
}

pub fn print_final(report: &FinalReport) {
    println!("\n");
    println!("{}", "=".repeat(70));
    println!("Test Results");
    println!("{}", "=".repeat(70));
    match report.reason {
        StopReason::Manual => println!("Stopped:             manually"),
        StopReason::DurationElapsed => println!("Stopped:             duration limit reached"),
    }
    println!("Total Requests:      {}", report.requests);
    println!("Successful:          {}", report.requests.saturating_sub(report.errors));
    println!("Errors:              {}", report.errors);
    println!("Success Rate:        {:.1}%", report.success_rate * 100.0);
    println!("Duration:            {:.1} seconds", report.elapsed.as_secs_f64());
    println!("Average Rate:        {:.1} requests/second", report.overall_rate);
    println!("Transfer:            {:.2}MB ({:.2}MB/s)", report.bytes as f64 / 1024.0 / 1024.0, report.transfer_rate_mib);
    println!();
    println!("Response Time:");
    println!("  Avg:    {:.0}ms", report.avg_ms);
    println!("  Median: {:.0}ms", report.median_ms);
    println!("  Min:    {:.0}ms", report.min_ms);
    println!("  Max:    {:.0}ms", report.max_ms);
    println!("  P99:    {:.0}ms", report.p99_ms);
    if report.abandoned_workers > 0 {
        println!();
        println!("{} workers were still finishing a request at shutdown", report.abandoned_workers);
    }
}
