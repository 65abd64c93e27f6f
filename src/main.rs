use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{Days, NaiveDate, Utc};
use tiered_backup_cloud::MemoryCloud;
use tiered_backup_common::{format_delete_on, DELETE_ON_FORMAT};
use tiered_backup_engine::{BackupCycle, Settings};
use tiered_backup_policy::{parse_policy, RetentionScheduler};
use tracing::info;

mod scenario;

const DEFAULT_STATE_PATH: &str = "tiered-backup-state.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let cmd = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    // Parse optional flags
    let date = parse_flag_string(&args, "--date");
    let config_path = parse_flag_string(&args, "--config");
    let state_path = parse_flag_string(&args, "--state").unwrap_or_else(|| DEFAULT_STATE_PATH.to_string());
    let days = parse_flag_value(&args, "--days").unwrap_or(1);

    match cmd {
        "decide" => {
            let raw = positional(&args).unwrap_or_else(|| usage());
            run_decide(&raw, resolve_date(date.as_deref())?, days)?;
        }
        "run" => {
            let settings = load_settings(config_path.as_deref())?;
            run_cycle(PathBuf::from(state_path), settings, resolve_date(date.as_deref())?).await?;
        }
        "scenario" => {
            let scenario_path = positional(&args).unwrap_or_else(|| usage());
            let settings = load_settings(config_path.as_deref())?;
            scenario::run_scenario_cli(&scenario_path, settings).await?;
        }
        _ => usage(),
    }

    Ok(())
}

fn usage() -> ! {
    eprintln!("Usage: tiered-backup decide <daily,weekly,monthly,yearly> [--date YYYY-MM-DD] [--days <n>]");
    eprintln!("       tiered-backup run [--state <file.json>] [--config <file.toml>] [--date YYYY-MM-DD]");
    eprintln!("       tiered-backup scenario <file.toml> [--config <file.toml>]");
    std::process::exit(1);
}

/// First argument after the command that is neither a flag nor a flag value.
fn positional(args: &[String]) -> Option<String> {
    let mut rest = args.iter().skip(2);
    while let Some(arg) = rest.next() {
        if arg.starts_with("--") {
            rest.next();
            continue;
        }
        return Some(arg.clone());
    }
    None
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<u64> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .and_then(|v| v.parse().ok())
}

fn parse_flag_string(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// `--date` if given, otherwise the current UTC date.
fn resolve_date(flag: Option<&str>) -> anyhow::Result<NaiveDate> {
    match flag {
        Some(s) => NaiveDate::parse_from_str(s, DELETE_ON_FORMAT)
            .with_context(|| format!("invalid --date {s:?}, expected YYYY-MM-DD")),
        None => Ok(Utc::now().date_naive()),
    }
}

fn load_settings(path: Option<&str>) -> anyhow::Result<Settings> {
    match path {
        Some(p) => Settings::load(Path::new(p)).with_context(|| format!("loading settings from {p}")),
        None => Ok(Settings::default()),
    }
}

fn run_decide(raw: &str, start: NaiveDate, days: u64) -> anyhow::Result<()> {
    let policy = parse_policy(raw).with_context(|| format!("invalid policy {raw:?}"))?;
    println!("Policy: daily={} weekly={} monthly={} yearly={}", policy.daily, policy.weekly, policy.monthly, policy.yearly);

    for offset in 0..days.max(1) {
        let Some(day) = start.checked_add_days(Days::new(offset)) else {
            break;
        };
        let decision = RetentionScheduler::decide(&policy, day);
        match decision.scheduled() {
            Some((tier, expires)) => println!(
                "{} {}  {:<7}  delete on {}",
                format_delete_on(day),
                day.format("%a"),
                tier.as_str(),
                format_delete_on(expires)
            ),
            None => println!("{} {}  -", format_delete_on(day), day.format("%a")),
        }
    }
    Ok(())
}

async fn run_cycle(state_path: PathBuf, settings: Settings, today: NaiveDate) -> anyhow::Result<()> {
    let cloud = Arc::new(
        MemoryCloud::open(&state_path)
            .with_context(|| format!("opening inventory {}", state_path.display()))?,
    );
    info!(state = %state_path.display(), date = %today, "running backup cycle");

    let cycle = BackupCycle::new(cloud, settings);
    let report = cycle.run(today).await?;

    println!("=== Backup cycle {} ===", format_delete_on(report.date));
    println!(
        "Instances: {} backed up, {} skipped, {} failed",
        report.backup.backed_up(),
        report.backup.skipped(),
        report.backup.failed()
    );
    println!("Snapshots created: {}", report.backup.snapshot_ids().len());
    println!("Snapshots expired: {}", report.sweep.deleted.len());
    for instance in &report.backup.instances {
        if let Err(e) = &instance.result {
            println!("  {}: {e}", instance.instance_id);
        }
    }
    for (id, e) in &report.sweep.failed {
        println!("  {id}: delete failed: {e}");
    }
    Ok(())
}
