use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use chrono::{Days, NaiveDate};
use serde::Deserialize;
use tiered_backup_cloud::MemoryCloud;
use tiered_backup_common::{
    format_delete_on, BlockDevice, Instance, Tags, BACKUP_LABEL_TAG, INSTANCE_ID_TAG, NAME_TAG,
};
use tiered_backup_engine::{BackupCycle, Settings};

#[derive(Deserialize)]
pub struct Scenario {
    pub meta: ScenarioMeta,
    #[serde(default)]
    pub instances: Vec<ScenarioInstance>,
    #[serde(default)]
    pub expect: Option<ScenarioExpect>,
}

#[derive(Deserialize)]
pub struct ScenarioMeta {
    pub name: String,
    pub description: Option<String>,
    /// First simulated day, written as a `"YYYY-MM-DD"` string.
    pub start: NaiveDate,
    /// Number of consecutive daily cycles to run.
    pub days: u64,
}

#[derive(Deserialize)]
pub struct ScenarioInstance {
    pub id: String,
    pub name: Option<String>,
    /// Raw policy string; `None` leaves the instance untagged.
    pub config: Option<String>,
    #[serde(default)]
    pub volumes: Vec<ScenarioVolume>,
}

#[derive(Deserialize)]
pub struct ScenarioVolume {
    pub device: String,
    pub volume: String,
}

/// Checks applied to the inventory after the last day.
#[derive(Deserialize, Default)]
pub struct ScenarioExpect {
    /// Total snapshots left.
    pub snapshots: Option<usize>,
    /// Snapshots left per `BackupLabel`.
    #[serde(default)]
    pub labels: BTreeMap<String, usize>,
    /// Instances expected to fail in at least one cycle; any other failing
    /// instance is an error.
    #[serde(default)]
    pub failing: Vec<String>,
}

/// Totals over a whole scenario run.
#[derive(Debug, Default)]
pub struct ScenarioOutcome {
    pub created: usize,
    pub expired: usize,
    /// Instance id → number of cycles in which it failed.
    pub failures: BTreeMap<String, usize>,
    /// `BackupLabel` → snapshots left at the end.
    pub remaining_by_label: BTreeMap<String, usize>,
    pub remaining: usize,
}

/// Run a scenario from the CLI.
pub async fn run_scenario_cli(scenario_path: &str, settings: Settings) -> anyhow::Result<()> {
    let toml_content = std::fs::read_to_string(scenario_path)
        .with_context(|| format!("reading scenario {scenario_path}"))?;
    let scenario: Scenario = toml::from_str(&toml_content)?;

    println!("=== Scenario: {} ===", scenario.meta.name);
    if let Some(ref desc) = scenario.meta.description {
        println!("{desc}");
    }

    let outcome = run_scenario(&scenario, settings, true).await?;

    println!(
        "\n{} snapshots created, {} expired, {} remaining",
        outcome.created, outcome.expired, outcome.remaining
    );
    for (label, count) in &outcome.remaining_by_label {
        println!("  {label:<8} {count}");
    }
    for (instance, cycles) in &outcome.failures {
        println!("  {instance} failed in {cycles} cycle(s)");
    }

    if let Some(expect) = &scenario.expect {
        check_expectations(expect, &outcome)?;
        println!("\nAll expectations met.");
    }
    Ok(())
}

/// Simulate `meta.days` daily cycles against a fresh in-memory inventory.
pub async fn run_scenario(
    scenario: &Scenario,
    settings: Settings,
    verbose: bool,
) -> anyhow::Result<ScenarioOutcome> {
    let cloud = Arc::new(MemoryCloud::new());
    for instance in &scenario.instances {
        cloud.put_instance(build_instance(instance, &settings))?;
    }

    let cycle = BackupCycle::new(cloud.clone(), settings);
    let mut outcome = ScenarioOutcome::default();

    for offset in 0..scenario.meta.days {
        let Some(today) = scenario.meta.start.checked_add_days(Days::new(offset)) else {
            bail!("scenario runs past the last representable date");
        };
        let report = cycle.run(today).await?;

        let created = report.backup.snapshot_ids().len();
        outcome.created += created;
        outcome.expired += report.sweep.deleted.len();
        for instance in &report.backup.instances {
            if instance.result.is_err() {
                *outcome.failures.entry(instance.instance_id.clone()).or_default() += 1;
            }
        }

        if verbose && (created > 0 || !report.sweep.deleted.is_empty()) {
            let labels: Vec<String> = report
                .backup
                .snapshot_ids()
                .iter()
                .filter_map(|id| cloud.snapshot(id))
                .map(|s| {
                    format!(
                        "{}:{}",
                        s.tag(INSTANCE_ID_TAG).unwrap_or("?"),
                        s.tag(BACKUP_LABEL_TAG).unwrap_or("?")
                    )
                })
                .collect();
            println!(
                "{} {}  +{created} -{}  {}",
                format_delete_on(today),
                today.format("%a"),
                report.sweep.deleted.len(),
                labels.join(" ")
            );
        }
    }

    let remaining = cloud.snapshots();
    outcome.remaining = remaining.len();
    for snapshot in &remaining {
        let label = snapshot.tag(BACKUP_LABEL_TAG).unwrap_or("untagged");
        *outcome.remaining_by_label.entry(label.to_string()).or_default() += 1;
    }
    Ok(outcome)
}

fn build_instance(entry: &ScenarioInstance, settings: &Settings) -> Instance {
    let mut tags = Tags::new();
    if let Some(name) = &entry.name {
        tags.insert(NAME_TAG.to_string(), name.clone());
    }
    if let Some(config) = &entry.config {
        tags.insert(settings.config_tag.clone(), config.clone());
    }
    Instance {
        id: entry.id.clone(),
        tags,
        block_devices: entry
            .volumes
            .iter()
            .map(|v| BlockDevice {
                device_name: v.device.clone(),
                volume_id: v.volume.clone(),
            })
            .collect(),
    }
}

fn check_expectations(expect: &ScenarioExpect, outcome: &ScenarioOutcome) -> anyhow::Result<()> {
    let mut problems = Vec::new();

    if let Some(want) = expect.snapshots {
        if want != outcome.remaining {
            problems.push(format!("expected {want} snapshots, found {}", outcome.remaining));
        }
    }
    for (label, want) in &expect.labels {
        let got = outcome.remaining_by_label.get(label).copied().unwrap_or(0);
        if *want != got {
            problems.push(format!("expected {want} {label} snapshots, found {got}"));
        }
    }
    for instance in &expect.failing {
        if !outcome.failures.contains_key(instance) {
            problems.push(format!("expected {instance} to fail"));
        }
    }
    for instance in outcome.failures.keys() {
        if !expect.failing.contains(instance) {
            problems.push(format!("{instance} failed unexpectedly"));
        }
    }

    if !problems.is_empty() {
        bail!("scenario expectations not met:\n  {}", problems.join("\n  "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_MONTHS: &str = r#"
[meta]
name = "two months"
start = "2024-01-01"
days = 60

[[instances]]
id = "i-web"
name = "web"
config = "7,4,3,1"
volumes = [{ device = "/dev/xvda", volume = "vol-web" }]

[[instances]]
id = "i-broken"
config = "7,4"
volumes = [{ device = "/dev/xvda", volume = "vol-broken" }]

[[instances]]
id = "i-untagged"
volumes = [{ device = "/dev/xvda", volume = "vol-untagged" }]

[expect]
failing = ["i-broken"]
"#;

    #[tokio::test]
    async fn test_two_month_simulation() {
        let scenario: Scenario = toml::from_str(TWO_MONTHS).unwrap();
        let outcome = run_scenario(&scenario, Settings::default(), false)
            .await
            .unwrap();

        // One snapshot per day for the single tagged, valid instance.
        assert_eq!(outcome.created, 60);
        assert_eq!(outcome.failures.get("i-broken"), Some(&60));
        assert!(!outcome.failures.contains_key("i-untagged"));

        // Last day is 2024-02-29 (Thursday). Kept: the yearly from Jan 1,
        // the monthly from Feb 1, weekly backups from the last 4 Sundays and
        // daily backups from Feb 23-29 except Sunday Feb 25.
        assert_eq!(outcome.remaining_by_label.get("yearly"), Some(&1));
        assert_eq!(outcome.remaining_by_label.get("monthly"), Some(&1));
        assert_eq!(outcome.remaining_by_label.get("weekly"), Some(&4));
        assert_eq!(outcome.remaining_by_label.get("daily"), Some(&6));
        assert_eq!(outcome.remaining, 12);
        assert_eq!(outcome.created - outcome.expired, outcome.remaining);

        check_expectations(scenario.expect.as_ref().unwrap(), &outcome).unwrap();
    }

    #[tokio::test]
    async fn test_bundled_first_quarter_scenario() {
        let scenario: Scenario =
            toml::from_str(include_str!("../scenarios/first-quarter.toml")).unwrap();
        let outcome = run_scenario(&scenario, Settings::default(), false)
            .await
            .unwrap();

        let labelled: usize = outcome.remaining_by_label.values().sum();
        assert_eq!(labelled, outcome.remaining);
        check_expectations(scenario.expect.as_ref().unwrap(), &outcome).unwrap();
    }

    #[test]
    fn test_expectation_mismatch_is_reported() {
        let outcome = ScenarioOutcome {
            remaining: 3,
            ..ScenarioOutcome::default()
        };
        let expect = ScenarioExpect {
            snapshots: Some(4),
            failing: vec!["i-1".to_string()],
            ..ScenarioExpect::default()
        };
        let err = check_expectations(&expect, &outcome).unwrap_err().to_string();
        assert!(err.contains("expected 4 snapshots, found 3"), "{err}");
        assert!(err.contains("expected i-1 to fail"), "{err}");
    }
}
