//! Topology creation, verification and teardown

use crate::commands::connect;
use crate::output::{print_error, print_info, print_success, print_warning};
use anyhow::{bail, Context, Result};
use emulator_lib::reconciler::{ReconcileCounts, ResourceReconciler};
use emulator_lib::EmulationConfig;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Create,
    DryRun,
    Verify,
    Delete,
}

impl Mode {
    pub fn from_flags(dry_run: bool, verify_only: bool, delete: bool) -> Self {
        if delete {
            Mode::Delete
        } else if verify_only {
            Mode::Verify
        } else if dry_run {
            Mode::DryRun
        } else {
            Mode::Create
        }
    }
}

pub async fn run(config_path: &Path, kubeconfig: Option<&Path>, mode: Mode, yes: bool) -> Result<()> {
    let config = Arc::new(
        EmulationConfig::load(config_path)
            .with_context(|| format!("loading {}", config_path.display()))?,
    );
    print_info(&format!(
        "Config: {} pods across {} namespaces, {} time points",
        config.metadata.total_pods, config.metadata.total_namespaces, config.metadata.time_points
    ));

    let cluster = connect(kubeconfig).await?;
    let reconciler =
        ResourceReconciler::new(cluster, config.clone()).dry_run(mode == Mode::DryRun);

    match mode {
        Mode::Create | Mode::DryRun => {
            let report = reconciler.apply_all().await?;
            print_counts("Nodes", &report.nodes);
            print_counts("Namespaces", &report.namespaces);
            print_counts("Pods", &report.pods);
            if report.failed_total() > 0 {
                print_error(&format!("{} resources failed", report.failed_total()));
                bail!("topology creation incomplete");
            }
            print_success(if mode == Mode::DryRun {
                "Dry run complete"
            } else {
                "Topology ready"
            });
        }
        Mode::Verify => {
            let report = reconciler.verify().await?;
            for node in &report.missing_nodes {
                print_warning(&format!("missing node {}", node));
            }
            for ns in &report.missing_namespaces {
                print_warning(&format!("missing namespace {}", ns));
            }
            for (ns, count) in &report.pod_counts {
                print_info(&format!("namespace {}: {} pods", ns, count));
            }
            if report.ok() {
                print_success(&format!(
                    "Topology verified: {}/{} pods present",
                    report.found_pods, report.expected_pods
                ));
            } else {
                print_error(&format!(
                    "Topology incomplete: {}/{} pods present",
                    report.found_pods, report.expected_pods
                ));
                bail!("verification failed");
            }
        }
        Mode::Delete => {
            if !yes && !confirm("Delete the emulated topology?")? {
                print_info("Aborted");
                return Ok(());
            }
            reconciler.delete_all().await?;
            print_success("Topology deleted");
        }
    }

    Ok(())
}

fn print_counts(kind: &str, counts: &ReconcileCounts) {
    print_info(&format!(
        "{}: {} created, {} skipped, {} failed",
        kind, counts.created, counts.skipped, counts.failed
    ));
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
