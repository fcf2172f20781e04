#![forbid(unsafe_code)]

use anyhow::{Result, bail};
use sgcompact_sim::{CampaignConfig, run_campaign};

fn main() -> Result<()> {
    let report = run_campaign(&CampaignConfig::default())?;

    println!(
        "campaign complete: seeds={} passed={} groups={}",
        report.seeds_run, report.seeds_passed, report.groups_checked
    );

    if let Some(seed) = report.first_failure {
        bail!("seed {seed} failed; replay it with `sgcompact sim --seeds {seed}..{}`", seed + 1);
    }
    Ok(())
}
