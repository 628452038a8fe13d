// src/codegen/script.rs
//
// Flat-script generator: one bash file that builds and runs everything in
// dependency order, each runnable in its own subshell.

use super::{prep_baseline, Job, Options, Plan};
use crate::artifacts::Artifacts;
use crate::error::Result;

use super::shell::{quote, UTILS};

fn section(job: &Job) -> String {
    let label = quote(&job.task);
    let mut out = format!(
        "\n# ---------------------------------------------------------------------------\n# {}\n# ---------------------------------------------------------------------------\n",
        job.task
    );
    // errexit is ignored inside `( ... ) ||`, so the status is checked after.
    out.push_str(&format!("tdl_report_start {label}\nset +e\n(\nset -e\n"));
    out.push_str(&job.body);
    out.push_str(&format!(
        ")\nstatus=$?\nset -e\nif [ \"$status\" -ne 0 ]; then\n    tdl_report_failure {label} \"$status\"\n    exit \"$status\"\nfi\ntdl_report_finish {label}\n"
    ));
    out
}

pub fn render(plan: &Plan, options: &Options) -> Result<Artifacts> {
    let mut out = String::from("#!/usr/bin/env bash\n");
    out.push_str(&format!(
        "# Generated by {} from {} at {}\n# mode: {}, run id: {}\n",
        plan.generator,
        plan.input,
        plan.generated,
        plan.mode.as_str(),
        plan.run_id
    ));
    out.push_str("set -e\n");
    if options.trace {
        out.push_str("set -x\n");
    }

    out.push_str("\n# Settings\n");
    out.push_str(&plan.settings.environment(options));
    out.push_str("mkdir -p \"$TDL_HOME\" \"$TDL_LOG\" \"$TDL_SCRATCH\"\n\n");
    out.push_str(UTILS);

    if let Some(prep) = prep_baseline(plan) {
        let label = quote("prep_baseline");
        out.push_str(&format!("\ntdl_report_start {label}\n"));
        out.push_str(&prep);
        out.push_str(&format!("tdl_report_finish {label}\n"));
    }

    for job in &plan.jobs {
        out.push_str(&section(job));
    }
    out.push_str("\ntdl_log \"all runnables finished\"\n");

    let mut artifacts = Artifacts::new(&options.output);
    artifacts.add("", out, true);
    Ok(artifacts)
}
