// src/codegen/workflow.rs
//
// =============================================================================
// TDLC: WORKFLOW DOCUMENT GENERATOR (v 0.1 )
// =============================================================================
//
// Emits a Rocoto workflow and the scripts it runs.
//
//   workflow.xml                 tasks, resources, dependencies
//   install.sh / uninstall.sh    per-build entry points (`all` for every build)
//   jobs/J<TASK>                 one entry script per scheduler task
//   scripts/ex<task>.sh          the rendered steps, sourced by the job
//   scripts/tdl_env.sh           exported TDL_* settings
//   scripts/tdl_utils.sh         shared helper library
//   plan.json, MANIFEST.sha256   machine-readable plan and file digests
//
// The INSTALL entity points at the generated tree; TDL_HOME is where builds
// run and may be elsewhere.

use std::collections::HashSet;
use std::fmt::Display;

use quick_xml::escape::escape;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use super::{prep_baseline, Job, JobKind, Mode, Options, Plan, Settings};
use crate::artifacts::Artifacts;
use crate::error::{Result, TdlError};

use super::shell::{quote, UTILS};

const PREP_BASELINE: &str = "prep_baseline";

fn xml_error(e: impl Display) -> TdlError {
    TdlError::generation(format!("writing workflow.xml: {e}"), None)
}

/// Entity values may not contain `"`, `&` or `%` unescaped.
fn entity_value(s: &str) -> String {
    escape(s).replace('%', "&#37;")
}

fn job_file(stem: &str) -> String {
    format!("jobs/J{}", stem.to_ascii_uppercase())
}

fn ex_file(stem: &str) -> String {
    format!("scripts/ex{stem}.sh")
}

// ============================================================================
// 1. XML
// ============================================================================

struct Doc {
    w: Writer<Vec<u8>>,
}

impl Doc {
    fn new() -> Self {
        Self {
            w: Writer::new_with_indent(Vec::new(), b' ', 2),
        }
    }

    fn event(&mut self, event: Event<'_>) -> Result<()> {
        self.w.write_event(event).map_err(xml_error)
    }

    fn start(&mut self, start: BytesStart<'_>) -> Result<()> {
        self.event(Event::Start(start))
    }

    fn end(&mut self, name: &str) -> Result<()> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    /// `<name>text</name>` where `text` is already escaped (may hold entities).
    fn element(&mut self, name: &str, escaped: &str) -> Result<()> {
        self.start(BytesStart::new(name))?;
        self.event(Event::Text(BytesText::from_escaped(escaped)))?;
        self.end(name)
    }

    fn finish(self) -> Result<String> {
        String::from_utf8(self.w.into_inner()).map_err(xml_error)
    }
}

fn doctype(plan: &Plan, options: &Options) -> String {
    let s = &plan.settings;
    let entities = [
        ("ACCOUNT", s.account.clone().unwrap_or_default()),
        ("LOG", s.log_dir.clone()),
        ("INSTALL", options.output.display().to_string()),
        ("SCHEDULER", s.scheduler.as_str().to_string()),
        ("TASKRETRY", s.task_retries.to_string()),
        ("RUNID", plan.run_id.to_string()),
    ];
    let mut out = String::from("workflow [\n");
    for (name, value) in entities {
        out.push_str(&format!("  <!ENTITY {name} \"{}\">\n", entity_value(&value)));
    }
    out.push(']');
    out
}

struct TaskSpec<'a> {
    name: &'a str,
    command: String,
    walltime: &'a str,
    queue: Option<&'a str>,
    partition: Option<&'a str>,
    native: Option<&'a str>,
    /// `<nodes>` text, or `None` for a plain core count.
    nodes: Option<String>,
    cores: u32,
    deps: Vec<&'a str>,
}

fn write_task(doc: &mut Doc, settings: &Settings, task: &TaskSpec<'_>) -> Result<()> {
    let mut start = BytesStart::new("task");
    start.push_attribute(("name", task.name));
    start.push_attribute((b"maxtries".as_slice(), b"&TASKRETRY;".as_slice()));
    doc.start(start)?;

    doc.element("command", &task.command)?;
    doc.element("jobname", &format!("tdl_&RUNID;_{}", escape(task.name)))?;
    if settings.account.is_some() {
        doc.element("account", "&ACCOUNT;")?;
    }
    if let Some(queue) = task.queue.or(settings.queue.as_deref()) {
        doc.element("queue", &escape(queue))?;
    }
    if let Some(partition) = task.partition.or(settings.partition.as_deref()) {
        doc.element("partition", &escape(partition))?;
    }
    match &task.nodes {
        Some(nodes) => doc.element("nodes", &escape(nodes.as_str()))?,
        None => doc.element("cores", &task.cores.to_string())?,
    }
    doc.element("walltime", &escape(task.walltime))?;
    if let Some(native) = task.native {
        doc.element("native", &escape(native))?;
    }
    doc.element("join", &format!("&LOG;/{}.log", escape(task.name)))?;

    if !task.deps.is_empty() {
        doc.start(BytesStart::new("dependency"))?;
        doc.start(BytesStart::new("and"))?;
        for dep in &task.deps {
            let mut taskdep = BytesStart::new("taskdep");
            taskdep.push_attribute(("task", *dep));
            doc.event(Event::Empty(taskdep))?;
        }
        doc.end("and")?;
        doc.end("dependency")?;
    }
    doc.end("task")
}

fn workflow_xml(plan: &Plan, options: &Options) -> Result<String> {
    let settings = &plan.settings;
    let mut doc = Doc::new();
    doc.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    doc.event(Event::DocType(BytesText::from_escaped(doctype(plan, options))))?;

    let mut root = BytesStart::new("workflow");
    root.push_attribute(("realtime", "F"));
    root.push_attribute((b"scheduler".as_slice(), b"&SCHEDULER;".as_slice()));
    root.push_attribute(("cyclethrottle", "1"));
    doc.start(root)?;

    doc.element("log", "&LOG;/workflow_&RUNID;.log")?;
    let mut cycle = BytesStart::new("cycledef");
    cycle.push_attribute(("group", "tdl"));
    doc.start(cycle)?;
    doc.event(Event::Text(BytesText::new("200001010000 200001010000 01:00:00")))?;
    doc.end("cycledef")?;

    let baseline = plan.mode == Mode::Baseline;
    if baseline {
        write_task(
            &mut doc,
            settings,
            &TaskSpec {
                name: PREP_BASELINE,
                command: format!("&INSTALL;/{}", job_file(PREP_BASELINE)),
                walltime: &settings.walltime,
                queue: None,
                partition: None,
                native: None,
                nodes: None,
                cores: 1,
                deps: Vec::new(),
            },
        )?;
    }

    for job in &plan.jobs {
        let command = match job.kind {
            JobKind::Build => format!("&INSTALL;/install.sh {}", escape(job.name.as_str())),
            JobKind::Test | JobKind::Task => format!("&INSTALL;/{}", job_file(&job.task)),
        };
        let mut deps: Vec<&str> = Vec::new();
        if baseline {
            deps.push(PREP_BASELINE);
        }
        deps.extend(job.prerequisites.iter().map(String::as_str));
        let r = &job.resources;
        write_task(
            &mut doc,
            settings,
            &TaskSpec {
                name: &job.task,
                command,
                walltime: &r.walltime,
                queue: r.queue.as_deref(),
                partition: r.partition.as_deref(),
                native: r.native.as_deref(),
                nodes: r.layout.as_ref().map(|l| l.rocoto_nodes()),
                cores: r.cores,
                deps,
            },
        )?;
    }

    doc.end("workflow")?;
    let mut xml = doc.finish()?;
    xml.push('\n');
    Ok(xml)
}

// ============================================================================
// 2. SCRIPTS
// ============================================================================

const LOCATE_ROOT: &str = "TDL_ROOT=\"$(cd \"$(dirname \"${BASH_SOURCE[0]}\")/..\" && pwd)\"\n";

fn job_entry(task: &str, ex: &str, trace: bool) -> String {
    let label = quote(task);
    format!(
        "#!/usr/bin/env bash\n\
         # Scheduler entry point for {task}.\n\
         set -e\n\
         {LOCATE_ROOT}\
         source \"$TDL_ROOT/scripts/tdl_env.sh\"\n\
         source \"$TDL_ROOT/scripts/tdl_utils.sh\"\n\
         tdl_report_start {label}\n\
         set +e\n\
         (\n\
         set -e{}\n\
         source \"$TDL_ROOT/{ex}\"\n\
         )\n\
         status=$?\n\
         set -e\n\
         if [ \"$status\" -ne 0 ]; then\n    \
             tdl_report_failure {label} \"$status\"\n    \
             exit \"$status\"\n\
         fi\n\
         tdl_report_finish {label}\n",
        if trace { "x" } else { "" }
    )
}

fn ex_script(task: &str, body: &str) -> String {
    format!("# Steps of {task}; sourced by its job script.\n{body}")
}

fn dispatch(script: &str, about: &str, cases: &[(String, String)]) -> String {
    let names: Vec<&str> = cases.iter().map(|(n, _)| n.as_str()).collect();
    let mut out = format!(
        "#!/usr/bin/env bash\n# {about}\n# usage: {script} NAME|all\nset -e\n{}",
        LOCATE_ROOT.replace("/..", "")
    );
    out.push_str("source \"$TDL_ROOT/scripts/tdl_env.sh\"\n\n");
    out.push_str("case \"${1:-}\" in\n");
    for (name, action) in cases {
        out.push_str(&format!("    {})\n        {action}\n        ;;\n", quote(name)));
    }
    out.push_str("    all)\n");
    if cases.is_empty() {
        out.push_str("        :\n");
    }
    for (_, action) in cases {
        out.push_str(&format!("        {action}\n"));
    }
    out.push_str("        ;;\n");
    out.push_str(&format!(
        "    *)\n        echo \"usage: $0 {{{}}}\" >&2\n        exit 2\n        ;;\nesac\n",
        names.iter().copied().chain(["all"]).collect::<Vec<_>>().join("|")
    ));
    out
}

fn uninstall_script(builds: &[&Job]) -> String {
    let mut functions = String::new();
    let mut cases = Vec::new();
    for job in builds {
        let func = format!("tdl_uninstall_{}", job.stem());
        let fragment = job.uninstall.as_deref().unwrap_or(":");
        functions.push_str(&format!(
            "{func}() {{\n    (\n    set -e\n    cd \"$TDL_HOME\"\n{fragment}\n    )\n}}\n\n"
        ));
        cases.push((job.name.clone(), func));
    }
    let dispatch = dispatch("uninstall.sh", "Removes what a build installed.", &cases);
    // Functions go after the environment is sourced, before the dispatch.
    match dispatch.find("case \"${1:-}\"") {
        Some(at) => format!("{}{functions}{}", &dispatch[..at], &dispatch[at..]),
        None => dispatch,
    }
}

/// Scheduler task names must not collide once sanitized.
fn check_unique(plan: &Plan) -> Result<()> {
    let mut seen = HashSet::new();
    for job in &plan.jobs {
        if !seen.insert(job.task.as_str()) {
            return Err(TdlError::generation(
                format!("two runnables map to the scheduler task name `{}`", job.task),
                None,
            ));
        }
    }
    Ok(())
}

pub fn render(plan: &Plan, options: &Options) -> Result<Artifacts> {
    check_unique(plan)?;
    let mut set = Artifacts::new(&options.output);

    set.add("workflow.xml", workflow_xml(plan, options)?, false);
    set.add("scripts/tdl_utils.sh", UTILS.to_string(), false);
    set.add(
        "scripts/tdl_env.sh",
        format!(
            "# Run settings for run {}, {} mode.\n{}",
            plan.run_id,
            plan.mode.as_str(),
            plan.settings.environment(options)
        ),
        false,
    );

    if let Some(prep) = prep_baseline(plan) {
        let ex = ex_file(PREP_BASELINE);
        set.add(job_file(PREP_BASELINE), job_entry(PREP_BASELINE, &ex, options.trace), true);
        set.add(ex, ex_script(PREP_BASELINE, &prep), false);
    }

    for job in &plan.jobs {
        let ex = ex_file(&job.task);
        set.add(job_file(&job.task), job_entry(&job.task, &ex, options.trace), true);
        set.add(ex, ex_script(&job.task, &job.body), false);
    }

    let builds: Vec<&Job> = plan.builds().collect();
    let install_cases: Vec<(String, String)> = builds
        .iter()
        .map(|j| (j.name.clone(), format!("\"$TDL_ROOT/{}\"", job_file(&j.task))))
        .collect();
    set.add(
        "install.sh",
        dispatch("install.sh", "Runs a build's job script.", &install_cases),
        true,
    );
    set.add("uninstall.sh", uninstall_script(&builds), true);

    let json = serde_json::to_string_pretty(plan)
        .map_err(|e| TdlError::generation(format!("serializing plan.json: {e}"), None))?;
    set.add("plan.json", json + "\n", false);

    let manifest = set.manifest();
    set.add("MANIFEST.sha256", manifest, false);
    log::info!(
        "Rendered workflow: {} task(s), {} file(s)",
        plan.jobs.len() + usize::from(plan.mode == Mode::Baseline),
        set.len()
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_values_are_escaped() {
        assert_eq!(entity_value("a&b \"c\" 100%"), "a&amp;b &quot;c&quot; 100&#37;");
    }

    #[test]
    fn job_files_use_upper_case_task_names() {
        assert_eq!(job_file("test_control"), "jobs/JTEST_CONTROL");
        assert_eq!(ex_file("test_control"), "scripts/extest_control.sh");
    }

    #[test]
    fn dispatch_lists_every_name_and_all() {
        let text = dispatch(
            "install.sh",
            "x",
            &[("fv3".into(), "run_fv3".into()), ("ww3".into(), "run_ww3".into())],
        );
        assert!(text.contains("    'fv3')\n        run_fv3\n"));
        assert!(text.contains("    all)\n        run_fv3\n        run_ww3\n"));
        assert!(text.contains("usage: $0 {fv3|ww3|all}"));
    }

    #[test]
    fn job_entry_sources_its_steps() {
        let text = job_entry("build_fv3", "scripts/exbuild_fv3.sh", true);
        assert!(text.contains("source \"$TDL_ROOT/scripts/exbuild_fv3.sh\""));
        assert!(text.contains("set -ex\n"));
        assert!(text.contains("tdl_report_finish 'build_fv3'"));
    }
}
