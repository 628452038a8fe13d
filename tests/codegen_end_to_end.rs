mod common;

use std::fs;
use std::path::Path;

use common::unit_on;
use tdlc::codegen::{self, Mode, Options, OutputKind};
use tdlc::deps;
use tdlc::CompilationUnit;

fn generate(selection: &str, kind: OutputKind, mode: Mode, output: &Path) -> tdlc::Artifacts {
    emit(unit_on("hera"), selection, kind, mode, output)
}

/// Parses `src` on a host where every `detect` script succeeds.
fn generate_from(src: &str, kind: OutputKind, mode: Mode, output: &Path) -> tdlc::Artifacts {
    let mut unit = CompilationUnit::new().with_runner(|_: &str| true);
    unit.parse_str(src, "suite.tdl").unwrap();
    emit(unit, "", kind, mode, output)
}

fn emit(
    mut unit: CompilationUnit,
    selection: &str,
    kind: OutputKind,
    mode: Mode,
    output: &Path,
) -> tdlc::Artifacts {
    let selected = unit.select(selection).unwrap();
    let resolved = deps::resolve(&unit.arena, &selected).unwrap();
    let options = Options {
        kind,
        mode,
        run_id: 42,
        trace: false,
        output: output.to_path_buf(),
        input: "suite.tdl".into(),
    };
    codegen::generate(&unit, &resolved, &options).unwrap()
}

fn read(root: &Path, relative: &str) -> String {
    fs::read_to_string(root.join(relative))
        .unwrap_or_else(|e| panic!("{relative}: {e}"))
}

#[test]
fn test_flat_script_runs_sections_in_dependency_order() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("rt.sh");
    generate("gfs", OutputKind::Script, Mode::Verify, &script).write().unwrap();

    let text = fs::read_to_string(&script).unwrap();
    assert!(text.starts_with("#!/usr/bin/env bash\n"));
    assert!(text.contains("export TDL_RUN_ID='42'\n"));
    assert!(text.contains("export TDL_MODE='verify'\n"));
    assert!(!text.contains("set -x"));
    assert!(text.contains("tdl_compare() {"));
    // Verify mode has no baseline preparation.
    assert!(!text.contains("tdl_report_start 'prep_baseline'"));

    let build = text.find("tdl_report_start 'build_fv3'").unwrap();
    let control = text.find("tdl_report_start 'test_control'").unwrap();
    let restart = text.find("tdl_report_start 'test_restart'").unwrap();
    assert!(build < control && control < restart);

    assert!(text.contains("make CC=gnu-cc fv3.exe"));
    assert!(text.contains("tdl_atparse 'input.nml.IN' 'input.nml'"));
    assert!(text.contains("tdl_deliver link '/shared/fix' 'fix'"));
    assert!(text.contains(
        "mpirun -np 100 env OMP_NUM_THREADS=2 'fv3.exe' : -np 4 env OMP_NUM_THREADS=1 'io.exe' '--fast'"
    ));
    assert!(text.contains(
        "tdl_compare bitcmp 'atmf024.nc' \"$TDL_BASELINE_DIR\"/'control'/'atmf024.nc'"
    ));
    assert!(text.contains("tdl_compare metacmp 'log' \"$TDL_BASELINE_DIR\"/'restart'/'log'"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&script).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}

#[test]
fn test_flat_script_in_baseline_mode_fills_the_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("rt.sh");
    let artifacts = generate("fast", OutputKind::Script, Mode::Baseline, &script);
    let text = &artifacts.get("").unwrap().contents;

    let prep = text.find("tdl_report_start 'prep_baseline'").unwrap();
    let build = text.find("tdl_report_start 'build_fv3'").unwrap();
    assert!(prep < build);
    assert!(text.contains("rm -rf \"$TDL_BASELINE_DIR\"/'control'\n"));
    assert!(text.contains(
        "tdl_deliver copy 'atmf024.nc' \"$TDL_BASELINE_DIR\"/'control'/'atmf024.nc'"
    ));
    assert!(!text.contains("tdl_compare bitcmp"));
}

#[test]
fn test_workflow_directory_layout() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("wf");
    let artifacts = generate("", OutputKind::Workflow, Mode::Baseline, &root);
    artifacts.write().unwrap();

    for file in [
        "workflow.xml",
        "install.sh",
        "uninstall.sh",
        "jobs/JBUILD_FV3",
        "jobs/JTEST_CONTROL",
        "jobs/JTEST_RESTART",
        "jobs/JTEST_CLEANUP",
        "jobs/JPREP_BASELINE",
        "scripts/exbuild_fv3.sh",
        "scripts/extest_control.sh",
        "scripts/exprep_baseline.sh",
        "scripts/tdl_utils.sh",
        "scripts/tdl_env.sh",
        "plan.json",
        "MANIFEST.sha256",
    ] {
        assert!(root.join(file).is_file(), "missing {file}");
    }

    let xml = read(&root, "workflow.xml");
    assert!(xml.contains("<!ENTITY ACCOUNT \"fv3-cpu\">"));
    assert!(xml.contains("<!ENTITY TASKRETRY \"3\">"));
    assert!(xml.contains("<!ENTITY RUNID \"42\">"));
    assert!(xml.contains("scheduler=\"&SCHEDULER;\""));
    assert!(xml.contains("<task name=\"build_fv3\" maxtries=\"&TASKRETRY;\">"));
    assert!(xml.contains("<command>&INSTALL;/install.sh fv3</command>"));
    assert!(xml.contains("<command>&INSTALL;/jobs/JTEST_CONTROL</command>"));
    assert!(xml.contains("<nodes>5:ppn=20:tpp=2+1:ppn=4:tpp=1</nodes>"));
    assert!(xml.contains("<native>--cpus-per-task=2</native>"));
    assert!(xml.contains("<walltime>00:20:00</walltime>"));
    assert!(xml.contains("<walltime>01:00:00</walltime>"));
    assert!(xml.contains("<taskdep task=\"prep_baseline\"/>"));
    assert!(xml.contains("<taskdep task=\"build_fv3\"/>"));
    assert!(xml.contains("<taskdep task=\"test_control\"/>"));

    let install = read(&root, "install.sh");
    assert!(install.contains("    'fv3')\n        \"$TDL_ROOT/jobs/JBUILD_FV3\"\n"));
    let uninstall = read(&root, "uninstall.sh");
    assert!(uninstall.contains("rm -f 'fv3.exe'"));

    let job = read(&root, "jobs/JTEST_CONTROL");
    assert!(job.contains("source \"$TDL_ROOT/scripts/extest_control.sh\""));
    assert!(read(&root, "scripts/tdl_env.sh").contains("export TDL_MODE='baseline'"));

    let plan: serde_json::Value = serde_json::from_str(&read(&root, "plan.json")).unwrap();
    assert_eq!(plan["run_id"], 42);
    assert_eq!(plan["mode"], "baseline");
    assert_eq!(plan["settings"]["scheduler"], "slurm");
    assert_eq!(plan["jobs"].as_array().unwrap().len(), 4);

    let manifest = read(&root, "MANIFEST.sha256");
    assert!(manifest.lines().any(|l| l.ends_with("  workflow.xml")));
    assert!(!manifest.contains("MANIFEST.sha256"));
}

#[test]
fn test_verify_workflow_has_no_baseline_task() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = generate("fast", OutputKind::Workflow, Mode::Verify, &dir.path().join("wf"));
    let xml = &artifacts.get("workflow.xml").unwrap().contents;
    assert!(!xml.contains("prep_baseline"));
    assert!(artifacts.get("jobs/JPREP_BASELINE").is_none());
    // build_fv3 has no prerequisites in verify mode.
    let build = xml.find("<task name=\"build_fv3\"").unwrap();
    let end = build + xml[build..].find("</task>").unwrap();
    assert!(!xml[build..end].contains("<dependency>"));
}

#[test]
fn test_nothing_is_written_when_rendering_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("wf");
    let mut unit = CompilationUnit::new();
    unit.parse_str(
        "test t { execute = 'x', verify = \"@[missing]\" }\nrun t\n",
        "bad.tdl",
    )
    .unwrap();
    let selected = unit.select("").unwrap();
    let resolved = deps::resolve(&unit.arena, &selected).unwrap();
    let options = Options {
        kind: OutputKind::Workflow,
        mode: Mode::Verify,
        run_id: 1,
        trace: false,
        output: out.clone(),
        input: "bad.tdl".into(),
    };
    let err = codegen::generate(&unit, &resolved, &options).unwrap_err();
    assert!(err.to_string().contains("missing"), "{err}");
    assert!(!out.exists());
}

/// The task element named `task`, up to its closing tag.
fn task_element<'a>(xml: &'a str, task: &str) -> &'a str {
    let start = xml
        .find(&format!("<task name=\"{task}\""))
        .unwrap_or_else(|| panic!("no task {task}"));
    let end = start + xml[start..].find("</task>").unwrap();
    &xml[start..end]
}

/// One section of a flat script, from its start report to its finish report.
fn section<'a>(script: &'a str, task: &str) -> &'a str {
    let start = script
        .find(&format!("tdl_report_start '{task}'"))
        .unwrap_or_else(|| panic!("no section {task}"));
    let end = start + script[start..].find("tdl_report_finish").unwrap();
    &script[start..end]
}

const SINGLE_BUILD: &str = "platform p {embed bash detect [[[ exit 0 ]]]}\n\
                            autodetect plat (/p/)\n\
                            hash h = { use plat X=1 }\n\
                            build b { target = 'b.exe', build = 'make b' }\n\
                            run b\n";

#[test]
fn test_single_build_suite_runs_only_that_build() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("rt.sh");
    let script = generate_from(SINGLE_BUILD, OutputKind::Script, Mode::Verify, &out);
    let text = &script.get("").unwrap().contents;
    assert_eq!(text.matches("tdl_report_start '").count(), 1);
    assert!(text.contains("tdl_report_start 'build_b'"));
    assert!(text.contains("make b"));

    let out = dir.path().join("wf");
    let wf = generate_from(SINGLE_BUILD, OutputKind::Workflow, Mode::Baseline, &out);
    let xml = &wf.get("workflow.xml").unwrap().contents;
    let build = task_element(xml, "build_b");
    assert_eq!(build.matches("<taskdep ").count(), 1);
    assert!(build.contains("<taskdep task=\"prep_baseline\"/>"));
    assert!(build.contains("<command>&INSTALL;/install.sh b</command>"));
    assert_eq!(xml.matches("<task name=").count(), 2);
}

#[test]
fn test_called_hash_builds_with_its_arguments() {
    let src = "hash suite(comp) { build b { target = 'x', build = \"make @[comp]\" } }\n\
               gnu = suite(comp = 'gnu')\n\
               intel = suite(comp = 'intel')\n\
               run gnu%b\n\
               run intel%b\n";
    let dir = tempfile::tempdir().unwrap();
    let script = generate_from(src, OutputKind::Script, Mode::Verify, &dir.path().join("rt.sh"));
    let text = &script.get("").unwrap().contents;
    assert!(section(text, "build_b").contains("make gnu"));
    assert!(section(text, "build_intel_b").contains("make intel"));
    assert!(!text.contains("make @"));
}

#[test]
fn test_used_hash_tests_see_the_using_hash() {
    let src = "hash common { test t { execute = \"run @[model]\", verify = 'v' } }\n\
               hash gfs { model = 'gfs'\n use common }\n\
               hash nam { model = 'nam'\n use common }\n\
               run gfs%t @ global\n\
               run nam%t @ regional\n";
    let dir = tempfile::tempdir().unwrap();
    let wf = generate_from(src, OutputKind::Workflow, Mode::Verify, &dir.path().join("wf"));
    let gfs = &wf.get("scripts/extest_t.sh").unwrap().contents;
    assert!(gfs.contains("# execute\nrun gfs\n"), "{gfs}");
    let nam = &wf.get("scripts/extest_nam_t.sh").unwrap().contents;
    assert!(nam.contains("# execute\nrun nam\n"), "{nam}");
}
