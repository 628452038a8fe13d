mod common;

use common::{unit_on, SUITE};
use tdlc::deps::{self, runnable_name};
use tdlc::{CompilationUnit, TdlError};

fn names(unit: &CompilationUnit, order: &[tdlc::Runnable]) -> Vec<String> {
    order.iter().map(|&r| runnable_name(&unit.arena, r)).collect()
}

#[test]
fn test_autodetect_picks_the_matching_platform() {
    let unit = unit_on("orion");
    let account = unit.global_setting("account").unwrap();
    assert_eq!(unit.arena.text(&account).unwrap(), "fv3-orion");

    let unit = unit_on("hera");
    let account = unit.global_setting("account").unwrap();
    assert_eq!(unit.arena.text(&account).unwrap(), "fv3-cpu");
}

#[test]
fn test_no_or_many_platforms_fail() {
    let mut unit = CompilationUnit::new().with_runner(|_: &str| false);
    let err = unit.parse_str(SUITE, "suite.tdl").unwrap_err();
    assert!(matches!(err, TdlError::PlatformDetection { .. }));
    assert!(err.to_string().contains("unknown platform"), "{err}");

    let mut unit = CompilationUnit::new().with_runner(|_: &str| true);
    let err = unit.parse_str(SUITE, "suite.tdl").unwrap_err();
    assert!(err.to_string().contains("ambiguous platform: hera, orion"), "{err}");
}

#[test]
fn test_platform_override_skips_detection() {
    let mut unit = CompilationUnit::new()
        .with_runner(|_: &str| -> bool { panic!("detection must not run") })
        .with_platform(Some("orion".into()));
    unit.parse_str(SUITE, "suite.tdl").unwrap();
    let account = unit.global_setting("account").unwrap();
    assert_eq!(unit.arena.text(&account).unwrap(), "fv3-orion");
}

#[test]
fn test_selection_and_dependency_closure() {
    let mut unit = unit_on("hera");

    let fast = unit.select("fast").unwrap();
    let resolved = deps::resolve(&unit.arena, &fast).unwrap();
    assert_eq!(names(&unit, &resolved.order), vec!["fv3", "control"]);

    let gfs = unit.select("gfs").unwrap();
    let resolved = deps::resolve(&unit.arena, &gfs).unwrap();
    assert_eq!(names(&unit, &resolved.order), vec!["fv3", "control", "restart"]);

    let all = unit.select("minus(*, gfs)").unwrap();
    assert_eq!(names(&unit, &all), vec!["cleanup"]);
}

#[test]
fn test_unknown_selection_names_fail() {
    let mut unit = unit_on("hera");
    let err = unit.select("nam").unwrap_err();
    assert!(matches!(err, TdlError::SetArithmetic { .. }));
}

#[test]
fn test_load_is_relative_to_the_including_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("common")).unwrap();
    std::fs::write(
        dir.path().join("common/defs.tdl"),
        "build lib { target = 'lib.a', build = 'make lib' }\n",
    )
    .unwrap();
    let main = dir.path().join("main.tdl");
    std::fs::write(
        &main,
        "load 'common/defs.tdl'\ntest t : lib { execute = 'x', verify = 'y' }\nrun t\n",
    )
    .unwrap();

    let mut unit = CompilationUnit::new().with_runner(|_: &str| true);
    unit.parse_file(&main).unwrap();
    let selected = unit.select("").unwrap();
    let resolved = deps::resolve(&unit.arena, &selected).unwrap();
    assert_eq!(names(&unit, &resolved.order), vec!["lib", "t"]);
}

#[test]
fn test_recursive_load_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.tdl");
    std::fs::write(&a, "load 'b.tdl'\n").unwrap();
    std::fs::write(dir.path().join("b.tdl"), "load 'a.tdl'\n").unwrap();

    let mut unit = CompilationUnit::new();
    let err = unit.parse_file(&a).unwrap_err();
    assert!(err.to_string().contains("recursive load"), "{err}");
}

#[test]
fn test_dependency_cycles_are_reported() {
    let mut unit = CompilationUnit::new();
    unit.parse_str(
        "test a : b { execute = 'x', verify = 'y' }\n\
         test b : a { execute = 'x', verify = 'y' }\n\
         run a\n",
        "cycle.tdl",
    )
    .unwrap();
    let selected = unit.select("").unwrap();
    let err = deps::resolve(&unit.arena, &selected).unwrap_err();
    assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
}
