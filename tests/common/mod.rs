// Shared fixture: a small regression suite for two machines.
#![allow(dead_code)]

use tdlc::CompilationUnit;

pub const SUITE: &str = r#"
platform hera {
    embed bash detect [[[ test "$(hostname -s)" = hera ]]]
    cores_per_node = 40
    cpus_per_core = 2
    project = 'fv3-cpu'
}
platform orion {
    embed bash detect [[[ test "$(hostname -s)" = orion ]]]
    cores_per_node = 80
    project = 'fv3-orion'
}
autodetect plat (/ hera, orion /)

account = plat%project
task_retries = 3
walltime = 20

hash compiler(name = 'intel') {
    CC = "@[name]-cc"
}

build fv3 {
    flags = compiler(name = 'gnu')
    target = 'fv3.exe'
    build = "make CC=@[flags%CC] @[target]"
}

spawn fv3_ranks {
    { 'fv3.exe', ranks = 100, threads = 2 }
    { 'io.exe', '--fast', ranks = 4 }
}

filters inputs {
    'input.nml' .atparse. 'input.nml.IN'
    'fix' .link. '/shared/fix'
}

criteria outputs {
    'atmf024.nc' .bitcmp. 'atmf024.nc'
    'log' .metacmp. 'log'
}

test control : fv3 {
    use plat
    input = inputs
    execute = fv3_ranks
    verify = outputs
    make_baseline = outputs
}

test restart : control {
    use plat
    execute = fv3_ranks
    output = outputs
    walltime = '01:00:00'
}

task cleanup {
    embed bash execute { DIR = 'tmp' } [[[ rm -rf "$DIR" ]]]
}

run control @ gfs, fast
run restart @ gfs
run cleanup @ maintenance
"#;

/// A unit parsed from `SUITE` as if running on `host`.
pub fn unit_on(host: &'static str) -> CompilationUnit {
    let mut unit = CompilationUnit::new().with_runner(move |script: &str| script.contains(host));
    unit.parse_str(SUITE, "suite.tdl").unwrap();
    unit
}
