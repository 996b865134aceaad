use std::process::Command;

fn main() {
    let git_hash = run("git", &["describe", "--always", "--dirty", "--abbrev=10"]);
    println!("cargo:rustc-env=WACRM_GIT_HASH={}", git_hash);

    // reproducible builds pin the date through SOURCE_DATE_EPOCH
    let build_date = match std::env::var("SOURCE_DATE_EPOCH") {
        Ok(epoch) => run("date", &["-u", "-d", &format!("@{}", epoch), "+%Y-%m-%d"]),
        Err(_) => run("date", &["-u", "+%Y-%m-%d"]),
    };
    println!("cargo:rustc-env=WACRM_BUILD_DATE={}", build_date);

    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/");
}

/// Trimmed stdout of a command, or "unknown".
fn run(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
