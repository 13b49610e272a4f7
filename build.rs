use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn main() {
    // Embed the short commit hash for `scout version` when building from git.
    if std::env::var_os("GIT_COMMIT").is_none() {
        if let Some(commit) = git(&["rev-parse", "--short", "HEAD"]) {
            println!("cargo:rustc-env=GIT_COMMIT={commit}");
        }
    }

    // Commit time as YYYYMMDDHHMMSS, reported as the `version` metric.
    if std::env::var_os("VERSION_DATE").is_none() {
        let date = git(&["log", "-1", "--format=%cd", "--date=format-local:%Y%m%d%H%M%S"]);
        if let Some(date) = date {
            println!("cargo:rustc-env=VERSION_DATE={date}");
        }
    }

    println!("cargo:rerun-if-env-changed=GIT_COMMIT");
    println!("cargo:rerun-if-env-changed=VERSION_DATE");
    println!("cargo:rerun-if-changed=build.rs");
}
