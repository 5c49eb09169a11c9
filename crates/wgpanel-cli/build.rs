use std::process::Command;

fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|o| o.status.success())?;
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn main() {
    let pkg = std::env::var("CARGO_PKG_VERSION").unwrap_or_default();
    let version = match git_describe() {
        Some(rev) => format!("{pkg} ({rev})"),
        None => pkg,
    };
    println!("cargo:rustc-env=GIT_VERSION={version}");

    println!("cargo::rustc-check-cfg=cfg(distribute)");
    if std::env::var("PROFILE").is_ok_and(|p| p == "distribute") {
        println!("cargo:rustc-cfg=distribute");
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
}
