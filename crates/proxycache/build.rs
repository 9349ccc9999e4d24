use std::process::{Command, Stdio};

fn git_describe() -> Option<String> {
    let cmd = Command::new("git")
        .args(["describe", "--always", "--dirty=-modified"])
        .stderr(Stdio::inherit())
        .output()
        .ok()?;

    if !cmd.status.success() {
        println!("cargo:warning=`git describe' failed: {}", cmd.status);
        return None;
    }

    Some(String::from_utf8_lossy(&cmd.stdout).trim().to_owned())
}

fn main() {
    let version = git_describe().unwrap_or_else(|| "unknown".to_owned());

    println!("cargo:rustc-env=PROXYCACHE_GIT_VERSION={version}");
    println!("cargo:rerun-if-env-changed=PROXYCACHE_GIT_VERSION");
}
