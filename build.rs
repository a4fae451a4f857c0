use std::process::Command;

// This build script bakes build information into the binary, read back by src/version.rs.
fn main() -> Result<(), anyhow::Error> {
    let version = std::env::var("HANGUP_VERSION")
        .unwrap_or_else(|_| std::env::var("CARGO_PKG_VERSION").unwrap_or_default());
    let revision = git(&["rev-parse", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let status = match git(&["status", "--porcelain"]) {
        Some(out) if out.is_empty() => "Clean",
        Some(_) => "Modified",
        None => "unknown",
    };
    let rustc = rustc_version::version()?;

    println!("cargo:rustc-env=HANGUP_BUILD_VERSION={version}");
    println!("cargo:rustc-env=HANGUP_BUILD_GIT_REVISION={revision}");
    println!("cargo:rustc-env=HANGUP_BUILD_STATUS={status}");
    println!("cargo:rustc-env=HANGUP_BUILD_RUSTC_VERSION={rustc}");

    println!("cargo:rerun-if-env-changed=HANGUP_VERSION");
    println!("cargo:rerun-if-changed=.git/HEAD");
    Ok(())
}

fn git(args: &[&str]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    String::from_utf8(out.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}
