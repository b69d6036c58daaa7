use std::process::Command;

/// `git describe` for the workspace, or "unknown" outside a checkout.
fn describe() -> String {
    let out = match Command::new("git")
        .args(["describe", "--always", "--dirty", "--abbrev=10"])
        .output()
    {
        Ok(out) if out.status.success() => out,
        _ => return "unknown".to_string(),
    };
    let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if text.is_empty() {
        "unknown".to_string()
    } else {
        text
    }
}

fn main() {
    // Packagers building from a tarball can pin the revision.
    let rev = std::env::var("AGENTOS_GIT_SHA")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(describe);
    println!("cargo:rustc-env=AGENTOS_GIT_SHA={rev}");
    println!("cargo:rerun-if-env-changed=AGENTOS_GIT_SHA");
    for path in ["../../.git/HEAD", "../../.git/index", "../../.git/refs/"] {
        println!("cargo:rerun-if-changed={path}");
    }
}
