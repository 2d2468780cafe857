use std::env;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

/// First non-empty line of a helper command's stdout.
fn probe(program: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(program).args(args).output().ok()?;
    out.status
        .success()
        .then(|| String::from_utf8_lossy(&out.stdout).lines().next().unwrap_or("").trim().to_string())
        .filter(|s| !s.is_empty())
}

fn stamp() -> String {
    // Reproducible builds pin the stamp.
    let secs = env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or_else(|| SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0));
    format!("epoch:{secs}")
}

fn host() -> String {
    env::var("HOSTNAME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| probe("hostname", &[]))
        .or_else(|| probe("uname", &["-n"]))
        .unwrap_or_else(|| "unknown".into())
}

fn main() {
    for var in ["SOURCE_DATE_EPOCH", "HOSTNAME"] {
        println!("cargo:rerun-if-env-changed={var}");
    }
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rustc-env=BOTMASTER_BUILD_TIME={}", stamp());
    println!("cargo:rustc-env=BOTMASTER_BUILD_HOST={}", host());
}
