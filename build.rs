use std::process::Command;

fn capture(program: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(program).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8(out.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    let git_sha = capture("git", &["rev-parse", "--short", "HEAD"]);
    // Reproducible builds pin the clock through SOURCE_DATE_EPOCH.
    let built_at = match std::env::var("SOURCE_DATE_EPOCH") {
        Ok(epoch) => capture("date", &["-u", "-d", &format!("@{epoch}"), "+%Y-%m-%dT%H:%M:%SZ"]),
        Err(_) => capture("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]),
    };

    if let Some(sha) = git_sha {
        println!("cargo:rustc-env=BUILD_GIT_SHA={sha}");
    }
    if let Some(ts) = built_at {
        println!("cargo:rustc-env=BUILD_TIMESTAMP={ts}");
    }
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
}
