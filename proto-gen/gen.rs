//! Regenerates, or checks, the committed allocation service bindings in
//! `src/generated`. Needs `proto-gen` on the `PATH`, installed with
//! `cargo install proto-gen --version 0.2.0`.

use std::process::Command;

const VERSION: &str = "0.2.0";
const OUTPUT: &str = "src/generated";
const PROTOS: &[(&str, &[&str])] = &[("proto", &["allocation/allocation"])];

fn check_version() -> Result<(), String> {
    let output = Command::new("proto-gen")
        .arg("-V")
        .output()
        .map_err(|error| format!("proto-gen is not installed: {error}"))?;
    let version = String::from_utf8_lossy(&output.stdout);

    match version.trim().strip_prefix("proto-gen ") {
        Some(found) if found == VERSION => Ok(()),
        Some(found) => Err(format!("found proto-gen {found}, expected {VERSION}")),
        None => Err(format!("unrecognised proto-gen version output '{version}'")),
    }
}

fn run(mode: &str) -> Result<(), String> {
    let mut cmd = Command::new("proto-gen");
    cmd.args([
        "--format",
        "--build-server",
        "--build-client",
        "--generate-transport",
        mode,
        "-o",
        OUTPUT,
    ]);

    for (dir, files) in PROTOS {
        cmd.args(["-d", dir]);
        for file in *files {
            cmd.arg("-f").arg(format!("{dir}/{file}.proto"));
        }
    }

    let status = cmd
        .status()
        .map_err(|error| format!("failed to run proto-gen: {error}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("proto-gen {mode} exited with {status}"))
    }
}

fn main() {
    let mode = std::env::args().nth(1).unwrap_or_else(|| "generate".into());
    if !matches!(mode.as_str(), "generate" | "validate") {
        eprintln!("unknown mode '{mode}', expected 'generate' or 'validate'");
        std::process::exit(2);
    }

    if let Err(error) = check_version().and_then(|_| run(&mode)) {
        eprintln!("{error}");
        std::process::exit(1);
    }
}
