use super::{EXIT_ENVIRONMENT, EXIT_SUCCESS};
use lamina_core::{BuildOptions, CoreError, StoreLock};
use lamina_runtime::{
    check_build_prereqs, check_optional_prereqs, filesystem_supported, format_missing,
    resolve_current, IdMapError, StorageBackend,
};
use std::path::Path;

pub fn run(stacker_dir: &Path, roots_dir: &Path, json_output: bool) -> Result<u8, CoreError> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    let rootless = !nix::unistd::geteuid().is_root();
    let probe_dir = roots_dir
        .ancestors()
        .find(|p| p.exists())
        .unwrap_or_else(|| Path::new("."));
    let backend = StorageBackend::detect(probe_dir);
    checks.push(Check::info(
        "backend",
        &format!("{} resolves to the {backend} backend", roots_dir.display()),
    ));

    check_tools(backend, rootless, &mut checks, &mut all_pass);
    check_filesystems(&mut checks);
    if rootless {
        check_allocation(&mut checks, &mut all_pass);
    } else {
        checks.push(Check::info(
            "subordinate_ids",
            "Running as root, build steps run without a user namespace",
        ));
    }
    check_lock(stacker_dir, &mut checks);

    print_results(&checks, all_pass, json_output)
}

fn check_tools(backend: StorageBackend, rootless: bool, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = check_build_prereqs(backend, true, rootless);
    if missing.is_empty() {
        checks.push(Check::pass("build_prereqs", "Build prerequisites satisfied"));
    } else {
        *all_pass = false;
        checks.push(Check::fail("build_prereqs", &format_missing(&missing)));
    }

    let optional = check_optional_prereqs();
    if optional.is_empty() {
        checks.push(Check::pass("optional_prereqs", "Optional tools available"));
    } else {
        let names: Vec<_> = optional.iter().map(|m| m.name).collect();
        checks.push(Check::warn(
            "optional_prereqs",
            &format!("Optional tools missing: {}", names.join(", ")),
        ));
    }
}

fn check_filesystems(checks: &mut Vec<Check>) {
    for fs in ["btrfs", "overlay"] {
        let name = format!("filesystem_{fs}");
        if filesystem_supported(fs) {
            checks.push(Check::pass(&name, &format!("{fs} listed in /proc/filesystems")));
        } else {
            checks.push(Check::warn(&name, &format!("{fs} not listed in /proc/filesystems")));
        }
    }
}

fn check_allocation(checks: &mut Vec<Check>, all_pass: &mut bool) {
    match resolve_current() {
        Ok(map) => checks.push(Check::pass(
            "subordinate_ids",
            &format!("Subordinate id map: {}", map.helper_args().join(" ")),
        )),
        Err(e @ IdMapError::NoSubordinateAllocation(_)) => {
            *all_pass = false;
            checks.push(Check::fail(
                "subordinate_ids",
                &format!("{e} (run 'sudo lamina unpriv-setup --user <name> --uid <uid> --gid <gid>')"),
            ));
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("subordinate_ids", &e.to_string()));
        }
    }
}

fn check_lock(stacker_dir: &Path, checks: &mut Vec<Check>) {
    if !stacker_dir.exists() {
        checks.push(Check::info(
            "state_lock",
            "Build state not initialized (will be created on first build)",
        ));
        return;
    }
    let options = BuildOptions {
        stacker_dir: stacker_dir.to_path_buf(),
        ..BuildOptions::default()
    };
    match StoreLock::try_acquire(&options.lock_path()) {
        Ok(Some(_)) => checks.push(Check::pass("state_lock", "Build state lock is free")),
        Ok(None) => checks.push(Check::info(
            "state_lock",
            "Build state lock is held by another process",
        )),
        Err(e) => checks.push(Check::warn(
            "state_lock",
            &format!("Cannot check build state lock: {e}"),
        )),
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, CoreError> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        println!("Lamina environment check\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All required checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass {
        EXIT_SUCCESS
    } else {
        EXIT_ENVIRONMENT
    })
}

struct Check {
    name: String,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &str, status: &'static str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}
