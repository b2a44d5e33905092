use super::{json_pretty, EXIT_SUCCESS};
use lamina_core::CoreError;
use lamina_runtime::ensure_allocation;
use lamina_runtime::idmap::{ALLOCATION_SIZE, SUBGID_PATH, SUBUID_PATH};
use std::path::Path;

pub struct Request<'a> {
    pub user: &'a str,
    pub uid: u32,
    pub gid: u32,
    pub subuid: &'a Path,
    pub subgid: &'a Path,
}

/// Append subordinate ranges for a user to the subuid and subgid files.
///
/// Writing the system files needs root; other paths are accepted as given.
pub fn run(req: &Request<'_>, json: bool) -> Result<u8, CoreError> {
    let system_files =
        req.subuid == Path::new(SUBUID_PATH) || req.subgid == Path::new(SUBGID_PATH);
    if system_files && !nix::unistd::geteuid().is_root() {
        return Err(CoreError::Config(
            "unpriv-setup must run as root to edit /etc/subuid and /etc/subgid".to_owned(),
        ));
    }
    if req.user.is_empty() || req.user.contains(':') {
        return Err(CoreError::Config(format!("invalid user name '{}'", req.user)));
    }

    let uid_start = ensure_allocation(req.subuid, req.user, req.uid)?;
    let gid_start = ensure_allocation(req.subgid, req.user, req.gid)?;

    if json {
        let payload = serde_json::json!({
            "user": req.user,
            "subuid_start": uid_start,
            "subgid_start": gid_start,
            "length": ALLOCATION_SIZE,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }
    report("subuid", req.subuid, req.user, uid_start);
    report("subgid", req.subgid, req.user, gid_start);
    Ok(EXIT_SUCCESS)
}

fn report(kind: &str, path: &Path, user: &str, start: Option<u64>) {
    match start {
        Some(start) => println!(
            "{kind}: added {user}:{start}:{ALLOCATION_SIZE} to {}",
            path.display()
        ),
        None => println!("{kind}: {user} already has an entry in {}", path.display()),
    }
}
