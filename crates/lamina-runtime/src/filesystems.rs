use std::fs;
use tracing::debug;

const PROC_FILESYSTEMS: &str = "/proc/filesystems";

/// Whether `name` is listed in `/proc/filesystems`-formatted `content`.
pub fn filesystem_supported_in(content: &str, name: &str) -> bool {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().last())
        .any(|fs| fs == name)
}

pub fn filesystem_supported(name: &str) -> bool {
    match fs::read_to_string(PROC_FILESYSTEMS) {
        Ok(content) => filesystem_supported_in(&content, name),
        Err(e) => {
            debug!("cannot read {PROC_FILESYSTEMS}: {e}");
            false
        }
    }
}
