use crate::filesystems::filesystem_supported;
use crate::rootfs::StorageBackend;
use crate::userns::USERNS_HELPER;
use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

pub fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check the tools a build with the given backend and layer type needs.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_build_prereqs(
    backend: StorageBackend,
    squashfs: bool,
    rootless: bool,
) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if rootless && !command_exists(USERNS_HELPER) {
        missing.push(MissingPrereq {
            name: USERNS_HELPER,
            purpose: "running build steps in a user namespace",
            install_hint: "apt install lxc-utils | dnf install lxc | zypper install lxc",
        });
    }

    if !command_exists("unshare") {
        missing.push(MissingPrereq {
            name: "unshare",
            purpose: "private mount namespace for build steps",
            install_hint: "part of util-linux (usually pre-installed)",
        });
    }

    match backend {
        StorageBackend::Btrfs => {
            if !command_exists("btrfs") {
                missing.push(MissingPrereq {
                    name: "btrfs",
                    purpose: "subvolume snapshots for build roots",
                    install_hint: "apt install btrfs-progs | dnf install btrfs-progs",
                });
            }
            if !filesystem_supported("btrfs") {
                missing.push(MissingPrereq {
                    name: "btrfs filesystem",
                    purpose: "btrfs storage backend",
                    install_hint: "load the btrfs kernel module, or use --backend overlay",
                });
            }
        }
        StorageBackend::Overlay => {
            if !command_exists("fuse-overlayfs") {
                missing.push(MissingPrereq {
                    name: "fuse-overlayfs",
                    purpose: "overlay filesystem for build roots",
                    install_hint: "apt install fuse-overlayfs | dnf install fuse-overlayfs | zypper install fuse-overlayfs",
                });
            }
        }
    }

    if squashfs {
        for tool in ["mksquashfs", "unsquashfs"] {
            if !command_exists(tool) {
                missing.push(MissingPrereq {
                    name: tool,
                    purpose: "squashfs layers",
                    install_hint: "apt install squashfs-tools | dnf install squashfs-tools",
                });
            }
        }
    }

    missing
}

/// Tools that only some operations need.
pub fn check_optional_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    if !command_exists("veritysetup") {
        missing.push(MissingPrereq {
            name: "veritysetup",
            purpose: "offline dm-verity verification",
            install_hint: "apt install cryptsetup-bin | dnf install cryptsetup",
        });
    }
    if !command_exists("skopeo") {
        missing.push(MissingPrereq {
            name: "skopeo",
            purpose: "docker: image references",
            install_hint: "apt install skopeo | dnf install skopeo",
        });
    }
    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nLamina requires these tools to build images.");
    msg
}
