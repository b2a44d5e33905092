use crate::userns::{Executor, RunOptions};
use crate::RuntimeError;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

/// File name of the generated step script inside the imports directory.
pub const RUN_SCRIPT: &str = ".lamina-run.sh";

fn shell_quote(s: &str) -> String {
    // Single-quoting in POSIX shell: replace ' with '\'' then wrap in '
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Shell-escape a Path for safe interpolation.
fn shell_quote_path(p: &Path) -> String {
    shell_quote(&p.to_string_lossy())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    /// Absolute path inside the rootfs.
    pub target: PathBuf,
    pub read_only: bool,
}

/// fuse-overlayfs directories mounted at the sandbox root.
#[derive(Debug, Clone)]
pub struct OverlayDirs {
    pub lower: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory the steps are chrooted into.
    pub mount_point: PathBuf,
    pub overlay: Option<OverlayDirs>,
    /// Host directory holding the step script, bound at `/stacker`.
    pub staging: PathBuf,
    pub imports: Vec<BindMount>,
    pub binds: Vec<BindMount>,
    pub env: BTreeMap<String, String>,
}

fn inside(mount_point: &Path, target: &Path) -> PathBuf {
    mount_point.join(target.strip_prefix("/").unwrap_or(target))
}

fn bind_lines(script: &mut String, mount_point: &Path, bm: &BindMount) {
    let qt = shell_quote_path(&inside(mount_point, &bm.target));
    let qs = shell_quote_path(&bm.source);
    let _ = writeln!(script, "[ -e {qt} ] || mkdir -p {qt}");
    let _ = writeln!(script, "mount --bind {qs} {qt}");
    if bm.read_only {
        let _ = writeln!(script, "mount -o remount,ro,bind {qt} 2>/dev/null || true");
    }
}

/// Shell script that assembles the build root and runs the step script.
/// It expects a private mount namespace.
pub fn build_sandbox_script(config: &SandboxConfig) -> String {
    let m = &config.mount_point;
    let qm = shell_quote_path(m);
    let mut script = String::from("set -e\n");

    let _ = writeln!(script, "cleanup() {{");
    if config.overlay.is_some() {
        let _ = writeln!(
            script,
            "  fusermount3 -u {qm} 2>/dev/null || fusermount -u {qm} 2>/dev/null || true"
        );
    } else {
        let _ = writeln!(script, "  :");
    }
    let _ = writeln!(script, "}}");
    let _ = writeln!(script, "trap cleanup EXIT");

    if let Some(ov) = &config.overlay {
        let opts = format!(
            "lowerdir={},upperdir={},workdir={}",
            ov.lower.display(),
            ov.upper.display(),
            ov.work.display()
        );
        let _ = writeln!(script, "fuse-overlayfs -o {} {qm}", shell_quote(&opts));
    }

    let qstacker = shell_quote_path(&m.join("stacker"));
    let _ = writeln!(script, "mkdir -p {qstacker}");
    let _ = writeln!(
        script,
        "mount --bind {} {qstacker}",
        shell_quote_path(&config.staging)
    );
    for bm in &config.imports {
        bind_lines(&mut script, m, bm);
    }
    let _ = writeln!(script, "mount -o remount,ro,bind {qstacker} 2>/dev/null || true");
    for bm in &config.binds {
        bind_lines(&mut script, m, bm);
    }

    let _ = writeln!(
        script,
        "[ -d {qm}/proc ] && mount -t proc proc {qm}/proc 2>/dev/null || true"
    );
    let _ = writeln!(
        script,
        "[ -d {qm}/dev ] && mount --rbind /dev {qm}/dev 2>/dev/null || true"
    );
    let _ = writeln!(script, "[ -f /etc/resolv.conf ] && [ -d {qm}/etc ] && touch {qm}/etc/resolv.conf 2>/dev/null && mount --bind /etc/resolv.conf {qm}/etc/resolv.conf 2>/dev/null || true");

    let mut env = String::new();
    for (key, val) in &config.env {
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            continue;
        }
        let _ = write!(env, " {}", shell_quote(&format!("{key}={val}")));
    }

    let _ = writeln!(script, "CHROOT=$(command -v chroot)");
    let _ = writeln!(script, "set +e");
    let _ = writeln!(
        script,
        "env -i{env} \"$CHROOT\" {qm} /stacker/{RUN_SCRIPT}"
    );
    let _ = writeln!(script, "rc=$?");
    let _ = writeln!(script, "exit $rc");
    script
}

/// Run the step script of `config` in a private mount namespace through
/// `executor`.
pub fn run_in_sandbox(
    executor: &Executor,
    config: &SandboxConfig,
    opts: &RunOptions<'_>,
) -> Result<(), RuntimeError> {
    let script = build_sandbox_script(config);
    info!("running steps in {}", config.mount_point.display());
    let args = [
        "--mount",
        "--propagation",
        "private",
        "--fork",
        "/bin/sh",
        "-c",
        script.as_str(),
    ];
    executor.run("unshare", &args, opts)
}
