//! Fixtures shared by the unit tests: tiny shell scripts standing in for the
//! git executables.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Write an executable `#!/bin/sh` script called `name` into `dir`.
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A fake `git` that understands `init --bare <path>` and `clone <src> <dst>`.
///
/// Every invocation appends its arguments to `<dir>/git.log`.
pub fn fake_git(dir: &Path) -> PathBuf {
    let log = dir.join("git.log");
    script(
        dir,
        "git",
        &format!(
            r#"echo "$@" >> {log}
case "$1" in
  init) mkdir -p "$3" && touch "$3/HEAD" ;;
  clone) mkdir -p "$4" && echo pushed > "$4/README" ;;
esac"#,
            log = log.display()
        ),
    )
}

/// Lines logged by [`fake_git`] so far.
pub fn git_log(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("git.log"))
        .unwrap_or_default()
        .lines()
        .map(str::to_owned)
        .collect()
}
