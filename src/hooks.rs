//! Post-pass hook dispatch. Hook failures are logged and never abort the
//! pass that triggered them.

use std::path::Path;
use std::process::{Command, Stdio};

use std::io::Write;

/// Split a configured hook line into argv. Quoting is not supported; hooks
/// needing shell features should be wrapper scripts.
fn hook_argv(line: &str) -> Option<Vec<String>> {
    let args: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if args.is_empty() {
        return None;
    }
    let script = Path::new(&args[0]);
    if !script.is_file() {
        tracing::warn!("hook not found: {}", line);
        return None;
    }
    Some(args)
}

fn run_hook(argv: &[String], extra_arg: Option<&str>, stdin: Option<&str>) {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    if let Some(arg) = extra_arg {
        cmd.arg(arg);
    }
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    tracing::debug!("running hook: {}", argv.join(" "));
    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!("hook {} failed to start: {}", argv[0], e);
            return;
        }
    };

    let mut child = child;
    if let (Some(input), Some(mut handle)) = (stdin, child.stdin.take()) {
        let _ = handle.write_all(input.as_bytes());
    }

    match child.wait_with_output() {
        Ok(out) => {
            let stdout = String::from_utf8_lossy(&out.stdout);
            let stderr = String::from_utf8_lossy(&out.stderr);
            if !stderr.trim().is_empty() {
                tracing::warn!("hook stderr: {}", stderr.trim());
            }
            if !stdout.trim().is_empty() {
                tracing::info!("hook stdout: {}", stdout.trim());
            }
        }
        Err(e) => tracing::warn!("hook {} failed: {}", argv[0], e),
    }
}

/// Fires once per changed repository, with the full path as the last arg.
pub fn run_post_update_hooks(hooks: &[String], fullpath: &Path) {
    for line in hooks {
        if let Some(argv) = hook_argv(line) {
            tracing::info!("     hook: {}", line);
            run_hook(&argv, Some(&fullpath.to_string_lossy()), None);
        }
    }
}

/// Fires once per pass when any new clone succeeded; the clone list goes to
/// stdin, one path per line.
pub fn run_post_clone_complete_hooks(hooks: &[String], cloned: &[String]) {
    if cloned.is_empty() {
        return;
    }
    let stdin = format!("{}\n", cloned.join("\n"));
    for line in hooks {
        if let Some(argv) = hook_argv(line) {
            tracing::info!(" inithook: {}", line);
            run_hook(&argv, None, Some(&stdin));
        }
    }
}

/// Fires at the end of every pass, work or no work.
pub fn run_post_work_complete_hooks(hooks: &[String]) {
    for line in hooks {
        if let Some(argv) = hook_argv(line) {
            tracing::info!(" workhook: {}", line);
            run_hook(&argv, None, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_missing_hook_does_not_panic() {
        run_post_update_hooks(
            &["/no/such/hook.sh".to_string()],
            Path::new("/tmp/x.git"),
        );
        run_post_work_complete_hooks(&["/no/such/hook.sh".to_string()]);
    }

    #[test]
    fn test_post_update_hook_receives_path() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("hook.sh");
        let outfile = tmp.path().join("out");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$1\" > {}\n", outfile.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        run_post_update_hooks(
            &[script.to_string_lossy().into_owned()],
            Path::new("/srv/mirror/a.git"),
        );
        let recorded = std::fs::read_to_string(&outfile).unwrap();
        assert_eq!(recorded.trim(), "/srv/mirror/a.git");
    }
}
