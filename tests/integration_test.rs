//! End-to-end tests: drive the grokmirror binary against real git
//! repositories in temporary directories, origin and replica both local.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

fn grok(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_grokmirror"))
        .args(args)
        .output()
        .expect("failed to run grokmirror")
}

fn grok_ok(args: &[&str]) {
    let out = grok(args);
    assert!(
        out.status.success(),
        "grokmirror {:?} failed:\nstdout: {}\nstderr: {}",
        args,
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
}

/// Run git in a directory and return trimmed stdout.
fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .current_dir(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@example.org")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@example.org")
        .output()
        .expect("failed to execute git");
    assert!(
        output.status.success(),
        "git {:?} failed in {}: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A work tree with one commit, used to seed bare mirrors.
fn make_worktree(base: &Path) -> PathBuf {
    let work = base.join("work");
    std::fs::create_dir_all(&work).unwrap();
    git(&work, &["init", "-q", "-b", "main"]);
    std::fs::write(work.join("README"), "hello\n").unwrap();
    git(&work, &["add", "README"]);
    git(&work, &["commit", "-q", "-m", "initial"]);
    work
}

fn mirror_clone(work: &Path, dest: &Path) {
    git(
        work.parent().unwrap(),
        &["clone", "-q", "--mirror", work.to_str().unwrap(), dest.to_str().unwrap()],
    );
}

fn write_config(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
}

fn origin_config(dir: &Path, toplevel: &Path) -> PathBuf {
    let path = dir.join("origin.conf");
    write_config(&path, &format!("core:\n  toplevel: {}\n", toplevel.display()));
    path
}

fn replica_config(dir: &Path, toplevel: &Path, origin_top: &Path) -> PathBuf {
    let path = dir.join("replica.conf");
    write_config(
        &path,
        &format!(
            "core:\n  toplevel: {}\nremote:\n  site: {}\n  manifest: file://{}/manifest.js.gz\npull:\n  pull_threads: 2\n",
            toplevel.display(),
            origin_top.display(),
            origin_top.display()
        ),
    );
    path
}

fn read_fingerprint(repo: &Path) -> String {
    std::fs::read_to_string(repo.join("grokmirror.fingerprint"))
        .unwrap_or_default()
        .trim()
        .to_string()
}

fn count_objects(repo: &Path) -> std::collections::HashMap<String, String> {
    git(repo, &["count-objects", "-v"])
        .lines()
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.trim().to_string()))
        .collect()
}

#[test]
fn test_cold_clone_and_delta_fetch() {
    let tmp = TempDir::new().unwrap();
    let origin_top = tmp.path().join("origin");
    let replica_top = tmp.path().join("replica");
    std::fs::create_dir_all(&origin_top).unwrap();
    std::fs::create_dir_all(&replica_top).unwrap();

    let work = make_worktree(tmp.path());
    mirror_clone(&work, &origin_top.join("a.git"));

    let oconf = origin_config(tmp.path(), &origin_top);
    let rconf = replica_config(tmp.path(), &replica_top, &origin_top);

    grok_ok(&["manifest", "-c", oconf.to_str().unwrap()]);
    assert!(origin_top.join("manifest.js.gz").exists());

    // Cold clone.
    grok_ok(&["pull", "-c", rconf.to_str().unwrap()]);
    let mirrored = replica_top.join("a.git");
    assert!(mirrored.join("HEAD").exists());
    assert_eq!(
        std::fs::read_to_string(mirrored.join("HEAD")).unwrap().trim(),
        "ref: refs/heads/main"
    );
    assert_eq!(
        git(&mirrored, &["rev-parse", "HEAD"]),
        git(&origin_top.join("a.git"), &["rev-parse", "HEAD"])
    );
    let origin_fp = read_fingerprint(&origin_top.join("a.git"));
    assert!(!origin_fp.is_empty());
    assert_eq!(read_fingerprint(&mirrored), origin_fp);
    assert!(replica_top.join("manifest.js.gz").exists());

    // Nothing changed: a second pull is a no-op and must succeed.
    grok_ok(&["pull", "-c", rconf.to_str().unwrap()]);

    // Advance the origin and verify the delta fetch converges.
    std::fs::write(work.join("second"), "more\n").unwrap();
    git(&work, &["add", "second"]);
    git(&work, &["commit", "-q", "-m", "second"]);
    git(
        &work,
        &["push", "-q", origin_top.join("a.git").to_str().unwrap(), "main"],
    );
    grok_ok(&["manifest", "-c", oconf.to_str().unwrap()]);
    let new_fp = read_fingerprint(&origin_top.join("a.git"));
    assert_ne!(new_fp, origin_fp);

    grok_ok(&["pull", "-n", "-c", rconf.to_str().unwrap()]);
    assert_eq!(read_fingerprint(&mirrored), new_fp);
    assert_eq!(
        git(&mirrored, &["rev-parse", "HEAD"]),
        git(&origin_top.join("a.git"), &["rev-parse", "HEAD"])
    );
}

#[test]
fn test_reclone_mark_forces_fresh_clone() {
    let tmp = TempDir::new().unwrap();
    let origin_top = tmp.path().join("origin");
    let replica_top = tmp.path().join("replica");
    std::fs::create_dir_all(&origin_top).unwrap();
    std::fs::create_dir_all(&replica_top).unwrap();

    let work = make_worktree(tmp.path());
    mirror_clone(&work, &origin_top.join("b.git"));

    let oconf = origin_config(tmp.path(), &origin_top);
    let rconf = replica_config(tmp.path(), &replica_top, &origin_top);
    grok_ok(&["manifest", "-c", oconf.to_str().unwrap()]);
    grok_ok(&["pull", "-c", rconf.to_str().unwrap()]);

    let mirrored = replica_top.join("b.git");
    let mark = mirrored.join("grokmirror.reclone");
    std::fs::write(&mark, "Requested by grok-fsck due to error: fatal: bad tree\n").unwrap();

    grok_ok(&["pull", "-n", "-c", rconf.to_str().unwrap()]);
    assert!(!mark.exists(), "reclone mark should be gone after reclone");
    assert_eq!(
        git(&mirrored, &["rev-parse", "HEAD"]),
        git(&origin_top.join("b.git"), &["rev-parse", "HEAD"])
    );
}

#[test]
fn test_purge_quorum_refusal_and_force() {
    let tmp = TempDir::new().unwrap();
    let origin_top = tmp.path().join("origin");
    let replica_top = tmp.path().join("replica");
    std::fs::create_dir_all(&origin_top).unwrap();
    std::fs::create_dir_all(&replica_top).unwrap();

    let work = make_worktree(tmp.path());
    let names: Vec<String> = (1..=8).map(|i| format!("b{}.git", i)).collect();
    for name in &names {
        mirror_clone(&work, &origin_top.join(name));
    }

    let oconf = origin_config(tmp.path(), &origin_top);
    let rconf = replica_config(tmp.path(), &replica_top, &origin_top);
    grok_ok(&["manifest", "-c", oconf.to_str().unwrap()]);
    grok_ok(&["pull", "-c", rconf.to_str().unwrap()]);
    for name in &names {
        assert!(replica_top.join(name).exists());
    }

    // Six of eight disappear from the origin (75% > the 5% quorum).
    for name in &names[..6] {
        std::fs::remove_dir_all(origin_top.join(name)).unwrap();
    }
    grok_ok(&["manifest", "-c", oconf.to_str().unwrap()]);

    // Purge is refused: everything still on disk.
    grok_ok(&["pull", "-n", "-p", "-c", rconf.to_str().unwrap()]);
    for name in &names {
        assert!(replica_top.join(name).exists(), "{} was purged past quorum", name);
    }

    // Forcing removes the six.
    grok_ok(&["pull", "-n", "-p", "--force-purge", "-c", rconf.to_str().unwrap()]);
    for name in &names[..6] {
        assert!(!replica_top.join(name).exists(), "{} should be purged", name);
    }
    for name in &names[6..] {
        assert!(replica_top.join(name).exists());
    }
}

#[test]
fn test_fork_consolidation_into_objstore() {
    let tmp = TempDir::new().unwrap();
    let toplevel = tmp.path().join("top");
    std::fs::create_dir_all(&toplevel).unwrap();

    // p and q share a root commit; p has one extra.
    let work = make_worktree(tmp.path());
    mirror_clone(&work, &toplevel.join("p.git"));
    mirror_clone(&work, &toplevel.join("q.git"));
    std::fs::write(work.join("fork"), "divergence\n").unwrap();
    git(&work, &["add", "fork"]);
    git(&work, &["commit", "-q", "-m", "fork-only commit"]);
    git(
        &work,
        &["push", "-q", toplevel.join("p.git").to_str().unwrap(), "main"],
    );

    let conf = origin_config(tmp.path(), &toplevel);
    grok_ok(&["manifest", "-c", conf.to_str().unwrap()]);
    grok_ok(&["fsck", "-f", "-c", conf.to_str().unwrap()]);

    // One objstore repo appeared.
    let objstore_dir = toplevel.join("objstore");
    let stores: Vec<PathBuf> = std::fs::read_dir(&objstore_dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "git").unwrap_or(false))
        .collect();
    assert_eq!(stores.len(), 1, "expected one objstore repo, got {:?}", stores);
    let obstrepo = &stores[0];
    assert!(obstrepo.join("grokmirror.objstore").exists());

    // Both members point their alternates at it.
    for name in ["p.git", "q.git"] {
        let altfile = toplevel.join(name).join("objects/info/alternates");
        let alt = std::fs::read_to_string(&altfile).unwrap();
        assert_eq!(
            std::fs::canonicalize(alt.trim()).unwrap(),
            obstrepo.canonicalize().unwrap().join("objects")
        );
    }

    // Virtual refs exist for two distinct members.
    let refs = git(obstrepo, &["for-each-ref", "--format=%(refname)", "refs/virtual"]);
    let mut namespaces: Vec<&str> = refs
        .lines()
        .filter_map(|r| r.strip_prefix("refs/virtual/"))
        .filter_map(|r| r.split('/').next())
        .collect();
    namespaces.sort_unstable();
    namespaces.dedup();
    assert_eq!(namespaces.len(), 2, "virtual refs: {}", refs);
    assert!(refs.lines().any(|r| r.ends_with("/heads/main")));

    // Members hold no objects of their own after the repack.
    for name in ["p.git", "q.git"] {
        let info = count_objects(&toplevel.join(name));
        assert_eq!(info.get("count").map(String::as_str), Some("0"), "{}: {:?}", name, info);
        assert_eq!(info.get("in-pack").map(String::as_str), Some("0"), "{}: {:?}", name, info);
    }

    // The manifest now records the fork family.
    let manifest_raw = std::fs::read(toplevel.join("manifest.js.gz")).unwrap();
    let mut decoder = flate2::read::GzDecoder::new(&manifest_raw[..]);
    let mut body = String::new();
    std::io::Read::read_to_string(&mut decoder, &mut body).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
    let forkgroup_p = parsed["/p.git"]["forkgroup"].as_str().unwrap();
    let forkgroup_q = parsed["/q.git"]["forkgroup"].as_str().unwrap();
    assert_eq!(forkgroup_p, forkgroup_q);
    assert_eq!(
        obstrepo.file_stem().unwrap().to_string_lossy(),
        forkgroup_p
    );

    // Fingerprints survive the consolidation (refs unchanged).
    assert!(!read_fingerprint(&toplevel.join("p.git")).is_empty());
}

#[test]
fn test_dumb_pull_updates_unmanaged_repo() {
    let tmp = TempDir::new().unwrap();
    let work = make_worktree(tmp.path());
    let upstream = tmp.path().join("upstream.git");
    mirror_clone(&work, &upstream);

    // A mirror with a configured remote, outside any manifest.
    let mirror = tmp.path().join("mirror.git");
    git(
        tmp.path(),
        &["clone", "-q", "--mirror", upstream.to_str().unwrap(), mirror.to_str().unwrap()],
    );

    std::fs::write(work.join("extra"), "x\n").unwrap();
    git(&work, &["add", "extra"]);
    git(&work, &["commit", "-q", "-m", "extra"]);
    git(&work, &["push", "-q", upstream.to_str().unwrap(), "main"]);

    grok_ok(&["dumb-pull", mirror.to_str().unwrap()]);
    assert_eq!(
        git(&mirror, &["rev-parse", "HEAD"]),
        git(&upstream, &["rev-parse", "HEAD"])
    );
}
