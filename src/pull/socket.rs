//! Push-notification listener: a Unix stream socket accepting
//! newline-terminated repository paths. Paths are debounced and handed to
//! the controller, which fetches them ahead of manifest-driven work.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam_channel::Sender;

const DEBOUNCE: Duration = Duration::from_secs(5);

pub struct SocketListener {
    handle: thread::JoinHandle<()>,
    sockpath: PathBuf,
}

impl SocketListener {
    /// Bind and start accepting. The listener wakes up regularly to check
    /// the shutdown flag and removes its socket file on the way out.
    pub fn spawn(
        sockpath: PathBuf,
        tx: Sender<String>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<SocketListener> {
        if sockpath.exists() {
            let ftype = std::fs::symlink_metadata(&sockpath)?.file_type();
            if ftype.is_socket() {
                std::fs::remove_file(&sockpath)?;
            } else {
                bail!(
                    "file exists but is not a socket: {}",
                    sockpath.display()
                );
            }
        }
        if let Some(parent) = sockpath.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&sockpath)
            .with_context(|| format!("Failed to bind socket {}", sockpath.display()))?;
        std::fs::set_permissions(&sockpath, std::fs::Permissions::from_mode(0o660))?;
        listener.set_nonblocking(true)?;
        tracing::info!(" listener: listening on socket {}", sockpath.display());

        let debounce: Arc<Mutex<HashMap<String, Instant>>> = Arc::new(Mutex::new(HashMap::new()));
        let accept_path = sockpath.clone();
        let handle = thread::spawn(move || {
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _)) => {
                        let tx = tx.clone();
                        let debounce = Arc::clone(&debounce);
                        thread::spawn(move || handle_connection(stream, tx, debounce));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(250));
                    }
                    Err(e) => {
                        tracing::warn!("socket accept error: {}", e);
                        thread::sleep(Duration::from_millis(250));
                    }
                }
            }
            let _ = std::fs::remove_file(&accept_path);
            tracing::debug!("listener stopped");
        });

        Ok(SocketListener { handle, sockpath })
    }

    pub fn join(self) {
        let _ = self.handle.join();
        let _ = std::fs::remove_file(&self.sockpath);
    }
}

fn handle_connection(
    stream: std::os::unix::net::UnixStream,
    tx: Sender<String>,
    debounce: Arc<Mutex<HashMap<String, Instant>>>,
) {
    // Connections inherit the listener's non-blocking flag on some
    // platforms; reads here should block.
    let _ = stream.set_nonblocking(false);
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            // Malformed frame: close the connection.
            Err(_) => return,
        };
        let gitdir = line.trim();
        if gitdir.is_empty() {
            return;
        }
        let gitdir = crate::manifest::normalize_key(gitdir);

        let now = Instant::now();
        {
            let mut seen = debounce.lock().unwrap();
            if let Some(last) = seen.get(&gitdir) {
                if now.duration_since(*last) < DEBOUNCE {
                    tracing::debug!("debounced: {}", gitdir);
                    continue;
                }
            }
            seen.insert(gitdir.clone(), now);
            seen.retain(|_, t| now.duration_since(*t) < DEBOUNCE * 4);
        }

        tracing::info!(" listener: {}", gitdir);
        if tx.send(gitdir).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use tempfile::TempDir;

    #[test]
    fn test_debounce_coalesces_duplicates() {
        let tmp = TempDir::new().unwrap();
        let sockpath = tmp.path().join("pull.sock");
        let (tx, rx) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        let listener = SocketListener::spawn(sockpath.clone(), tx, Arc::clone(&shutdown)).unwrap();
        assert!(sockpath.exists());

        let mut stream = UnixStream::connect(&sockpath).unwrap();
        for _ in 0..5 {
            stream.write_all(b"/x.git\n").unwrap();
        }
        stream.write_all(b"/y.git\n").unwrap();
        drop(stream);

        // One /x.git despite five sends, plus /y.git.
        let mut got = Vec::new();
        for _ in 0..2 {
            got.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        got.sort();
        assert_eq!(got, vec!["/x.git".to_string(), "/y.git".to_string()]);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        shutdown.store(true, Ordering::Relaxed);
        listener.join();
        assert!(!sockpath.exists());
    }

    #[test]
    fn test_refuses_non_socket_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("not-a-socket");
        std::fs::write(&path, b"hi").unwrap();
        let (tx, _rx) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        assert!(SocketListener::spawn(path, tx, shutdown).is_err());
    }
}
