//! Problem accumulation and mail delivery. Everything worth an operator's
//! attention during a pass lands here; if anything accumulated and
//! `fsck.report_to` is set, one message goes out through a sendmail-style
//! transport at the end.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};

use crate::config::FsckConfig;

#[derive(Debug, Default)]
pub struct Report {
    lines: Vec<String>,
}

impl Report {
    pub fn new() -> Report {
        Report::default()
    }

    pub fn critical(&mut self, line: impl Into<String>) {
        let line = line.into();
        tracing::error!("{}", line);
        self.lines.push(line);
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn body(&self) -> String {
        self.lines.join("\n")
    }

    /// Hand the report to the configured mailer. The transport gets a full
    /// message with headers on stdin, sendmail-style.
    pub fn send(&self, config: &FsckConfig, config_name: &str) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let Some(report_to) = &config.report_to else {
            return Ok(());
        };

        let argv: Vec<&str> = config.report_mailer.split_whitespace().collect();
        if argv.is_empty() {
            bail!("fsck.report_mailer is empty");
        }

        let subject = config.report_subject.clone().unwrap_or_else(|| {
            let host = hostname().unwrap_or_else(|| "localhost".to_string());
            format!("grok-fsck errors on {} ({})", host, config_name)
        });

        let message = format!(
            "Subject: {}\nFrom: {}\nTo: {}\n\n{}\n",
            subject,
            config.report_from,
            report_to,
            self.body()
        );

        tracing::info!("sending report to {} via {}", report_to, argv[0]);
        let mut child = Command::new(argv[0])
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start mailer {}", argv[0]))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(message.as_bytes())
                .context("Failed to write report to mailer")?;
        }
        let out = child.wait_with_output().context("Mailer did not finish")?;
        if !out.status.success() {
            bail!(
                "mailer exited with {:?}: {}",
                out.status.code(),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }
}

fn hostname() -> Option<String> {
    let out = Command::new("hostname").output().ok()?;
    if !out.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_empty_report_sends_nothing() {
        let report = Report::new();
        let config = FsckConfig::default();
        report.send(&config, "test.conf").unwrap();
    }

    #[test]
    fn test_report_goes_through_mailer() {
        let tmp = TempDir::new().unwrap();
        let mailer = tmp.path().join("mailer.sh");
        let outfile = tmp.path().join("sent");
        std::fs::write(
            &mailer,
            format!("#!/bin/sh\ncat > {}\n", outfile.display()),
        )
        .unwrap();
        std::fs::set_permissions(&mailer, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = FsckConfig::default();
        config.report_to = Some("mirror-admin@example.org".to_string());
        config.report_mailer = mailer.to_string_lossy().into_owned();

        let mut report = Report::new();
        report.critical("repacking /a.git returned critical errors");
        report.send(&config, "grokmirror.conf").unwrap();

        let sent = std::fs::read_to_string(&outfile).unwrap();
        assert!(sent.contains("To: mirror-admin@example.org"));
        assert!(sent.contains("critical errors"));
    }
}
