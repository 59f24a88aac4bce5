//! Hook-script launcher.
//!
//! One process-wide thread receives spawn requests over a channel and
//! detaches each script via the shell; camera threads therefore never
//! block on an exec, however slow the user's hook is. Exec failures are
//! logged and forgotten.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::process::{Command, Stdio};
use std::thread;

use crossbeam_channel::{unbounded, Sender};

pub struct SpawnRequest {
    pub cmdline: String,
}

#[derive(Clone)]
pub struct ScriptLauncher {
    tx: Sender<SpawnRequest>,
}

impl ScriptLauncher {
    /// Starts the launcher thread. The thread exits when the last handle
    /// is dropped.
    pub fn start() -> ScriptLauncher {
        let (tx, rx) = unbounded::<SpawnRequest>();
        thread::spawn(move || {
            while let Ok(req) = rx.recv() {
                debug!("spawning hook script: {}", req.cmdline);
                match Command::new("sh")
                    .arg("-c")
                    .arg(&req.cmdline)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                {
                    Ok(mut child) => {
                        // Reap in the background so the script can outlive
                        // the event that fired it.
                        thread::spawn(move || {
                            let _ = child.wait();
                        });
                    }
                    Err(e) => {
                        error!("could not exec {:?}: {e}", req.cmdline);
                    }
                }
            }
        });
        ScriptLauncher { tx }
    }

    /// Queues a script; a no-op for empty command lines.
    pub fn run(&self, cmdline: &str) {
        if cmdline.is_empty() {
            return;
        }
        let _ = self.tx.send(SpawnRequest {
            cmdline: cmdline.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn script_runs_detached() {
        let dir = std::env::temp_dir().join(format!("vigil-script-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let marker = dir.join("ran");
        let launcher = ScriptLauncher::start();
        launcher.run(&format!("touch {}", marker.display()));

        let mut seen = false;
        for _ in 0..50 {
            if marker.exists() {
                seen = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        let _ = std::fs::remove_dir_all(&dir);
        assert!(seen, "hook script never ran");
    }

    #[test]
    fn empty_cmdline_is_ignored() {
        let launcher = ScriptLauncher::start();
        launcher.run("");
    }
}
