//! External command player.
//!
//! The configured command line is split into arguments, the music file is
//! appended, and the result is run as a child process that writes audio on
//! its own. The mixing bridge never touches this backend.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use super::{BackendError, BackendResult};

/// Environment variable carrying the music volume (0..=MAX_VOLUME) to the child.
pub const VOLUME_ENV: &str = "TUNEMIX_MUSIC_VOLUME";

pub struct CommandSong {
    program: String,
    args: Vec<String>,
    file: PathBuf,
    volume: i32,
    child: Option<Child>,
}

impl CommandSong {
    pub fn load(command: &str, file: &Path) -> BackendResult<Self> {
        let mut argv = split_command(command).into_iter();
        let program = argv
            .next()
            .ok_or_else(|| BackendError::Format("empty music command".into()))?;
        Ok(Self {
            program,
            args: argv.collect(),
            file: file.to_path_buf(),
            volume: crate::MAX_VOLUME,
            child: None,
        })
    }

    pub fn set_volume(&mut self, volume: i32) {
        self.volume = volume;
    }

    pub fn start(&mut self) -> BackendResult<()> {
        self.stop();
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(&self.file)
            .env(VOLUME_ENV, self.volume.to_string())
            .stdin(Stdio::null())
            .spawn()?;
        log::debug!("tunemix: spawned '{}' (pid {})", self.program, child.id());
        self.child = Some(child);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                log::debug!("tunemix: kill pid {}: {}", child.id(), e);
            }
            let _ = child.wait();
        }
    }

    /// SIGSTOP the child. No-op off unix.
    pub fn pause(&mut self) {
        #[cfg(unix)]
        self.signal(libc::SIGSTOP);
    }

    /// SIGCONT the child. No-op off unix.
    pub fn resume(&mut self) {
        #[cfg(unix)]
        self.signal(libc::SIGCONT);
    }

    pub fn is_active(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Deliver `sig` to the running child. False when there is no live
    /// child or the signal could not be sent.
    #[cfg(unix)]
    fn signal(&mut self, sig: libc::c_int) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        // A reaped child's pid may already belong to someone else
        if !matches!(child.try_wait(), Ok(None)) {
            return false;
        }
        let Ok(pid) = libc::pid_t::try_from(child.id()) else {
            return false;
        };
        // SAFETY: kill(2) takes no pointers; pid is our unreaped child.
        if unsafe { libc::kill(pid, sig) } == 0 {
            return true;
        }
        log::warn!(
            "tunemix: signal {} to pid {} failed: {}",
            sig,
            pid,
            std::io::Error::last_os_error()
        );
        false
    }
}

impl Drop for CommandSong {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Split a command line on whitespace, honouring single and double quotes.
pub fn split_command(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_arg = true;
            }
            None if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            None => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}
