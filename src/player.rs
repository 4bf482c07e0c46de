use std::fs;
use std::io::Write;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::debug;
use rand::{distributions::Alphanumeric, Rng};
use serde_json::json;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use crate::model::MediaRef;
use crate::playback::{MediaPlayer, MediaResourceFactory, PlayerOptions};

const IPC_RETRIES: usize = 20;
const IPC_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Starts one paused `mpv` process per mounted item and drives it over
/// mpv's JSON IPC socket.
#[derive(Debug, Clone)]
pub struct MpvFactory {
    mpv_path: String,
    extra_args: Vec<String>,
}

impl MpvFactory {
    pub fn new<S: Into<String>>(mpv_path: S, extra_args: Vec<String>) -> Self {
        Self {
            mpv_path: mpv_path.into(),
            extra_args,
        }
    }
}

impl MediaResourceFactory for MpvFactory {
    fn create(&self, media: &MediaRef, options: &PlayerOptions) -> Result<Box<dyn MediaPlayer>> {
        if media.is_empty() {
            return Err(anyhow!("media locator missing"));
        }
        let ipc_path = unique_ipc_path().context("inline mpv control is not supported here")?;
        remove_ipc_path(&ipc_path);

        let args = mpv_args(media, options, &ipc_path, &self.extra_args);
        debug!("mpv args: {:?}", args);
        let child = Command::new(&self.mpv_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("launch mpv for {media}"))?;

        Ok(Box::new(MpvPlayer {
            child: Some(child),
            ipc_path,
        }))
    }
}

fn mpv_args(
    media: &MediaRef,
    options: &PlayerOptions,
    ipc_path: &str,
    extra_args: &[String],
) -> Vec<String> {
    let mut args = vec![
        media.as_str().to_string(),
        "--pause".to_string(),
        "--force-window=yes".to_string(),
        "--keep-open=no".to_string(),
        "--really-quiet".to_string(),
        "--terminal=no".to_string(),
        "--no-config".to_string(),
        "--ytdl=no".to_string(),
        format!("--input-ipc-server={ipc_path}"),
    ];
    if options.looping {
        args.push("--loop-file=inf".to_string());
    }
    args.extend(extra_args.iter().cloned());
    args
}

pub struct MpvPlayer {
    child: Option<Child>,
    ipc_path: String,
}

impl MpvPlayer {
    fn send(&self, command: serde_json::Value) -> Result<()> {
        if self.child.is_none() {
            return Err(anyhow!("mpv already released"));
        }
        let payload = json!({ "command": command });
        let serialized = serde_json::to_string(&payload).context("serialize mpv command")?;
        send_ipc_command(&self.ipc_path, &serialized)
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let quit = {
            let payload = json!({ "command": ["quit"] });
            send_ipc_command(&self.ipc_path, &payload.to_string())
        };
        if quit.is_err() || child.try_wait().ok().flatten().is_none() {
            let _ = child.kill();
        }
        let status = child.wait().context("wait for mpv to exit");
        remove_ipc_path(&self.ipc_path);
        status?;
        Ok(())
    }
}

impl MediaPlayer for MpvPlayer {
    fn play(&mut self) -> Result<()> {
        self.send(json!(["set_property", "pause", false]))
    }

    fn pause(&mut self) -> Result<()> {
        self.send(json!(["set_property", "pause", true]))
    }

    fn release(&mut self) -> Result<()> {
        self.shutdown()
    }
}

impl Drop for MpvPlayer {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(unix)]
fn send_ipc_command(path: &str, serialized: &str) -> Result<()> {
    let mut last_err = None;
    for _ in 0..IPC_RETRIES {
        match UnixStream::connect(path) {
            Ok(mut stream) => {
                stream
                    .write_all(serialized.as_bytes())
                    .context("write mpv IPC command")?;
                stream
                    .write_all(b"\n")
                    .context("write mpv IPC command terminator")?;
                return Ok(());
            }
            Err(err) => {
                last_err = Some(err);
                thread::sleep(IPC_RETRY_DELAY);
            }
        }
    }
    match last_err {
        Some(err) => Err(anyhow!(err)).context(format!("connect to mpv IPC socket {path}")),
        None => Err(anyhow!("connect to mpv IPC socket {path}")),
    }
}

#[cfg(not(unix))]
fn send_ipc_command(_path: &str, _serialized: &str) -> Result<()> {
    let _ = (IPC_RETRIES, IPC_RETRY_DELAY);
    Err(anyhow!("mpv IPC control is not supported on this platform"))
}

fn ipc_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect()
}

#[cfg(unix)]
fn unique_ipc_path() -> Option<String> {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "reelfeed-mpv-{}-{}.sock",
        std::process::id(),
        ipc_suffix()
    ));
    Some(path.to_string_lossy().to_string())
}

#[cfg(target_os = "windows")]
fn unique_ipc_path() -> Option<String> {
    Some(format!(
        r"\\.\pipe\reelfeed-mpv-{}-{}",
        std::process::id(),
        ipc_suffix()
    ))
}

#[cfg(all(not(unix), not(target_os = "windows")))]
fn unique_ipc_path() -> Option<String> {
    let _ = ipc_suffix;
    None
}

fn remove_ipc_path(path: &str) {
    if cfg!(unix) {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!("failed to remove mpv ipc path {path}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_pause_on_start_and_loop_when_asked() {
        let media = MediaRef::new("https://media.test/a.mp4");
        let args = mpv_args(
            &media,
            &PlayerOptions { looping: true },
            "/tmp/x.sock",
            &["--mute=yes".to_string()],
        );
        assert_eq!(args[0], "https://media.test/a.mp4");
        assert!(args.contains(&"--pause".to_string()));
        assert!(args.contains(&"--loop-file=inf".to_string()));
        assert!(args.contains(&"--input-ipc-server=/tmp/x.sock".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--mute=yes"));

        let args = mpv_args(&media, &PlayerOptions { looping: false }, "/tmp/x.sock", &[]);
        assert!(!args.iter().any(|arg| arg.starts_with("--loop-file")));
    }

    #[test]
    fn empty_media_is_rejected() {
        let factory = MpvFactory::new("mpv", Vec::new());
        assert!(factory
            .create(&MediaRef::new("  "), &PlayerOptions::default())
            .is_err());
    }

    #[test]
    fn missing_binary_fails_creation() {
        let factory = MpvFactory::new("/nonexistent/reelfeed-mpv", Vec::new());
        let result = factory.create(&MediaRef::new("clip.mp4"), &PlayerOptions::default());
        if cfg!(any(unix, target_os = "windows")) {
            let err = result.err().map(|e| format!("{e:#}")).unwrap_or_default();
            assert!(err.contains("launch mpv"), "unexpected error: {err}");
        }
    }

    #[cfg(unix)]
    #[test]
    fn ipc_paths_are_unique() {
        let a = unique_ipc_path().unwrap();
        let b = unique_ipc_path().unwrap();
        assert_ne!(a, b);
        assert!(a.ends_with(".sock"));
    }
}
