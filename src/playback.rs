use std::fs;
use std::io::Write;
use std::process::{Child, Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::json;

#[cfg(unix)]
use rand::{distributions::Alphanumeric, Rng};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use crate::viewport::{Bounds, IntersectionEntry, Observation, ScrollRegion, Threshold};

/// Share of a video that must be on screen before it plays.
pub const PLAYBACK_THRESHOLD: Threshold = Threshold::HALF;

pub trait Player {
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Hidden,
    Visible,
}

/// Plays one video while at least half of it is visible.
pub struct VideoGate<P: Player> {
    player: P,
    state: Visibility,
    observation: Option<Observation>,
}

impl<P: Player> VideoGate<P> {
    pub fn new(player: P) -> Self {
        Self {
            player,
            state: Visibility::Hidden,
            observation: None,
        }
    }

    pub fn attach(&mut self, region: &ScrollRegion, bounds: Bounds) {
        self.detach();
        self.observation = Some(region.observe(bounds, PLAYBACK_THRESHOLD));
    }

    /// Stops observing and pauses a playing video, so a later attach starts
    /// from `Hidden`.
    pub fn detach(&mut self) {
        if let Some(observation) = self.observation.take() {
            observation.release();
        }
        if self.state == Visibility::Visible {
            self.state = Visibility::Hidden;
            self.player.pause();
        }
    }

    pub fn move_to(&self, bounds: Bounds) {
        if let Some(observation) = &self.observation {
            observation.set_bounds(bounds);
        }
    }

    pub fn state(&self) -> Visibility {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.observation.is_some()
    }

    pub fn player(&self) -> &P {
        &self.player
    }

    pub fn handle(&mut self, entries: &[IntersectionEntry]) {
        let Some(id) = self.observation.as_ref().map(Observation::id) else {
            return;
        };
        for entry in entries.iter().filter(|entry| entry.id == id) {
            match (self.state, entry.is_intersecting) {
                (Visibility::Hidden, true) => {
                    self.state = Visibility::Visible;
                    if let Err(err) = self.player.play() {
                        tracing::debug!(error = %err, "video playback did not start");
                    }
                }
                (Visibility::Visible, false) => {
                    self.state = Visibility::Hidden;
                    self.player.pause();
                }
                _ => {}
            }
        }
    }
}

/// External player driven over mpv's JSON IPC where available.
pub struct MpvPlayer {
    command: Vec<String>,
    url: String,
    child: Option<Child>,
    ipc_path: Option<String>,
}

impl MpvPlayer {
    /// `command` is a program plus arguments; `%URL%` is replaced with `url`,
    /// or `url` is appended when no argument mentions it.
    pub fn new(command: Vec<String>, url: impl Into<String>) -> Self {
        Self {
            command,
            url: url.into(),
            child: None,
            ipc_path: None,
        }
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    fn build_args(&self, ipc_path: Option<&str>) -> Result<(String, Vec<String>)> {
        let Some((program, rest)) = self.command.split_first() else {
            bail!("player: video command is empty");
        };
        if self.url.trim().is_empty() {
            bail!("player: video URL missing");
        }
        let mut saw_url = false;
        let mut args: Vec<String> = rest
            .iter()
            .map(|arg| {
                if arg.contains("%URL%") {
                    saw_url = true;
                    arg.replace("%URL%", &self.url)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !saw_url {
            args.push(self.url.clone());
        }
        if let Some(path) = ipc_path {
            args.push(format!("--input-ipc-server={path}"));
        }
        Ok((program.clone(), args))
    }

    fn spawn(&mut self) -> Result<()> {
        let ipc_path = if is_mpv(&self.command) {
            unique_ipc_path()
        } else {
            None
        };
        let (program, args) = self.build_args(ipc_path.as_deref())?;
        tracing::debug!(%program, ?args, "launching video player");
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("launch {program} to play {}", self.url))?;
        self.child = Some(child);
        self.ipc_path = ipc_path;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(path) = self.ipc_path.take() {
            cleanup_ipc_path(&path);
        }
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        let Some(path) = &self.ipc_path else {
            return Err(anyhow!("player: no IPC channel"));
        };
        let payload = json!({ "command": ["set_property", "pause", paused] });
        let serialized = serde_json::to_string(&payload).context("serialize mpv command")?;
        send_ipc_command(path, &serialized)
    }
}

impl Player for MpvPlayer {
    fn play(&mut self) -> Result<()> {
        if self.is_running() {
            if self.set_paused(false).is_ok() {
                return Ok(());
            }
            self.stop();
        }
        self.spawn()
    }

    fn pause(&mut self) {
        if !self.is_running() {
            return;
        }
        if let Err(err) = self.set_paused(true) {
            tracing::debug!(error = %err, "pausing by stopping player");
            self.stop();
        }
    }
}

impl Drop for MpvPlayer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_mpv(command: &[String]) -> bool {
    command
        .first()
        .and_then(|program| {
            std::path::Path::new(program)
                .file_stem()
                .map(|stem| stem.to_string_lossy().eq_ignore_ascii_case("mpv"))
        })
        .unwrap_or(false)
}

#[cfg(unix)]
fn send_ipc_command(path: &str, serialized: &str) -> Result<()> {
    let mut stream =
        UnixStream::connect(path).with_context(|| format!("connect to mpv IPC socket {path}"))?;
    stream
        .write_all(serialized.as_bytes())
        .context("write mpv IPC command")?;
    stream
        .write_all(b"\n")
        .context("write mpv IPC command terminator")?;
    Ok(())
}

#[cfg(not(unix))]
fn send_ipc_command(_path: &str, _serialized: &str) -> Result<()> {
    Err(anyhow!("mpv IPC is not supported on this platform"))
}

#[cfg(unix)]
fn unique_ipc_path() -> Option<String> {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    let mut path = std::env::temp_dir();
    path.push(format!("socialfeed-mpv-{}-{suffix}.sock", std::process::id()));
    Some(path.to_string_lossy().to_string())
}

#[cfg(not(unix))]
fn unique_ipc_path() -> Option<String> {
    None
}

fn cleanup_ipc_path(path: &str) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(%path, error = %err, "failed to remove mpv ipc path");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingPlayer {
        calls: Vec<&'static str>,
        fail_play: bool,
    }

    impl Player for RecordingPlayer {
        fn play(&mut self) -> Result<()> {
            self.calls.push("play");
            if self.fail_play {
                bail!("autoplay blocked");
            }
            Ok(())
        }

        fn pause(&mut self) {
            self.calls.push("pause");
        }
    }

    #[test]
    fn plays_at_half_visibility_and_pauses_below() {
        let region = ScrollRegion::new(10);
        let mut gate = VideoGate::new(RecordingPlayer::default());
        gate.attach(&region, Bounds::new(12, 4));
        gate.handle(&region.take_entries());
        assert_eq!(gate.state(), Visibility::Hidden);

        // Rows 12..14 of 12..16 visible: exactly half.
        region.scroll_to(4);
        gate.handle(&region.take_entries());
        assert_eq!(gate.state(), Visibility::Visible);

        // One row visible.
        region.scroll_to(3);
        gate.handle(&region.take_entries());
        assert_eq!(gate.state(), Visibility::Hidden);

        assert_eq!(gate.player().calls, vec!["play", "pause"]);
    }

    #[test]
    fn play_failure_is_swallowed() {
        let region = ScrollRegion::new(10);
        let mut gate = VideoGate::new(RecordingPlayer {
            fail_play: true,
            ..Default::default()
        });
        gate.attach(&region, Bounds::new(0, 4));
        gate.handle(&region.take_entries());
        assert_eq!(gate.state(), Visibility::Visible);
        assert_eq!(gate.player().calls, vec!["play"]);
    }

    #[test]
    fn detach_stops_observing() {
        let region = ScrollRegion::new(10);
        let mut gate = VideoGate::new(RecordingPlayer::default());
        gate.attach(&region, Bounds::new(20, 4));
        gate.detach();
        assert!(!gate.is_attached());
        assert_eq!(region.observed_count(), 0);
        region.scroll_to(18);
        gate.handle(&region.take_entries());
        assert!(gate.player().calls.is_empty());
    }

    #[test]
    fn reattach_after_playing_starts_hidden() {
        let region = ScrollRegion::new(10);
        let mut gate = VideoGate::new(RecordingPlayer::default());
        gate.attach(&region, Bounds::new(0, 4));
        gate.handle(&region.take_entries());
        assert_eq!(gate.state(), Visibility::Visible);

        gate.attach(&region, Bounds::new(2, 4));
        assert_eq!(gate.state(), Visibility::Hidden);
        gate.handle(&region.take_entries());
        assert_eq!(gate.state(), Visibility::Visible);
        assert_eq!(gate.player().calls, vec!["play", "pause", "play"]);
        assert_eq!(region.observed_count(), 1);
    }

    #[test]
    fn builds_command_with_url_placeholder() {
        let player = MpvPlayer::new(
            vec!["mpv".into(), "--loop".into(), "%URL%".into()],
            "https://cdn.test/a.mp4",
        );
        let (program, args) = player.build_args(Some("/tmp/x.sock")).unwrap();
        assert_eq!(program, "mpv");
        assert_eq!(
            args,
            vec![
                "--loop".to_string(),
                "https://cdn.test/a.mp4".to_string(),
                "--input-ipc-server=/tmp/x.sock".to_string(),
            ]
        );
    }

    #[test]
    fn appends_url_when_not_templated() {
        let player = MpvPlayer::new(vec!["vlc".into()], "https://cdn.test/a.mp4");
        let (_, args) = player.build_args(None).unwrap();
        assert_eq!(args, vec!["https://cdn.test/a.mp4".to_string()]);
        assert!(!is_mpv(&["vlc".to_string()]));
        assert!(is_mpv(&["/usr/bin/mpv".to_string()]));
    }

    #[test]
    fn missing_player_binary_is_an_error() {
        let mut player = MpvPlayer::new(
            vec!["socialfeed-no-such-player".into()],
            "https://cdn.test/a.mp4",
        );
        assert!(player.play().is_err());
        assert!(!player.is_running());
    }
}
