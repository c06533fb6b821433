// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Starting supervised processes

use camino::{Utf8Path, Utf8PathBuf};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};

pub const DEFAULT_HOME: &str = "/root";
pub const DEFAULT_PATH: &str =
    "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("{0:?}: executable file not found in $PATH")]
    NotFound(String),
    #[error("no command given")]
    EmptyCommand,
    #[error("unknown {kind} {name:?}")]
    UnknownId { kind: &'static str, name: String },
    #[error("failed to allocate a pty")]
    Pty(#[source] std::io::Error),
    #[error("failed to start {path}")]
    Start {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

/// What to run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub path: String,
    /// Full argument vector, `argv[0]` included
    pub args: Vec<String>,
    /// `KEY=value` entries
    pub env: Vec<String>,
    pub dir: Option<String>,
    pub user: String,
    pub group: String,
    pub tty: bool,
}

impl ProcessSpec {
    /// The environment to run with: `env` in order, later entries winning,
    /// with `HOME` defaulted.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), DEFAULT_HOME.to_string());
        for entry in &self.env {
            let (key, value) = entry.split_once('=').unwrap_or((entry, ""));
            env.insert(key.to_string(), value.to_string());
        }
        env
    }
}

/// Locates `name` the way a shell would, using the `PATH` of `env`.
pub fn look_path(
    name: &str,
    env: &BTreeMap<String, String>,
) -> Result<Utf8PathBuf, SpawnError> {
    if name.is_empty() {
        return Err(SpawnError::EmptyCommand);
    }
    if name.contains('/') {
        return Ok(Utf8PathBuf::from(name));
    }
    let path = env.get("PATH").map(String::as_str).unwrap_or(DEFAULT_PATH);
    path.split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Utf8Path::new(dir).join(name))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| SpawnError::NotFound(name.to_string()))
}

fn is_executable(path: &Utf8Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolves a user or group name through `db` (`/etc/passwd` format).
/// Numeric names are taken as ids.
fn lookup_id(
    db: &Utf8Path,
    kind: &'static str,
    name: &str,
) -> Result<u32, SpawnError> {
    if let Ok(id) = name.parse() {
        return Ok(id);
    }
    let unknown = || SpawnError::UnknownId { kind, name: name.to_string() };
    let contents = std::fs::read_to_string(db).map_err(|_| unknown())?;
    contents
        .lines()
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|fields| fields.len() > 2 && fields[0] == name)
        .and_then(|fields| fields[2].parse().ok())
        .ok_or_else(unknown)
}

/// Control side of a pseudo-terminal
pub struct Pty {
    master: OwnedFd,
}

impl Pty {
    fn open() -> std::io::Result<(Pty, OwnedFd)> {
        let mut master = -1;
        let mut slave = -1;
        // SAFETY: openpty writes two descriptors into the provided integers
        // and reads nothing from the null arguments.
        let rc = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null(),
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        // SAFETY: both descriptors were just returned to us and are owned
        // by nothing else.
        let (master, slave) = unsafe {
            (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave))
        };
        Ok((Pty { master }, slave))
    }

    pub fn resize(
        &self,
        columns: u16,
        rows: u16,
        width: u16,
        height: u16,
    ) -> std::io::Result<()> {
        let size = libc::winsize {
            ws_row: rows,
            ws_col: columns,
            ws_xpixel: width,
            ws_ypixel: height,
        };
        // SAFETY: TIOCSWINSZ only reads the winsize we pass.
        let rc = unsafe {
            libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &size)
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn file(&self) -> std::io::Result<File> {
        Ok(File::from(self.master.try_clone()?))
    }
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A started process and its standard streams
pub struct Spawned {
    pub pid: u32,
    /// Standard output, or the terminal when running on a pty
    pub output: BoxedReader,
    /// Standard error; absent on a pty
    pub errors: Option<BoxedReader>,
    pub input: Option<BoxedWriter>,
    pub pty: Option<Pty>,
}

impl std::fmt::Debug for Spawned {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spawned")
            .field("pid", &self.pid)
            .field("pty", &self.pty.is_some())
            .finish_non_exhaustive()
    }
}

/// Starts `spec` in its own process group (or session, with a pty).
///
/// The child is not waited on here: the reaper collects it, so the caller
/// must record the returned pid before the reaper next runs.
pub fn spawn(spec: &ProcessSpec) -> Result<Spawned, SpawnError> {
    let env = spec.environment();
    let path = look_path(&spec.path, &env)?;

    let mut command = Command::new(&path);
    if let Some((argv0, rest)) = spec.args.split_first() {
        command.arg0(argv0).args(rest);
    }
    command.env_clear().envs(&env);
    if let Some(dir) = spec.dir.as_deref().filter(|d| !d.is_empty()) {
        command.current_dir(dir);
    }
    if !spec.user.is_empty() {
        let passwd = Utf8Path::new("/etc/passwd");
        command.uid(lookup_id(passwd, "user", &spec.user)?);
    }
    if !spec.group.is_empty() {
        let group = Utf8Path::new("/etc/group");
        command.gid(lookup_id(group, "group", &spec.group)?);
    }

    let start = |err| SpawnError::Start { path: path.clone(), err };
    if spec.tty {
        let (pty, slave) = Pty::open().map_err(SpawnError::Pty)?;
        let stdio = |fd: &OwnedFd| -> Result<Stdio, SpawnError> {
            Ok(Stdio::from(fd.try_clone().map_err(SpawnError::Pty)?))
        };
        command
            .stdin(stdio(&slave)?)
            .stdout(stdio(&slave)?)
            .stderr(stdio(&slave)?);
        // SAFETY: only async-signal-safe calls are made between fork and
        // exec.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(0, libc::TIOCSCTTY, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = command.spawn().map_err(start)?;
        drop(slave);

        let output = pty.file().map_err(SpawnError::Pty)?;
        let input = pty.file().map_err(SpawnError::Pty)?;
        return Ok(Spawned {
            pid: child.id(),
            output: Box::new(tokio::fs::File::from_std(output)),
            errors: None,
            input: Some(Box::new(tokio::fs::File::from_std(input))),
            pty: Some(pty),
        });
    }

    command
        .process_group(0)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn().map_err(start)?;
    let pid = child.id();
    let output = child.stdout.take().map(tokio::process::ChildStdout::from_std);
    let errors = child.stderr.take().map(tokio::process::ChildStderr::from_std);
    let input = child.stdin.take().map(tokio::process::ChildStdin::from_std);
    match (output, errors, input) {
        (Some(Ok(output)), Some(Ok(errors)), Some(Ok(input))) => Ok(Spawned {
            pid,
            output: Box::new(output),
            errors: Some(Box::new(errors)),
            input: Some(Box::new(input)),
            pty: None,
        }),
        _ => Err(start(std::io::Error::other("failed to set up stdio"))),
    }
}

/// A writer fanning out to a set of writers that may change while a
/// process is running
///
/// A writer that fails is dropped from the set.
#[derive(Clone, Default)]
pub struct MultiWriter {
    writers: Arc<Mutex<Vec<Box<dyn Write + Send>>>>,
}

impl MultiWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, writer: Box<dyn Write + Send>) {
        self.writers.lock().unwrap().push(writer);
    }

    pub fn len(&self) -> usize {
        self.writers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writers
            .lock()
            .unwrap()
            .retain_mut(|writer| writer.write_all(buf).is_ok());
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writers
            .lock()
            .unwrap()
            .retain_mut(|writer| writer.flush().is_ok());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use tokio::io::AsyncReadExt;

    #[test]
    fn environment_defaults_home() {
        let spec = ProcessSpec {
            env: vec!["PATH=/opt/bin".into(), "FOO=a=b".into()],
            ..Default::default()
        };
        let env = spec.environment();
        assert_eq!(env["HOME"], DEFAULT_HOME);
        assert_eq!(env["FOO"], "a=b");

        let spec = ProcessSpec {
            env: vec!["HOME=/home/daemon".into()],
            ..Default::default()
        };
        assert_eq!(spec.environment()["HOME"], "/home/daemon");
    }

    #[test]
    fn path_lookup() {
        let dir = Utf8TempDir::new().unwrap();
        let tool = dir.path().join("tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755))
            .unwrap();
        std::fs::write(dir.path().join("data"), "").unwrap();

        let env = BTreeMap::from([(
            "PATH".to_string(),
            format!("/nonexistent:{}", dir.path()),
        )]);
        assert_eq!(look_path("tool", &env).unwrap(), tool);
        assert!(matches!(
            look_path("data", &env),
            Err(SpawnError::NotFound(_))
        ));
        assert_eq!(look_path("/bin/true", &env).unwrap(), "/bin/true");
        assert!(matches!(look_path("", &env), Err(SpawnError::EmptyCommand)));
    }

    #[test]
    fn id_lookup() {
        let dir = Utf8TempDir::new().unwrap();
        let db = dir.path().join("passwd");
        std::fs::write(
            &db,
            "root:x:0:0:root:/root:/bin/sh\ndaemon:x:2:2::/:/bin/false\n",
        )
        .unwrap();
        assert_eq!(lookup_id(&db, "user", "daemon").unwrap(), 2);
        assert_eq!(lookup_id(&db, "user", "1000").unwrap(), 1000);
        assert!(lookup_id(&db, "user", "nobody").is_err());
    }

    #[test]
    fn multi_writer_drops_failed_writers() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("broken"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut writer = MultiWriter::new();
        writer.add(Box::new(Vec::new()));
        writer.add(Box::new(Broken));
        writer.write_all(b"hello").unwrap();
        assert_eq!(writer.len(), 1);
    }

    #[tokio::test]
    async fn spawn_captures_output() {
        let spec = ProcessSpec {
            path: "sh".into(),
            args: vec!["sh".into(), "-c".into(), "echo $HOME".into()],
            ..Default::default()
        };
        let mut spawned = spawn(&spec).unwrap();
        let mut output = String::new();
        spawned.output.read_to_string(&mut output).await.unwrap();
        assert_eq!(output, "/root\n");
        assert!(spawned.pty.is_none());
    }
}
