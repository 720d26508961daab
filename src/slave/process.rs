// =============================================================================
// PLAYER PROCESS
// =============================================================================
//
// The controller only sees the `SlaveTransport` trait: write a line, pick up
// whatever output arrived, ask whether the child is still alive and tear it
// down. `SlaveProcess` backs it with a real child; stdout and stderr are
// drained by two reader threads into one channel so reads never block.
//
// =============================================================================

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::ControllerError;
use crate::slave::lines::OutputStream;

/// Poll interval while waiting for the child to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 4096;
/// Total time `Drop` waits for the reader threads.
const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(100);

pub trait SlaveTransport: Send {
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Everything read since the last call, in arrival order. Never blocks.
    fn read_available(&mut self) -> Vec<(OutputStream, Vec<u8>)>;

    fn pid(&self) -> Option<u32>;

    fn is_alive(&mut self) -> bool;

    /// Waits at most `timeout` for the child to exit on its own.
    fn wait_for_exit(&mut self, timeout: Duration) -> bool;

    /// Asks the OS to terminate the child, then kills it after `grace`.
    /// Returns true once the child is known to be gone.
    fn terminate_with_escalation(&mut self, grace: Duration) -> bool;
}

pub trait SlaveLauncher: Send {
    fn spawn(&mut self, program: &Path, args: &[String]) -> Result<Box<dyn SlaveTransport>, ControllerError>;

    /// Kills `pid` without a handle to it. Runs after the transport is gone.
    fn force_kill(&mut self, pid: u32) {
        force_kill_pid(pid);
    }
}

/// Bounded-time check that a source can be read at all, so an unreachable
/// file fails fast instead of waiting for the load deadline.
pub trait PreloadProbe: Send {
    /// `None` on success, otherwise a reason.
    fn try_preload(&self, source: &str, byte_limit: usize, timeout: Duration) -> Option<String>;
}

// =============================================================================
// REAL CHILD PROCESS
// =============================================================================

#[derive(Debug, Default)]
pub struct ProcessLauncher;

impl SlaveLauncher for ProcessLauncher {
    fn spawn(&mut self, program: &Path, args: &[String]) -> Result<Box<dyn SlaveTransport>, ControllerError> {
        let process = SlaveProcess::spawn(program, args)?;
        Ok(Box::new(process))
    }
}

pub struct SlaveProcess {
    child: Child,
    stdin: ChildStdin,
    output_rx: mpsc::Receiver<(OutputStream, Vec<u8>)>,
    readers: Vec<JoinHandle<()>>,
    exited: bool,
}

impl SlaveProcess {
    pub fn spawn(program: &Path, args: &[String]) -> Result<Self, ControllerError> {
        log::info!("Spawning {:?} {}", program, args.join(" "));

        let spawn_error = |source: io::Error| ControllerError::Spawn {
            program: program.display().to_string(),
            source,
        };

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        let missing = |name: &str| spawn_error(io::Error::new(io::ErrorKind::BrokenPipe, format!("no {} pipe", name)));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (output_tx, output_rx) = mpsc::channel();
        let readers = vec![
            spawn_reader(stdout, OutputStream::Stdout, output_tx.clone()),
            spawn_reader(stderr, OutputStream::Stderr, output_tx),
        ];

        log::debug!("Player started with pid {}", child.id());
        Ok(Self {
            child,
            stdin,
            output_rx,
            readers,
            exited: false,
        })
    }

    fn poll_exit(&mut self) -> bool {
        if self.exited {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                log::debug!("Player exited: {}", status);
                self.exited = true;
            }
            Ok(None) => {}
            Err(e) => log::warn!("Failed to poll player process: {}", e),
        }
        self.exited
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut pipe: R,
    stream: OutputStream,
    output_tx: mpsc::Sender<(OutputStream, Vec<u8>)>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = [0u8; READ_CHUNK];
        loop {
            match pipe.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.send((stream, buffer[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Player {} reader error: {}", stream, e);
                    break;
                }
            }
        }
        log::debug!("Player {} reader stopped", stream);
    })
}

impl SlaveTransport for SlaveProcess {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()
    }

    fn read_available(&mut self) -> Vec<(OutputStream, Vec<u8>)> {
        self.output_rx.try_iter().collect()
    }

    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_alive(&mut self) -> bool {
        !self.poll_exit()
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.poll_exit() {
                return true;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
        self.poll_exit()
    }

    fn terminate_with_escalation(&mut self, grace: Duration) -> bool {
        if self.poll_exit() {
            return true;
        }

        #[cfg(unix)]
        {
            send_sigterm(self.child.id());
            if self.wait_for_exit(grace) {
                return true;
            }
            log::warn!("Player ignored SIGTERM; escalating to kill");
        }
        #[cfg(not(unix))]
        let _ = grace;

        if let Err(e) = self.child.kill() {
            log::warn!("Failed to kill player: {}", e);
        }
        match self.child.wait() {
            Ok(status) => {
                log::info!("Player killed: {}", status);
                self.exited = true;
            }
            Err(e) => log::warn!("Failed to wait for killed player: {}", e),
        }
        self.exited
    }
}

impl Drop for SlaveProcess {
    fn drop(&mut self) {
        // Readers only finish once every holder of the pipes is gone, which a
        // forked grandchild can delay indefinitely. Whatever is still running
        // at the deadline is detached and stops on its next failed send.
        let deadline = Instant::now() + READER_JOIN_TIMEOUT;
        for reader in self.readers.drain(..) {
            while !reader.is_finished() && Instant::now() < deadline {
                thread::sleep(EXIT_POLL_INTERVAL);
            }
            if reader.is_finished() {
                let _ = reader.join();
            } else {
                log::debug!("Player output reader still blocked, detaching it");
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

/// Last-resort kill of a process we no longer own a handle to.
pub fn force_kill_pid(pid: u32) {
    log::warn!("Force killing player pid {}", pid);

    #[cfg(unix)]
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    #[cfg(windows)]
    unsafe {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::System::Threading::{OpenProcess, TerminateProcess, PROCESS_TERMINATE};

        match OpenProcess(PROCESS_TERMINATE, false, pid) {
            Ok(handle) => {
                if let Err(e) = TerminateProcess(handle, 1) {
                    log::warn!("TerminateProcess failed for pid {}: {}", pid, e);
                }
                let _ = CloseHandle(handle);
            }
            Err(e) => log::debug!("OpenProcess failed for pid {}: {}", pid, e),
        }
    }
}

// =============================================================================
// PRELOAD
// =============================================================================

/// Reads the first bytes of a local file on a helper thread. URLs are left
/// to the player.
#[derive(Debug, Default)]
pub struct FilePreloadProbe;

impl PreloadProbe for FilePreloadProbe {
    fn try_preload(&self, source: &str, byte_limit: usize, timeout: Duration) -> Option<String> {
        if source.contains("://") {
            log::debug!("Skipping preload of {}", source);
            return None;
        }

        let path = PathBuf::from(source);
        let (result_tx, result_rx) = mpsc::channel();
        thread::spawn(move || {
            let result = File::open(&path).and_then(|file| {
                let mut buffer = Vec::with_capacity(byte_limit);
                file.take(byte_limit as u64).read_to_end(&mut buffer)
            });
            let _ = result_tx.send(result);
        });

        match result_rx.recv_timeout(timeout) {
            Ok(Ok(read)) => {
                log::debug!("Preloaded {} bytes of {}", read, source);
                None
            }
            Ok(Err(e)) => Some(format!("cannot read {}: {}", source, e)),
            Err(_) => Some(format!("reading {} timed out after {:?}", source, timeout)),
        }
    }
}

#[derive(Debug, Default)]
pub struct NoPreload;

impl PreloadProbe for NoPreload {
    fn try_preload(&self, _source: &str, _byte_limit: usize, _timeout: Duration) -> Option<String> {
        None
    }
}
