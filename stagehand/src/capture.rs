//! Background capture of a child's merged stdout/stderr.
//!
//! While a handshake is in progress the child's output is drained by a
//! dedicated thread into a bounded buffer. If the handshake fails, whatever
//! was captured ends up in the diagnostic report; if it succeeds the
//! capturer is stopped and the caller takes over the stream.

use std::collections::VecDeque;
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Default capture buffer bound.
pub const DEFAULT_CAPTURE_LIMIT: usize = 128 * 1024;

/// How long a single blocking wait for readable data may take. The stop
/// flag is re-checked between waits, so this bounds stop latency.
const READ_QUANTUM_MS: i32 = 100;

type EndCallback = Box<dyn FnOnce() + Send>;

struct Shared {
    buffer: Mutex<VecDeque<u8>>,
    limit: usize,
    stop_requested: AtomicBool,
    stopped: AtomicBool,
    end_callback: Mutex<Option<EndCallback>>,
}

impl Shared {
    fn append(&self, bytes: &[u8]) {
        let mut buffer = self.buffer.lock().unwrap();
        buffer.extend(bytes);
        // Bounded: the newest output is the interesting part.
        while buffer.len() > self.limit {
            buffer.pop_front();
        }
    }

    fn finish(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(callback) = self.end_callback.lock().unwrap().take() {
            callback();
        }
    }
}

/// Background reader draining one file descriptor into a bounded buffer.
pub struct OutputCapturer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl OutputCapturer {
    /// Starts capturing from `fd`. `seed` is output that was already read
    /// by other means (the smart path reads some bytes before the capturer
    /// takes over). `end_callback` fires once, when the stream reaches EOF
    /// or the capturer is stopped.
    pub fn start(
        fd: OwnedFd,
        seed: &[u8],
        end_callback: Option<EndCallback>,
    ) -> std::io::Result<OutputCapturer> {
        Self::start_with_limit(fd, seed, DEFAULT_CAPTURE_LIMIT, end_callback)
    }

    pub fn start_with_limit(
        fd: OwnedFd,
        seed: &[u8],
        limit: usize,
        end_callback: Option<EndCallback>,
    ) -> std::io::Result<OutputCapturer> {
        let shared = Arc::new(Shared {
            buffer: Mutex::new(VecDeque::new()),
            limit,
            stop_requested: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            end_callback: Mutex::new(end_callback),
        });
        shared.append(seed);

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("spawn output capturer".to_string())
            .spawn(move || capture_loop(fd, thread_shared))?;

        Ok(OutputCapturer {
            shared,
            thread: Some(thread),
        })
    }

    /// Everything captured so far, lossily decoded.
    pub fn data(&self) -> String {
        let buffer = self.shared.buffer.lock().unwrap();
        String::from_utf8_lossy(&buffer.iter().copied().collect::<Vec<u8>>()).into_owned()
    }

    /// Whether the capture thread has finished (EOF, error, or stop).
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Stops capturing and joins the reader thread. Idempotent.
    pub fn stop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for OutputCapturer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(fd: OwnedFd, shared: Arc<Shared>) {
    let mut file = std::fs::File::from(fd);
    let mut chunk = [0u8; 4096];
    loop {
        if shared.stop_requested.load(Ordering::SeqCst) {
            break;
        }
        match wait_readable(&file) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(_) => break,
        }
        match file.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => shared.append(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    shared.finish();
}

/// Waits one quantum for the fd to become readable. `Ok(false)` on timeout.
fn wait_readable(file: &std::fs::File) -> std::io::Result<bool> {
    let mut pollfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let ret = unsafe { libc::poll(&mut pollfd, 1, READ_QUANTUM_MS) };
    match ret {
        -1 => {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(err)
            }
        }
        0 => Ok(false),
        _ => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn pipe_pair() -> (OwnedFd, std::fs::File) {
        let (read, write) = nix::unistd::pipe().unwrap();
        (read, std::fs::File::from(write))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn captures_written_bytes_and_fires_callback_on_eof() {
        let (read, mut write) = pipe_pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let capturer = OutputCapturer::start(
            read,
            b"seed:",
            Some(Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        write.write_all(b"hello world").unwrap();
        wait_until(|| capturer.data().contains("hello world"));
        assert!(capturer.data().starts_with("seed:"));
        assert!(!capturer.is_stopped());

        drop(write);
        wait_until(|| capturer.is_stopped());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_is_idempotent_and_marks_stopped() {
        let (read, write) = pipe_pair();
        let mut capturer = OutputCapturer::start(read, b"", None).unwrap();
        capturer.stop();
        capturer.stop();
        assert!(capturer.is_stopped());
        drop(write);
    }

    #[test]
    fn buffer_is_bounded_and_keeps_the_tail() {
        let (read, mut write) = pipe_pair();
        let capturer = OutputCapturer::start_with_limit(read, b"", 16, None).unwrap();
        write.write_all(b"0123456789abcdefGHIJ").unwrap();
        drop(write);
        wait_until(|| capturer.is_stopped());
        let data = capturer.data();
        assert_eq!(data.len(), 16);
        assert!(data.ends_with("GHIJ"));
    }
}
