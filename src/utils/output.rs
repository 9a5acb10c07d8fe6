/// Bounded output capture
///
/// Each stream is drained on its own thread until EOF. Bytes beyond the limit
/// are read and discarded, so a chatty program never blocks on a full pipe and
/// the truncation is reported instead of failing the run.
use crate::config::types::CapturedStream;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

const CHUNK: usize = 8192;

#[derive(Default)]
struct Buffer {
    bytes: Vec<u8>,
    truncated: bool,
    read_error: Option<String>,
}

/// A stream being drained in the background
pub struct StreamCapture {
    name: String,
    buffer: Arc<Mutex<Buffer>>,
    done: Receiver<()>,
}

impl StreamCapture {
    /// Start draining `stream`, keeping at most `limit` bytes.
    pub fn spawn<R: Read + Send + 'static>(name: &str, stream: R, limit: usize) -> std::io::Result<Self> {
        let buffer = Arc::new(Mutex::new(Buffer::default()));
        let (tx, done) = bounded(1);
        let shared = Arc::clone(&buffer);

        thread::Builder::new()
            .name(format!("runbox-{name}"))
            .spawn(move || {
                drain(stream, limit, &shared);
                let _ = tx.send(());
            })?;

        Ok(StreamCapture {
            name: name.to_string(),
            buffer,
            done,
        })
    }

    /// Wait for EOF up to `timeout`. On timeout the bytes captured so far are
    /// returned and marked truncated; the reader thread ends with the last writer.
    pub fn finish(self, timeout: Duration) -> CapturedStream {
        let timed_out = match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "{} still open {:?} after the sandbox exited, returning partial output",
                    self.name,
                    timeout
                );
                true
            }
        };

        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(err) = buffer.read_error.take() {
            log::warn!("Reading {} failed: {}", self.name, err);
        }
        CapturedStream {
            bytes: std::mem::take(&mut buffer.bytes),
            truncated: buffer.truncated || timed_out,
        }
    }
}

fn drain<R: Read>(mut stream: R, limit: usize, shared: &Mutex<Buffer>) {
    let mut chunk = [0u8; CHUNK];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => {
                let mut buffer = shared.lock().unwrap_or_else(PoisonError::into_inner);
                let room = limit.saturating_sub(buffer.bytes.len());
                if n > room {
                    buffer.truncated = true;
                }
                let keep = n.min(room);
                buffer.bytes.extend_from_slice(&chunk[..keep]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                shared
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .read_error = Some(e.to_string());
                return;
            }
        }
    }
}

/// Write `data` to a child's stdin from a helper thread, then close it.
/// A program that exits without reading everything is not an error.
pub fn feed_stdin<W: Write + Send + 'static>(mut stdin: W, data: Vec<u8>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("runbox-stdin".to_string())
        .spawn(move || {
            if let Err(e) = stdin.write_all(&data) {
                if e.kind() != ErrorKind::BrokenPipe {
                    log::debug!("stdin feed stopped early: {}", e);
                }
            }
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Cursor;

    fn pipe() -> (File, File) {
        let (reader, writer) = nix::unistd::pipe().unwrap();
        (File::from(reader), File::from(writer))
    }

    #[test]
    fn test_small_output_is_complete() {
        let capture = StreamCapture::spawn("stdout", Cursor::new(b"hello\n".to_vec()), 1024).unwrap();
        let stream = capture.finish(Duration::from_secs(1));
        assert_eq!(stream.bytes, b"hello\n");
        assert!(!stream.truncated);
    }

    #[test]
    fn test_excess_output_is_drained_and_flagged() {
        let data = vec![b'x'; 100_000];
        let capture = StreamCapture::spawn("stdout", Cursor::new(data), 1000).unwrap();
        let stream = capture.finish(Duration::from_secs(1));
        assert_eq!(stream.bytes.len(), 1000);
        assert!(stream.truncated);
    }

    #[test]
    fn test_exact_limit_is_not_truncated() {
        let capture = StreamCapture::spawn("stderr", Cursor::new(vec![b'y'; 512]), 512).unwrap();
        let stream = capture.finish(Duration::from_secs(1));
        assert_eq!(stream.bytes.len(), 512);
        assert!(!stream.truncated);
    }

    #[test]
    fn test_pipe_never_blocks_writer() {
        let (reader, mut writer) = pipe();
        let capture = StreamCapture::spawn("stdout", reader, 16).unwrap();
        // Far more than a pipe buffer; would deadlock if the reader stopped at the limit.
        let writer_thread = thread::spawn(move || {
            let block = vec![b'z'; 64 * 1024];
            for _ in 0..16 {
                writer.write_all(&block).unwrap();
            }
        });
        writer_thread.join().unwrap();
        let stream = capture.finish(Duration::from_secs(5));
        assert_eq!(stream.bytes.len(), 16);
        assert!(stream.truncated);
    }

    #[test]
    fn test_open_writer_times_out_with_partial_output() {
        let (reader, mut writer) = pipe();
        writer.write_all(b"partial").unwrap();
        let capture = StreamCapture::spawn("stdout", reader, 1024).unwrap();
        thread::sleep(Duration::from_millis(50));
        let stream = capture.finish(Duration::from_millis(50));
        assert_eq!(stream.bytes, b"partial");
        assert!(stream.truncated);
        drop(writer);
    }
}
