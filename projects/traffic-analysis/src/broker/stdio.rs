use crate::broker::{EventSource, Polled, RecordSink};
use crate::error::{PipelineError, PipelineResult};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use std::io::{BufRead, BufReader, Write};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Lines buffered ahead of the ingress loop
const READ_AHEAD: usize = 64;

/// One JSON document per line. Blank lines are skipped; end of input
/// exhausts the source.
pub struct LineSource {
    rx: Receiver<Vec<u8>>,
}

impl LineSource {
    pub fn stdin() -> Self {
        Self::spawn(BufReader::new(std::io::stdin()))
    }

    /// Read `reader` on a background thread so `poll` can honour its timeout.
    pub fn spawn<R: BufRead + Send + 'static>(reader: R) -> Self {
        let (tx, rx) = channel::bounded(READ_AHEAD);
        thread::spawn(move || {
            // Raw bytes: a line that is not valid UTF-8 is rejected downstream as malformed
            for line in reader.split(b'\n') {
                let mut line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!("Stopped reading input: {}", e);
                        break;
                    }
                };
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
            tracing::debug!("Input reader reached end of stream");
        });
        Self { rx }
    }
}

impl EventSource for LineSource {
    fn poll(&mut self, timeout: Duration) -> PipelineResult<Polled> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Ok(Polled::Message(line)),
            Err(RecvTimeoutError::Timeout) => Ok(Polled::Idle),
            Err(RecvTimeoutError::Disconnected) => Ok(Polled::Exhausted),
        }
    }
}

/// Writes each payload as one line. The key is not part of the output.
pub struct LineSink<W: Write + Send> {
    out: Mutex<W>,
}

impl LineSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> LineSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }
}

#[cfg(test)]
impl<W: Write + Send> LineSink<W> {
    fn into_inner(self) -> Option<W> {
        self.out.into_inner().ok()
    }
}

impl<W: Write + Send> RecordSink for LineSink<W> {
    fn publish(&self, _key: &str, payload: &[u8]) -> PipelineResult<()> {
        let mut out = self
            .out
            .lock()
            .map_err(|_| PipelineError::Publish("output lock poisoned".into()))?;
        out.write_all(payload)
            .and_then(|_| out.write_all(b"\n"))
            .and_then(|_| out.flush())
            .map_err(|e| PipelineError::Publish(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_lines_then_exhausted() {
        let input = Cursor::new(b"{\"id\":\"a\"}\n\n{\"id\":\"b\"}\n".to_vec());
        let mut source = LineSource::spawn(input);
        let timeout = Duration::from_secs(1);

        assert_eq!(source.poll(timeout).unwrap(), Polled::Message(br#"{"id":"a"}"#.to_vec()));
        assert_eq!(source.poll(timeout).unwrap(), Polled::Message(br#"{"id":"b"}"#.to_vec()));
        assert_eq!(source.poll(timeout).unwrap(), Polled::Exhausted);
    }

    #[test]
    fn test_invalid_utf8_line_does_not_end_input() {
        let input = Cursor::new(b"{\"id\":\"a\"}\n\xff\xfe garbage\r\n{\"id\":\"b\"}\n".to_vec());
        let mut source = LineSource::spawn(input);
        let timeout = Duration::from_secs(1);

        assert_eq!(source.poll(timeout).unwrap(), Polled::Message(br#"{"id":"a"}"#.to_vec()));
        assert_eq!(source.poll(timeout).unwrap(), Polled::Message(b"\xff\xfe garbage".to_vec()));
        assert_eq!(source.poll(timeout).unwrap(), Polled::Message(br#"{"id":"b"}"#.to_vec()));
        assert_eq!(source.poll(timeout).unwrap(), Polled::Exhausted);
    }

    #[test]
    fn test_sink_writes_one_line_per_record() {
        let sink = LineSink::new(Vec::new());
        sink.publish("cam-1", br#"{"camera_id":"cam-1"}"#).unwrap();
        sink.publish("cam-2", br#"{"camera_id":"cam-2"}"#).unwrap();
        let written = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(written, "{\"camera_id\":\"cam-1\"}\n{\"camera_id\":\"cam-2\"}\n");
    }
}
