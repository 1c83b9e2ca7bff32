//! Emulator session loop.
//!
//! Consumes transport bytes, reassembles them into request frames, feeds
//! each decoded request to the dispatcher, and writes the encoded response
//! back with a trailing newline. This is the only component that touches
//! the transport or the registry, and it runs on its own thread until the
//! shutdown flag flips.
//!
//! Framing: a frame is a newline-terminated line. With `lenient_framing`
//! enabled, a buffer holding the message-start delimiter but no newline is
//! additionally consumed whole, for peers that omit the terminator; that
//! mode can truncate a request still in flight, which is why it is opt-in.

use crate::handler::{dispatch, Versions};
use crate::protocol::{decode, encode, Response, Value};
use crate::registry::Registry;
use crate::synth::ReadingSource;
use crate::transport::Transport;
use bytes::BytesMut;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Idle wait between transport polls.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Reassembly buffer cap; a bufferful with no frame boundary is dropped.
const MAX_BUFFER: usize = 16 * 1024;

pub struct SessionLoop {
    transport: Box<dyn Transport>,
    registry: Registry,
    source: Box<dyn ReadingSource>,
    versions: Versions,
    lenient_framing: bool,
    buffer: BytesMut,
}

impl SessionLoop {
    pub fn new(
        transport: Box<dyn Transport>,
        registry: Registry,
        source: Box<dyn ReadingSource>,
        versions: Versions,
        lenient_framing: bool,
    ) -> Self {
        Self {
            transport,
            registry,
            source,
            versions,
            lenient_framing,
            buffer: BytesMut::with_capacity(MAX_BUFFER),
        }
    }

    /// Serve until `shutdown` flips true.
    ///
    /// Per-iteration faults (unreadable bytes, transport hiccups) are logged
    /// and the loop keeps serving; only the transport open, which happens
    /// before the loop starts, can fail the process.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        debug!("session loop started");
        while !shutdown.load(Ordering::SeqCst) {
            match self.transport.read_available() {
                Ok(data) if !data.is_empty() => {
                    self.buffer.extend_from_slice(&data);
                    self.drain_frames();
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "transport read failed"),
            }
            thread::sleep(POLL_INTERVAL);
        }
        debug!("session loop stopped");
    }

    /// Close the underlying transport. Called by the controlling thread
    /// after the loop has exited.
    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Process every complete frame currently buffered.
    fn drain_frames(&mut self) {
        while let Some(frame) = take_frame(&mut self.buffer, self.lenient_framing) {
            let line = frame.trim();
            if !line.starts_with('?') {
                if !line.is_empty() {
                    debug!(line, "discarding frame without message delimiter");
                }
                continue;
            }

            trace!(line, "request received");
            let response = match decode(line) {
                Ok(request) => dispatch(
                    &request,
                    &mut self.registry,
                    self.source.as_mut(),
                    &self.versions,
                ),
                Err(e) => {
                    warn!(error = %e, "undecodable request");
                    malformed_response()
                }
            };

            let mut wire = encode(&response);
            trace!(line = %wire, "response sent");
            wire.push('\n');
            if let Err(e) = self.transport.write(wire.as_bytes()) {
                warn!(error = %e, "transport write failed");
            }
        }

        if self.buffer.len() > MAX_BUFFER {
            warn!(
                dropped = self.buffer.len(),
                "reassembly buffer overflow, discarding"
            );
            self.buffer.clear();
        }
    }
}

/// Failure response for a frame addressed to the emulator that decoded to
/// nothing usable.
fn malformed_response() -> Response {
    Response::from([
        ("status".to_string(), Value::Text("0".to_string())),
        ("error".to_string(), Value::Text("Malformed message".to_string())),
    ])
}

/// Pull the next frame out of the buffer, newline framing first.
fn take_frame(buffer: &mut BytesMut, lenient: bool) -> Option<String> {
    if let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let frame = buffer.split_to(pos + 1);
        return Some(String::from_utf8_lossy(&frame[..pos]).into_owned());
    }

    if lenient && !buffer.is_empty() && buffer.contains(&b'?') {
        let len = buffer.len();
        let frame = buffer.split_to(len);
        return Some(String::from_utf8_lossy(&frame).into_owned());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::default_catalog;
    use crate::synth::Passthrough;
    use crate::transport::TransportError;
    use std::sync::{Arc, Mutex};

    /// In-memory transport: scripted incoming chunks, captured output.
    struct MockTransport {
        incoming: Vec<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl MockTransport {
        fn new(chunks: &[&[u8]]) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let transport = Self {
                incoming: chunks.iter().rev().map(|c| c.to_vec()).collect(),
                written: Arc::clone(&written),
            };
            (transport, written)
        }
    }

    impl Transport for MockTransport {
        fn open(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
            Ok(self.incoming.pop().unwrap_or_default())
        }

        fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn versions() -> Versions {
        Versions {
            api: "1.2".to_string(),
            db: "1.0.0".to_string(),
        }
    }

    fn session(chunks: &[&[u8]], lenient: bool) -> (SessionLoop, Arc<Mutex<Vec<u8>>>) {
        let (transport, written) = MockTransport::new(chunks);
        let session = SessionLoop::new(
            Box::new(transport),
            Registry::new(default_catalog()),
            Box::new(Passthrough),
            versions(),
            lenient,
        );
        (session, written)
    }

    fn output(written: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8(written.lock().unwrap().clone()).unwrap()
    }

    /// Feed one chunk through the reassembly + dispatch path.
    fn feed(session: &mut SessionLoop, chunk: &[u8]) {
        session.buffer.extend_from_slice(chunk);
        session.drain_frames();
    }

    #[test]
    fn test_complete_line_round_trip() {
        let (mut session, written) = session(&[], false);
        feed(
            &mut session,
            b"?type=INIT&app=Test&db=1.0.0&api=1.2\n",
        );

        let out = output(&written);
        assert!(out.starts_with("?status=1&message="), "got: {out}");
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn test_chunked_arrival_waits_for_newline() {
        let (mut session, written) = session(&[], false);

        feed(&mut session, b"?type=INIT&app=Test");
        assert!(output(&written).is_empty());

        feed(&mut session, b"&db=1.0.0&api=1.2\n");
        assert!(output(&written).starts_with("?status=1"));
    }

    #[test]
    fn test_lenient_mode_consumes_unterminated_buffer() {
        let (mut session, written) = session(&[], true);
        feed(&mut session, b"?type=INIT&app=Test&db=1.0.0&api=1.2");

        assert!(output(&written).starts_with("?status=1"));
    }

    #[test]
    fn test_lenient_mode_truncation_hazard() {
        // The documented cost of lenient framing: a partial request that
        // already contains the delimiter is consumed as-is.
        let (mut session, written) = session(&[], true);
        feed(&mut session, b"?type=INIT&app=Te");

        // The half-request was processed (and failed), not held for more.
        assert!(output(&written).starts_with("?status=0"));
        assert!(session.buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let (mut session, written) = session(&[], false);
        feed(
            &mut session,
            b"?type=INIT&app=Test&db=1.0.0&api=1.2\n?type=CONNECT&id=sensor_001&pin=4\n",
        );

        let out = output(&written);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("?status=1&message="));
        assert_eq!(lines[1], "?status=1&id=sensor_001&pin=4");
    }

    #[test]
    fn test_frames_without_delimiter_discarded() {
        let (mut session, written) = session(&[], false);
        feed(&mut session, b"noise\n\n  \n?type=RESET&id=all\n");

        // Only the addressed frame got an answer (gated, but answered).
        let out = output(&written);
        assert_eq!(out.lines().count(), 1);
        assert!(out.starts_with("?status=0&error=Protocol not initialized"));
    }

    #[test]
    fn test_malformed_frame_answered() {
        let (mut session, written) = session(&[], false);
        feed(&mut session, b"?garbage\n");

        assert_eq!(output(&written), "?status=0&error=Malformed message\n");
    }

    #[test]
    fn test_crlf_line_endings_accepted() {
        let (mut session, written) = session(&[], false);
        feed(&mut session, b"?type=INIT&app=Test&db=1.0.0&api=1.2\r\n");

        assert!(output(&written).starts_with("?status=1"));
    }

    #[test]
    fn test_session_state_carries_across_frames() {
        let (mut session, written) = session(&[], false);
        feed(&mut session, b"?type=CONNECT&id=sensor_001&pin=4\n");
        feed(&mut session, b"?type=INIT&app=T&db=1.0.0&api=1.2\n");
        feed(&mut session, b"?type=CONNECT&id=sensor_001&pin=4\n");
        feed(&mut session, b"?type=DISCONNECT&id=sensor_001\n");

        let out = output(&written);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("Protocol not initialized"));
        assert!(lines[1].starts_with("?status=1&message="));
        assert_eq!(lines[2], "?status=1&id=sensor_001&pin=4");
        assert_eq!(lines[3], "?status=1&id=sensor_001&pin=4");
    }

    #[test]
    fn test_buffer_overflow_discarded() {
        let (mut session, written) = session(&[], false);
        let junk = vec![b'x'; MAX_BUFFER + 1];
        feed(&mut session, &junk);

        assert!(session.buffer.is_empty());
        assert!(output(&written).is_empty());
    }

    #[test]
    fn test_run_stops_on_shutdown_flag() {
        let (session, _written) = session(&[b"?type=RESET&id=all\n"], false);
        let mut session = session;
        let shutdown = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            session.run(&flag);
        });

        std::thread::sleep(Duration::from_millis(50));
        shutdown.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert!(handle.is_finished());
        handle.join().unwrap();
    }

    #[test]
    fn test_take_frame_strict() {
        let mut buffer = BytesMut::from(&b"?a=1\nrest"[..]);
        assert_eq!(take_frame(&mut buffer, false).unwrap(), "?a=1");
        assert_eq!(&buffer[..], b"rest");
        assert!(take_frame(&mut buffer, false).is_none());
    }

    #[test]
    fn test_take_frame_lenient_needs_delimiter() {
        let mut buffer = BytesMut::from(&b"noise"[..]);
        assert!(take_frame(&mut buffer, true).is_none());

        let mut buffer = BytesMut::from(&b"?a=1"[..]);
        assert_eq!(take_frame(&mut buffer, true).unwrap(), "?a=1");
        assert!(buffer.is_empty());
    }
}
