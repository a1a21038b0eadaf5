//! Serial command surface.
//!
//! Bytes from the serial link accumulate into a bounded line buffer;
//! each newline-terminated line is parsed as one JSON document and
//! routed. Requests are exclusive — the first matching rule wins, in
//! the order laid out in [`CommandDispatcher::dispatch`].
//!
//! Overflowing lines are truncated: the surplus is dropped and the
//! eventual parse of the truncated text fails with the normal
//! `invalid command` reply, which is the designed safe-failure mode.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use heapless::Vec as BoundedVec;
use log::warn;
use serde_json::{json, Value};

use crate::config::store::ConfigStore;
use crate::control::heater::HeaterBank;
use crate::ports::{ProtocolOut, PwmChannelPort, SwitchBankPort, SystemPort};
use crate::power::{converter::VoltageConverter, PowerArbiter, ADJ};
use crate::sensors::{self, autodry::DryHandle, SharedCache};

/// Upper bound on one request line.
pub const MAX_LINE: usize = 4096;

// ── Line accumulator ──────────────────────────────────────────

#[derive(Default)]
pub struct LineBuffer {
    buf: BoundedVec<u8, MAX_LINE>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every line completed by this chunk
    /// (without the terminating newline).
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' {
                lines.push(self.buf.to_vec());
                self.buf.clear();
            } else {
                // A full buffer silently drops the surplus.
                let _ = self.buf.push(b);
            }
        }
        lines
    }
}

// ── Command dispatcher ────────────────────────────────────────

pub struct CommandDispatcher<S: SwitchBankPort, P: PwmChannelPort> {
    line: LineBuffer,
    config: Arc<ConfigStore>,
    cache: SharedCache,
    arbiter: Arc<PowerArbiter<S, P>>,
    converter: Arc<VoltageConverter<P>>,
    heaters: Arc<HeaterBank<P>>,
    dry: DryHandle,
}

impl<S: SwitchBankPort, P: PwmChannelPort> CommandDispatcher<S, P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigStore>,
        cache: SharedCache,
        arbiter: Arc<PowerArbiter<S, P>>,
        converter: Arc<VoltageConverter<P>>,
        heaters: Arc<HeaterBank<P>>,
        dry: DryHandle,
    ) -> Self {
        Self {
            line: LineBuffer::new(),
            config,
            cache,
            arbiter,
            converter,
            heaters,
            dry,
        }
    }

    /// Feed serial bytes, dispatching every completed line.
    pub fn feed(&mut self, bytes: &[u8], out: &ProtocolOut, system: &mut impl SystemPort) {
        for line in self.line.feed(bytes) {
            match core::str::from_utf8(&line) {
                Ok(text) => self.dispatch(text, out, system),
                Err(_) => out.send_line(r#"{"error":"invalid command"}"#),
            }
        }
    }

    /// Route one request line. Match order is part of the protocol
    /// contract; do not reorder.
    pub fn dispatch(&self, line: &str, out: &ProtocolOut, system: &mut impl SystemPort) {
        let doc: Value = match serde_json::from_str(line) {
            Ok(doc) => doc,
            Err(_) => {
                out.send_line(r#"{"error":"invalid command"}"#);
                return;
            }
        };

        let command = doc.get("command").and_then(Value::as_str);
        let get = doc.get("get").and_then(Value::as_str);

        if command == Some("reboot") {
            out.send_line(r#"{"status":"rebooting"}"#);
            // Give the host a chance to read the reply.
            thread::sleep(Duration::from_millis(100));
            system.restart();
        } else if command == Some("factory_reset") {
            out.send_line(r#"{"status":"performing factory reset"}"#);
            self.config.replace_with_defaults();
            thread::sleep(Duration::from_millis(100));
            system.restart();
        } else if command == Some("dry_sensor") {
            if !self.dry.request() {
                warn!("dry_sensor: cycle already in progress, request dropped");
            }
        } else if get == Some("status") {
            out.send_line(&self.arbiter.status().to_string());
        } else if let Some(set) = doc.get("set").filter(|v| v.is_object()) {
            self.arbiter.handle_set(set, out);
            out.send_line(&self.arbiter.status().to_string());
        } else if get == Some("config") {
            out.send_line(&self.config.to_wire().to_string());
        } else if get == Some("sensors") {
            let readings = self.cache.snapshot_blocking();
            let reply = sensors::to_wire(
                &readings,
                self.heaters.live_power(0),
                self.heaters.live_power(1),
            );
            out.send_line(&reply.to_string());
        } else if get == Some("version") {
            out.send_line(&json!({"version": env!("CARGO_PKG_VERSION")}).to_string());
        } else if let Some(sc) = doc.get("sc").filter(|v| v.is_object()) {
            let av_changed = sc.get("av").is_some();
            self.config.apply_patch(sc);
            out.send_line(&self.config.to_wire().to_string());

            // A new preset takes effect immediately if the converter is
            // already running.
            if av_changed && self.arbiter.output_on(ADJ) {
                self.converter
                    .set_state(true, self.config.snapshot().converter_preset_v);
            }
        } else {
            out.send_line(r#"{"error":"unknown command in valid JSON"}"#);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_lines_and_keeps_partial_tail() {
        let mut lb = LineBuffer::new();
        assert!(lb.feed(b"{\"get\":").is_empty());
        let lines = lb.feed(b"\"status\"}\n{\"a\":1}\n{\"part");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], b"{\"get\":\"status\"}");
        assert_eq!(lines[1], b"{\"a\":1}");
        let lines = lb.feed(b"ial\"}\n");
        assert_eq!(lines[0], b"{\"partial\"}");
    }

    #[test]
    fn overflow_truncates_line() {
        let mut lb = LineBuffer::new();
        let long = vec![b'x'; MAX_LINE + 500];
        assert!(lb.feed(&long).is_empty());
        let lines = lb.feed(b"\n");
        assert_eq!(lines[0].len(), MAX_LINE);

        // The buffer is usable again afterwards.
        let lines = lb.feed(b"ok\n");
        assert_eq!(lines[0], b"ok");
    }

    #[test]
    fn blank_line_is_a_complete_empty_line() {
        let mut lb = LineBuffer::new();
        let lines = lb.feed(b"\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].is_empty());
    }
}
