use futures_util::{StreamExt, stream};
use tokio::sync::oneshot;

use crate::{
    gate::types::{GateFragment, GateStream},
    inference::dispatcher::{DispatchFragment, DispatchStream},
};

/// Result of watching one full reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionReport {
    pub granted: bool,
    pub exhausted: bool,
    /// Everything the model said, with the marker removed.
    pub reply: String,
}

/// Watches streamed model text for the sentinel marker.
///
/// Fragments that carry the marker whole have it cut out before they are
/// forwarded. A marker split across fragments is still detected once the
/// reply is complete, but the pieces reach the caller unmodified.
#[derive(Debug, Clone)]
pub struct OutcomeDetector {
    marker: String,
    accumulated: String,
}

impl OutcomeDetector {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
            accumulated: String::new(),
        }
    }

    /// Records `fragment` and returns the text to forward, if any.
    pub fn observe(&mut self, fragment: &str) -> Option<String> {
        self.accumulated.push_str(fragment);

        if self.marker.is_empty() || !fragment.contains(self.marker.as_str()) {
            return Some(fragment.to_string());
        }

        let visible = fragment.replace(self.marker.as_str(), "");
        if visible.trim().is_empty() {
            None
        } else {
            Some(visible)
        }
    }

    pub fn granted(&self) -> bool {
        !self.marker.is_empty() && self.accumulated.contains(self.marker.as_str())
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    pub fn report(&self, exhausted: bool) -> DetectionReport {
        let reply = if self.marker.is_empty() {
            self.accumulated.clone()
        } else {
            self.accumulated.replace(self.marker.as_str(), "")
        };
        DetectionReport {
            granted: self.granted(),
            exhausted,
            reply: reply.trim_end().to_string(),
        }
    }

    /// Wraps a dispatch stream. The returned stream forwards visible text, the
    /// failure notice if dispatch gave up, and one `GateOpen` fragment after the
    /// reply when the marker was seen. The report is delivered only if the
    /// stream is driven to its end.
    pub fn attach(
        self,
        upstream: DispatchStream,
        gate_open_signal: impl Into<String>,
    ) -> (GateStream, oneshot::Receiver<DetectionReport>) {
        let (report_tx, report_rx) = oneshot::channel();
        let state = DetectState {
            upstream,
            detector: self,
            gate_open_signal: gate_open_signal.into(),
            report_tx: Some(report_tx),
            exhausted: false,
        };

        let stream = stream::unfold(state, |mut state| async move {
            loop {
                match state.upstream.next().await {
                    Some(DispatchFragment::Text(text)) => {
                        if let Some(visible) = state.detector.observe(&text) {
                            return Some((GateFragment::Text(visible), state));
                        }
                    }
                    Some(DispatchFragment::Exhausted(notice)) => {
                        state.exhausted = true;
                        return Some((GateFragment::Failure(notice), state));
                    }
                    None => {
                        let report_tx = state.report_tx.take()?;
                        let report = state.detector.report(state.exhausted);
                        let granted = report.granted;
                        let _ = report_tx.send(report);
                        if granted {
                            let signal = GateFragment::GateOpen(state.gate_open_signal.clone());
                            return Some((signal, state));
                        }
                        return None;
                    }
                }
            }
        });

        (Box::pin(stream), report_rx)
    }
}

struct DetectState {
    upstream: DispatchStream,
    detector: OutcomeDetector,
    gate_open_signal: String,
    report_tx: Option<oneshot::Sender<DetectionReport>>,
    exhausted: bool,
}
