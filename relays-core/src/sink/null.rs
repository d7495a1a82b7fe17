use bytes::Bytes;
use tracing::info;

use super::{Outcome, Rejection, encode_json};
use crate::event::Event;

/// Accepts everything. Useful to watch the event stream in the logs.
#[derive(Debug, Clone, Default)]
pub struct NullSink;

impl NullSink {
    pub(super) fn prepare(&self, event: &Event) -> Result<Bytes, Rejection> {
        encode_json(&event.flatten())
    }

    pub(super) fn send(&self, payload: &Bytes) -> Outcome {
        info!(event = %String::from_utf8_lossy(payload), "Discarding event in null sink");
        Outcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::test_utils::sample_event;

    #[test]
    fn test_null_sink() {
        let payload = NullSink.prepare(&sample_event()).unwrap();
        let flat: std::collections::BTreeMap<String, String> =
            serde_json::from_slice(&payload).unwrap();
        assert_eq!(flat["application"], "app");
        assert_eq!(NullSink.send(&payload), Outcome::Success);
    }
}
