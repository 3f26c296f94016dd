use super::Sink;
use crate::errors::StreamerResult;
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

/// Writes one JSON line per event to stdout. The default sink, and the
/// one every other sink's tests can fall back on without any external
/// service running.
pub struct StdoutSink {
    out: Mutex<Stdout>,
}

impl StdoutSink {
    pub fn new() -> Self {
        StdoutSink { out: Mutex::new(tokio::io::stdout()) }
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn start(&self) -> StreamerResult<()> {
        Ok(())
    }

    async fn stop(&self) -> StreamerResult<()> {
        let mut out = self.out.lock().await;
        out.flush().await.map_err(Into::into)
    }

    async fn emit(&self, topic: &str, key: &str, payload: &[u8]) -> StreamerResult<()> {
        let line = format!("{{\"topic\":\"{topic}\",\"key\":\"{key}\",\"payload\":{}}}\n", String::from_utf8_lossy(payload));
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_stop_emit_do_not_error() {
        let sink = StdoutSink::new();
        sink.start().await.unwrap();
        sink.emit("public.metrics", "public.metrics", br#"{"id":1}"#).await.unwrap();
        sink.stop().await.unwrap();
    }
}
