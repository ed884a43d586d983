use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::engine::EngineResult;
use crate::models::{CoreError, CoreErrorKind};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EngineEvent {
    pub name: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
struct CompletionPayload {
    #[serde(rename = "isSuccess", default)]
    is_success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

impl EngineEvent {
    pub fn payload(&self) -> serde_json::Value {
        serde_json::from_str(&self.data).unwrap_or(serde_json::Value::Null)
    }

    /// Interprets a `*Finished` acknowledgement carrying `isSuccess`/`message`/`data`.
    pub fn completion(&self) -> EngineResult<serde_json::Value> {
        let payload: CompletionPayload = serde_json::from_str(&self.data).map_err(|error| {
            CoreError::new(
                CoreErrorKind::ParseFailure,
                format!("malformed '{}' event payload: {error}", self.name),
            )
        })?;

        if payload.is_success {
            Ok(payload.data)
        } else {
            Err(CoreError::new(
                CoreErrorKind::EngineFailure,
                payload
                    .message
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| format!("{} reported failure", self.name)),
            ))
        }
    }
}

/// Line-oriented `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (without its terminator); returns an event when a blank line
    /// closes one.
    pub fn push_line(&mut self, line: &str) -> Option<EngineEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                return None;
            }
            let name = self.event.take().unwrap_or_else(|| "message".to_string());
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(EngineEvent { name, data });
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

/// Fan-out of engine events read from the long-lived event stream.
#[derive(Clone)]
pub struct EngineEventHub {
    sender: broadcast::Sender<EngineEvent>,
    stopped: Arc<AtomicBool>,
}

impl Default for EngineEventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineEventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Starts a background reader that keeps the stream at `url` connected, reconnecting
    /// with exponential backoff until [`EngineEventHub::stop`] is called.
    pub fn spawn_reader(&self, agent: ureq::Agent, url: String) -> std::io::Result<()> {
        let hub = self.clone();
        std::thread::Builder::new()
            .name("meshq-engine-events".to_string())
            .spawn(move || hub.read_loop(&agent, &url))
            .map(|_| ())
    }

    fn read_loop(&self, agent: &ureq::Agent, url: &str) {
        let mut delay = RECONNECT_INITIAL_DELAY;

        while !self.is_stopped() {
            match agent.get(url).call() {
                Ok(response) => {
                    tracing::info!(url, "connected to engine event stream");
                    delay = RECONNECT_INITIAL_DELAY;
                    self.pump(BufReader::new(response.into_reader()));
                }
                Err(error) => {
                    tracing::debug!(url, message = %error, "engine event stream unavailable");
                }
            }

            if self.is_stopped() {
                break;
            }
            std::thread::sleep(delay);
            delay = (delay * 2).min(RECONNECT_MAX_DELAY);
        }
    }

    fn pump(&self, reader: impl BufRead) {
        let mut parser = SseParser::new();
        for line in reader.lines() {
            if self.is_stopped() {
                return;
            }
            match line {
                Ok(line) => {
                    if let Some(event) = parser.push_line(&line) {
                        tracing::trace!(event = %event.name, "engine event");
                        self.publish(event);
                    }
                }
                Err(error) => {
                    tracing::warn!(message = %error, "engine event stream interrupted");
                    return;
                }
            }
        }
    }
}

/// Waits for the next event named `name` on an already-subscribed receiver.
pub async fn next_event(
    receiver: &mut broadcast::Receiver<EngineEvent>,
    name: &str,
    timeout: Option<Duration>,
) -> EngineResult<EngineEvent> {
    let wait = async {
        loop {
            match receiver.recv().await {
                Ok(event) if event.name == name => return Ok(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(event = name, skipped, "engine event receiver lagged");
                }
                Err(RecvError::Closed) => {
                    return Err(CoreError::new(
                        CoreErrorKind::EngineUnavailable,
                        "engine event stream closed",
                    ));
                }
            }
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
            CoreError::new(
                CoreErrorKind::Timeout,
                format!("timed out after {}ms waiting for '{name}'", limit.as_millis()),
            )
        })?,
        None => wait.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_emits_named_event_on_blank_line() {
        let mut parser = SseParser::new();
        assert_eq!(parser.push_line("event: OpenFinished"), None);
        assert_eq!(parser.push_line("data: {\"isSuccess\":true}"), None);

        let event = parser.push_line("").unwrap();
        assert_eq!(event.name, "OpenFinished");
        assert_eq!(event.data, "{\"isSuccess\":true}");
    }

    #[test]
    fn parser_joins_multi_line_data_and_skips_comments() {
        let mut parser = SseParser::new();
        parser.push_line(": keep-alive");
        parser.push_line("data: first");
        parser.push_line("data:second\r");

        let event = parser.push_line("\r").unwrap();
        assert_eq!(event.name, "message");
        assert_eq!(event.data, "first\nsecond");
    }

    #[test]
    fn blank_lines_without_fields_do_not_emit() {
        let mut parser = SseParser::new();
        assert_eq!(parser.push_line(""), None);
        assert_eq!(parser.push_line(""), None);
    }

    #[test]
    fn completion_reports_engine_message_on_failure() {
        let event = EngineEvent {
            name: "SaveFinished".to_string(),
            data: r#"{"isSuccess":false,"message":"Disk full"}"#.to_string(),
        };
        let error = event.completion().unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::EngineFailure);
        assert_eq!(error.message, "Disk full");
    }

    #[tokio::test]
    async fn next_event_skips_unrelated_events() {
        let hub = EngineEventHub::new();
        let mut receiver = hub.subscribe();
        hub.publish(EngineEvent {
            name: "Progress".to_string(),
            data: "{}".to_string(),
        });
        hub.publish(EngineEvent {
            name: "BuildFinished".to_string(),
            data: r#"{"result":"Success"}"#.to_string(),
        });

        let event = next_event(&mut receiver, "BuildFinished", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(event.payload()["result"], "Success");
    }

    #[tokio::test]
    async fn next_event_times_out() {
        let hub = EngineEventHub::new();
        let mut receiver = hub.subscribe();
        let error = next_event(&mut receiver, "OpenFinished", Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(error.kind, CoreErrorKind::Timeout);
    }
}
