use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tokio::sync::broadcast;

const MIN_BROADCAST_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Logs,
    Guard,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Logs => "logs",
            Self::Guard => "guard",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "logs" => Some(Self::Logs),
            "guard" => Some(Self::Guard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEvent {
    pub run_id: String,
    pub channel: Channel,
    pub seq: u64,
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: i64,
    pub payload: Value,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("run {run_id} already has {limit} open stream connections")]
    Capacity { run_id: String, limit: u32 },
    #[error("no event stream for run {0}")]
    UnknownRun(String),
    #[error("malformed event id: {0}")]
    MalformedEventId(String),
    #[error("stream {0} is closed")]
    Closed(String),
    #[error("stream state lock poisoned")]
    Poisoned,
}

impl StreamError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Capacity { .. } => "STREAM_CAPACITY_EXCEEDED",
            Self::UnknownRun(_) => "RUN_NOT_FOUND",
            Self::MalformedEventId(_) => "INVALID_LAST_EVENT_ID",
            Self::Closed(_) => "STREAM_CLOSED",
            Self::Poisoned => "STORE_LOCK_ERROR",
        }
    }
}

pub fn event_id(run_id: &str, channel: Channel, seq: u64) -> String {
    format!("{run_id}:{}:{seq}", channel.as_str())
}

/// Inverse of [`event_id`]. Run ids may contain ':' so the split is from
/// the right.
pub fn parse_event_id(raw: &str) -> Result<(String, Channel, u64), StreamError> {
    let malformed = || StreamError::MalformedEventId(raw.to_string());
    let mut parts = raw.rsplitn(3, ':');
    let seq = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|s| *s > 0)
        .ok_or_else(malformed)?;
    let channel = parts.next().and_then(Channel::parse).ok_or_else(malformed)?;
    let run_id = parts.next().filter(|r| !r.is_empty()).ok_or_else(malformed)?;
    Ok((run_id.to_string(), channel, seq))
}

#[derive(Debug)]
struct ChannelLog {
    last_seq: u64,
    buffer: VecDeque<StreamEvent>,
    sender: Option<broadcast::Sender<StreamEvent>>,
}

impl ChannelLog {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(MIN_BROADCAST_CAPACITY));
        Self {
            last_seq: 0,
            buffer: VecDeque::new(),
            sender: Some(sender),
        }
    }
}

#[derive(Debug)]
struct RunChannels {
    logs: Mutex<ChannelLog>,
    guard: Mutex<ChannelLog>,
}

impl RunChannels {
    fn log(&self, channel: Channel) -> Result<MutexGuard<'_, ChannelLog>, StreamError> {
        let log = match channel {
            Channel::Logs => &self.logs,
            Channel::Guard => &self.guard,
        };
        log.lock().map_err(|_| StreamError::Poisoned)
    }
}

/// Replay events followed by the live feed, obtained atomically so the
/// two never overlap or leave a gap.
#[derive(Debug)]
pub struct Subscription {
    pub replay: Vec<StreamEvent>,
    pub live: Option<broadcast::Receiver<StreamEvent>>,
    /// Highest seq already handed to this subscriber.
    pub cursor: u64,
}

/// Per (run, channel) sequence writer with a bounded replay buffer.
#[derive(Debug)]
pub struct Sequencer {
    buffer_capacity: usize,
    replay_window: u64,
    runs: RwLock<HashMap<String, Arc<RunChannels>>>,
}

impl Sequencer {
    pub fn new(buffer_capacity: usize, replay_window: u64) -> Self {
        Self {
            buffer_capacity: buffer_capacity.max(1),
            replay_window: replay_window.max(1),
            runs: RwLock::new(HashMap::new()),
        }
    }

    pub fn open_run(&self, run_id: &str) -> Result<(), StreamError> {
        let mut runs = self.runs.write().map_err(|_| StreamError::Poisoned)?;
        runs.entry(run_id.to_string()).or_insert_with(|| {
            Arc::new(RunChannels {
                logs: Mutex::new(ChannelLog::new(self.buffer_capacity)),
                guard: Mutex::new(ChannelLog::new(self.buffer_capacity)),
            })
        });
        Ok(())
    }

    pub fn publish(
        &self,
        run_id: &str,
        channel: Channel,
        event_type: &str,
        payload: Value,
    ) -> Result<StreamEvent, StreamError> {
        let run = self.run(run_id)?;
        let mut log = run.log(channel)?;
        let Some(sender) = log.sender.clone() else {
            return Err(StreamError::Closed(format!("{run_id}:{}", channel.as_str())));
        };

        let seq = log.last_seq + 1;
        let event = StreamEvent {
            run_id: run_id.to_string(),
            channel,
            seq,
            event_id: event_id(run_id, channel, seq),
            event_type: event_type.to_string(),
            timestamp: Utc::now().timestamp_millis(),
            payload,
        };
        log.last_seq = seq;
        log.buffer.push_back(event.clone());
        while log.buffer.len() > self.buffer_capacity {
            log.buffer.pop_front();
        }
        // No receivers is fine; the buffer still serves later subscribers.
        let _ = sender.send(event.clone());
        Ok(event)
    }

    pub fn subscribe(
        &self,
        run_id: &str,
        channel: Channel,
        last_event_id: Option<&str>,
    ) -> Result<Subscription, StreamError> {
        let resume_from = match last_event_id {
            Some(raw) => {
                let (id_run, id_channel, seq) = parse_event_id(raw)?;
                (id_run == run_id && id_channel == channel).then_some(seq)
            }
            None => None,
        };

        let run = self.run(run_id)?;
        let log = run.log(channel)?;
        let start = match resume_from {
            Some(seq) => seq.saturating_add(1),
            None => log.last_seq.saturating_sub(self.replay_window) + 1,
        };
        let replay = log
            .buffer
            .iter()
            .filter(|e| e.seq >= start)
            .cloned()
            .collect::<Vec<_>>();
        let cursor = replay
            .last()
            .map(|e| e.seq)
            .unwrap_or_else(|| start.saturating_sub(1).min(log.last_seq));
        let live = log.sender.as_ref().map(broadcast::Sender::subscribe);
        Ok(Subscription {
            replay,
            live,
            cursor,
        })
    }

    /// Buffered events after `seq`, used to recover a lagged receiver.
    pub fn events_after(&self, run_id: &str, channel: Channel, seq: u64) -> Result<Vec<StreamEvent>, StreamError> {
        let run = self.run(run_id)?;
        let log = run.log(channel)?;
        Ok(log.buffer.iter().filter(|e| e.seq > seq).cloned().collect())
    }

    pub fn latest_seq(&self, run_id: &str, channel: Channel) -> Result<u64, StreamError> {
        let run = self.run(run_id)?;
        let log = run.log(channel)?;
        Ok(log.last_seq)
    }

    /// Drops the senders so live receivers drain and then see `Closed`.
    pub fn close_run(&self, run_id: &str) -> Result<(), StreamError> {
        let run = self.run(run_id)?;
        for channel in [Channel::Logs, Channel::Guard] {
            run.log(channel)?.sender = None;
        }
        Ok(())
    }

    pub fn evict_run(&self, run_id: &str) {
        if let Ok(mut runs) = self.runs.write() {
            runs.remove(run_id);
        }
    }

    fn run(&self, run_id: &str) -> Result<Arc<RunChannels>, StreamError> {
        let runs = self.runs.read().map_err(|_| StreamError::Poisoned)?;
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| StreamError::UnknownRun(run_id.to_string()))
    }
}
