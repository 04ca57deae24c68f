//! In-memory transport
//!
//! Records every job and notice instead of sending it. Used for dry runs
//! and tests; failures can be scripted per destination channel.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{OutboundJob, Transport, TransportError, TransportResult};
use crate::models::Destination;

#[derive(Debug, Default)]
struct Recorded {
    jobs: Vec<OutboundJob>,
    notices: Vec<(Destination, String)>,
    scripted: HashMap<String, VecDeque<TransportError>>,
}

/// Transport that remembers instead of sending
#[derive(Debug, Default)]
pub struct RecordingTransport {
    recorded: Mutex<Recorded>,
    foreign_guilds: HashSet<String>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat destinations in these guilds as owned by another process
    pub fn with_foreign_guilds<I, S>(mut self, guilds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.foreign_guilds.extend(guilds.into_iter().map(Into::into));
        self
    }

    /// Make the next send to `channel` fail with `error`
    pub fn fail_next(&self, channel: impl Into<String>, error: TransportError) {
        if let Ok(mut recorded) = self.recorded.lock() {
            recorded
                .scripted
                .entry(channel.into())
                .or_default()
                .push_back(error);
        }
    }

    /// Jobs accepted so far, in send order
    pub fn jobs(&self) -> Vec<OutboundJob> {
        self.recorded
            .lock()
            .map(|r| r.jobs.clone())
            .unwrap_or_default()
    }

    /// Jobs accepted for one channel, in send order
    pub fn jobs_for(&self, channel: &str) -> Vec<OutboundJob> {
        self.jobs()
            .into_iter()
            .filter(|j| j.destination.channel == channel)
            .collect()
    }

    /// Notices sent so far
    pub fn notices(&self) -> Vec<(Destination, String)> {
        self.recorded
            .lock()
            .map(|r| r.notices.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, job: &OutboundJob) -> TransportResult<()> {
        let mut recorded = self
            .recorded
            .lock()
            .map_err(|_| TransportError::Http("recording transport poisoned".to_string()))?;
        if let Some(error) = recorded
            .scripted
            .get_mut(&job.destination.channel)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        tracing::info!(
            destination = %job.destination.channel,
            item_id = %job.metadata.item_id,
            chunks = job.chunks.len(),
            "Recorded delivery"
        );
        recorded.jobs.push(job.clone());
        Ok(())
    }

    async fn send_notice(&self, destination: &Destination, text: &str) -> TransportResult<()> {
        let mut recorded = self
            .recorded
            .lock()
            .map_err(|_| TransportError::Http("recording transport poisoned".to_string()))?;
        recorded.notices.push((destination.clone(), text.to_string()));
        Ok(())
    }

    fn owns(&self, destination: &Destination) -> bool {
        !self.foreign_guilds.contains(&destination.guild_id)
    }
}
