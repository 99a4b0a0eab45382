//! Ingest: SRT listener whose received TS is demuxed and published on the bus

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tsbridge_srt::{
    relay, EndpointOptions, EndpointStatsSnapshot, MonitorStatus, RelayEvent, RelayReceiver,
    SrtEndpoint, SrtLibrary,
};

use crate::bus::{BusError, MediaBus};
use crate::error::SessionError;
use crate::media::MediaEvent;
use crate::metrics::{global_metrics, BridgeMetrics};
use crate::ts::{TsDemuxer, TsReader};

enum Step {
    Shutdown,
    Pumped(bool),
    Health,
}

pub struct IngestSession {
    stream: String,
    endpoint: SrtEndpoint,
    relay: RelayReceiver,
    demuxer: Box<dyn TsDemuxer>,
    metrics: Arc<BridgeMetrics>,
    /// How often `run` checks the monitor and the subscribers
    health_interval: Duration,
    /// Peer of the most recent caller
    caller: Option<SocketAddr>,
    published: bool,
    stopped: bool,
}

impl IngestSession {
    /// Listen on `host`, publish `stream` and start relaying callers' TS
    pub fn start(
        stream: &str,
        host: &str,
        options: EndpointOptions,
        library: Arc<SrtLibrary>,
        bus: &mut MediaBus,
    ) -> Result<Self, SessionError> {
        let health_interval = options.poll_interval;
        let (sender, receiver) = relay();
        let endpoint = SrtEndpoint::listener(library, options, Arc::new(sender));
        endpoint.open(host)?;
        endpoint.connect()?;
        bus.publish(stream)?;

        let metrics = global_metrics();
        metrics.session_started();
        tracing::info!(stream = %stream, host = %host, "ingest session started");

        Ok(Self {
            stream: stream.to_string(),
            endpoint,
            relay: receiver,
            demuxer: Box::new(TsReader::new()),
            metrics,
            health_interval,
            caller: None,
            published: true,
            stopped: false,
        })
    }

    /// Replace the default TS demuxer
    pub fn with_demuxer(mut self, demuxer: Box<dyn TsDemuxer>) -> Self {
        self.demuxer = demuxer;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn endpoint_stats(&self) -> EndpointStatsSnapshot {
        self.endpoint.stats()
    }

    pub fn monitor_status(&self) -> MonitorStatus {
        self.endpoint.monitor_status()
    }

    pub fn caller(&self) -> Option<SocketAddr> {
        self.caller
    }

    /// Listener and subscriber health; the first fatal condition wins
    pub fn check_health(&self, bus: &MediaBus) -> Result<(), SessionError> {
        if let MonitorStatus::Failed(reason) = self.endpoint.monitor_status() {
            return Err(SessionError::MonitorFailed(reason));
        }
        check_subscribers(bus)
    }

    /// Demux one relay event and dispatch the result; returns the number of
    /// media events produced
    pub fn handle(&mut self, event: RelayEvent, bus: &mut MediaBus) -> usize {
        let events = match event {
            RelayEvent::Caller(peer) => {
                let peer = SocketAddr::V4(peer);
                match self.caller.replace(peer) {
                    Some(old) if old != peer && self.published => {
                        bus.address_changed(&self.stream, old, peer)
                    }
                    _ => {}
                }
                return 0;
            }
            RelayEvent::Chunk(chunk) => {
                self.metrics.chunk_relayed(chunk.data().len());
                tracing::trace!(seq = chunk.seq(), len = chunk.data().len(), "chunk relayed");
                self.demuxer.read(chunk.data())
            }
            RelayEvent::Reset => {
                tracing::info!(stream = %self.stream, "caller gone, flushing demuxer");
                self.demuxer.flush()
            }
        };
        self.publish(&events, bus);
        events.len()
    }

    fn publish(&mut self, events: &[MediaEvent], bus: &mut MediaBus) {
        if !self.published || events.is_empty() {
            return;
        }
        for event in events {
            match bus.dispatch(&self.stream, event) {
                Ok(_) => {}
                Err(BusError::NotPublished(_)) => {
                    tracing::warn!(stream = %self.stream, "stream unpublished underneath ingest");
                    self.published = false;
                    return;
                }
                Err(e) => tracing::warn!(stream = %self.stream, error = %e, "dispatch failed"),
            }
        }
        self.metrics.frames_published(events.len());
    }

    /// Wait for the next relay event and handle it; `false` once the relay
    /// is closed
    pub async fn pump(&mut self, bus: &mut MediaBus) -> bool {
        match self.relay.recv().await {
            Some(event) => {
                self.handle(event, bus);
                true
            }
            None => false,
        }
    }

    /// Dispatcher loop until `shutdown` resolves or the listener fails
    pub async fn run<F>(&mut self, bus: &mut MediaBus, shutdown: F) -> Result<(), SessionError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut health = tokio::time::interval(self.health_interval);
        health.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                _ = &mut shutdown => Step::Shutdown,
                more = self.pump(bus) => Step::Pumped(more),
                _ = health.tick() => Step::Health,
            };
            match step {
                Step::Shutdown => {
                    tracing::info!(stream = %self.stream, "ingest shutdown requested");
                    return Ok(());
                }
                Step::Pumped(true) => {}
                Step::Pumped(false) => {
                    tracing::info!(stream = %self.stream, "relay closed");
                    return Ok(());
                }
                Step::Health => {
                    if let Err(e) = self.check_health(bus) {
                        tracing::error!(stream = %self.stream, error = %e, "ingest stopping on failure");
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Unpublish, close the listener and discard undelivered chunks;
    /// idempotent
    pub fn stop(&mut self, bus: &mut MediaBus) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if std::mem::take(&mut self.published) {
            if let Err(e) = bus.unpublish(&self.stream) {
                tracing::debug!(stream = %self.stream, error = %e, "unpublish on stop");
            }
        }
        self.endpoint.close();
        self.relay.close();
        while self.relay.try_recv().is_some() {}
        self.demuxer.flush();
        self.metrics.session_ended();

        let stats = self.endpoint.stats();
        tracing::info!(
            stream = %self.stream,
            accepted = stats.connections_accepted,
            chunks_received = stats.chunks_received,
            bytes_received = stats.bytes_received,
            "ingest session stopped"
        );
    }
}

/// Fatal subscriber failure on `bus`, if any
pub fn check_subscribers(bus: &MediaBus) -> Result<(), SessionError> {
    match bus.failed_subscriber() {
        Some((subscriber, stream, reason)) => Err(SessionError::SubscriberFailed {
            subscriber,
            stream: stream.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

impl std::fmt::Debug for IngestSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestSession")
            .field("stream", &self.stream)
            .field("endpoint", &self.endpoint)
            .field("caller", &self.caller)
            .field("published", &self.published)
            .field("stopped", &self.stopped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::rc::Rc;

    use bytes::{Bytes, BytesMut};
    use tsbridge_srt::mock::{MockInbound, MockSrt};

    use crate::media::{AudioCodec, AudioTag, MediaHandler};
    use crate::ts::{TsMuxer, TsWriter};

    fn options() -> EndpointOptions {
        EndpointOptions {
            poll_interval: Duration::from_millis(5),
            ..EndpointOptions::default()
        }
    }

    #[derive(Default)]
    struct Collector {
        events: Rc<RefCell<Vec<String>>>,
    }

    impl MediaHandler for Collector {
        fn on_event(&mut self, event: &MediaEvent) {
            self.events.borrow_mut().push(event.to_string());
        }

        fn on_address_changed(&mut self, old: SocketAddr, new: SocketAddr) {
            self.events.borrow_mut().push(format!("moved {old} -> {new}"));
        }
    }

    fn aac_stream() -> Vec<u8> {
        let mut writer = TsWriter::new();
        let mut out = BytesMut::new();
        writer.begin(&mut out);
        writer.write_audio(0, &AudioTag::config(AudioCodec::Aac, 0), &[0x12, 0x10], &mut out);
        writer.write_audio(0, &AudioTag::new(AudioCodec::Aac, 0), &[0x21; 64], &mut out);
        writer.write_audio(0, &AudioTag::new(AudioCodec::Aac, 23), &[0x22; 64], &mut out);
        out.to_vec()
    }

    #[tokio::test]
    async fn test_caller_stream_is_published_then_ended() {
        let mock = MockSrt::new();
        let stream = aac_stream();
        mock.queue_client(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 4000),
            stream
                .chunks(1316)
                .map(|c| MockInbound::Data(Bytes::copy_from_slice(c)))
                .collect(),
        );

        let library = SrtLibrary::new(mock.clone());
        let mut bus = MediaBus::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        bus.subscribe(
            "srtIn",
            Box::new(Collector {
                events: events.clone(),
            }),
        );

        let mut session =
            IngestSession::start("srtIn", "127.0.0.1:1234", options(), library, &mut bus).unwrap();
        assert!(bus.is_published("srtIn"));

        while !events.borrow().iter().any(|e| e == "end") {
            let more = tokio::time::timeout(Duration::from_secs(5), session.pump(&mut bus))
                .await
                .unwrap();
            assert!(more);
        }

        assert_eq!(
            *events.borrow(),
            vec![
                "audio Aac config t=0 (2 bytes)",
                "audio Aac t=0 (64 bytes)",
                "audio Aac t=23 (64 bytes)",
                "end",
            ]
        );
        assert!(session.endpoint_stats().chunks_received >= 1);

        session.stop(&mut bus);
        session.stop(&mut bus);
        assert!(!bus.is_published("srtIn"));
        assert_eq!(mock.open_sockets(), 0);
    }

    #[tokio::test]
    async fn test_new_caller_address_is_announced() {
        let mock = MockSrt::new();
        let first = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 4000);
        let second = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 10), 4000);
        for peer in [first, first, second] {
            mock.queue_client(
                peer,
                aac_stream()
                    .chunks(1316)
                    .map(|c| MockInbound::Data(Bytes::copy_from_slice(c)))
                    .collect(),
            );
        }

        let library = SrtLibrary::new(mock.clone());
        let mut bus = MediaBus::new();
        let events = Rc::new(RefCell::new(Vec::new()));
        bus.subscribe(
            "srtIn",
            Box::new(Collector {
                events: events.clone(),
            }),
        );
        let mut session =
            IngestSession::start("srtIn", "127.0.0.1:1234", options(), library, &mut bus).unwrap();

        while events.borrow().iter().filter(|e| *e == "end").count() < 3 {
            let more = tokio::time::timeout(Duration::from_secs(5), session.pump(&mut bus))
                .await
                .unwrap();
            assert!(more);
        }

        // Same peer reconnecting is not a change
        let moves: Vec<String> = events
            .borrow()
            .iter()
            .filter(|e| e.starts_with("moved"))
            .cloned()
            .collect();
        assert_eq!(moves, vec!["moved 10.0.0.9:4000 -> 10.0.0.10:4000"]);
        assert_eq!(session.caller(), Some(SocketAddr::V4(second)));
        session.stop(&mut bus);
    }

    #[test]
    fn test_run_returns_on_shutdown() {
        let mock = MockSrt::new();
        let library = SrtLibrary::new(mock.clone());
        let mut bus = MediaBus::new();
        let mut session =
            IngestSession::start("srtIn", "127.0.0.1:1234", options(), library, &mut bus).unwrap();

        let result = tokio_test::block_on(async {
            session
                .run(&mut bus, tokio::time::sleep(Duration::from_millis(20)))
                .await
        });
        tokio_test::assert_ok!(result);
        session.stop(&mut bus);
    }

    #[test]
    fn test_bind_failure_is_fatal() {
        let mock = MockSrt::new();
        mock.refuse_bind();
        let library = SrtLibrary::new(mock.clone());
        let mut bus = MediaBus::new();

        let result = IngestSession::start("srtIn", "127.0.0.1:1234", options(), library, &mut bus);
        assert!(matches!(result, Err(SessionError::Srt(_))));
        assert!(!bus.is_published("srtIn"));
        assert_eq!(mock.startups(), mock.cleanups());
    }

    #[test]
    fn test_double_publish_is_rejected() {
        let mock = MockSrt::new();
        let library = SrtLibrary::new(mock.clone());
        let mut bus = MediaBus::new();
        bus.publish("srtIn").unwrap();

        let result = IngestSession::start("srtIn", "127.0.0.1:1234", options(), library, &mut bus);
        assert!(matches!(
            result,
            Err(SessionError::Bus(BusError::AlreadyPublished(_)))
        ));
    }
}
