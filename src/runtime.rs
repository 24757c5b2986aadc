//! Wires the sources to the synchronizer.
//!
//! Every adapter thread posts onto one channel; the synchronizer consumes
//! it on the calling thread. The receive timeout doubles as the ALSA poll
//! timer.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::time::Instant;

use crate::config::Preferences;
use crate::graph::{CanvasProjection, GraphEvent, GraphSynchronizer};
use crate::sources::alsa::{self, AlsaTextAdapter};
use crate::sources::bus::{self, BusConfig, BusHandle};
use crate::sources::native::{self, NativeConfig, NativeHandle};
use crate::sources::{Backoff, BusEvent, EventNormalizer, SourceEvent};

pub struct Runtime<P: CanvasProjection> {
    normalizer: EventNormalizer,
    sync: GraphSynchronizer<P>,
    native: Option<NativeHandle>,
    bus: Option<BusHandle>,
    alsa_trigger: Option<SyncSender<()>>,
}

impl<P: CanvasProjection> Runtime<P> {
    pub fn new(prefs: &Preferences, projection: P) -> Self {
        Self {
            normalizer: EventNormalizer::new(prefs.port_alias_index),
            sync: GraphSynchronizer::new(projection),
            native: None,
            bus: None,
            alsa_trigger: None,
        }
    }

    #[cfg(test)]
    pub fn synchronizer(&self) -> &GraphSynchronizer<P> {
        &self.sync
    }

    /// Start every enabled adapter thread.
    fn start_sources(&mut self, prefs: &Preferences, tx: &Sender<SourceEvent>) {
        let backoff = Backoff::new(
            prefs.reconnect_initial_backoff_ms,
            prefs.reconnect_max_backoff_ms,
            prefs.reconnect_max_attempts,
        );

        if prefs.enable_native {
            let config = NativeConfig {
                client_name: prefs.client_name.clone(),
                backoff,
            };
            match native::start(config, tx.clone()) {
                Ok(handle) => self.native = Some(handle),
                Err(e) => log::error!("Failed to start JACK thread: {}", e),
            }
        }

        if prefs.enable_bus || prefs.enable_bridge {
            let config = BusConfig {
                mirror_graph: prefs.enable_bus,
                track_bridge: prefs.enable_bridge,
                backoff,
            };
            match bus::start(config, tx.clone()) {
                Ok(handle) => self.bus = Some(handle),
                Err(e) => log::error!("Failed to start D-Bus thread: {}", e),
            }
        }

        if prefs.enable_alsa {
            let adapter =
                AlsaTextAdapter::new(prefs.aconnect_path.clone(), prefs.alsa_canonical_names.clone());
            match alsa::start(adapter, tx.clone()) {
                Ok(trigger) => self.alsa_trigger = Some(trigger),
                Err(e) => log::error!("Failed to start ALSA thread: {}", e),
            }
        }
    }

    /// Normalize one adapter payload and apply the result.
    pub fn dispatch(&mut self, event: SourceEvent) {
        if let SourceEvent::Bus(BusEvent::BridgeClientName(name)) = event {
            if self.normalizer.set_bridge_client(name) {
                // Ports already mirrored were classified without the bridge name
                if let Some(native) = &self.native {
                    native.resync();
                }
                if let Some(bus) = &self.bus {
                    bus.resync();
                }
            }
            return;
        }

        for event in self.normalizer.normalize(event) {
            self.sync.apply(event);
        }
    }

    /// One poll interval elapsed.
    pub fn tick(&mut self) {
        self.sync.apply(GraphEvent::PollCycle);

        let Some(trigger) = &self.alsa_trigger else {
            return;
        };
        match trigger.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => log::debug!("ALSA poll still running, skipping this cycle"),
            Err(TrySendError::Disconnected(())) => {
                log::debug!("ALSA worker gone, polling stopped");
                self.alsa_trigger = None;
            }
        }
    }

    fn serve(&mut self, prefs: &Preferences, rx: Receiver<SourceEvent>) {
        let interval = prefs.poll_interval();
        let mut next_tick = Instant::now() + interval;

        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match rx.recv_timeout(wait) {
                Ok(event) => self.dispatch(event),
                Err(RecvTimeoutError::Timeout) => {
                    self.tick();
                    next_tick += interval;
                    let now = Instant::now();
                    if next_tick < now {
                        next_tick = now + interval;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    log::info!("All sources stopped");
                    break;
                }
            }
        }
    }

    /// Start the sources and run until every one of them has hung up.
    pub fn run(mut self, prefs: &Preferences) -> GraphSynchronizer<P> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.start_sources(prefs, &tx);
        drop(tx);
        self.serve(prefs, rx);
        self.sync
    }
}
