// Shared fixtures for SFU integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use relaycast_sfu::engine::{
    DtlsFingerprint, DtlsParameters, DtlsRole, RtpCodecParameters, RtpParameters,
};
use relaycast_sfu::hls::{TranscodeJob, TranscoderLauncher, TranscoderProcess};
use relaycast_sfu::{
    BridgeConfig, HlsBridge, LoopbackEngine, Peer, ServerMessage, SfuConfig, SfuError,
    SfuManager, TransportId, TransportRole,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

/// Launcher that records jobs instead of spawning processes
#[derive(Default)]
pub struct RecordingLauncher {
    pub jobs: Mutex<Vec<TranscodeJob>>,
    pub running: Arc<AtomicUsize>,
    pub terminated: Arc<AtomicUsize>,
    pub fail: AtomicBool,
    /// When set, every launch parks here until a permit is added
    gate: Mutex<Option<Arc<Semaphore>>>,
    waiting: AtomicUsize,
}

impl RecordingLauncher {
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn launched(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Park subsequent launches; add permits to the returned gate to let
    /// them finish
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Launches currently parked at the gate
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscoderLauncher for RecordingLauncher {
    async fn launch(&self, job: &TranscodeJob) -> relaycast_sfu::Result<Box<dyn TranscoderProcess>> {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            gate.acquire().await.unwrap().forget();
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SfuError::Bridge("launch refused".to_string()));
        }
        self.jobs.lock().push(job.clone());
        self.running.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockProcess {
            running: Arc::clone(&self.running),
            terminated: Arc::clone(&self.terminated),
            alive: true,
        }))
    }
}

struct MockProcess {
    running: Arc<AtomicUsize>,
    terminated: Arc<AtomicUsize>,
    alive: bool,
}

impl TranscoderProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn terminate(&mut self) {
        if std::mem::take(&mut self.alive) {
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub struct Harness {
    pub manager: Arc<SfuManager>,
    pub engine: LoopbackEngine,
    pub launcher: Arc<RecordingLauncher>,
    pub bridge: Arc<HlsBridge>,
}

/// Manager with an HLS bridge writing into `output_dir`; catch-up is pushed
/// far enough out that it never interferes unless a test waits for it
pub fn harness(output_dir: &Path) -> Harness {
    harness_with(output_dir, SfuConfig {
        catch_up_delay_ms: 3_600_000,
        ..SfuConfig::default()
    })
}

pub fn harness_with(output_dir: &Path, config: SfuConfig) -> Harness {
    let engine = LoopbackEngine::default();
    let launcher = Arc::new(RecordingLauncher::default());
    let bridge = Arc::new(HlsBridge::new(
        Arc::new(engine.clone()),
        launcher.clone(),
        BridgeConfig {
            output_dir: output_dir.to_path_buf(),
            ..BridgeConfig::default()
        },
    ));
    let manager = SfuManager::new(config, Arc::new(engine.clone()), Some(Arc::clone(&bridge)));

    Harness {
        manager,
        engine,
        launcher,
        bridge,
    }
}

pub struct Client {
    pub peer: Arc<Peer>,
    pub rx: mpsc::Receiver<ServerMessage>,
    pub send: TransportId,
    pub recv: TransportId,
}

impl Client {
    /// Everything queued for this client so far
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }
}

/// Connect a peer and walk it through capabilities and both transports
pub async fn join(manager: &Arc<SfuManager>) -> Client {
    let (peer, rx) = manager.connect();
    manager.router_capabilities(&peer.id).unwrap();

    let send = manager
        .create_transport(&peer.id, TransportRole::Send)
        .await
        .unwrap()
        .id;
    let recv = manager
        .create_transport(&peer.id, TransportRole::Recv)
        .await
        .unwrap()
        .id;
    manager.connect_transport(&peer.id, &send, dtls()).await.unwrap();
    manager.connect_transport(&peer.id, &recv, dtls()).await.unwrap();

    Client { peer, rx, send, recv }
}

pub fn dtls() -> DtlsParameters {
    DtlsParameters {
        role: DtlsRole::Client,
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF".to_string(),
        }],
    }
}

fn codec(mime_type: &str, payload_type: u8, clock_rate: u32, channels: Option<u8>) -> RtpParameters {
    RtpParameters {
        codecs: vec![RtpCodecParameters {
            mime_type: mime_type.to_string(),
            payload_type,
            clock_rate,
            channels,
            parameters: serde_json::Map::new(),
            rtcp_feedback: Vec::new(),
        }],
        ..RtpParameters::default()
    }
}

pub fn vp8() -> RtpParameters {
    codec("video/VP8", 96, 90000, None)
}

pub fn h264() -> RtpParameters {
    codec("video/H264", 125, 90000, None)
}

pub fn opus() -> RtpParameters {
    codec("audio/opus", 111, 48000, Some(2))
}

/// Poll `check` until it holds or a second passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
