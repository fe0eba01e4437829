//! Segmented-output bridge
//!
//! Every video producer gets a relay: a plain RTP transport on the loopback
//! interface, an unpaused internal consumer feeding it, an SDP file, and a
//! transcoder turning that RTP into `user<n>.m3u8`. The entry lives exactly
//! as long as the producer.
//!
//! The table lock is only taken for bookkeeping, never across engine calls.
//! A producer whose teardown arrives while its relay is still being built is
//! marked cancelled; the setup task notices and unwinds.

pub mod ports;
pub mod sdp;
pub mod transcoder;

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::engine::{Consumer, MediaEngine, PlainTransport, PlainTransportOptions, Producer};
use crate::error::{Result, SfuError};
use crate::types::{MediaKind, ProducerId};

pub use ports::SlotAllocator;
pub use sdp::SdpDescription;
pub use transcoder::{
    EncodingPreset, FfmpegLauncher, TranscodeJob, TranscoderLauncher, TranscoderProcess,
};

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub output_dir: PathBuf,
    /// Relay port of slot 1
    pub base_port: u16,
    pub port_stride: u16,
    /// Maximum concurrent relays (0 = as many as the port range allows)
    pub max_bridges: u32,
    /// Segments kept in each playlist
    pub list_size: u32,
    pub preset: EncodingPreset,
    /// Address the relay transport sends to and the transcoder listens on
    pub relay_ip: IpAddr,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./public/hls"),
            base_port: 5004,
            port_stride: 2,
            max_bridges: 0,
            list_size: 5,
            preset: EncodingPreset::Normal,
            relay_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

/// Public view of one live relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeInfo {
    pub producer_id: ProducerId,
    pub slot: u32,
    pub port: u16,
    pub manifest: PathBuf,
}

struct BridgeEntry {
    slot: u32,
    port: u16,
    manifest: PathBuf,
    transport: Arc<dyn PlainTransport>,
    consumer: Arc<dyn Consumer>,
    process: Box<dyn TranscoderProcess>,
}

impl BridgeEntry {
    fn info(&self, producer_id: &ProducerId) -> BridgeInfo {
        BridgeInfo {
            producer_id: producer_id.clone(),
            slot: self.slot,
            port: self.port,
            manifest: self.manifest.clone(),
        }
    }

    fn close(mut self) {
        self.consumer.close();
        self.transport.close();
        self.process.terminate();
    }
}

struct BridgeTable {
    entries: HashMap<ProducerId, BridgeEntry>,
    slots: SlotAllocator,
    /// Relays being built, with their reserved slot
    pending: HashMap<ProducerId, u32>,
    /// Pending relays whose producer went away mid-setup
    cancelled: HashSet<ProducerId>,
}

/// HLS bridge - one transcoder pipeline per video producer
pub struct HlsBridge {
    engine: Arc<dyn MediaEngine>,
    launcher: Arc<dyn TranscoderLauncher>,
    config: BridgeConfig,
    table: Mutex<BridgeTable>,
}

impl HlsBridge {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        launcher: Arc<dyn TranscoderLauncher>,
        config: BridgeConfig,
    ) -> Self {
        let slots = SlotAllocator::new(config.base_port, config.port_stride, config.max_bridges);

        info!(
            output_dir = %config.output_dir.display(),
            base_port = config.base_port,
            port_stride = config.port_stride,
            capacity = slots.capacity(),
            preset = config.preset.label(),
            "HLS bridge initialized"
        );

        Self {
            engine,
            launcher,
            config,
            table: Mutex::new(BridgeTable {
                entries: HashMap::new(),
                slots,
                pending: HashMap::new(),
                cancelled: HashSet::new(),
            }),
        }
    }

    /// Build the relay for `producer`.
    ///
    /// Audio producers are ignored (`Ok(None)`), as is a producer that closes
    /// before the relay is ready. On error everything acquired so far has
    /// already been released.
    pub async fn start(&self, producer: &Arc<dyn Producer>) -> Result<Option<BridgeInfo>> {
        if producer.kind() != MediaKind::Video {
            return Ok(None);
        }
        let producer_id = producer.id().clone();

        let (slot, port) = {
            let mut table = self.table.lock();
            if table.entries.contains_key(&producer_id) || table.pending.contains_key(&producer_id) {
                return Err(SfuError::Bridge(format!("Producer {producer_id} is already bridged")));
            }
            let (slot, port) = table
                .slots
                .acquire()
                .ok_or_else(|| SfuError::Bridge("No free bridge slot".to_string()))?;
            table.pending.insert(producer_id.clone(), slot);
            (slot, port)
        };

        let mut guard = SetupGuard {
            bridge: self,
            producer_id: producer_id.clone(),
            slot,
            transport: None,
            consumer: None,
        };

        let ip = self.config.relay_ip;
        let transport = self
            .engine
            .create_plain_transport(PlainTransportOptions::local(ip))
            .await?;
        guard.transport = Some(Arc::clone(&transport));

        transport.connect(ip, port).await?;

        let consumer = transport
            .consume(&producer_id, &self.engine.rtp_capabilities(), false)
            .await?;
        guard.consumer = Some(Arc::clone(&consumer));

        let codec = consumer
            .rtp_parameters()
            .codecs
            .first()
            .cloned()
            .ok_or_else(|| SfuError::Bridge(format!("Relay consumer for {producer_id} has no codec")))?;

        let job = TranscodeJob::for_slot(&self.config.output_dir, slot, self.config.preset, self.config.list_size);
        let sdp = SdpDescription::for_codec(ip, port, &codec).render();
        tokio::fs::create_dir_all(&self.config.output_dir).await?;
        tokio::fs::write(&job.sdp_path, sdp).await?;

        let mut process = self.launcher.launch(&job).await?;

        let mut table = self.table.lock();
        if table.cancelled.contains(&producer_id) || producer.is_closed() {
            drop(table);
            process.terminate();
            debug!(producer_id = %producer_id, "Producer closed during bridge setup");
            return Ok(None);
        }

        table.pending.remove(&producer_id);
        let pid = process.pid();
        let entry = BridgeEntry {
            slot,
            port,
            manifest: job.manifest_path,
            transport,
            consumer,
            process,
        };
        let info = entry.info(&producer_id);
        table.entries.insert(producer_id.clone(), entry);
        drop(table);
        guard.disarm();

        info!(
            producer_id = %producer_id,
            slot,
            port,
            pid = ?pid,
            codec = codec.codec_name(),
            manifest = %info.manifest.display(),
            "HLS bridge started"
        );
        Ok(Some(info))
    }

    /// Tear down the relay of `producer_id`. Safe to call for producers that
    /// were never bridged; returns true if a live relay was removed.
    pub fn teardown(&self, producer_id: &ProducerId) -> bool {
        let entry = {
            let mut table = self.table.lock();
            match table.entries.remove(producer_id) {
                Some(entry) => {
                    table.slots.release(entry.slot);
                    Some(entry)
                }
                None => {
                    if table.pending.contains_key(producer_id) {
                        table.cancelled.insert(producer_id.clone());
                    }
                    None
                }
            }
        };

        let Some(entry) = entry else {
            return false;
        };

        let (slot, port, pid) = (entry.slot, entry.port, entry.process.pid());
        entry.close();
        info!(producer_id = %producer_id, slot, port, pid = ?pid, "HLS bridge stopped");
        true
    }

    /// Tear down every relay and cancel the ones still being built
    pub fn shutdown(&self) -> usize {
        let entries: Vec<_> = {
            let mut table = self.table.lock();
            let pending: Vec<_> = table.pending.keys().cloned().collect();
            table.cancelled.extend(pending);
            let drained: Vec<_> = table.entries.drain().collect();
            for (_, entry) in &drained {
                table.slots.release(entry.slot);
            }
            drained
        };

        let count = entries.len();
        for (_, entry) in entries {
            entry.close();
        }
        if count > 0 {
            info!(count, "HLS bridges shut down");
        }
        count
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.table.lock().entries.len()
    }

    #[must_use]
    pub fn is_bridged(&self, producer_id: &ProducerId) -> bool {
        self.table.lock().entries.contains_key(producer_id)
    }

    #[must_use]
    pub fn port_of(&self, producer_id: &ProducerId) -> Option<u16> {
        self.table.lock().entries.get(producer_id).map(|e| e.port)
    }

    #[must_use]
    pub fn entries(&self) -> Vec<BridgeInfo> {
        let table = self.table.lock();
        let mut entries: Vec<_> = table.entries.iter().map(|(id, e)| e.info(id)).collect();
        entries.sort_by_key(|e| e.slot);
        entries
    }
}

/// Releases a half-built relay unless disarmed
struct SetupGuard<'a> {
    bridge: &'a HlsBridge,
    producer_id: ProducerId,
    slot: u32,
    transport: Option<Arc<dyn PlainTransport>>,
    consumer: Option<Arc<dyn Consumer>>,
}

impl SetupGuard<'_> {
    fn disarm(&mut self) {
        self.transport = None;
        self.consumer = None;
        self.slot = 0;
    }
}

impl Drop for SetupGuard<'_> {
    fn drop(&mut self) {
        if self.slot == 0 {
            return;
        }
        if let Some(consumer) = self.consumer.take() {
            consumer.close();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }

        let mut table = self.bridge.table.lock();
        table.pending.remove(&self.producer_id);
        table.cancelled.remove(&self.producer_id);
        table.slots.release(self.slot);
        drop(table);

        debug!(producer_id = %self.producer_id, slot = self.slot, "Released partial HLS bridge");
    }
}

/// A fixed RTP source transcoded independently of any producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSource {
    pub ip: IpAddr,
    pub port: u16,
    pub payload_type: u8,
    pub codec_name: String,
}

/// Write `stream.sdp` for `source` and start its transcoder.
/// The returned handle keeps the process alive.
pub async fn start_ingest(
    launcher: &dyn TranscoderLauncher,
    output_dir: &Path,
    source: &IngestSource,
    preset: EncodingPreset,
    list_size: u32,
) -> Result<Box<dyn TranscoderProcess>> {
    prepare_output_dir(output_dir).await?;

    let job = TranscodeJob::ingest(output_dir, preset, list_size);
    let sdp = SdpDescription::new(source.ip, source.port, source.payload_type, source.codec_name.as_str())
        .with_session_name("Relaycast Ingest Stream")
        .render();
    tokio::fs::write(&job.sdp_path, sdp).await?;

    info!(
        ip = %source.ip,
        port = source.port,
        codec = %source.codec_name,
        preset = preset.label(),
        "Starting ingest transcoder"
    );
    launcher.launch(&job).await
}

pub async fn prepare_output_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

fn is_generated_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("ts" | "m3u8" | "sdp")
    )
}

/// Remove playlists, segments and SDP files from `dir`; returns how many
/// files were deleted. A missing directory counts as already clean.
pub async fn cleanup_output_dir(dir: &Path) -> io::Result<usize> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() || !is_generated_file(&path) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove HLS file"),
        }
    }

    debug!(dir = %dir.display(), removed, "Cleaned HLS output directory");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cleanup_only_removes_generated_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["user1.m3u8", "user1_segment000.ts", "user1.sdp", "index.html"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        let removed = cleanup_output_dir(dir.path()).await.unwrap();

        assert_eq!(removed, 3);
        assert!(dir.path().join("index.html").exists());
        assert!(!dir.path().join("user1.m3u8").exists());
    }

    #[tokio::test]
    async fn test_cleanup_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("hls");
        assert_eq!(cleanup_output_dir(&missing).await.unwrap(), 0);
    }
}
