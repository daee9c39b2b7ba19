//! aya-backed probe feed
//!
//! Each attached link gets its own instance of the probe object: the TC
//! classifier is attached to the link's ingress hook and records are read
//! from the object's `EVENTS` ring buffer.

use super::{ProbeFeed, ProbeSession};
use crate::error::{AgentError, ProbeError};
use crate::links::LinkEndpoint;
use async_trait::async_trait;
use aya::{
    maps::{MapData, RingBuf},
    programs::{tc, ProgramError, SchedClassifier, TcAttachType},
    Ebpf,
};
use aya_log::EbpfLogger;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tokio::io::unix::AsyncFd;

/// Ring buffer map written by the probe
const EVENTS_MAP: &str = "EVENTS";

/// Upper bound on buffers drained from the ring per wakeup
const MAX_BATCH_SIZE: usize = 1024;

/// Loads the traffic probe object from disk and attaches it per link
pub struct AyaProbeFeed {
    object_path: PathBuf,
    program_name: String,
}

impl AyaProbeFeed {
    pub fn new(object_path: impl Into<PathBuf>, program_name: impl Into<String>) -> Self {
        Self {
            object_path: object_path.into(),
            program_name: program_name.into(),
        }
    }
}

#[async_trait]
impl ProbeFeed for AyaProbeFeed {
    async fn attach(&self, link: &LinkEndpoint) -> Result<Box<dyn ProbeSession>, ProbeError> {
        let attach_err = |reason: String| ProbeError::Attach {
            link: link.name.clone(),
            reason,
        };

        let mut bpf = Ebpf::load_file(&self.object_path).map_err(|e| {
            ProbeError::Load(format!("{}: {}", self.object_path.display(), e))
        })?;

        if let Err(e) = EbpfLogger::init(&mut bpf) {
            debug!("Probe logs unavailable for {}: {}", link.name, e);
        }

        let program: &mut SchedClassifier = bpf
            .program_mut(&self.program_name)
            .ok_or_else(|| attach_err(format!("program {} not found", self.program_name)))?
            .try_into()
            .map_err(|e: ProgramError| attach_err(e.to_string()))?;
        program.load().map_err(|e| attach_err(e.to_string()))?;

        // clsact is required for TC attachment and may already exist
        if let Err(e) = tc::qdisc_add_clsact(&link.name) {
            warn!("Failed to add clsact qdisc to {}: {}", link.name, e);
        }

        program
            .attach(&link.name, TcAttachType::Ingress)
            .map_err(|e| attach_err(e.to_string()))?;

        let map = bpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| ProbeError::Map(format!("{} map not found", EVENTS_MAP)))?;
        let ring = RingBuf::try_from(map).map_err(|e| ProbeError::Map(e.to_string()))?;

        info!("Traffic probe attached to {} (index {})", link.name, link.index);

        Ok(Box::new(RingBufSession {
            ring: AsyncFd::new(ring)?,
            pending: VecDeque::new(),
            _bpf: bpf,
        }))
    }
}

struct RingBufSession {
    ring: AsyncFd<RingBuf<MapData>>,
    pending: VecDeque<Vec<u8>>,
    // Keeps the program attached for the lifetime of the session
    _bpf: Ebpf,
}

#[async_trait]
impl ProbeSession for RingBufSession {
    async fn next_buffer(&mut self) -> Result<Option<Vec<u8>>, ProbeError> {
        loop {
            if let Some(buf) = self.pending.pop_front() {
                return Ok(Some(buf));
            }

            let mut guard = self.ring.readable_mut().await?;
            let ring = guard.get_inner_mut();

            let mut drained = true;
            while let Some(item) = ring.next() {
                self.pending.push_back(item.to_vec());
                if self.pending.len() >= MAX_BATCH_SIZE {
                    warn!("Hit maximum batch size ({}), deferring the rest", MAX_BATCH_SIZE);
                    drained = false;
                    break;
                }
            }

            // Readiness is edge-triggered: only clear it once the ring is empty
            if drained {
                guard.clear_ready();
            }
        }
    }
}

/// Allow the process to lock memory for kernel maps.
///
/// Failure is fatal for the agent: no probe can be loaded without it.
pub fn raise_memlock_limit() -> Result<(), AgentError> {
    let limit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };

    // SAFETY: setrlimit only reads the provided struct
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &limit) };
    if ret != 0 {
        return Err(AgentError::Memlock(std::io::Error::last_os_error()));
    }

    debug!("RLIMIT_MEMLOCK raised to unlimited");
    Ok(())
}

/// Warn about environment problems that will surface as attach failures
pub fn run_preflight_checks() {
    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        warn!("BTF not found at /sys/kernel/btf/vmlinux; CO-RE probes may fail to load");
    }

    // SAFETY: geteuid has no preconditions
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        warn!(
            "Not running as root (euid={}). Ensure CAP_BPF and CAP_NET_ADMIN are granted.",
            euid
        );
    }
}
