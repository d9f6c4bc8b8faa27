use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::counter;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::protocol::Envelope;
use crate::session::Session;

/// How long a device's ring survives after its session last closed with no
/// successor. Brief cellular blackouts keep their telemetry continuity.
pub const RETENTION_WINDOW: Duration = Duration::from_secs(300);

struct BufferedFrame {
    frame: Envelope,
    #[allow(dead_code)]
    arrived_at: Instant,
}

#[derive(Default)]
struct Ring {
    frames: VecDeque<BufferedFrame>,
    last_seq: HashMap<String, i64>,
    disconnected_at: Option<Instant>,
}

/// Per-device rings of the most recent telemetry envelopes, replayed to
/// clients that attach late.
pub struct TelemetryStore {
    rings: DashMap<String, Mutex<Ring>>,
    capacity: usize,
}

impl TelemetryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            rings: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a telemetry frame, evicting the oldest at capacity. Returns the
    /// detected sequence gap, if any.
    pub fn append(&self, device_id: &str, frame: Envelope) -> Option<i64> {
        let entry = self
            .rings
            .entry(device_id.to_string())
            .or_insert_with(|| Mutex::new(Ring::default()));
        let mut ring = entry.lock();

        let gap = sequence_of(&frame).and_then(|(subtype, seq)| {
            let gap = match ring.last_seq.get(&subtype) {
                Some(&last) if seq > last + 1 => Some(seq - last - 1),
                _ => None,
            };
            ring.last_seq.insert(subtype.clone(), seq);
            if let Some(gap) = gap {
                warn!(device_id, subtype = %subtype, gap, "telemetry sequence gap");
                counter!("telemetry_sequence_gaps").increment(gap as u64);
            }
            gap
        });

        if ring.frames.len() == self.capacity {
            ring.frames.pop_front();
        }
        ring.frames.push_back(BufferedFrame {
            frame,
            arrived_at: Instant::now(),
        });
        gap
    }

    /// Enqueue the buffered frames for `device_id` into `sink`'s outbound
    /// queue in arrival order. Returns how many were delivered.
    pub fn replay(&self, device_id: &str, sink: &Session) -> usize {
        let frames: Vec<Envelope> = match self.rings.get(device_id) {
            Some(entry) => entry.lock().frames.iter().map(|b| b.frame.clone()).collect(),
            None => return 0,
        };
        let total = frames.len();
        let mut delivered = 0;
        for frame in frames {
            if sink.enqueue(frame).is_ok() {
                delivered += 1;
            } else {
                counter!("telemetry_replay_drops").increment(1);
            }
        }
        if delivered > 0 {
            debug!(device_id, delivered, total, client = sink.id(), "replayed telemetry");
        }
        delivered
    }

    pub fn forget(&self, device_id: &str) {
        self.rings.remove(device_id);
    }

    /// Start the retention clock for a device whose session just closed.
    pub fn mark_disconnected(&self, device_id: &str) {
        if let Some(entry) = self.rings.get(device_id) {
            entry.lock().disconnected_at = Some(Instant::now());
        }
    }

    /// A successor session arrived; the ring keeps its contents.
    pub fn mark_connected(&self, device_id: &str) {
        if let Some(entry) = self.rings.get(device_id) {
            entry.lock().disconnected_at = None;
        }
    }

    /// Forget rings whose device has been absent past the retention window.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now(), RETENTION_WINDOW)
    }

    fn sweep_at(&self, now: Instant, window: Duration) -> usize {
        let expired: Vec<String> = self
            .rings
            .iter()
            .filter(|entry| {
                entry.value().lock().disconnected_at.is_some_and(|at| {
                    now.checked_duration_since(at)
                        .is_some_and(|absent| absent >= window)
                })
            })
            .map(|entry| entry.key().clone())
            .collect();
        for device_id in &expired {
            debug!(device_id = %device_id, "forgetting telemetry for absent device");
            self.forget(device_id);
        }
        expired.len()
    }

    pub fn depth(&self, device_id: &str) -> usize {
        self.rings
            .get(device_id)
            .map(|entry| entry.lock().frames.len())
            .unwrap_or(0)
    }

    pub fn depths(&self) -> Vec<(String, usize)> {
        self.rings
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().lock().frames.len()))
            .collect()
    }

    /// Device ids with a retained ring, whether or not a session is live.
    pub fn known_devices(&self) -> Vec<String> {
        self.rings.iter().map(|entry| entry.key().clone()).collect()
    }
}

fn sequence_of(frame: &Envelope) -> Option<(String, i64)> {
    let Envelope::Telemetry { body, .. } = frame else {
        return None;
    };
    let seq = body.get("sequence")?.as_i64()?;
    let subtype = body
        .get("subtype")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown");
    Some((subtype.to_string(), seq))
}
