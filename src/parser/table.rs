//! The flow table: concurrent dispatch, expiry and ownership hand-off.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::flow::{Flow, FlowConfig, FlowError};
use crate::packet::{IpHeader, Protocol, Transport};
use crate::parser::FlowKey;

/// Parser-wide configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    /// Inactivity timeout after which a flow is evicted, in capture time
    /// units (microseconds for pcap timestamps).
    pub flow_timeout: u64,
    pub flow: FlowConfig,
}

impl Default for ParserConfig {
    fn default() -> Self {
        ParserConfig {
            flow_timeout: 60_000_000,
            flow: FlowConfig::default(),
        }
    }
}

/// Receives exclusive ownership of each evicted flow, invoked outside all
/// parser locks.
pub type FlowSink = Box<dyn FnMut(Flow) + Send>;

/// A live table entry. The `Option` is emptied at eviction so a racing
/// dispatch that already cloned the slot observes the hand-off and retries.
type FlowSlot = Arc<Mutex<Option<Flow>>>;

#[derive(Default)]
struct ProtocolTables {
    tcp: HashMap<FlowKey, FlowSlot>,
    udp: HashMap<FlowKey, FlowSlot>,
    icmp: HashMap<FlowKey, FlowSlot>,
    other: HashMap<FlowKey, FlowSlot>,
}

impl ProtocolTables {
    fn table_mut(&mut self, protocol: Protocol) -> &mut HashMap<FlowKey, FlowSlot> {
        match protocol {
            Protocol::Tcp => &mut self.tcp,
            Protocol::Udp => &mut self.udp,
            Protocol::Icmp => &mut self.icmp,
            Protocol::Other => &mut self.other,
        }
    }

    fn tables_mut(&mut self) -> [&mut HashMap<FlowKey, FlowSlot>; 4] {
        [&mut self.tcp, &mut self.udp, &mut self.icmp, &mut self.other]
    }

    fn len(&self) -> usize {
        self.tcp.len() + self.udp.len() + self.icmp.len() + self.other.len()
    }
}

/// Owns all live flows and dispatches packets to them.
///
/// Locking is two-level: one mutex guards the key-to-flow mapping's
/// structure and is held only for lookups and structural edits, and each
/// flow carries its own mutex guarding its mutable state. A flow's lock is
/// taken after the table lock is released, so receives on different flows
/// never contend.
pub struct FlowParser {
    config: ParserConfig,
    flow_config: Arc<FlowConfig>,
    tables: Mutex<ProtocolTables>,
    sink: Mutex<FlowSink>,
    /// Largest timestamp seen across all dispatched packets. Exposed so the
    /// caller can thread it back into `collect_expired` as the eviction
    /// clock.
    last_rx: AtomicU64,
    /// Running total of marginal storage bytes, for memory-pressure
    /// reporting.
    mem_bytes: AtomicUsize,
}

impl FlowParser {
    pub fn new(config: ParserConfig, sink: FlowSink) -> FlowParser {
        let flow_config = Arc::new(config.flow.clone());
        FlowParser {
            config,
            flow_config,
            tables: Mutex::new(ProtocolTables::default()),
            sink: Mutex::new(sink),
            last_rx: AtomicU64::new(0),
            mem_bytes: AtomicUsize::new(0),
        }
    }

    /// Dispatches one packet to its flow, creating the flow on first sight.
    /// Returns the marginal storage bytes the receive consumed.
    pub fn handle_packet(
        &self,
        ip: &IpHeader,
        transport: &Transport,
        timestamp: u64,
    ) -> Result<usize, FlowError> {
        let protocol = transport.protocol();
        let key = FlowKey::from_packet(ip, transport);
        self.last_rx.fetch_max(timestamp, Ordering::Relaxed);

        loop {
            let slot = {
                let mut tables = self.tables.lock().unwrap();
                tables
                    .table_mut(protocol)
                    .entry(key)
                    .or_insert_with(|| {
                        trace!("new {protocol} flow {key}");
                        Arc::new(Mutex::new(Some(Flow::new(
                            key,
                            ip.protocol,
                            timestamp,
                            self.config.flow_timeout,
                            Arc::clone(&self.flow_config),
                        ))))
                    })
                    .clone()
            };

            let mut guard = slot.lock().unwrap();
            let Some(flow) = guard.as_mut() else {
                // Evicted between lookup and lock acquisition. The evictor
                // may not have unlinked the key yet, so drop the stale entry
                // here; the pointer check leaves a replacement slot created
                // in the meantime intact. The retry then starts a fresh flow.
                drop(guard);
                let mut tables = self.tables.lock().unwrap();
                let table = tables.table_mut(protocol);
                if let Some(existing) = table.get(&key) {
                    if Arc::ptr_eq(existing, &slot) {
                        table.remove(&key);
                    }
                }
                continue;
            };

            let bytes = match transport {
                Transport::Tcp(tcp) => flow.receive_tcp(ip, tcp, timestamp)?,
                Transport::Udp(udp) => flow.receive_udp(ip, udp, timestamp)?,
                Transport::Icmp(icmp) => flow.receive_icmp(ip, icmp, timestamp)?,
                Transport::Other => flow.receive_other(ip, timestamp)?,
            };
            self.mem_bytes.fetch_add(bytes, Ordering::Relaxed);
            return Ok(bytes);
        }
    }

    /// Evicts every flow whose inactivity deadline has passed relative to
    /// `now` and hands each to the sink. Returns the number evicted.
    pub fn collect_expired(&self, now: u64) -> usize {
        self.evict_where(|flow| flow.time_left(now) <= 0)
    }

    /// Evicts every live flow regardless of timeout, for end-of-input
    /// flushing.
    pub fn collect_all(&self) -> usize {
        self.evict_where(|_| true)
    }

    fn evict_where<F: Fn(&Flow) -> bool>(&self, expired: F) -> usize {
        // Snapshot slots under the table lock, then judge each flow under
        // its own lock, so a receive in flight on one flow never stalls
        // dispatch for the rest of the table.
        let candidates: Vec<(Protocol, FlowKey, FlowSlot)> = {
            let mut tables = self.tables.lock().unwrap();
            let mut snapshot = Vec::with_capacity(tables.len());
            for protocol in [Protocol::Tcp, Protocol::Udp, Protocol::Icmp, Protocol::Other] {
                for (key, slot) in tables.table_mut(protocol).iter() {
                    snapshot.push((protocol, *key, Arc::clone(slot)));
                }
            }
            snapshot
        };

        let mut evicted = Vec::new();
        let mut unlink = Vec::new();
        for (protocol, key, slot) in candidates {
            let mut guard = slot.lock().unwrap();
            let keep = matches!(guard.as_ref(), Some(flow) if !expired(flow));
            if keep {
                continue;
            }
            // Slots emptied on a previous pass fall through and get their
            // keys unlinked as well.
            if let Some(mut flow) = guard.take() {
                flow.close();
                evicted.push(flow);
            }
            drop(guard);
            unlink.push((protocol, key, slot));
        }

        if !unlink.is_empty() {
            let mut tables = self.tables.lock().unwrap();
            for (protocol, key, slot) in &unlink {
                let table = tables.table_mut(*protocol);
                // A dispatcher may already have replaced the emptied entry
                // with a fresh flow; only the slot we emptied is unlinked.
                if let Some(existing) = table.get(key) {
                    if Arc::ptr_eq(existing, slot) {
                        table.remove(key);
                    }
                }
            }
        }

        if evicted.is_empty() {
            return 0;
        }

        debug!("evicting {} expired flows", evicted.len());

        // The sink runs outside the table lock so packet dispatch for
        // unrelated flows is never blocked by, say, a slow writer.
        let count = evicted.len();
        let mut sink = self.sink.lock().unwrap();
        for flow in evicted {
            sink(flow);
        }
        count
    }

    /// Folds the per-period counters of every live flow into its decayed
    /// averages. Meant to be driven at a fixed cadence by the caller.
    pub fn update_averages(&self) {
        let slots: Vec<FlowSlot> = {
            let mut tables = self.tables.lock().unwrap();
            tables
                .tables_mut()
                .into_iter()
                .flat_map(|t| t.values().cloned().collect::<Vec<_>>())
                .collect()
        };

        // Flow locks are taken after the table lock is dropped.
        for slot in slots {
            if let Some(flow) = slot.lock().unwrap().as_mut() {
                flow.update_averages();
            }
        }
    }

    pub fn flow_count(&self) -> usize {
        self.tables.lock().unwrap().len()
    }

    /// Timestamp of the most recently dispatched packet, zero before the
    /// first one.
    pub fn last_rx(&self) -> u64 {
        self.last_rx.load(Ordering::Relaxed)
    }

    /// Total storage bytes consumed by tracked series across all flows ever
    /// dispatched to.
    pub fn mem_bytes(&self) -> usize {
        self.mem_bytes.load(Ordering::Relaxed)
    }
}
