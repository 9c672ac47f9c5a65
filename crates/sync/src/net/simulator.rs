use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::transport::Transport;

/// Probabilities in `0.0..=1.0` applied to every datagram on a link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConditions {
    pub loss: f32,
    pub duplicate: f32,
    pub reorder: f32,
}

impl LinkConditions {
    pub fn lossy(loss: f32) -> Self {
        Self {
            loss,
            ..Default::default()
        }
    }

    pub fn is_perfect(&self) -> bool {
        self.loss <= 0.0 && self.duplicate <= 0.0 && self.reorder <= 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Drop,
    Deliver { copies: usize, reorder: bool },
}

fn roll(rng: &mut StdRng, conditions: &LinkConditions) -> Fate {
    if rng.r#gen::<f32>() < conditions.loss {
        return Fate::Drop;
    }
    let copies = if rng.r#gen::<f32>() < conditions.duplicate { 2 } else { 1 };
    let reorder = rng.r#gen::<f32>() < conditions.reorder;
    Fate::Deliver { copies, reorder }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatorStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
}

#[derive(Debug)]
struct Hub {
    inboxes: HashMap<SocketAddr, VecDeque<(SocketAddr, Vec<u8>)>>,
    conditions: LinkConditions,
    link_conditions: HashMap<SocketAddr, LinkConditions>,
    blocked: HashSet<SocketAddr>,
    rng: StdRng,
    next_port: u16,
    stats: SimulatorStats,
}

/// In-process datagram network with seeded, reproducible impairments.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new(seed: u64) -> Self {
        Self::with_conditions(seed, LinkConditions::default())
    }

    pub fn with_conditions(seed: u64, conditions: LinkConditions) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                inboxes: HashMap::new(),
                conditions,
                link_conditions: HashMap::new(),
                blocked: HashSet::new(),
                rng: StdRng::seed_from_u64(seed),
                next_port: 20_000,
                stats: SimulatorStats::default(),
            })),
        }
    }

    pub fn bind(&self) -> MemoryTransport {
        let mut hub = self.hub.lock();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), hub.next_port);
        hub.next_port = hub.next_port.wrapping_add(1);
        hub.inboxes.insert(addr, VecDeque::new());
        MemoryTransport {
            addr,
            hub: Arc::clone(&self.hub),
        }
    }

    pub fn set_conditions(&self, conditions: LinkConditions) {
        self.hub.lock().conditions = conditions;
    }

    /// Override the conditions for datagrams addressed to `addr`.
    pub fn set_link_conditions(&self, addr: SocketAddr, conditions: LinkConditions) {
        self.hub.lock().link_conditions.insert(addr, conditions);
    }

    /// Silently drop everything sent from or to `addr`.
    pub fn set_blocked(&self, addr: SocketAddr, blocked: bool) {
        let mut hub = self.hub.lock();
        if blocked {
            hub.blocked.insert(addr);
        } else {
            hub.blocked.remove(&addr);
        }
    }

    pub fn stats(&self) -> SimulatorStats {
        self.hub.lock().stats
    }
}

#[derive(Debug)]
pub struct MemoryTransport {
    addr: SocketAddr,
    hub: Arc<Mutex<Hub>>,
}

impl Transport for MemoryTransport {
    fn send(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
        let mut hub = self.hub.lock();
        let hub = &mut *hub;
        hub.stats.sent += 1;

        if hub.blocked.contains(&self.addr) || hub.blocked.contains(&addr) {
            hub.stats.dropped += 1;
            return Ok(data.len());
        }

        let conditions = hub
            .link_conditions
            .get(&addr)
            .copied()
            .unwrap_or(hub.conditions);
        let fate = roll(&mut hub.rng, &conditions);

        let Some(inbox) = hub.inboxes.get_mut(&addr) else {
            hub.stats.dropped += 1;
            return Ok(data.len());
        };

        match fate {
            Fate::Drop => hub.stats.dropped += 1,
            Fate::Deliver { copies, reorder } => {
                for _ in 0..copies {
                    let datagram = (self.addr, data.to_vec());
                    if reorder && !inbox.is_empty() {
                        let index = hub.rng.gen_range(0..inbox.len());
                        inbox.insert(index, datagram);
                    } else {
                        inbox.push_back(datagram);
                    }
                }
                hub.stats.delivered += copies as u64;
                hub.stats.duplicated += copies as u64 - 1;
            }
        }
        Ok(data.len())
    }

    fn poll(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>> {
        Ok(self
            .hub
            .lock()
            .inboxes
            .get_mut(&self.addr)
            .and_then(VecDeque::pop_front))
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.lock().inboxes.remove(&self.addr);
    }
}

/// Applies `LinkConditions` to the outgoing side of any transport.
pub struct ConditionedTransport<T> {
    inner: T,
    conditions: LinkConditions,
    rng: StdRng,
}

impl<T: Transport> ConditionedTransport<T> {
    pub fn new(inner: T, conditions: LinkConditions, seed: u64) -> Self {
        Self {
            inner,
            conditions,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn conditions(&self) -> LinkConditions {
        self.conditions
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Transport> Transport for ConditionedTransport<T> {
    fn send(&mut self, addr: SocketAddr, data: &[u8]) -> io::Result<usize> {
        match roll(&mut self.rng, &self.conditions) {
            Fate::Drop => Ok(data.len()),
            Fate::Deliver { copies, .. } => {
                let mut sent = 0;
                for _ in 0..copies {
                    sent = self.inner.send(addr, data)?;
                }
                Ok(sent)
            }
        }
    }

    fn poll(&mut self) -> io::Result<Option<(SocketAddr, Vec<u8>)>> {
        self.inner.poll()
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr()
    }
}
