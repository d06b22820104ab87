//! Simulated network of DATEX endpoints
//!
//! Every runtime's send hook drops its blocks into one shared queue. The
//! network delivers them hop by hop to the linked endpoints, optionally
//! losing, duplicating or reordering them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use datex_core::{Endpoint, Timestamp};
use datex_crypto::Identity;
use datex_runtime::{OutboundBlock, Runtime, RuntimeConfig};

/// Idle rounds before `drive` lets timers advance
const IDLE_ROUNDS: u32 = 64;

/// Link conditions
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Probability a block is lost (0.0 - 1.0)
    pub loss_rate: f64,
    pub duplicate_prob: f64,
    /// Shuffle each delivery round
    pub reorder: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            loss_rate: 0.0,
            duplicate_prob: 0.0,
            reorder: false,
        }
    }
}

impl LinkConfig {
    /// Lossless, but blocks arrive in any order and sometimes twice
    pub fn shuffled() -> Self {
        LinkConfig {
            loss_rate: 0.0,
            duplicate_prob: 0.1,
            reorder: true,
        }
    }

    pub fn lossy(loss_rate: f64) -> Self {
        LinkConfig {
            loss_rate,
            ..LinkConfig::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub sent: u64,
    pub delivered: u64,
    pub lost: u64,
    pub duplicated: u64,
    /// Blocks with nowhere to go
    pub unroutable: u64,
}

#[derive(Debug)]
struct Envelope {
    from: Endpoint,
    block: OutboundBlock,
}

type Queue = Arc<Mutex<VecDeque<Envelope>>>;

pub struct SimNetwork {
    runtimes: HashMap<Endpoint, Arc<Runtime>>,
    order: Vec<Endpoint>,
    /// Explicit topology; `None` links everybody with everybody
    links: Option<HashSet<(Endpoint, Endpoint)>>,
    queue: Queue,
    config: LinkConfig,
    rng: StdRng,
    stats: NetworkStats,
}

impl SimNetwork {
    pub fn new(config: LinkConfig) -> Self {
        Self::with_seed(config, 0)
    }

    pub fn with_seed(config: LinkConfig, seed: u64) -> Self {
        SimNetwork {
            runtimes: HashMap::new(),
            order: Vec::new(),
            links: None,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            config,
            rng: StdRng::seed_from_u64(seed),
            stats: NetworkStats::default(),
        }
    }

    /// Lossless, in-order network
    pub fn reliable() -> Self {
        Self::new(LinkConfig::default())
    }

    /// Create a runtime for `name` and attach it
    pub fn add(&mut self, name: &str, config: RuntimeConfig) -> Arc<Runtime> {
        let runtime = Arc::new(Runtime::new(Endpoint::person(name), Identity::generate(), config));
        self.attach(Arc::clone(&runtime));
        runtime
    }

    /// Attach an existing runtime; blocks it buffered so far enter the network
    pub fn attach(&mut self, runtime: Arc<Runtime>) {
        let endpoint = runtime.endpoint().main();
        let queue = Arc::clone(&self.queue);
        let from = endpoint.clone();
        runtime.set_send_hook(Box::new(move |block| {
            queue.lock().push_back(Envelope {
                from: from.clone(),
                block,
            });
        }));
        if !self.runtimes.contains_key(&endpoint) {
            self.order.push(endpoint.clone());
        }
        self.runtimes.insert(endpoint, runtime);
    }

    pub fn runtime(&self, endpoint: &Endpoint) -> Option<&Arc<Runtime>> {
        self.runtimes.get(&endpoint.main())
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.order
    }

    /// Switch to an explicit topology and link two endpoints both ways
    pub fn connect(&mut self, a: &Endpoint, b: &Endpoint) {
        let links = self.links.get_or_insert_with(HashSet::new);
        links.insert((a.main(), b.main()));
        links.insert((b.main(), a.main()));
    }

    pub fn is_linked(&self, from: &Endpoint, to: &Endpoint) -> bool {
        if from.main() == to.main() || !self.runtimes.contains_key(&to.main()) {
            return false;
        }
        match &self.links {
            Some(links) => links.contains(&(from.main(), to.main())),
            None => true,
        }
    }

    fn neighbors(&self, from: &Endpoint) -> Vec<Endpoint> {
        self.order.iter().filter(|e| self.is_linked(from, e)).cloned().collect()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Next hops of one block: direct receivers if linked, relays otherwise
    fn hops(&self, envelope: &Envelope) -> Vec<Endpoint> {
        let except = envelope.block.except.as_ref().map(Endpoint::main);
        let neighbors: Vec<Endpoint> = self
            .neighbors(&envelope.from)
            .into_iter()
            .filter(|e| Some(e) != except.as_ref())
            .collect();
        if envelope.block.is_flood() {
            return neighbors;
        }

        let mut hops: Vec<Endpoint> = Vec::new();
        let mut unreachable = false;
        for receiver in &envelope.block.receivers {
            let receiver = receiver.main();
            if self.is_linked(&envelope.from, &receiver) {
                if !hops.contains(&receiver) {
                    hops.push(receiver);
                }
            } else {
                unreachable = true;
            }
        }
        if unreachable {
            for relay in neighbors {
                if !hops.contains(&relay) {
                    hops.push(relay);
                }
            }
        }
        hops
    }

    fn deliver(&mut self, envelope: Envelope) -> usize {
        self.stats.sent += 1;
        let hops = self.hops(&envelope);
        if hops.is_empty() {
            self.stats.unroutable += 1;
            tracing::debug!(from = %envelope.from, "unroutable block");
            return 0;
        }
        let mut delivered = 0;
        for hop in hops {
            if self.config.loss_rate > 0.0 && self.rng.gen_bool(self.config.loss_rate) {
                self.stats.lost += 1;
                continue;
            }
            let copies = if self.config.duplicate_prob > 0.0 && self.rng.gen_bool(self.config.duplicate_prob) {
                self.stats.duplicated += 1;
                2
            } else {
                1
            };
            let Some(runtime) = self.runtimes.get(&hop).cloned() else {
                continue;
            };
            for _ in 0..copies {
                runtime.receive(&envelope.block.bytes, Some(&envelope.from));
                self.stats.delivered += 1;
                delivered += 1;
            }
        }
        delivered
    }

    /// Deliver everything queued right now; returns the deliveries made
    pub fn step(&mut self) -> usize {
        let mut batch: Vec<Envelope> = self.queue.lock().drain(..).collect();
        if batch.is_empty() {
            return 0;
        }
        if self.config.reorder {
            batch.shuffle(&mut self.rng);
        }
        let mut delivered = 0;
        for envelope in batch {
            delivered += self.deliver(envelope);
        }
        delivered.max(1)
    }

    /// Deliver until no endpoint has anything left to send
    pub fn settle(&mut self) -> usize {
        let mut total = 0;
        loop {
            let delivered = self.step();
            if delivered == 0 {
                return total;
            }
            total += delivered;
        }
    }

    /// Let other tasks run, then settle, until both are quiet
    pub async fn run_until_idle(&mut self) {
        let mut quiet = 0;
        while quiet < 3 {
            tokio::task::yield_now().await;
            if self.settle() == 0 {
                quiet += 1;
            } else {
                quiet = 0;
            }
        }
    }

    /// Poll `fut` while delivering blocks until it completes
    pub async fn drive<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        let mut idle = 0u32;
        loop {
            tokio::select! {
                biased;
                out = &mut fut => return out,
                _ = tokio::task::yield_now() => {
                    if self.settle() == 0 {
                        idle += 1;
                    } else {
                        idle = 0;
                    }
                    if idle > IDLE_ROUNDS {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }

    /// Tick every runtime at the same instant and deliver what it sends
    pub fn tick_all(&mut self, now: Timestamp) {
        for endpoint in &self.order {
            if let Some(runtime) = self.runtimes.get(endpoint) {
                runtime.tick_at(now);
            }
        }
        self.settle();
    }
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("endpoints", &self.order)
            .field("pending", &self.pending())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Builds a network of named endpoints
pub struct ScenarioBuilder {
    names: Vec<String>,
    config: RuntimeConfig,
    link: LinkConfig,
    seed: u64,
    chain: bool,
}

impl ScenarioBuilder {
    pub fn new() -> Self {
        ScenarioBuilder {
            names: Vec::new(),
            config: RuntimeConfig::default(),
            link: LinkConfig::default(),
            seed: 0,
            chain: false,
        }
    }

    pub fn with_endpoints(mut self, names: &[&str]) -> Self {
        self.names = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn with_runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_link_config(mut self, link: LinkConfig) -> Self {
        self.link = link;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Link the endpoints in a line instead of fully meshing them
    pub fn as_chain(mut self) -> Self {
        self.chain = true;
        self
    }

    /// Network with every endpoint announced to every other
    pub fn build(self) -> (SimNetwork, Vec<Arc<Runtime>>) {
        let mut net = SimNetwork::with_seed(self.link, self.seed);
        let runtimes: Vec<Arc<Runtime>> = self.names.iter().map(|n| net.add(n, self.config.clone())).collect();
        if self.chain {
            for pair in runtimes.windows(2) {
                net.connect(&pair[0].endpoint(), &pair[1].endpoint());
            }
        }
        for runtime in &runtimes {
            if let Err(e) = runtime.announce() {
                tracing::warn!(endpoint = %runtime.endpoint(), error = %e, "announce failed");
            }
        }
        net.settle();
        (net, runtimes)
    }
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_reaches_everyone() {
        let (net, runtimes) = ScenarioBuilder::new().with_endpoints(&["a", "b", "c"]).build();
        for runtime in &runtimes {
            for other in &runtimes {
                if runtime.endpoint() != other.endpoint() {
                    assert_eq!(
                        runtime.keys().identity_of(&other.endpoint()),
                        Some(other.public_identity())
                    );
                }
            }
        }
        assert_eq!(net.pending(), 0);
    }

    #[test]
    fn test_chain_floods_through_relays() {
        let (net, runtimes) = ScenarioBuilder::new()
            .with_endpoints(&["a", "b", "c", "d"])
            .as_chain()
            .build();
        let (a, d) = (&runtimes[0], &runtimes[3]);
        assert!(!net.is_linked(&a.endpoint(), &d.endpoint()));
        assert_eq!(d.keys().identity_of(&a.endpoint()), Some(a.public_identity()));
        assert!(runtimes[1].stats().blocks_relayed > 0);
    }

    #[test]
    fn test_hops_skip_the_previous_hop() {
        let (net, runtimes) = ScenarioBuilder::new().with_endpoints(&["a", "b", "c"]).build();
        let envelope = Envelope {
            from: runtimes[0].endpoint(),
            block: OutboundBlock {
                bytes: Vec::new(),
                receivers: Vec::new(),
                except: Some(runtimes[1].endpoint()),
            },
        };
        assert_eq!(net.hops(&envelope), vec![runtimes[2].endpoint()]);
    }

    #[test]
    fn test_lossy_link_counts_losses() {
        let mut net = SimNetwork::with_seed(LinkConfig::lossy(1.0), 7);
        let a = net.add("a", RuntimeConfig::default());
        net.add("b", RuntimeConfig::default());
        a.announce().unwrap();
        net.settle();
        assert_eq!(net.stats().delivered, 0);
        assert_eq!(net.stats().lost, 1);
    }
}
