use std::{cmp, collections::VecDeque, net::SocketAddr, sync::Arc, time::Instant};

use crate::clock::Clock;

use super::node_id::NodeId;

/// The most live nodes a bucket holds. The canonical mainline DHT value.
pub const BUCKET_MAX: usize = 8;

/// The most candidates a bucket's replacement cache holds.
const REPLACEMENT_MAX: usize = 8;

/// A node is evicted once it fails more than this many RPCs in a row and
/// a replacement candidate is available.
const MAX_FAILED_RPCS: u8 = 2;

/// The midpoint of the full id space, `2^159`.
fn top_half() -> NodeId {
    let mut bytes = [0; 20];
    bytes[0] = 0x80;
    NodeId::new(bytes)
}

/// A remote DHT node.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// When we last heard from the node.
    last_seen: Instant,
    /// How many RPCs in a row the node has failed to answer.
    failed_rpcs: u8,
}

impl Node {
    pub fn new(id: NodeId, addr: SocketAddr, now: Instant) -> Self {
        Self {
            id,
            addr,
            last_seen: now,
            failed_rpcs: 0,
        }
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn failed_rpcs(&self) -> u8 {
        self.failed_rpcs
    }
}

/// The outcome of [`RoutingTable::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddResult {
    /// The node was new and was inserted live.
    Added,
    /// A node with this id is already in the table; its last seen time was
    /// refreshed.
    AlreadyPresent,
    /// The bucket was full and couldn't split; the node went to the
    /// bucket's replacement cache.
    Rejected,
    /// The bucket was full but held a repeatedly failing node, which the
    /// new node replaced.
    Replaced,
}

/// Gets notified of routing table changes. Delivery is synchronous on the
/// caller's task.
pub trait TableObserver: Send {
    fn node_added(&mut self, node: &Node);
}

/// A contiguous slice `[start, end)` of the id space.
///
/// `end` of `None` stands for `2^160`, which doesn't fit an id. Live nodes
/// are kept ordered by last seen time, oldest first, so position doubles as
/// the LRU order.
#[derive(Clone, Debug)]
pub struct Bucket {
    start: NodeId,
    end: Option<NodeId>,
    nodes: Vec<Node>,
    replacements: VecDeque<Node>,
}

impl Bucket {
    fn new(start: NodeId, end: Option<NodeId>) -> Self {
        Self {
            start,
            end,
            nodes: Vec::with_capacity(BUCKET_MAX),
            replacements: VecDeque::new(),
        }
    }

    pub fn start(&self) -> &NodeId {
        &self.start
    }

    /// The exclusive end of the bucket's range, `None` meaning `2^160`.
    pub fn end(&self) -> Option<&NodeId> {
        self.end.as_ref()
    }

    /// The bucket's live nodes, ordered oldest seen first.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// The candidates waiting for a live slot to open up.
    pub fn replacements(&self) -> impl Iterator<Item = &Node> {
        self.replacements.iter()
    }

    fn could_hold(&self, id: &NodeId) -> bool {
        &self.start <= id && self.end.as_ref().map_or(true, |end| id < end)
    }

    fn idx_of(&self, id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|node| &node.id == id)
    }

    /// The point at which the bucket splits, `start + (end - start) / 2`.
    fn midpoint(&self) -> NodeId {
        match &self.end {
            Some(end) => {
                let half = end.wrapping_sub(&self.start).shr1();
                self.start.wrapping_add(&half)
            }
            // end is 2^160; for a zero start the difference is the whole
            // space, otherwise it's the two's complement of start
            None if self.start == NodeId::MIN => top_half(),
            None => {
                let half = self.start.wrapping_neg().shr1();
                self.start.wrapping_add(&half)
            }
        }
    }

    fn cache_replacement(&mut self, node: Node) {
        if let Some(pos) =
            self.replacements.iter().position(|n| n.id == node.id)
        {
            self.replacements.remove(pos);
        } else if self.replacements.len() == REPLACEMENT_MAX {
            self.replacements.pop_front();
        }
        self.replacements.push_back(node);
    }
}

/// The Kademlia routing table: an ordered list of buckets partitioning the
/// 160-bit id space with no gaps and no overlaps.
///
/// Exactly one bucket contains the local id. Only that bucket splits when it
/// overflows; all others push overflow into their replacement cache.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    clock: Arc<dyn Clock>,
    observers: Vec<Box<dyn TableObserver>>,
}

impl RoutingTable {
    /// Creates a table with a single bucket spanning the entire id space.
    pub fn new(local_id: NodeId, clock: Arc<dyn Clock>) -> Self {
        Self {
            local_id,
            buckets: vec![Bucket::new(NodeId::MIN, None)],
            clock,
            observers: Vec::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Registers an observer for node additions.
    pub fn subscribe(&mut self, observer: Box<dyn TableObserver>) {
        self.observers.push(observer);
    }

    /// A read-only view of the buckets, ordered by range.
    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// The number of live nodes across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all nodes, collapsing the table back to a single bucket.
    pub fn clear(&mut self) {
        self.buckets = vec![Bucket::new(NodeId::MIN, None)];
    }

    /// Inserts a node observed by the DHT subsystem.
    ///
    /// If the node is already present only its last seen time is refreshed.
    /// A full bucket containing the local id is split and the insert
    /// retried; a full bucket elsewhere either replaces a repeatedly
    /// failing node or pushes the candidate into the replacement cache.
    pub fn add(&mut self, node: Node) -> AddResult {
        let now = self.clock.now();
        loop {
            let idx = self.bucket_idx(&node.id);
            let bucket = &mut self.buckets[idx];

            if let Some(pos) = bucket.idx_of(&node.id) {
                let mut present = bucket.nodes.remove(pos);
                present.last_seen = now;
                bucket.nodes.push(present);
                return AddResult::AlreadyPresent;
            }

            if bucket.nodes.len() < BUCKET_MAX {
                bucket.nodes.push(node);
                let node = bucket.nodes.last().expect("just pushed");
                Self::notify_added(&mut self.observers, node);
                return AddResult::Added;
            }

            if bucket.could_hold(&self.local_id) {
                self.split(idx);
                continue;
            }

            // the bucket can't grow; a node that keeps failing its RPCs
            // gives up its slot, otherwise the candidate waits in the
            // replacement cache
            return if let Some(pos) = bucket
                .nodes
                .iter()
                .position(|n| n.failed_rpcs > MAX_FAILED_RPCS)
            {
                bucket.nodes.remove(pos);
                bucket.nodes.push(node);
                let node = bucket.nodes.last().expect("just pushed");
                Self::notify_added(&mut self.observers, node);
                AddResult::Replaced
            } else {
                bucket.cache_replacement(node);
                AddResult::Rejected
            };
        }
    }

    /// Returns up to `k` nodes closest to `target` by XOR distance, sorted
    /// ascending. Ties are broken by id order.
    pub fn closest(&self, target: &NodeId, k: usize) -> Vec<&Node> {
        let mut nodes: Vec<&Node> =
            self.buckets.iter().flat_map(|b| b.nodes.iter()).collect();
        nodes.sort_by_key(|node| (node.id.distance(target), node.id));
        nodes.truncate(k);
        nodes
    }

    /// Notes that the node answered an RPC: refreshes its last seen time
    /// and clears its failure streak.
    pub fn record_response(&mut self, id: &NodeId) {
        let now = self.clock.now();
        let idx = self.bucket_idx(id);
        let bucket = &mut self.buckets[idx];
        if let Some(pos) = bucket.idx_of(id) {
            let mut node = bucket.nodes.remove(pos);
            node.last_seen = now;
            node.failed_rpcs = 0;
            bucket.nodes.push(node);
        }
    }

    /// Notes that the node failed to answer an RPC. Once the failure streak
    /// exceeds the threshold and a replacement candidate exists, the node
    /// is evicted and the freshest candidate promoted.
    pub fn record_failure(&mut self, id: &NodeId) {
        let idx = self.bucket_idx(id);
        let bucket = &mut self.buckets[idx];
        let pos = match bucket.idx_of(id) {
            Some(pos) => pos,
            None => return,
        };
        bucket.nodes[pos].failed_rpcs += 1;
        if bucket.nodes[pos].failed_rpcs > MAX_FAILED_RPCS {
            if let Some(replacement) = bucket.replacements.pop_back() {
                log::debug!(
                    "Evicting unresponsive node {} for {}",
                    id,
                    replacement.id
                );
                bucket.nodes.remove(pos);
                bucket.nodes.push(replacement);
                let node = bucket.nodes.last().expect("just pushed");
                Self::notify_added(&mut self.observers, node);
            }
        }
    }

    fn notify_added(observers: &mut [Box<dyn TableObserver>], node: &Node) {
        log::trace!("Node {} added to routing table", node.id);
        for observer in observers {
            observer.node_added(node);
        }
    }

    /// The index of the unique bucket whose range contains `id`.
    fn bucket_idx(&self, id: &NodeId) -> usize {
        self.buckets
            .binary_search_by(|bucket| {
                if bucket.could_hold(id) {
                    cmp::Ordering::Equal
                } else {
                    bucket.start.cmp(id)
                }
            })
            .expect("buckets always cover the full id space")
    }

    /// Splits the bucket at `idx` at its midpoint, migrating each node and
    /// replacement candidate to whichever half contains its id.
    fn split(&mut self, idx: usize) {
        let bucket = &mut self.buckets[idx];
        let midpoint = bucket.midpoint();
        log::trace!(
            "Splitting bucket [{}, {:?}) at {}",
            bucket.start,
            bucket.end,
            midpoint
        );

        let mut right = Bucket::new(midpoint, bucket.end.take());
        bucket.end = Some(midpoint);

        let nodes = std::mem::replace(
            &mut bucket.nodes,
            Vec::with_capacity(BUCKET_MAX),
        );
        for node in nodes {
            if bucket.could_hold(&node.id) {
                bucket.nodes.push(node);
            } else {
                right.nodes.push(node);
            }
        }
        let replacements = std::mem::take(&mut bucket.replacements);
        for node in replacements {
            if bucket.could_hold(&node.id) {
                bucket.replacements.push_back(node);
            } else {
                right.replacements.push_back(node);
            }
        }

        self.buckets.insert(idx + 1, right);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use pretty_assertions::assert_eq;

    use crate::clock::{test::VirtualClock, SystemClock};

    use super::*;

    fn id(first: &[u8]) -> NodeId {
        let mut bytes = [0; 20];
        bytes[..first.len()].copy_from_slice(first);
        NodeId::new(bytes)
    }

    fn node(table: &RoutingTable, id: NodeId) -> Node {
        Node::new(id, "127.0.0.1:6881".parse().unwrap(), table.clock.now())
    }

    struct CountingObserver(Arc<AtomicUsize>);

    impl TableObserver for CountingObserver {
        fn node_added(&mut self, _: &Node) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Checks the four structural invariants of the table: buckets cover
    /// the id space contiguously, nodes live in the bucket containing their
    /// id, no bucket is over capacity, and exactly one bucket holds the
    /// local id.
    fn check_invariants(table: &RoutingTable) {
        let buckets = table.buckets();
        assert_eq!(*buckets[0].start(), NodeId::MIN);
        assert!(buckets.last().unwrap().end().is_none());
        for pair in buckets.windows(2) {
            assert_eq!(pair[0].end(), Some(pair[1].start()));
        }
        for bucket in buckets {
            assert!(bucket.nodes().len() <= BUCKET_MAX);
            for node in bucket.nodes() {
                assert!(bucket.could_hold(&node.id));
            }
        }
        let holding_local = buckets
            .iter()
            .filter(|b| b.could_hold(table.local_id()))
            .count();
        assert_eq!(holding_local, 1);
    }

    #[test]
    fn test_fill_single_bucket() {
        let events = Arc::new(AtomicUsize::new(0));
        let mut table = RoutingTable::new(
            id(&[0x80]),
            Arc::new(SystemClock),
        );
        table.subscribe(Box::new(CountingObserver(Arc::clone(&events))));

        for i in 1..=8u8 {
            let n = node(&table, id(&[0x80, i]));
            assert_eq!(table.add(n), AddResult::Added);
        }

        assert_eq!(table.buckets().len(), 1);
        assert_eq!(table.len(), 8);
        assert_eq!(events.load(Ordering::SeqCst), 8);
        check_invariants(&table);
    }

    #[test]
    fn test_split_cadence() {
        let mut table =
            RoutingTable::new(NodeId::MIN, Arc::new(SystemClock));

        for i in 0x00..0x18u8 {
            let n = node(&table, id(&[i]));
            assert_eq!(table.add(n), AddResult::Added);
        }

        let sizes: Vec<usize> =
            table.buckets().iter().map(|b| b.nodes().len()).collect();
        assert_eq!(sizes, vec![8, 8, 8, 0, 0, 0]);
        check_invariants(&table);
    }

    #[test]
    fn test_add_refreshes_existing() {
        let clock = Arc::new(VirtualClock::new());
        let mut table =
            RoutingTable::new(NodeId::MIN, Arc::clone(&clock) as Arc<dyn Clock>);

        let n = node(&table, id(&[0x42]));
        let first_seen = n.last_seen();
        assert_eq!(table.add(n.clone()), AddResult::Added);

        clock.advance(std::time::Duration::from_secs(60));
        assert_eq!(table.add(n), AddResult::AlreadyPresent);

        let refreshed = &table.buckets()[0].nodes()[0];
        assert!(refreshed.last_seen() > first_seen);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_invariants_hold_under_random_adds() {
        let mut table =
            RoutingTable::new(NodeId::random(), Arc::new(SystemClock));
        for _ in 0..500 {
            let n = node(&table, NodeId::random());
            table.add(n);
        }
        check_invariants(&table);
    }

    #[test]
    fn test_closest_matches_brute_force() {
        let mut table =
            RoutingTable::new(NodeId::random(), Arc::new(SystemClock));
        let mut all = Vec::new();
        for _ in 0..100 {
            let n = node(&table, NodeId::random());
            if table.add(n.clone()) == AddResult::Added {
                all.push(n.id);
            }
        }

        let target = NodeId::random();
        let closest: Vec<NodeId> = table
            .closest(&target, 8)
            .into_iter()
            .map(|n| n.id)
            .collect();

        all.sort_by_key(|id| (id.distance(&target), *id));
        all.truncate(8);
        assert_eq!(closest, all);
        // the result is sorted ascending by distance
        for pair in closest.windows(2) {
            assert!(pair[0].distance(&target) <= pair[1].distance(&target));
        }
    }

    #[test]
    fn test_full_far_bucket_rejects_into_replacement_cache() {
        // local id in the top half; the bottom half bucket can't split once
        // the first split has separated it from the local id
        let mut table =
            RoutingTable::new(id(&[0xff]), Arc::new(SystemClock));

        // fill [0, 2^160) to force a split, then overfill the bottom half
        for i in 0..=8u8 {
            let n = node(&table, id(&[i, 1]));
            table.add(n);
        }
        // buckets are now [0, 0x80..) and [0x80.., 2^160); keep stuffing
        // the bottom one
        for i in 9..32u8 {
            let n = node(&table, id(&[0, i]));
            let result = table.add(n);
            assert!(
                result == AddResult::Added || result == AddResult::Rejected
            );
        }

        check_invariants(&table);
        let bottom = &table.buckets()[0];
        assert_eq!(bottom.nodes().len(), BUCKET_MAX);
        assert!(bottom.replacements().count() > 0);
        assert!(bottom.replacements().count() <= REPLACEMENT_MAX);
    }

    #[test]
    fn test_failed_node_evicted_for_replacement() {
        let mut table =
            RoutingTable::new(id(&[0xff]), Arc::new(SystemClock));

        // fill the bottom-half bucket and cache one replacement
        for i in 1..=16u8 {
            let n = node(&table, id(&[0, i]));
            table.add(n);
        }
        let bottom_size = table.buckets()[0].nodes().len();
        assert_eq!(bottom_size, BUCKET_MAX);
        let spare = node(&table, id(&[0, 0xaa]));
        assert_eq!(table.add(spare), AddResult::Rejected);

        let victim = id(&[0, 1]);
        for _ in 0..3 {
            table.record_failure(&victim);
        }

        let bottom = &table.buckets()[0];
        assert_eq!(bottom.nodes().len(), BUCKET_MAX);
        assert!(bottom.idx_of(&victim).is_none());
        assert!(bottom.idx_of(&id(&[0, 0xaa])).is_some());
        check_invariants(&table);
    }

    #[test]
    fn test_add_replaces_failed_node() {
        let mut table =
            RoutingTable::new(id(&[0xff]), Arc::new(SystemClock));
        // fill the initial bucket with bottom-half ids, then force the
        // split with a top-half node; the bottom bucket ends up full with
        // an empty replacement cache
        for i in 1..=8u8 {
            let n = node(&table, id(&[0, i]));
            table.add(n);
        }
        let n = node(&table, id(&[0x90, 1]));
        assert_eq!(table.add(n), AddResult::Added);
        assert_eq!(table.buckets()[0].replacements().count(), 0);

        // with no replacement cached the failing node stays in place until
        // an add comes along to take its slot
        let victim = id(&[0, 2]);
        for _ in 0..3 {
            table.record_failure(&victim);
        }
        assert!(table.buckets()[0].idx_of(&victim).is_some());

        let fresh = node(&table, id(&[0, 0xbb]));
        assert_eq!(table.add(fresh), AddResult::Replaced);
        let bottom = &table.buckets()[0];
        assert!(bottom.idx_of(&victim).is_none());
        assert!(bottom.idx_of(&id(&[0, 0xbb])).is_some());
        check_invariants(&table);
    }

    #[test]
    fn test_clear() {
        let mut table =
            RoutingTable::new(NodeId::random(), Arc::new(SystemClock));
        for _ in 0..100 {
            let n = node(&table, NodeId::random());
            table.add(n);
        }
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.buckets().len(), 1);
    }

    #[test]
    fn test_midpoint() {
        let full = Bucket::new(NodeId::MIN, None);
        assert_eq!(full.midpoint(), id(&[0x80]));

        let top = Bucket::new(id(&[0x80]), None);
        assert_eq!(top.midpoint(), id(&[0xc0]));

        let bounded = Bucket::new(id(&[0x40]), Some(id(&[0x80])));
        assert_eq!(bounded.midpoint(), id(&[0x60]));
    }

    #[test]
    fn test_record_on_unknown_id_is_noop() {
        let clock = Arc::new(VirtualClock::new());
        let mut table =
            RoutingTable::new(NodeId::MIN, Arc::clone(&clock) as Arc<dyn Clock>);
        table.record_failure(&id(&[1]));
        table.record_response(&id(&[1]));
        assert!(table.is_empty());
    }

    #[test]
    fn test_observers_are_objects() {
        // observers may capture shared state
        let log = Arc::new(Mutex::new(Vec::new()));
        struct Recorder(Arc<Mutex<Vec<NodeId>>>);
        impl TableObserver for Recorder {
            fn node_added(&mut self, node: &Node) {
                self.0.lock().unwrap().push(node.id);
            }
        }

        let mut table = RoutingTable::new(NodeId::MIN, Arc::new(SystemClock));
        table.subscribe(Box::new(Recorder(Arc::clone(&log))));
        let n = node(&table, id(&[7]));
        table.add(n);
        assert_eq!(&*log.lock().unwrap(), &[id(&[7])]);
    }
}
