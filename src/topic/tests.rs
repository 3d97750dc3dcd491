use super::*;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn ids<const N: usize>() -> [ConnectionId; N] {
    std::array::from_fn(|_| ConnectionId::next())
}

fn sorted(mut subs: Vec<Subscription>) -> Vec<(ConnectionId, QoS)> {
    let mut out: Vec<_> = subs.drain(..).map(|s| (s.connection, s.qos)).collect();
    out.sort();
    out
}

#[test]
fn test_insert_and_lookup() {
    let [a, b] = ids();
    let mut reg = SubscriptionRegistry::new();

    assert!(reg.insert("sensors/temp", a, QoS::AtLeastOnce));
    assert!(reg.insert("sensors/temp", b, QoS::AtMostOnce));
    assert!(reg.insert("alerts", a, QoS::ExactlyOnce));

    assert_eq!(
        sorted(reg.lookup_by_topic("sensors/temp")),
        vec![(a, QoS::AtLeastOnce), (b, QoS::AtMostOnce)]
    );
    assert_eq!(reg.len(), 3);
    assert_eq!(reg.topic_count(), 2);
}

#[test]
fn test_exact_match_only() {
    let [a] = ids();
    let mut reg = SubscriptionRegistry::new();
    reg.insert("a/+", a, QoS::AtMostOnce);
    reg.insert("a/#", a, QoS::AtMostOnce);

    assert!(reg.lookup_by_topic("a/b").is_empty());
    assert!(reg.lookup_by_topic("a").is_empty());
    assert!(reg.lookup_by_topic("A/+").is_empty());
    assert_eq!(reg.lookup_by_topic("a/+").len(), 1);
}

#[test]
fn test_lookup_shares_topic_arc() {
    let [a, b] = ids();
    let mut reg = SubscriptionRegistry::new();
    reg.insert("t", a, QoS::AtMostOnce);
    reg.insert("t", b, QoS::AtMostOnce);

    let subs = reg.lookup_by_topic("t");
    assert!(Arc::ptr_eq(&subs[0].topic, &subs[1].topic));
}

#[test]
fn test_resubscribe_replace_updates_qos() {
    let [a] = ids();
    let mut reg = SubscriptionRegistry::new();

    assert!(reg.insert("t", a, QoS::AtMostOnce));
    assert!(!reg.insert("t", a, QoS::ExactlyOnce));

    assert_eq!(sorted(reg.lookup_by_topic("t")), vec![(a, QoS::ExactlyOnce)]);
    assert_eq!(reg.len(), 1);
}

#[test]
fn test_resubscribe_append_keeps_duplicates() {
    let [a] = ids();
    let mut reg = SubscriptionRegistry::with_policy(ResubscribePolicy::Append);

    assert!(reg.insert("t", a, QoS::AtMostOnce));
    assert!(reg.insert("t", a, QoS::AtLeastOnce));

    assert_eq!(
        sorted(reg.lookup_by_topic("t")),
        vec![(a, QoS::AtMostOnce), (a, QoS::AtLeastOnce)]
    );
    assert_eq!(reg.len(), 2);
    assert_eq!(reg.topics_for(a).len(), 1);

    assert_eq!(reg.remove_by_connection(a), 2);
    assert!(reg.is_empty());
}

#[test]
fn test_remove_by_topic_removes_all_owners() {
    let [a, b] = ids();
    let mut reg = SubscriptionRegistry::new();
    reg.insert("t", a, QoS::AtMostOnce);
    reg.insert("t", b, QoS::AtMostOnce);
    reg.insert("other", b, QoS::AtMostOnce);

    assert_eq!(reg.remove_by_topic("t"), 2);
    assert!(reg.lookup_by_topic("t").is_empty());
    assert!(reg.topics_for(a).is_empty());
    assert_eq!(reg.topics_for(b), vec![Arc::<str>::from("other")]);
    assert_eq!(reg.remove_by_topic("t"), 0);
}

#[test]
fn test_remove_is_scoped_to_connection() {
    let [a, b] = ids();
    let mut reg = SubscriptionRegistry::new();
    reg.insert("t", a, QoS::AtMostOnce);
    reg.insert("t", b, QoS::AtLeastOnce);

    assert_eq!(reg.remove("t", a), 1);
    assert_eq!(sorted(reg.lookup_by_topic("t")), vec![(b, QoS::AtLeastOnce)]);
    assert_eq!(reg.remove("t", a), 0);
    assert_eq!(reg.remove("never", a), 0);
}

#[test]
fn test_remove_by_connection_leaves_others() {
    let [a, b] = ids();
    let mut reg = SubscriptionRegistry::new();
    reg.insert("x", a, QoS::AtMostOnce);
    reg.insert("x", b, QoS::AtLeastOnce);
    reg.insert("y", a, QoS::ExactlyOnce);

    assert_eq!(reg.remove_by_connection(a), 2);

    assert_eq!(sorted(reg.lookup_by_topic("x")), vec![(b, QoS::AtLeastOnce)]);
    assert!(reg.lookup_by_topic("y").is_empty());
    assert_eq!(reg.topic_count(), 1);
    assert_eq!(reg.remove_by_connection(a), 0);
}

#[test]
fn test_for_each_match() {
    let [a, b] = ids();
    let mut reg = SubscriptionRegistry::new();
    reg.insert("t", a, QoS::AtMostOnce);
    reg.insert("t", b, QoS::ExactlyOnce);

    let mut seen = Vec::new();
    reg.for_each_match("t", |conn, qos| seen.push((conn, qos)));
    seen.sort();
    assert_eq!(seen, vec![(a, QoS::AtMostOnce), (b, QoS::ExactlyOnce)]);

    reg.for_each_match("missing", |_, _| panic!("no subscribers expected"));
}

// ============================================================================
// Model comparison
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Insert(usize, usize, u8),
    Remove(usize, usize),
    RemoveByTopic(usize),
    RemoveByConnection(usize),
}

const TOPICS: [&str; 4] = ["a", "a/b", "sensors/temp", "alerts"];
const CONNECTIONS: usize = 4;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..TOPICS.len(), 0..CONNECTIONS, 0u8..3).prop_map(|(t, c, q)| Op::Insert(t, c, q)),
        2 => (0..TOPICS.len(), 0..CONNECTIONS).prop_map(|(t, c)| Op::Remove(t, c)),
        1 => (0..TOPICS.len()).prop_map(Op::RemoveByTopic),
        1 => (0..CONNECTIONS).prop_map(Op::RemoveByConnection),
    ]
}

/// Flat list of triples with the same semantics as the registry
#[derive(Default)]
struct Model {
    policy: ResubscribePolicy,
    entries: Vec<(usize, usize, QoS)>,
}

impl Model {
    fn apply(&mut self, op: &Op) -> usize {
        match *op {
            Op::Insert(t, c, q) => {
                let qos = QoS::from_u8(q).unwrap();
                if self.policy == ResubscribePolicy::Replace {
                    if let Some(e) = self.entries.iter_mut().find(|e| e.0 == t && e.1 == c) {
                        e.2 = qos;
                        return 0;
                    }
                }
                self.entries.push((t, c, qos));
                1
            }
            Op::Remove(t, c) => self.retain(|e| !(e.0 == t && e.1 == c)),
            Op::RemoveByTopic(t) => self.retain(|e| e.0 != t),
            Op::RemoveByConnection(c) => self.retain(|e| e.1 != c),
        }
    }

    fn retain(&mut self, keep: impl Fn(&(usize, usize, QoS)) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| keep(e));
        before - self.entries.len()
    }
}

fn check_against_model(policy: ResubscribePolicy, ops: &[Op]) -> Result<(), TestCaseError> {
    let conns = ids::<CONNECTIONS>();
    let mut reg = SubscriptionRegistry::with_policy(policy);
    let mut model = Model {
        policy,
        ..Default::default()
    };

    for op in ops {
        let expected = model.apply(op);
        let actual = match *op {
            Op::Insert(t, c, q) => {
                usize::from(reg.insert(TOPICS[t], conns[c], QoS::from_u8(q).unwrap()))
            }
            Op::Remove(t, c) => reg.remove(TOPICS[t], conns[c]),
            Op::RemoveByTopic(t) => reg.remove_by_topic(TOPICS[t]),
            Op::RemoveByConnection(c) => reg.remove_by_connection(conns[c]),
        };
        prop_assert_eq!(actual, expected, "op {:?}", op);
    }

    prop_assert_eq!(reg.len(), model.entries.len());
    for (t, topic) in TOPICS.iter().enumerate() {
        let mut expected: Vec<_> = model
            .entries
            .iter()
            .filter(|e| e.0 == t)
            .map(|e| (conns[e.1], e.2))
            .collect();
        expected.sort();
        prop_assert_eq!(sorted(reg.lookup_by_topic(topic)), expected);
    }
    for (c, conn) in conns.iter().enumerate() {
        let mut expected: Vec<&str> = model
            .entries
            .iter()
            .filter(|e| e.1 == c)
            .map(|e| TOPICS[e.0])
            .collect();
        expected.sort();
        expected.dedup();
        let topics = reg.topics_for(*conn);
        let mut actual: Vec<&str> = topics.iter().map(|t| t.as_ref()).collect();
        actual.sort();
        prop_assert_eq!(actual, expected);
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_registry_matches_model_replace(ops in prop::collection::vec(op_strategy(), 0..64)) {
        check_against_model(ResubscribePolicy::Replace, &ops)?;
    }

    #[test]
    fn prop_registry_matches_model_append(ops in prop::collection::vec(op_strategy(), 0..64)) {
        check_against_model(ResubscribePolicy::Append, &ops)?;
    }
}
