//! Node readiness classification.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use convoy_state::{Node, StateResult, StateStore};

/// Node records fetched during one critical section, keyed by name.
pub type NodeCache = HashMap<String, Node>;

/// Names of the nodes in `nodes` that are not `ready`.
///
/// Every node found is added to `cache`; nodes that no longer exist are
/// skipped. Call only while holding the node-assignment lock, otherwise a
/// concurrent readiness transition can race the answer.
pub fn not_ready(
    store: &StateStore,
    nodes: &[String],
    cache: &mut NodeCache,
) -> StateResult<BTreeSet<String>> {
    let mut delay = BTreeSet::new();
    for name in nodes {
        let Some(node) = store.get_node(name)? else {
            debug!(node = %name, "node vanished, skipping readiness check");
            continue;
        };
        if !node.is_ready() {
            delay.insert(name.clone());
        }
        cache.insert(name.clone(), node);
    }
    Ok(delay)
}
