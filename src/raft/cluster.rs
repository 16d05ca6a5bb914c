use std::sync::Arc;

use log::warn;

use crate::network::PeerClient;

use super::state::NodeStatus;

pub const SINGLE_NODE_NOTICE: &str =
    "This is the state of a single node. Query the leader for full cluster status.";

/// What the node task hands back for a cluster-state request.
#[derive(Debug, Clone)]
pub enum ClusterPlan {
    /// Not the leader: only this node's own record, with a notice.
    Single(NodeStatus),
    /// Leader: poll every target and append the replies after `own`.
    Poll {
        own: NodeStatus,
        targets: Vec<String>,
        term: u64,
    },
}

/// Polls every target concurrently with a one-shot `get-state`.
///
/// Replies are appended in target order after `own`. If any poll fails the
/// partial results are discarded and only `own` is returned.
pub async fn gather(
    client: Arc<PeerClient>,
    own: NodeStatus,
    targets: Vec<String>,
    term: u64,
) -> Vec<NodeStatus> {
    let own_address = own.address.clone();
    let mut polls: Vec<_> = targets
        .into_iter()
        .map(|target| {
            let client = Arc::clone(&client);
            let own_address = own_address.clone();
            tokio::spawn(async move { client.fetch_state(&target, term, &own_address).await })
        })
        .collect();

    let mut results = Vec::with_capacity(polls.len() + 1);
    results.push(own.clone());

    for i in 0..polls.len() {
        let outcome = match (&mut polls[i]).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(status) => results.push(status),
            Err(e) => {
                warn!("Error polling followers for state: {e}");
                for pending in &polls[i + 1..] {
                    pending.abort();
                }
                return vec![own];
            }
        }
    }

    results
}

pub async fn resolve(plan: ClusterPlan, client: Arc<PeerClient>) -> Vec<NodeStatus> {
    match plan {
        ClusterPlan::Single(status) => vec![status],
        ClusterPlan::Poll { own, targets, term } => gather(client, own, targets, term).await,
    }
}
