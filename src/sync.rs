//! Congestion planning: figure out which headers and bodies stand between
//! the node and the heaviest advertised chain, and shape them into typed
//! requests for the peer layer.

use std::collections::HashSet;

use serde::Serialize;

use crate::headers::HeaderDag;
use crate::types::{BlockId, PeerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RequestKind {
    /// The header itself is unknown. Peers answer with the header and are
    /// expected to keep serving ancestors until the requester can connect.
    Header,
    /// The header is known but its body has not arrived.
    Body,
}

#[derive(Clone, Debug, Serialize)]
pub struct DataRequest {
    pub id: BlockId,
    pub kind: RequestKind,
    pub preferred_peer: Option<PeerId>,
}

/// Work plan for catching up with the best advertised chains.
#[derive(Clone, Debug, Default, Serialize)]
pub struct CongestionPlan {
    pub requests: Vec<DataRequest>,
}

impl CongestionPlan {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn missing_bodies(&self) -> Vec<BlockId> {
        self.requests
            .iter()
            .filter(|request| request.kind == RequestKind::Body)
            .map(|request| request.id)
            .collect()
    }

    pub fn missing_headers(&self) -> Vec<BlockId> {
        self.requests
            .iter()
            .filter(|request| request.kind == RequestKind::Header)
            .map(|request| request.id)
            .collect()
    }
}

/// For every maximal-work header that is known but not yet functional and
/// heavier than the tip, walk its ancestry toward the last functional header
/// and collect what is missing along the way. Requests prefer the peer that
/// advertised the descendant.
pub fn plan_congestions(dag: &HeaderDag, tip: Option<&BlockId>) -> CongestionPlan {
    let tip_work = tip
        .and_then(|tip| dag.get(tip))
        .map(|record| record.header.chain_work)
        .unwrap_or(0);

    let mut candidates: Vec<BlockId> = dag
        .iter()
        .filter(|(id, record)| {
            !record.flags.insane
                && !record.flags.functional
                && record.header.chain_work > tip_work
                && dag
                    .children_of(&id.hash)
                    .iter()
                    .all(|child| dag.get(child).map_or(true, |c| c.flags.insane))
        })
        .map(|(id, _)| *id)
        .collect();
    candidates.sort_by(|a, b| {
        let work_a = dag.get(a).map(|r| r.header.chain_work).unwrap_or(0);
        let work_b = dag.get(b).map(|r| r.header.chain_work).unwrap_or(0);
        work_b.cmp(&work_a).then_with(|| a.hash.cmp(&b.hash))
    });

    let mut seen: HashSet<(RequestKind, BlockId)> = HashSet::new();
    let mut plan = CongestionPlan::default();
    for candidate in candidates {
        let advertiser = dag.get(&candidate).and_then(|record| record.peer);
        let mut cursor = Some(candidate);
        while let Some(current) = cursor.take() {
            match dag.get(&current) {
                None => {
                    if seen.insert((RequestKind::Header, current)) {
                        plan.requests.push(DataRequest {
                            id: current,
                            kind: RequestKind::Header,
                            preferred_peer: advertiser,
                        });
                    }
                }
                Some(record) => {
                    if record.flags.functional {
                        continue;
                    }
                    if !record.body && seen.insert((RequestKind::Body, current)) {
                        plan.requests.push(DataRequest {
                            id: current,
                            kind: RequestKind::Body,
                            preferred_peer: advertiser.or(record.peer),
                        });
                    }
                    cursor = record.parent_id();
                }
            }
        }
    }
    plan
}
