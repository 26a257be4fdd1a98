//! Placement policy: which storage nodes receive the blocks of a write
use std::collections::HashSet;

use silo_rpc::control::NodeStatus;
use silo_util::data::*;

use crate::error::MetaError;
use crate::schema::NodeRecord;

/// Select the storage nodes that will hold each of `num_blocks` blocks.
/// For every block the first node of its assignment is the write leader,
/// the others are followers.
///
/// Candidates are the ACTIVE nodes with room for a block, minus
/// `exclude`. Nodes are ranked by free space descending, then fewest
/// blocks stored, then node id; as blocks are assigned, the working copy
/// of each node's free space and block count is charged, which both
/// spreads consecutive blocks over different node pairs and keeps the
/// long-run distribution proportional to free capacity.
pub fn select_nodes_for_write(
	nodes: &[NodeRecord],
	num_blocks: usize,
	block_size: u64,
	replicas: usize,
	exclude: &[Uuid],
) -> Result<Vec<Vec<NodeRecord>>, MetaError> {
	let excluded: HashSet<&Uuid> = exclude.iter().collect();

	struct Candidate {
		record: NodeRecord,
		remaining: u64,
		assigned: u64,
	}

	let mut candidates: Vec<Candidate> = nodes
		.iter()
		.filter(|n| n.status == NodeStatus::Active)
		.filter(|n| n.available_space >= block_size && n.available_space > 0)
		.filter(|n| !excluded.contains(&n.id))
		.map(|n| Candidate {
			record: n.clone(),
			remaining: n.available_space,
			assigned: 0,
		})
		.collect();

	if candidates.len() < replicas {
		return Err(MetaError::NoEligibleNodes(format!(
			"{} eligible node(s), {} required",
			candidates.len(),
			replicas
		)));
	}

	let mut assignments = Vec::with_capacity(num_blocks);
	for _ in 0..num_blocks {
		candidates.sort_by(|a, b| {
			b.remaining
				.cmp(&a.remaining)
				.then_with(|| {
					(a.record.blocks_stored + a.assigned).cmp(&(b.record.blocks_stored + b.assigned))
				})
				.then_with(|| a.record.id.cmp(&b.record.id))
		});

		// Not enough room left on enough distinct nodes
		if candidates
			.iter()
			.take(replicas)
			.any(|c| c.remaining < block_size)
		{
			return Err(MetaError::CapacityExceeded(format!(
				"not enough free space for {} replica(s) of a {} byte block",
				replicas, block_size
			)));
		}

		let chosen: Vec<NodeRecord> = candidates
			.iter()
			.take(replicas)
			.map(|c| c.record.clone())
			.collect();
		for c in candidates.iter_mut().take(replicas) {
			c.remaining = c.remaining.saturating_sub(block_size);
			c.assigned += 1;
		}
		assignments.push(chosen);
	}

	Ok(assignments)
}

#[cfg(test)]
mod tests {
	use super::*;
	use silo_util::time::now_msec;

	fn node(id_byte: u8, available: u64, blocks_stored: u64) -> NodeRecord {
		NodeRecord {
			id: [id_byte; 32].into(),
			hostname: format!("node{}", id_byte),
			rpc_port: 3900 + id_byte as u16,
			storage_capacity: available,
			available_space: available,
			status: NodeStatus::Active,
			last_heartbeat_msec: now_msec(),
			blocks_stored,
		}
	}

	#[test]
	fn test_basic_selection() {
		let nodes = vec![node(1, 1 << 30, 0), node(2, 1 << 30, 0), node(3, 1 << 30, 0)];
		let placement = select_nodes_for_write(&nodes, 3, 4096, 2, &[]).unwrap();
		assert_eq!(placement.len(), 3);
		for assignment in placement.iter() {
			assert_eq!(assignment.len(), 2);
			assert_ne!(assignment[0].id, assignment[1].id);
		}
	}

	#[test]
	fn test_consecutive_blocks_rotate() {
		let nodes = vec![node(1, 1 << 30, 0), node(2, 1 << 30, 0), node(3, 1 << 30, 0)];
		let placement = select_nodes_for_write(&nodes, 2, 4096, 2, &[]).unwrap();
		let pair0: HashSet<Uuid> = placement[0].iter().map(|n| n.id).collect();
		let pair1: HashSet<Uuid> = placement[1].iter().map(|n| n.id).collect();
		assert_ne!(pair0, pair1);
	}

	#[test]
	fn test_zero_space_node_never_selected() {
		let nodes = vec![node(1, 1 << 30, 0), node(2, 1 << 30, 0), node(3, 0, 0)];
		let placement = select_nodes_for_write(&nodes, 10, 4096, 2, &[]).unwrap();
		for assignment in placement.iter().flatten() {
			assert_ne!(assignment.id, nodes[2].id);
		}
	}

	#[test]
	fn test_inactive_node_never_selected() {
		let mut n2 = node(2, 1 << 30, 0);
		n2.status = NodeStatus::Inactive;
		let nodes = vec![node(1, 1 << 30, 0), n2, node(3, 1 << 30, 0)];
		let placement = select_nodes_for_write(&nodes, 5, 4096, 2, &[]).unwrap();
		for assignment in placement.iter().flatten() {
			assert_ne!(assignment.id, nodes[1].id);
		}
	}

	#[test]
	fn test_not_enough_nodes() {
		let nodes = vec![node(1, 1 << 30, 0)];
		assert!(matches!(
			select_nodes_for_write(&nodes, 1, 4096, 2, &[]),
			Err(MetaError::NoEligibleNodes(_))
		));
	}

	#[test]
	fn test_exclusion() {
		let nodes = vec![node(1, 1 << 30, 0), node(2, 1 << 30, 0), node(3, 1 << 30, 0)];
		let exclude = vec![nodes[0].id, nodes[1].id];
		let placement = select_nodes_for_write(&nodes, 1, 4096, 1, &exclude).unwrap();
		assert_eq!(placement[0][0].id, nodes[2].id);
	}

	#[test]
	fn test_weighted_fairness() {
		// One node with 100 GiB free, two with 10 GiB. Placing 20 blocks
		// with 2 replicas each: the large node takes one replica of
		// every block, the small ones split the rest about evenly.
		let nodes = vec![
			node(1, 100 << 30, 0),
			node(2, 10 << 30, 0),
			node(3, 10 << 30, 0),
		];
		let placement = select_nodes_for_write(&nodes, 20, 4096, 2, &[]).unwrap();

		let mut counts = std::collections::HashMap::new();
		for n in placement.iter().flatten() {
			*counts.entry(n.id).or_insert(0u64) += 1;
		}
		assert_eq!(counts[&nodes[0].id], 20);
		let c2 = counts[&nodes[1].id];
		let c3 = counts[&nodes[2].id];
		assert_eq!(c2 + c3, 20);
		assert!((c2 as i64 - c3 as i64).abs() <= 2);
	}

	#[test]
	fn test_deterministic_tiebreak_by_id() {
		// Identical free space and block counts: node id decides
		let nodes = vec![node(3, 1 << 30, 0), node(1, 1 << 30, 0), node(2, 1 << 30, 0)];
		let placement = select_nodes_for_write(&nodes, 1, 4096, 2, &[]).unwrap();
		assert_eq!(placement[0][0].id, nodes[1].id);
		assert_eq!(placement[0][1].id, nodes[2].id);
	}
}
