//! Nginx-style smooth-weighted round-robin, one step per selector call.

use std::collections::HashMap;

use ccload_common::ChannelId;

#[derive(Debug, Clone)]
pub struct SwrrEntry {
    pub channel_id: ChannelId,
    pub weight: i64,
    pub current_weight: i64,
}

/// Runs one SWRR step over `entries` (mutated in place), syncing each
/// entry's weight from `weights` first (so a change in effective key
/// count is picked up without resetting the running state). Returns
/// the channel ids in emission order: the picked channel first, then
/// the rest by post-update current_weight descending, ties by
/// ascending channel id.
pub fn swrr_round(entries: &mut Vec<SwrrEntry>, weights: &HashMap<ChannelId, i64>) -> Vec<ChannelId> {
    for e in entries.iter_mut() {
        if let Some(&w) = weights.get(&e.channel_id) {
            e.weight = w;
        }
    }
    let total: i64 = entries.iter().map(|e| e.weight).sum();
    for e in entries.iter_mut() {
        e.current_weight += e.weight;
    }

    let picked_idx = entries
        .iter()
        .enumerate()
        .fold(0usize, |best, (idx, e)| {
            let b = &entries[best];
            if e.current_weight > b.current_weight
                || (e.current_weight == b.current_weight && e.channel_id < b.channel_id)
            {
                idx
            } else {
                best
            }
        });
    entries[picked_idx].current_weight -= total;
    let picked_id = entries[picked_idx].channel_id;

    let mut rest: Vec<&SwrrEntry> = entries
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != picked_idx)
        .map(|(_, e)| e)
        .collect();
    rest.sort_unstable_by(|a, b| {
        b.current_weight
            .cmp(&a.current_weight)
            .then(a.channel_id.cmp(&b.channel_id))
    });

    let mut order = Vec::with_capacity(entries.len());
    order.push(picked_id);
    order.extend(rest.into_iter().map(|e| e.channel_id));
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_nginx_sequence_for_3_to_1_weights() {
        let mut entries = vec![
            SwrrEntry {
                channel_id: 1,
                weight: 3,
                current_weight: 0,
            },
            SwrrEntry {
                channel_id: 2,
                weight: 1,
                current_weight: 0,
            },
        ];
        let weights: HashMap<ChannelId, i64> = [(1, 3), (2, 1)].into_iter().collect();
        let mut picks = Vec::new();
        for _ in 0..4 {
            let order = swrr_round(&mut entries, &weights);
            picks.push(order[0]);
        }
        assert_eq!(picks, vec![1, 1, 2, 1]);
    }
}
