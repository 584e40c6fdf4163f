//! Block locators sent with a headers request

use tessera_common::{BlockHash, ZERO_HASH};

/// How many recent hashes to load to fill a locator
pub const LOCATOR_DEPTH: usize = 555;

/// (count, spacing) of each locator band, newest first
const BANDS: [(usize, usize); 3] = [(5, 1), (5, 10), (5, 100)];

/// Pick locator hashes from `recent`, which is ordered highest first.
/// A single zero hash asks the peer to start from genesis.
pub fn select_locator(recent: &[BlockHash]) -> Vec<BlockHash> {
    if recent.is_empty() {
        return vec![ZERO_HASH.to_string()];
    }
    let mut locator = Vec::new();
    let mut index = 0;
    for (count, spacing) in BANDS {
        for _ in 0..count {
            match recent.get(index) {
                Some(hash) => locator.push(hash.clone()),
                None => return locator,
            }
            index += spacing;
        }
    }
    locator
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashes(n: usize) -> Vec<BlockHash> {
        (0..n).map(|i| i.to_string()).collect()
    }

    #[test]
    fn empty_history_sends_zero_hash() {
        assert_eq!(select_locator(&[]), vec![ZERO_HASH.to_string()]);
    }

    #[test]
    fn short_history_is_sent_whole() {
        assert_eq!(select_locator(&hashes(3)), hashes(3));
    }

    #[test]
    fn long_history_is_sampled_sparser_with_depth() {
        let locator = select_locator(&hashes(LOCATOR_DEPTH));
        let expected: Vec<String> = [
            0, 1, 2, 3, 4, 5, 15, 25, 35, 45, 55, 155, 255, 355, 455,
        ]
        .iter()
        .map(|i| i.to_string())
        .collect();
        assert_eq!(locator, expected);
    }

    #[test]
    fn sampling_stops_at_the_oldest_hash() {
        let locator = select_locator(&hashes(30));
        assert_eq!(locator.len(), 8);
        assert_eq!(locator.last().map(String::as_str), Some("25"));
    }
}
