//! Transmit channel selection from channel sets.

use super::config::ChannelRange;
use super::phy::Channel;
use super::primitives::ChannelSetIndex;
use super::random::RandomSource;

/// Transmit channels usable for a frame.
///
/// `Any` keeps every transmit channel. A radio with a single transmit channel
/// uses it whatever the sets say. Otherwise only channels inside the selected
/// set's range are kept; a set that does not exist yields nothing.
pub fn eligible_channels(
    tx_channels: &[Channel],
    sets: &[ChannelRange],
    index: ChannelSetIndex,
) -> Vec<Channel> {
    let Some(position) = index.position() else {
        return tx_channels.to_vec();
    };
    if tx_channels.len() == 1 {
        return tx_channels.to_vec();
    }
    match sets.get(position) {
        Some(range) => tx_channels
            .iter()
            .copied()
            .filter(|channel| range.contains(*channel))
            .collect(),
        None => Vec::new(),
    }
}

/// Pick one eligible channel uniformly at random.
pub fn pick_channel<R: RandomSource + ?Sized>(
    tx_channels: &[Channel],
    sets: &[ChannelRange],
    index: ChannelSetIndex,
    rng: &mut R,
) -> Option<Channel> {
    let eligible = eligible_channels(tx_channels, sets, index);
    if eligible.is_empty() {
        return None;
    }
    Some(eligible[rng.index(eligible.len())])
}
