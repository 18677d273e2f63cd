//! ZeroSum contract ABI: the events we decode and the view functions we call.
//!
//! Topic0 hashes come from the generated `SolEvent::SIGNATURE_HASH`
//! constants, so a signature change here changes the subscription filter too.

use crate::events::EventKind;
use alloy::primitives::B256;
use alloy::sol;
use alloy::sol_types::SolEvent;

sol! {
    /// PlayerJoined(uint256 indexed gameId, address indexed player)
    event PlayerJoined(uint256 indexed gameId, address indexed player);

    /// NumberGenerated(uint256 indexed gameId, uint256 number)
    event NumberGenerated(uint256 indexed gameId, uint256 number);

    /// MoveMade(uint256 indexed gameId, address indexed player, uint256 subtraction, uint256 newNumber)
    event MoveMade(uint256 indexed gameId, address indexed player, uint256 subtraction, uint256 newNumber);

    /// GameFinished(uint256 indexed gameId, address indexed winner, address indexed loser)
    event GameFinished(uint256 indexed gameId, address indexed winner, address indexed loser);

    /// TimeoutHandled(uint256 indexed gameId, address indexed player)
    event TimeoutHandled(uint256 indexed gameId, address indexed player);

    /// GameCancelled(uint256 indexed gameId)
    event GameCancelled(uint256 indexed gameId);

    #[sol(rpc)]
    interface IZeroSum {
        function getPlayers(uint256 gameId) external view returns (address[] memory);
        function playerWins(address player) external view returns (uint256);
        function playerLosses(address player) external view returns (uint256);
        function stakedAmount(address player) external view returns (uint256);
        function gameCounter() external view returns (uint256);
    }
}

/// topic0 for an event kind.
pub fn topic_for(kind: EventKind) -> B256 {
    match kind {
        EventKind::PlayerJoined => PlayerJoined::SIGNATURE_HASH,
        EventKind::NumberGenerated => NumberGenerated::SIGNATURE_HASH,
        EventKind::MoveMade => MoveMade::SIGNATURE_HASH,
        EventKind::GameFinished => GameFinished::SIGNATURE_HASH,
        EventKind::TimeoutHandled => TimeoutHandled::SIGNATURE_HASH,
        EventKind::GameCancelled => GameCancelled::SIGNATURE_HASH,
    }
}

/// Event kind for a topic0, if it is one of ours.
pub fn kind_for(topic0: &B256) -> Option<EventKind> {
    EventKind::ALL
        .iter()
        .copied()
        .find(|kind| topic_for(*kind) == *topic0)
}
