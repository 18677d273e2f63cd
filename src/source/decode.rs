//! Raw log → [`GameEvent`] normalization.
//!
//! Both delivery paths go through [`decode_log`], so a log decodes the same
//! way whether it was polled or pushed. `gameId` is the first indexed topic
//! of every ZeroSum event.

use crate::events::{DeliveryPath, EventPayload, GameEvent, OrderingKey, RejectedLog};
use crate::source::abi;
use crate::source::SourceError;
use alloy::primitives::U256;
use alloy::rpc::types::Log;
use alloy::sol_types::SolEvent;
use tracing::warn;

/// Narrow an on-chain uint256 to u64, saturating.
fn narrow(value: U256) -> u64 {
    value.saturating_to::<u64>()
}

fn decode_as<E: SolEvent>(log: &Log) -> Result<E, SourceError> {
    log.log_decode::<E>()
        .map(|decoded| decoded.inner.data)
        .map_err(|e| SourceError::Decode(format!("{}: {}", E::SIGNATURE, e)))
}

/// Ordering key of a mined log. Pending logs have no position yet.
pub fn ordering_key(log: &Log) -> Option<OrderingKey> {
    Some(OrderingKey::new(log.block_number?, log.log_index?))
}

/// Decode one contract log.
pub fn decode_log(log: &Log, via: DeliveryPath) -> Result<GameEvent, SourceError> {
    let key = ordering_key(log)
        .ok_or_else(|| SourceError::Decode("log has no block number or log index".to_string()))?;
    let topic0 = log
        .topic0()
        .ok_or_else(|| SourceError::Decode("log has no topic0".to_string()))?;

    let (game_id, payload) = match *topic0 {
        t if t == abi::PlayerJoined::SIGNATURE_HASH => {
            let e: abi::PlayerJoined = decode_as(log)?;
            (e.gameId, EventPayload::PlayerJoined { player: e.player })
        }
        t if t == abi::NumberGenerated::SIGNATURE_HASH => {
            let e: abi::NumberGenerated = decode_as(log)?;
            (
                e.gameId,
                EventPayload::NumberGenerated {
                    number: narrow(e.number),
                },
            )
        }
        t if t == abi::MoveMade::SIGNATURE_HASH => {
            let e: abi::MoveMade = decode_as(log)?;
            (
                e.gameId,
                EventPayload::MoveMade {
                    player: e.player,
                    subtraction: narrow(e.subtraction),
                    new_number: narrow(e.newNumber),
                },
            )
        }
        t if t == abi::GameFinished::SIGNATURE_HASH => {
            let e: abi::GameFinished = decode_as(log)?;
            (
                e.gameId,
                EventPayload::GameFinished {
                    winner: e.winner,
                    loser: e.loser,
                },
            )
        }
        t if t == abi::TimeoutHandled::SIGNATURE_HASH => {
            let e: abi::TimeoutHandled = decode_as(log)?;
            (e.gameId, EventPayload::TimeoutHandled { player: e.player })
        }
        t if t == abi::GameCancelled::SIGNATURE_HASH => {
            let e: abi::GameCancelled = decode_as(log)?;
            (e.gameId, EventPayload::GameCancelled)
        }
        other => {
            return Err(SourceError::Decode(format!("unrecognised event topic {other}")));
        }
    };

    Ok(GameEvent::new(narrow(game_id), key, payload, via))
}

/// Decode a batch of logs, splitting them into events and rejects.
/// Events come back sorted by ordering key.
pub fn decode_logs(logs: &[Log], via: DeliveryPath) -> (Vec<GameEvent>, Vec<RejectedLog>) {
    let mut events = Vec::with_capacity(logs.len());
    let mut rejected = Vec::new();

    for log in logs {
        match decode_log(log, via) {
            Ok(event) => events.push(event),
            Err(e) => {
                warn!(
                    block = ?log.block_number,
                    log_index = ?log.log_index,
                    error = %e,
                    "failed to decode contract log"
                );
                rejected.push(RejectedLog {
                    key: ordering_key(log),
                    reason: e.to_string(),
                });
            }
        }
    }

    events.sort_by_key(|e| e.key);
    (events, rejected)
}
