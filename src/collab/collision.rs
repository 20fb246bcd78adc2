//! Duel between an existing proxy and a competing inbound connection.
//!
//! The connection whose magic number is higher survives. Both nodes evaluate
//! the same pair of numbers, so each keeps the same physical connection.

use std::time::Duration;

use rand::Rng;

use super::proxy::ProxyState;

/// Upper bound of the jitter slept before re-checking a tied duel.
pub const TIE_JITTER_MAX: Duration = Duration::from_millis(1_234);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollisionOutcome {
    /// The existing proxy is gone; register a fresh proxy for the new
    /// connection.
    NewWins,
    /// The existing proxy loses the duel and adopts the new connection.
    NewWinsProxyReused,
    /// The new connection loses and is closed.
    ExistingWins,
    /// Both magic numbers are equal; sleep and re-check.
    Tie,
}

/// Decide a first-round duel.
///
/// `existing_magic` is `None` when the existing proxy has neither a live
/// endpoint nor a dial in flight, which counts as a loss for it.
pub fn duel(
    existing_state: ProxyState,
    existing_magic: Option<u64>,
    incoming_magic: u64,
) -> CollisionOutcome {
    if existing_state == ProxyState::Destroyed {
        return CollisionOutcome::NewWins;
    }
    if existing_state.is_negotiated() {
        return CollisionOutcome::ExistingWins;
    }
    match existing_magic {
        None => CollisionOutcome::NewWinsProxyReused,
        Some(existing) if existing < incoming_magic => CollisionOutcome::NewWinsProxyReused,
        Some(existing) if existing > incoming_magic => CollisionOutcome::ExistingWins,
        Some(_) => CollisionOutcome::Tie,
    }
}

/// Decide the re-check after a tie: a proxy that finished negotiating in the
/// meantime keeps its connection, anything else is replaced outright.
pub fn settle_tie(existing_state: ProxyState) -> CollisionOutcome {
    if existing_state.is_negotiated() {
        CollisionOutcome::ExistingWins
    } else {
        CollisionOutcome::NewWins
    }
}

pub fn tie_jitter() -> Duration {
    let max = TIE_JITTER_MAX.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(0..=max))
}
