// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Ascending identifiers compatible with the agent's ID scheme.
//!
//! Format: `{prefix}_{timestamp_hex}{random_base62}` where the hex part is
//! 12 characters encoding `(unix_ms * 0x1000 + counter)` masked to 48 bits,
//! followed by 14 random base62 characters.
//!
//! IDs generated by one process are strictly monotone: the counter advances
//! within a millisecond and resets when the clock moves forward. The agent
//! gates its prompt loop on the user-message ID sorting after every earlier
//! assistant-message ID, so monotonicity here is load-bearing, not cosmetic.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

const BASE62_CHARS: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const RANDOM_LENGTH: usize = 14;

/// Namespaces the agent uses for its object identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPrefix {
    Session,
    Message,
    Part,
}

impl IdPrefix {
    fn as_str(self) -> &'static str {
        match self {
            IdPrefix::Session => "ses",
            IdPrefix::Message => "msg",
            IdPrefix::Part => "prt",
        }
    }
}

// (last millisecond seen, counter within that millisecond)
static STATE: Mutex<(u64, u64)> = Mutex::new((0, 0));

/// Generate the next ascending ID for the given prefix.
pub fn ascending(prefix: IdPrefix) -> String {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let counter = {
        let mut state = STATE.lock().unwrap_or_else(|e| e.into_inner());
        if now_ms != state.0 {
            state.0 = now_ms;
            state.1 = 0;
        }
        state.1 += 1;
        state.1
    };

    let encoded = (now_ms.wrapping_mul(0x1000)).wrapping_add(counter) & 0xFFFF_FFFF_FFFF;

    let mut id = String::with_capacity(4 + 12 + RANDOM_LENGTH);
    id.push_str(prefix.as_str());
    id.push('_');
    id.push_str(&format!("{encoded:012x}"));

    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_LENGTH {
        id.push(BASE62_CHARS[rng.gen_range(0..BASE62_CHARS.len())] as char);
    }
    id
}

// ── Unit tests ────────────────────────────────────────────────────────────────
