//! Identifier generators behind UNIQUE column defaults.
//!
//! - ULID-style text: 26 Crockford base32 characters over a UUIDv7, so ids
//!   sort lexicographically by creation time.
//! - Sqid text: a short id encoding a fresh snowflake.
//! - Snowflake bigint: 41 bits of milliseconds since 2020-01-01, 10 bits of
//!   node id and a 12 bit sequence. Strictly increasing per generator.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use sqids::Sqids;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::DefaultPolicy;

/// 2020-01-01T00:00:00Z in milliseconds
const SNOWFLAKE_EPOCH_MS: i64 = 1_577_836_800_000;
const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

#[derive(Debug, Error)]
pub enum IdError {
    #[error("Snowflake node id {0} does not fit in 10 bits")]
    InvalidNode(u16),

    #[error("Failed to encode sqid: {0}")]
    Sqid(#[from] sqids::Error),
}

#[derive(Debug, Default)]
struct SnowflakeState {
    last_ms: i64,
    sequence: i64,
}

pub struct IdGenerator {
    node_id: u16,
    state: Mutex<SnowflakeState>,
    sqids: Sqids,
}

impl IdGenerator {
    pub fn new(node_id: u16) -> Result<Self, IdError> {
        if node_id > MAX_NODE {
            return Err(IdError::InvalidNode(node_id));
        }
        Ok(Self {
            node_id,
            state: Mutex::new(SnowflakeState::default()),
            sqids: Sqids::default(),
        })
    }

    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Value for a column default, `None` when the policy generates nothing
    pub fn generate(&self, policy: DefaultPolicy) -> Result<Option<Value>, IdError> {
        Ok(match policy {
            DefaultPolicy::None => None,
            DefaultPolicy::UniqueTextUlid => Some(Value::String(self.ulid())),
            DefaultPolicy::UniqueTextSqid => Some(Value::String(self.sqid()?)),
            DefaultPolicy::UniqueBigintSnowflake => Some(Value::from(self.snowflake())),
        })
    }

    pub fn ulid(&self) -> String {
        encode_crockford(Uuid::now_v7().as_u128())
    }

    pub fn sqid(&self) -> Result<String, IdError> {
        Ok(self.sqids.encode(&[self.snowflake() as u64])?)
    }

    pub fn snowflake(&self) -> i64 {
        let now = Utc::now().timestamp_millis() - SNOWFLAKE_EPOCH_MS;
        let mut state = self.state.lock();

        // A clock that moves backwards keeps using the last timestamp
        let ms = now.max(state.last_ms);
        if ms == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Sequence exhausted; borrow the next millisecond
                state.last_ms += 1;
            }
        } else {
            state.last_ms = ms;
            state.sequence = 0;
        }

        (state.last_ms << (NODE_BITS + SEQUENCE_BITS))
            | (i64::from(self.node_id) << SEQUENCE_BITS)
            | state.sequence
    }
}

fn encode_crockford(value: u128) -> String {
    (0..26)
        .map(|i| {
            let shift = 125 - 5 * i;
            CROCKFORD[((value >> shift) & 0x1f) as usize] as char
        })
        .collect()
}
