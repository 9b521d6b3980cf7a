//! Byte schemas for the three databases.
//!
//! The layouts are a binding contract:
//!
//! - address key: `address[20] || blockTime[4] || sequence[1]`, so a prefix
//!   scan on the address alone walks all touches in chronological order and
//!   the address+time prefix isolates one block;
//! - address value: `txHash[32] || coupleAddress[20] || |value|[var BE] ||
//!   flags[1]` — the amount is stored as its magnitude and the trailing
//!   flags byte carries receipt status (bit 0) and the sender role (bit 1,
//!   set when the stored value is negative), so a record is self-contained;
//! - block key: the decimal block number zero-padded to 10 ASCII digits so
//!   lexicographic order equals numeric order;
//! - block value: `createdAt[4] || blockTime[4] || (address[20] || seq[1])*`;
//! - batch key: `fromPad10 || toPad10 || step[1] || createdAtDecimal`,
//!   batch value: `updatedAt[4] || current[var BE]`.
//!
//! The schema is append-only: any future field extends a value at the tail
//! and is detected by length.

use num_bigint::{BigInt, BigUint, Sign};
use num_traits::Zero;

use crate::error::AppError;
use crate::timeutil::{marshal_time, unmarshal_time, TIMESTAMP_BYTE_LENGTH};
use crate::types::{AddressIndex, AddressSequence, BatchStatus, BlockIndex};

pub const ADDRESS_BYTE_LENGTH: usize = 20;
pub const HASH_BYTE_LENGTH: usize = 32;
pub const BLOCK_NUMBER_PAD_LENGTH: usize = 10;

const ADDRESS_VALUE_FIXED_LENGTH: usize = HASH_BYTE_LENGTH + ADDRESS_BYTE_LENGTH + 1;
const ADDRESS_SEQ_LENGTH: usize = ADDRESS_BYTE_LENGTH + 1;

const FLAG_STATUS: u8 = 0b01;
const FLAG_SENDER: u8 = 0b10;

/// Decode a `0x`-prefixed hex address into its 20 raw bytes.
pub fn decode_address(address: &str) -> Result<[u8; ADDRESS_BYTE_LENGTH], AppError> {
    let hex_part = address
        .strip_prefix("0x")
        .ok_or_else(|| AppError::InvalidInput(format!("address missing 0x prefix: {address}")))?;
    let bytes = hex::decode(hex_part)
        .map_err(|_| AppError::InvalidInput(format!("bad hex address: {address}")))?;
    bytes
        .try_into()
        .map_err(|_| AppError::InvalidInput(format!("address is not 20 bytes: {address}")))
}

fn decode_hash(hash: &str) -> Result<[u8; HASH_BYTE_LENGTH], AppError> {
    let hex_part = hash
        .strip_prefix("0x")
        .ok_or_else(|| AppError::InvalidInput(format!("hash missing 0x prefix: {hash}")))?;
    let bytes = hex::decode(hex_part)
        .map_err(|_| AppError::InvalidInput(format!("bad hex hash: {hash}")))?;
    bytes
        .try_into()
        .map_err(|_| AppError::InvalidInput(format!("hash is not 32 bytes: {hash}")))
}

fn encode_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Big-endian magnitude without leading zeros; empty for zero, matching the
/// variable-length value fields on disk.
fn trimmed_be_bytes(n: &BigUint) -> Vec<u8> {
    if n.is_zero() {
        Vec::new()
    } else {
        n.to_bytes_be()
    }
}

/// Zero-pad a decimal block number to the fixed key width.
pub fn pad_block_number(block_number: &str) -> String {
    format!("{block_number:0>width$}", width = BLOCK_NUMBER_PAD_LENGTH)
}

fn strip_pad(padded: &str) -> String {
    let trimmed = padded.trim_start_matches('0');
    if trimmed.is_empty() {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

// --- address db ---

pub fn marshal_address_key(index: &AddressIndex) -> Result<Vec<u8>, AppError> {
    marshal_address_key_parts(&index.address, index.time, index.sequence)
}

pub fn marshal_address_key_parts(
    address: &str,
    time: u64,
    sequence: u8,
) -> Result<Vec<u8>, AppError> {
    let mut key = marshal_address_key_prefix_time(address, time)?;
    key.push(sequence);
    Ok(key)
}

/// Key prefix covering every touch of an address.
pub fn marshal_address_key_prefix(address: &str) -> Result<Vec<u8>, AppError> {
    Ok(decode_address(address)?.to_vec())
}

/// Key prefix covering every touch of an address inside one block time.
pub fn marshal_address_key_prefix_time(address: &str, time: u64) -> Result<Vec<u8>, AppError> {
    let mut key = Vec::with_capacity(ADDRESS_BYTE_LENGTH + TIMESTAMP_BYTE_LENGTH + 1);
    key.extend_from_slice(&decode_address(address)?);
    key.extend_from_slice(&marshal_time(time));
    Ok(key)
}

pub fn unmarshal_address_key(key: &[u8]) -> Result<(String, u64, u8), AppError> {
    if key.len() != ADDRESS_BYTE_LENGTH + TIMESTAMP_BYTE_LENGTH + 1 {
        return Err(AppError::Storage(format!(
            "address key has length {}",
            key.len()
        )));
    }
    let address = encode_hex(&key[..ADDRESS_BYTE_LENGTH]);
    let time = unmarshal_time(&key[ADDRESS_BYTE_LENGTH..ADDRESS_BYTE_LENGTH + TIMESTAMP_BYTE_LENGTH]);
    let sequence = key[ADDRESS_BYTE_LENGTH + TIMESTAMP_BYTE_LENGTH];
    Ok((address, time, sequence))
}

pub fn marshal_address_value(index: &AddressIndex) -> Result<Vec<u8>, AppError> {
    let mut value = Vec::with_capacity(ADDRESS_VALUE_FIXED_LENGTH + 8);
    value.extend_from_slice(&decode_hash(&index.tx_hash)?);
    value.extend_from_slice(&decode_address(&index.couple_address)?);
    value.extend_from_slice(&trimmed_be_bytes(index.value.magnitude()));
    let mut flags = 0u8;
    if index.status {
        flags |= FLAG_STATUS;
    }
    if index.value.sign() == Sign::Minus {
        flags |= FLAG_SENDER;
    }
    value.push(flags);
    Ok(value)
}

/// Decode an address-db value. The key fields (`address`, `time`,
/// `sequence`) are left empty for the caller to fill in from the key.
pub fn unmarshal_address_value(value: &[u8]) -> Result<AddressIndex, AppError> {
    if value.len() < ADDRESS_VALUE_FIXED_LENGTH {
        return Err(AppError::Storage(format!(
            "address value has length {}",
            value.len()
        )));
    }
    let tx_hash = encode_hex(&value[..HASH_BYTE_LENGTH]);
    let couple_address =
        encode_hex(&value[HASH_BYTE_LENGTH..HASH_BYTE_LENGTH + ADDRESS_BYTE_LENGTH]);
    let amount = &value[HASH_BYTE_LENGTH + ADDRESS_BYTE_LENGTH..value.len() - 1];
    let flags = value[value.len() - 1];
    let sign = if flags & FLAG_SENDER != 0 {
        Sign::Minus
    } else {
        Sign::Plus
    };
    Ok(AddressIndex {
        address: String::new(),
        sequence: 0,
        tx_hash,
        value: BigInt::from_bytes_be(sign, amount),
        time: 0,
        couple_address,
        status: flags & FLAG_STATUS != 0,
    })
}

// --- block db ---

pub fn marshal_block_key(block_number: &str) -> Vec<u8> {
    pad_block_number(block_number).into_bytes()
}

pub fn unmarshal_block_key(key: &[u8]) -> Result<String, AppError> {
    let s = std::str::from_utf8(key)
        .map_err(|_| AppError::Storage("block key is not ASCII".to_string()))?;
    Ok(strip_pad(s))
}

pub fn marshal_block_value(block_index: &BlockIndex) -> Result<Vec<u8>, AppError> {
    let mut value = Vec::with_capacity(
        2 * TIMESTAMP_BYTE_LENGTH + block_index.addresses.len() * ADDRESS_SEQ_LENGTH,
    );
    value.extend_from_slice(&marshal_time(block_index.created_at));
    value.extend_from_slice(&marshal_time(block_index.time));
    for address_seq in &block_index.addresses {
        value.extend_from_slice(&decode_address(&address_seq.address)?);
        value.push(address_seq.sequence);
    }
    Ok(value)
}

/// Decode a block-db value; `block_number` comes from the key and is left
/// empty here.
pub fn unmarshal_block_value(value: &[u8]) -> Result<BlockIndex, AppError> {
    if value.len() < 2 * TIMESTAMP_BYTE_LENGTH
        || (value.len() - 2 * TIMESTAMP_BYTE_LENGTH) % ADDRESS_SEQ_LENGTH != 0
    {
        return Err(AppError::Storage(format!(
            "block value has length {}",
            value.len()
        )));
    }
    let created_at = unmarshal_time(&value[..TIMESTAMP_BYTE_LENGTH]);
    let time = unmarshal_time(&value[TIMESTAMP_BYTE_LENGTH..2 * TIMESTAMP_BYTE_LENGTH]);
    let mut addresses = Vec::new();
    for chunk in value[2 * TIMESTAMP_BYTE_LENGTH..].chunks_exact(ADDRESS_SEQ_LENGTH) {
        addresses.push(AddressSequence {
            address: encode_hex(&chunk[..ADDRESS_BYTE_LENGTH]),
            sequence: chunk[ADDRESS_BYTE_LENGTH],
        });
    }
    Ok(BlockIndex {
        block_number: String::new(),
        addresses,
        time,
        created_at,
    })
}

// --- batch db ---

pub fn marshal_batch_key(
    from: &BigUint,
    to: &BigUint,
    step: u8,
    created_at: u64,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 * BLOCK_NUMBER_PAD_LENGTH + 1 + 10);
    key.extend_from_slice(pad_block_number(&from.to_string()).as_bytes());
    key.extend_from_slice(pad_block_number(&to.to_string()).as_bytes());
    key.push(step);
    key.extend_from_slice(created_at.to_string().as_bytes());
    key
}

/// The from-padded prefix alone, a valid lookup key for "any batch starting
/// at this block".
pub fn marshal_batch_key_from(from: &BigUint) -> Vec<u8> {
    pad_block_number(&from.to_string()).into_bytes()
}

/// Decode identity fields from a batch key; progress fields stay default.
pub fn unmarshal_batch_key(key: &[u8]) -> Result<BatchStatus, AppError> {
    if key.len() < 2 * BLOCK_NUMBER_PAD_LENGTH + 2 {
        return Err(AppError::Storage(format!("batch key has length {}", key.len())));
    }
    let from_str = std::str::from_utf8(&key[..BLOCK_NUMBER_PAD_LENGTH])
        .map_err(|_| AppError::Storage("batch key from is not ASCII".to_string()))?;
    let to_str =
        std::str::from_utf8(&key[BLOCK_NUMBER_PAD_LENGTH..2 * BLOCK_NUMBER_PAD_LENGTH])
            .map_err(|_| AppError::Storage("batch key to is not ASCII".to_string()))?;
    let step = key[2 * BLOCK_NUMBER_PAD_LENGTH];
    let created_str = std::str::from_utf8(&key[2 * BLOCK_NUMBER_PAD_LENGTH + 1..])
        .map_err(|_| AppError::Storage("batch key created-at is not ASCII".to_string()))?;
    let parse = |s: &str, what: &str| {
        s.parse::<BigUint>()
            .map_err(|_| AppError::Storage(format!("batch key {what} is not decimal: {s}")))
    };
    Ok(BatchStatus {
        from: parse(&strip_pad(from_str), "from")?,
        to: parse(&strip_pad(to_str), "to")?,
        step,
        created_at: created_str
            .parse::<u64>()
            .map_err(|_| AppError::Storage(format!("batch key created-at is not decimal: {created_str}")))?,
        current: None,
        updated_at: 0,
    })
}

pub fn marshal_batch_value(updated_at: u64, current: &BigUint) -> Vec<u8> {
    let mut value = Vec::with_capacity(TIMESTAMP_BYTE_LENGTH + 8);
    value.extend_from_slice(&marshal_time(updated_at));
    value.extend_from_slice(&trimmed_be_bytes(current));
    value
}

/// Decode progress fields from a batch value: `(updated_at, current)`.
pub fn unmarshal_batch_value(value: &[u8]) -> Result<(u64, BigUint), AppError> {
    if value.len() < TIMESTAMP_BYTE_LENGTH {
        return Err(AppError::Storage(format!(
            "batch value has length {}",
            value.len()
        )));
    }
    let updated_at = unmarshal_time(&value[..TIMESTAMP_BYTE_LENGTH]);
    let current = BigUint::from_bytes_be(&value[TIMESTAMP_BYTE_LENGTH..]);
    Ok((updated_at, current))
}
