// Blockstash - Cached Chain Data Service
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Chain data records and request selectors

use alloy_primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::error::ResolveError;

/// A symbolic block tag: a mutable pointer to the newest block satisfying
/// a finality condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockTag {
    /// Current chain head
    Head,
    /// Latest finalized block
    Finalized,
    /// Latest safe block
    Safe,
}

impl BlockTag {
    /// All tags, in polling order
    pub const ALL: [Self; 3] = [Self::Head, Self::Finalized, Self::Safe];

    /// Label used in request paths and logs
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Finalized => "finalized",
            Self::Safe => "safe",
        }
    }

    /// Block parameter understood by the upstream node
    pub const fn rpc_param(&self) -> &'static str {
        match self {
            Self::Head => "latest",
            Self::Finalized => "finalized",
            Self::Safe => "safe",
        }
    }

    /// Key of this tag's entry in the fast cache
    pub fn cache_key(&self) -> String {
        format!("block:{}", self.label())
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "head" | "latest" => Some(Self::Head),
            "finalized" => Some(Self::Finalized),
            "safe" => Some(Self::Safe),
            _ => None,
        }
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identifies a block, by absolute number or by tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockSelector {
    /// Absolute block number, immutable once stored
    Number(u64),
    /// Symbolic tag, resolved through the fast cache
    Tag(BlockTag),
}

impl BlockSelector {
    /// Block parameter understood by the upstream node
    pub fn rpc_param(&self) -> String {
        match self {
            Self::Number(number) => format!("{number:#x}"),
            Self::Tag(tag) => tag.rpc_param().to_string(),
        }
    }
}

impl fmt::Display for BlockSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(number) => write!(f, "{number}"),
            Self::Tag(tag) => write!(f, "{tag}"),
        }
    }
}

impl From<BlockTag> for BlockSelector {
    fn from(tag: BlockTag) -> Self {
        Self::Tag(tag)
    }
}

impl From<u64> for BlockSelector {
    fn from(number: u64) -> Self {
        Self::Number(number)
    }
}

impl FromStr for BlockSelector {
    type Err = ResolveError;

    /// Accepts a tag label, a decimal number, or a `0x` hex quantity
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(tag) = BlockTag::from_label(s) {
            return Ok(Self::Tag(tag));
        }

        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) if !hex.is_empty() => u64::from_str_radix(hex, 16).ok(),
            Some(_) => None,
            None if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s.parse().ok(),
            None => None,
        };

        parsed
            .map(Self::Number)
            .ok_or_else(|| ResolveError::Validation(format!("invalid block selector: {s:?}")))
    }
}

/// Validates a transaction hash: `0x` followed by exactly 64 hex digits
pub fn parse_tx_hash(input: &str) -> Result<B256, ResolveError> {
    let invalid = || ResolveError::Validation(format!("invalid transaction hash: {input:?}"));

    let hex = input.strip_prefix("0x").ok_or_else(invalid)?;
    if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }

    B256::from_str(hex).map_err(|_| invalid())
}

/// A block header, optionally with its full transaction list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    /// Block number, the immutable key for numeric lookups
    pub number: u64,
    /// Block hash
    pub hash: B256,
    /// Parent block hash
    pub parent_hash: B256,
    /// Unix timestamp in seconds
    pub timestamp: u64,
    /// Root of the transactions trie
    pub transactions_root: B256,
    /// Ordered transactions, present only when fetched "full"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactions: Option<Vec<TransactionRecord>>,
}

impl BlockRecord {
    /// Whether the full transaction list is attached
    pub fn is_full(&self) -> bool {
        self.transactions.is_some()
    }

    /// Returns the header-only view of this block
    pub fn without_transactions(mut self) -> Self {
        self.transactions = None;
        self
    }
}

/// A mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Transaction hash, unique key
    pub hash: B256,
    /// Sender nonce
    pub nonce: u64,
    /// Recipient, `None` for contract creation
    pub to: Option<Address>,
    /// Transferred value in wei
    pub value: U256,
    /// Gas limit
    pub gas_limit: u64,
    /// Gas price in wei (effective price for dynamic-fee transactions)
    pub gas_price: U256,
    /// Call data
    pub input: Bytes,
    /// Number of the owning block
    pub block_number: u64,
    /// Position within the owning block, when known
    pub transaction_index: Option<u64>,
}

/// A transaction receipt together with the resolved sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRecord {
    /// Hash of the transaction this receipt belongs to, primary key
    pub transaction_hash: B256,
    /// Hash of the owning block
    pub block_hash: B256,
    /// Number of the owning block
    pub block_number: u64,
    /// Position within the owning block
    pub transaction_index: u64,
    /// Created contract, if any
    pub contract_address: Option<Address>,
    /// Gas used by this transaction alone
    pub gas_used: u64,
    /// Execution status (1 success, 0 failure)
    pub status: u64,
    /// Sender, `None` when sender recovery failed
    pub from: Option<Address>,
    /// Recipient, `None` for contract creation
    pub to: Option<Address>,
    /// Number of emitted logs
    pub log_count: u64,
    /// The receipt exactly as returned upstream, as JSON
    pub raw: String,
    /// When this record was first assembled
    pub created_at: DateTime<Utc>,
    /// When this record was last touched
    pub updated_at: DateTime<Utc>,
}

/// Current time truncated to milliseconds, the precision the store keeps
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_parses_tags() {
        assert_eq!("head".parse::<BlockSelector>().unwrap(), BlockSelector::Tag(BlockTag::Head));
        assert_eq!("latest".parse::<BlockSelector>().unwrap(), BlockSelector::Tag(BlockTag::Head));
        assert_eq!(
            "finalized".parse::<BlockSelector>().unwrap(),
            BlockSelector::Tag(BlockTag::Finalized)
        );
        assert_eq!("safe".parse::<BlockSelector>().unwrap(), BlockSelector::Tag(BlockTag::Safe));
    }

    #[test]
    fn test_selector_parses_numbers() {
        assert_eq!("0".parse::<BlockSelector>().unwrap(), BlockSelector::Number(0));
        assert_eq!("19000000".parse::<BlockSelector>().unwrap(), BlockSelector::Number(19_000_000));
        assert_eq!("0x10".parse::<BlockSelector>().unwrap(), BlockSelector::Number(16));
    }

    #[test]
    fn test_selector_rejects_garbage() {
        for input in ["", "-1", "pending", "12a", "0x", "0xzz", "99999999999999999999999", "+5"] {
            let err = input.parse::<BlockSelector>().unwrap_err();
            assert!(matches!(err, ResolveError::Validation(_)), "accepted {input:?}");
        }
    }

    #[test]
    fn test_selector_rpc_params() {
        assert_eq!(BlockSelector::Number(255).rpc_param(), "0xff");
        assert_eq!(BlockSelector::Tag(BlockTag::Head).rpc_param(), "latest");
        assert_eq!(BlockSelector::Tag(BlockTag::Safe).rpc_param(), "safe");
        assert_eq!(BlockTag::Finalized.cache_key(), "block:finalized");
    }

    #[test]
    fn test_tx_hash_validation() {
        let good = format!("0x{}", "ab".repeat(32));
        assert_eq!(parse_tx_hash(&good).unwrap(), B256::repeat_byte(0xab));

        let upper = format!("0x{}", "AB".repeat(32));
        assert_eq!(parse_tx_hash(&upper).unwrap(), B256::repeat_byte(0xab));

        for bad in [
            "not-a-hash".to_string(),
            "ab".repeat(32),
            format!("0x{}", "ab".repeat(31)),
            format!("0x{}", "ab".repeat(33)),
            format!("0x{}g", "a".repeat(63)),
            // an address is not a transaction hash
            "0x00000000219ab540356cBB839Cbe05303d7705Fa".to_string(),
        ] {
            assert!(matches!(parse_tx_hash(&bad), Err(ResolveError::Validation(_))), "{bad}");
        }
    }

    #[test]
    fn test_block_strips_body() {
        let block = BlockRecord {
            number: 1,
            hash: B256::repeat_byte(1),
            parent_hash: B256::ZERO,
            timestamp: 1_700_000_000,
            transactions_root: B256::repeat_byte(2),
            transactions: Some(vec![]),
        };
        assert!(block.is_full());
        assert!(!block.clone().without_transactions().is_full());

        let json = serde_json::to_value(block.without_transactions()).unwrap();
        assert!(json.get("transactions").is_none());
        assert_eq!(json["parentHash"], B256::ZERO.to_string());
    }

    #[test]
    fn test_now_millis_has_no_sub_millisecond_part() {
        let now = now_millis();
        assert_eq!(now.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
