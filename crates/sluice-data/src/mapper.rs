//! Translates upstream wire objects into canonical block records.
//!
//! All hex parsing happens here, so a malformed quantity surfaces as one
//! mapping error carrying the offending block's height and hash. Mapping
//! errors are fatal to the batch.

use crate::types::{BlockHeader, BlockItem, FullBlockData, Log, LogItem, Transaction};
use crate::wire::{parse_hex_u256, parse_hex_u64, WireBlockData, WireBlockHeader, WireLog, WireTransaction};
use alloy::primitives::{Address, Bytes, B256, U256};
use eyre::{Context, Result};
use std::collections::HashMap;

fn parse_b256(value: &str, what: &str) -> Result<B256> {
    value
        .parse::<B256>()
        .wrap_err_with(|| format!("malformed {what} {value:?}"))
}

fn parse_address(value: &str, what: &str) -> Result<Address> {
    value
        .parse::<Address>()
        .wrap_err_with(|| format!("malformed {what} {value:?}"))
}

fn parse_bytes(value: &str, what: &str) -> Result<Bytes> {
    value
        .parse::<Bytes>()
        .wrap_err_with(|| format!("malformed {what} {value:?}"))
}

fn opt_u256(value: &Option<String>, what: &str) -> Result<Option<U256>> {
    value
        .as_deref()
        .map(|v| parse_hex_u256(v).wrap_err_with(|| format!("in {what}")))
        .transpose()
}

/// Maps a wire header. The timestamp becomes a plain u64; other quantities
/// become u256; unrecognized fields are carried over verbatim.
pub fn map_header(wire: &WireBlockHeader) -> Result<BlockHeader> {
    Ok(BlockHeader {
        height: wire.number,
        hash: parse_b256(&wire.hash, "block hash")?,
        parent_hash: wire
            .parent_hash
            .as_deref()
            .map(|h| parse_b256(h, "parent hash"))
            .transpose()?
            .unwrap_or_default(),
        timestamp: wire
            .timestamp
            .as_deref()
            .map(parse_hex_u64)
            .transpose()
            .wrap_err("in timestamp")?
            .unwrap_or_default(),
        nonce: opt_u256(&wire.nonce, "nonce")?,
        difficulty: opt_u256(&wire.difficulty, "difficulty")?,
        total_difficulty: opt_u256(&wire.total_difficulty, "totalDifficulty")?,
        size: opt_u256(&wire.size, "size")?,
        gas_used: opt_u256(&wire.gas_used, "gasUsed")?,
        gas_limit: opt_u256(&wire.gas_limit, "gasLimit")?,
        base_fee_per_gas: opt_u256(&wire.base_fee_per_gas, "baseFeePerGas")?,
        extra: wire.extra.clone(),
    })
}

pub fn map_transaction(wire: &WireTransaction) -> Result<Transaction> {
    Ok(Transaction {
        index: u32::try_from(wire.transaction_index)
            .wrap_err("transaction index out of range")?,
        hash: wire
            .hash
            .as_deref()
            .map(|h| parse_b256(h, "transaction hash"))
            .transpose()?
            .unwrap_or_default(),
        from: wire
            .from
            .as_deref()
            .map(|a| parse_address(a, "from address"))
            .transpose()?,
        to: wire
            .to
            .as_deref()
            .map(|a| parse_address(a, "to address"))
            .transpose()?,
        input: wire
            .input
            .as_deref()
            .map(|b| parse_bytes(b, "input"))
            .transpose()?,
        value: opt_u256(&wire.value, "value")?,
        gas: opt_u256(&wire.gas, "gas")?,
        gas_price: opt_u256(&wire.gas_price, "gasPrice")?,
        nonce: wire.nonce,
        v: opt_u256(&wire.v, "v")?,
        r: opt_u256(&wire.r, "r")?,
        s: opt_u256(&wire.s, "s")?,
        chain_id: wire.chain_id,
        y_parity: wire.y_parity,
        max_fee_per_gas: opt_u256(&wire.max_fee_per_gas, "maxFeePerGas")?,
        max_priority_fee_per_gas: opt_u256(&wire.max_priority_fee_per_gas, "maxPriorityFeePerGas")?,
    })
}

pub fn map_log(wire: &WireLog) -> Result<Log> {
    Ok(Log {
        index: u32::try_from(wire.index).wrap_err("log index out of range")?,
        address: wire
            .address
            .as_deref()
            .map(|a| parse_address(a, "log address"))
            .transpose()?
            .unwrap_or_default(),
        topics: wire
            .topics
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|t| parse_b256(t, "topic"))
            .collect::<Result<Vec<_>>>()?,
        data: wire
            .data
            .as_deref()
            .map(|d| parse_bytes(d, "log data"))
            .transpose()?
            .unwrap_or_default(),
        transaction_index: u32::try_from(wire.transaction_index)
            .wrap_err("log transaction index out of range")?,
        transaction_hash: wire
            .transaction_hash
            .as_deref()
            .map(|h| parse_b256(h, "log transaction hash"))
            .transpose()?
            .unwrap_or_default(),
    })
}

enum RawItem {
    Tx(Transaction),
    Log(Log),
}

impl RawItem {
    fn order_key(&self) -> (u32, u8, u32) {
        match self {
            RawItem::Tx(tx) => (tx.index, 0, 0),
            RawItem::Log(log) => (log.transaction_index, 1, log.index),
        }
    }
}

/// Merges transactions and logs into the canonical ordered item sequence,
/// attaching each log's transaction back-reference when the transaction is
/// also part of the block. Back-references always point at earlier items
/// because a transaction sorts before its own logs.
pub fn assemble_items(transactions: Vec<Transaction>, logs: Vec<Log>) -> Vec<BlockItem> {
    let mut raw: Vec<RawItem> = transactions
        .into_iter()
        .map(RawItem::Tx)
        .chain(logs.into_iter().map(RawItem::Log))
        .collect();
    raw.sort_by_key(RawItem::order_key);

    let mut items = Vec::with_capacity(raw.len());
    let mut tx_positions: HashMap<u32, usize> = HashMap::new();
    for entry in raw {
        match entry {
            RawItem::Tx(tx) => {
                tx_positions.insert(tx.index, items.len());
                items.push(BlockItem::Transaction(tx));
            }
            RawItem::Log(log) => {
                let tx = tx_positions.get(&log.transaction_index).copied();
                items.push(BlockItem::Log(LogItem { log, tx }));
            }
        }
    }
    items
}

/// Maps one block's wire data into the canonical shape. Errors are annotated
/// with the block's height and hash.
pub fn map_block_data(wire: &WireBlockData) -> Result<FullBlockData> {
    let map = || -> Result<FullBlockData> {
        let header = map_header(&wire.block)?;
        let transactions = wire
            .transactions
            .iter()
            .map(map_transaction)
            .collect::<Result<Vec<_>>>()?;
        let logs = wire.logs.iter().map(map_log).collect::<Result<Vec<_>>>()?;
        Ok(FullBlockData {
            header,
            items: assemble_items(transactions, logs),
        })
    };
    map().wrap_err_with(|| {
        format!(
            "failed to map block {} {}",
            wire.block.number, wire.block.hash
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wire_block(number: u64) -> WireBlockHeader {
        WireBlockHeader {
            number,
            hash: format!("0x{:064x}", number),
            parent_hash: Some(format!("0x{:064x}", number.saturating_sub(1))),
            timestamp: Some("0x64".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn maps_header_quantities() {
        let mut wire = wire_block(18_000_000);
        wire.gas_used = Some("0xe4e1c0".to_string());
        wire.extra
            .insert("mixHash".to_string(), serde_json::json!("0xabc"));

        let header = map_header(&wire).expect("should map");
        assert_eq!(header.height, 18_000_000);
        assert_eq!(header.timestamp, 100);
        assert_eq!(header.gas_used, Some(U256::from(15_000_000u64)));
        assert!(header.extra.contains_key("mixHash"));
    }

    #[test]
    fn malformed_hex_is_annotated_with_block_identity() {
        let mut wire = WireBlockData {
            block: wire_block(55),
            ..Default::default()
        };
        wire.block.gas_used = Some("0xnope".to_string());

        let err = map_block_data(&wire).expect_err("should fail");
        let message = format!("{err:#}");
        assert!(message.contains("failed to map block 55"), "{message}");
    }

    #[test]
    fn log_joins_its_transaction_when_present() {
        let wire = WireBlockData {
            block: wire_block(10),
            transactions: vec![WireTransaction {
                transaction_index: 2,
                hash: Some(format!("0x{:064x}", 0xbeefu64)),
                ..Default::default()
            }],
            logs: vec![
                WireLog {
                    index: 0,
                    transaction_index: 2,
                    ..Default::default()
                },
                WireLog {
                    index: 1,
                    transaction_index: 5,
                    ..Default::default()
                },
            ],
        };
        let block = map_block_data(&wire).expect("should map");
        assert!(block.items_are_ordered());
        assert_eq!(block.items.len(), 3);

        let BlockItem::Log(joined) = &block.items[1] else {
            panic!("expected log item");
        };
        assert_eq!(joined.tx, Some(0));
        assert_eq!(
            block.transaction_of(joined).map(|tx| tx.index),
            Some(2)
        );

        // No transaction with index 5 in the block: reference stays absent.
        let BlockItem::Log(unjoined) = &block.items[2] else {
            panic!("expected log item");
        };
        assert_eq!(unjoined.tx, None);
    }

    proptest! {
        #[test]
        fn assembled_items_are_always_ordered(
            tx_indexes in proptest::collection::btree_set(0u32..50, 0..10),
            logs in proptest::collection::vec((0u32..50, 0u32..100), 0..20),
        ) {
            let transactions: Vec<Transaction> = tx_indexes
                .into_iter()
                .map(|index| Transaction { index, ..Default::default() })
                .collect();
            let mut seen = std::collections::BTreeSet::new();
            let logs: Vec<Log> = logs
                .into_iter()
                .filter(|(_, index)| seen.insert(*index))
                .map(|(transaction_index, index)| Log {
                    index,
                    transaction_index,
                    ..Default::default()
                })
                .collect();

            let expected = transactions.len() + logs.len();
            let block = FullBlockData {
                header: BlockHeader::default(),
                items: assemble_items(transactions, logs),
            };
            prop_assert_eq!(block.items.len(), expected);
            prop_assert!(block.items_are_ordered());
        }
    }
}
