//! Order receipt decoding
//!
//! The market maker emits `MakeBuyOrder` / `MakeSellOrder` when an order
//! settles. The converted amount is the `returnedAmount` field of the last
//! such log in the receipt.

use alloy_primitives::IntoLogData;
use alloy_sol_types::{sol, SolEvent};

use super::amount::Amount;
use super::chain::{Address, ConversionDirection, ConversionGateway, Log, TransactionReceipt, TxHash};
use super::error::{AbiError, ChainError, ReceiptError};

sol! {
    /// ERC-20 transfer, emitted by both tokens.
    event Transfer(address indexed from, address indexed to, uint256 value);

    event MakeBuyOrder(
        address indexed buyer,
        address indexed onBehalfOf,
        address indexed collateral,
        uint256 fee,
        uint256 purchaseAmount,
        uint256 returnedAmount,
        uint256 feePct
    );

    event MakeSellOrder(
        address indexed seller,
        address indexed onBehalfOf,
        address indexed collateral,
        uint256 fee,
        uint256 sellAmount,
        uint256 returnedAmount,
        uint256 feePct
    );
}

fn event_name(direction: ConversionDirection) -> &'static str {
    match direction {
        ConversionDirection::ToBonded => "MakeBuyOrder",
        ConversionDirection::FromBonded => "MakeSellOrder",
    }
}

fn topic0(direction: ConversionDirection) -> alloy_primitives::B256 {
    match direction {
        ConversionDirection::ToBonded => MakeBuyOrder::SIGNATURE_HASH,
        ConversionDirection::FromBonded => MakeSellOrder::SIGNATURE_HASH,
    }
}

fn returned_amount(log: &Log, direction: ConversionDirection) -> Result<Amount, AbiError> {
    let decode_err = |e: alloy_sol_types::Error| AbiError::Decode {
        event: event_name(direction),
        reason: e.to_string(),
    };
    let returned = match direction {
        ConversionDirection::ToBonded => {
            MakeBuyOrder::decode_log(log, true).map_err(decode_err)?.data.returnedAmount
        }
        ConversionDirection::FromBonded => {
            MakeSellOrder::decode_log(log, true).map_err(decode_err)?.data.returnedAmount
        }
    };
    Ok(Amount::from_u256(returned))
}

/// `returnedAmount` of the last order event in `receipt`.
pub fn converted_amount(
    receipt: &TransactionReceipt,
    direction: ConversionDirection,
) -> Result<Amount, ReceiptError> {
    if !receipt.status {
        return Err(ReceiptError::Reverted(receipt.transaction_hash));
    }
    let topic = topic0(direction);
    let log = receipt
        .logs
        .iter()
        .rev()
        .find(|log| log.topics().first() == Some(&topic))
        .ok_or(ReceiptError::MissingEvent {
            event: event_name(direction),
            hash: receipt.transaction_hash,
        })?;
    returned_amount(log, direction).map_err(ReceiptError::from)
}

/// Fetch the receipt of a mined order and extract the converted amount.
pub async fn extract_converted_amount(
    gateway: &dyn ConversionGateway,
    hash: TxHash,
    direction: ConversionDirection,
) -> Result<Amount, ReceiptError> {
    let receipt = gateway
        .transaction_receipt(hash)
        .await?
        .ok_or(ReceiptError::Fetch(ChainError::UnknownTransaction(hash)))?;
    let amount = converted_amount(&receipt, direction)?;
    tracing::debug!("Order {} returned {}", hash, amount);
    Ok(amount)
}

/// Fields of a settled order, as the market maker reports them.
#[derive(Debug, Clone, Copy)]
pub struct OrderFill {
    pub trader: Address,
    pub collateral: Address,
    pub fee: Amount,
    pub amount: Amount,
    pub returned: Amount,
    pub fee_pct: Amount,
}

/// The log the market maker emits for a settled order.
pub fn order_log(emitter: Address, direction: ConversionDirection, fill: &OrderFill) -> Log {
    let data = match direction {
        ConversionDirection::ToBonded => MakeBuyOrder {
            buyer: fill.trader,
            onBehalfOf: fill.trader,
            collateral: fill.collateral,
            fee: fill.fee.into(),
            purchaseAmount: fill.amount.into(),
            returnedAmount: fill.returned.into(),
            feePct: fill.fee_pct.into(),
        }
        .into_log_data(),
        ConversionDirection::FromBonded => MakeSellOrder {
            seller: fill.trader,
            onBehalfOf: fill.trader,
            collateral: fill.collateral,
            fee: fill.fee.into(),
            sellAmount: fill.amount.into(),
            returnedAmount: fill.returned.into(),
            feePct: fill.fee_pct.into(),
        }
        .into_log_data(),
    };
    Log {
        address: emitter,
        data,
    }
}

/// ERC-20 `Transfer` log from `token`.
pub fn transfer_log(token: Address, from: Address, to: Address, value: Amount) -> Log {
    Log {
        address: token,
        data: Transfer {
            from,
            to,
            value: value.into(),
        }
        .into_log_data(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, B256};

    fn addr(b: u8) -> Address {
        Address::repeat_byte(b)
    }

    fn receipt(logs: Vec<Log>) -> TransactionReceipt {
        TransactionReceipt {
            transaction_hash: B256::repeat_byte(7),
            block_number: 1,
            status: true,
            logs,
        }
    }

    fn buy_log(returned: u64) -> Log {
        order_log(
            addr(1),
            ConversionDirection::ToBonded,
            &OrderFill {
                trader: addr(2),
                collateral: addr(3),
                fee: Amount::from(1u64),
                amount: Amount::from(100u64),
                returned: Amount::from(returned),
                fee_pct: Amount::ZERO,
            },
        )
    }

    #[test]
    fn test_signature_and_topic() {
        assert_eq!(
            MakeBuyOrder::SIGNATURE,
            "MakeBuyOrder(address,address,address,uint256,uint256,uint256,uint256)"
        );
        assert_ne!(MakeBuyOrder::SIGNATURE_HASH, MakeSellOrder::SIGNATURE_HASH);
        assert_eq!(
            Transfer::SIGNATURE_HASH.to_string(),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }

    #[test]
    fn test_decode_fields() {
        let decoded = MakeBuyOrder::decode_log(&buy_log(42), true).unwrap().data;
        assert_eq!(Amount::from_u256(decoded.returnedAmount), Amount::from(42u64));
        assert_eq!(decoded.collateral, addr(3));
        assert_eq!(decoded.buyer, addr(2));
    }

    #[test]
    fn test_last_matching_log_wins() {
        let unrelated = Log::new_unchecked(addr(9), vec![B256::repeat_byte(1)], Bytes::new());
        let r = receipt(vec![buy_log(10), unrelated.clone(), buy_log(25), unrelated]);
        assert_eq!(
            converted_amount(&r, ConversionDirection::ToBonded).unwrap(),
            Amount::from(25u64)
        );
    }

    #[test]
    fn test_missing_event_is_distinct() {
        let r = receipt(vec![buy_log(10)]);
        let err = converted_amount(&r, ConversionDirection::FromBonded).unwrap_err();
        assert!(matches!(err, ReceiptError::MissingEvent { event: "MakeSellOrder", .. }));
    }

    #[test]
    fn test_malformed_log() {
        let log = buy_log(10);
        let truncated = Log::new_unchecked(
            log.address,
            log.topics().to_vec(),
            Bytes::copy_from_slice(&log.data.data[..70]),
        );
        let err = converted_amount(&receipt(vec![truncated]), ConversionDirection::ToBonded)
            .unwrap_err();
        assert!(matches!(
            err,
            ReceiptError::Malformed(AbiError::Decode { event: "MakeBuyOrder", .. })
        ));

        let mut topics = log.topics().to_vec();
        topics.pop();
        let short = Log::new_unchecked(log.address, topics, log.data.data.clone());
        let err = converted_amount(&receipt(vec![short]), ConversionDirection::ToBonded)
            .unwrap_err();
        assert!(matches!(err, ReceiptError::Malformed(_)));
    }

    #[test]
    fn test_reverted_receipt() {
        let mut r = receipt(vec![buy_log(10)]);
        r.status = false;
        assert!(matches!(
            converted_amount(&r, ConversionDirection::ToBonded),
            Err(ReceiptError::Reverted(_))
        ));
    }

    #[test]
    fn test_transfer_log_topics() {
        let log = transfer_log(addr(5), addr(1), addr(2), Amount::from(7u64));
        assert_eq!(log.address, addr(5));
        assert_eq!(log.topics()[0], Transfer::SIGNATURE_HASH);
        assert_eq!(Address::from_word(log.topics()[2]), addr(2));
    }
}
