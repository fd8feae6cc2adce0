use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U64};
use hyper::StatusCode;
use oracleblock::chain::LogQuery;
use oracleblock::{Head, LogFilter};
use serde_json::{json, Value};

use super::mock_chain::MockChain;
use super::mock_http::{Handler, RecordedRequest};

/// Serves the `eth_*` methods the node uses from `chain`.
pub fn json_rpc_handler(chain: MockChain) -> Handler {
    Arc::new(move |req: &RecordedRequest| {
        let response = if let Value::Array(calls) = &req.body {
            Value::Array(calls.iter().map(|call| handle_call(&chain, call)).collect())
        } else {
            handle_call(&chain, &req.body)
        };
        (StatusCode::OK, response)
    })
}

fn handle_call(chain: &MockChain, call: &Value) -> Value {
    let id = call.get("id").cloned().unwrap_or(Value::Null);
    let method = call
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let params = call
        .get("params")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    match method.as_str() {
        "eth_getBlockByNumber" => {
            let head = match params.first().and_then(Value::as_str) {
                Some("latest") => Some(chain.tip()),
                Some(number) => parse_quantity(number).and_then(|number| chain.head_at(number)),
                None => None,
            };
            success(id, head.map(block_json).unwrap_or(Value::Null))
        }
        "eth_sendRawTransaction" => {
            let raw = params
                .first()
                .and_then(|value| serde_json::from_value::<Bytes>(value.clone()).ok());
            match raw {
                Some(raw) => match chain.send_sync(&raw) {
                    Ok(hash) => success(id, json!(hash)),
                    Err(err) => error(id, -32000, format!("{err:#}")),
                },
                None => error(id, -32602, "invalid raw transaction"),
            }
        }
        "eth_getTransactionReceipt" => {
            let hash = params
                .first()
                .and_then(|value| serde_json::from_value::<B256>(value.clone()).ok());
            let receipt = hash.and_then(|hash| chain.receipt(hash));
            success(
                id,
                receipt
                    .map(|receipt| {
                        json!({
                            "transactionHash": receipt.tx_hash,
                            "blockHash": receipt.block_hash,
                            "blockNumber": U64::from(receipt.block_number),
                            "status": if receipt.success { "0x1" } else { "0x0" },
                        })
                    })
                    .unwrap_or(Value::Null),
            )
        }
        "eth_getTransactionCount" => {
            let address = params
                .first()
                .and_then(|value| serde_json::from_value::<Address>(value.clone()).ok());
            match address {
                Some(address) => success(id, json!(U64::from(chain.count_sync(address)))),
                None => error(id, -32602, "invalid address"),
            }
        }
        "eth_getLogs" => match params.first().and_then(parse_log_query) {
            Some(query) => {
                let logs: Vec<Value> = chain
                    .logs_sync(&query)
                    .into_iter()
                    .map(|log| {
                        json!({
                            "address": log.address,
                            "topics": log.topics,
                            "data": log.data,
                            "blockNumber": U64::from(log.block_number),
                            "blockHash": log.block_hash,
                            "transactionHash": log.tx_hash,
                            "logIndex": U64::from(log.log_index),
                            "removed": log.removed,
                        })
                    })
                    .collect();
                success(id, Value::Array(logs))
            }
            None => error(id, -32602, "invalid log filter"),
        },
        _ => error(id, -32601, format!("unknown method {method}")),
    }
}

fn block_json(head: Head) -> Value {
    json!({
        "number": U64::from(head.number),
        "hash": head.hash,
        "parentHash": head.parent_hash,
        "transactions": [],
    })
}

fn parse_quantity(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

fn parse_log_query(filter: &Value) -> Option<LogQuery> {
    let from_block = parse_quantity(filter.get("fromBlock")?.as_str()?)?;
    let to_block = parse_quantity(filter.get("toBlock")?.as_str()?)?;
    let addresses: Vec<Address> = match filter.get("address") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
        Some(single) => vec![serde_json::from_value(single.clone()).ok()?],
    };
    let topics: Vec<Vec<B256>> = match filter.get("topics") {
        Some(Value::Array(positions)) => positions
            .iter()
            .map(|position| match position {
                Value::Null => Vec::new(),
                Value::Array(items) => items
                    .iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect(),
                single => serde_json::from_value(single.clone())
                    .map(|topic| vec![topic])
                    .unwrap_or_default(),
            })
            .collect(),
        _ => Vec::new(),
    };

    Some(LogQuery {
        from_block,
        to_block,
        filter: LogFilter { addresses, topics },
    })
}

fn success(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "result": result,
        "id": id,
    })
}

fn error(id: Value, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "error": {
            "code": code,
            "message": message.into(),
        },
        "id": id,
    })
}
