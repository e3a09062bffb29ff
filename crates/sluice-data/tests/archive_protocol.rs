//! Archive client protocol tests against a canned local HTTP responder.

use sluice_data::fields::{resolve, FieldSelection};
use sluice_data::plan::{DataRequest, LogCriterion};
use sluice_data::source::FinalizedSource;
use sluice_data::ArchiveClient;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Serves one canned JSON response per incoming request, in order, and
/// reports each request's first line and body back to the test.
fn spawn_scripted_server(
    responses: Vec<String>,
) -> (String, mpsc::Receiver<(String, String)>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let address = format!("http://{}", listener.local_addr().expect("local addr"));
    let (sender, receiver) = mpsc::channel();

    std::thread::spawn(move || {
        for response in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                return;
            };
            let mut buffer: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 4096];
            let (first_line, body) = loop {
                let read = match stream.read(&mut chunk) {
                    Ok(0) => return,
                    Ok(n) => n,
                    Err(_) => return,
                };
                buffer.extend_from_slice(&chunk[..read]);
                if let Some(split) = find_subslice(&buffer, b"\r\n\r\n") {
                    let header_end = split + 4;
                    let headers = String::from_utf8_lossy(&buffer[..split]).to_string();
                    let content_length = headers
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    while buffer.len() < header_end + content_length {
                        let read = stream.read(&mut chunk).expect("read body");
                        if read == 0 {
                            break;
                        }
                        buffer.extend_from_slice(&chunk[..read]);
                    }
                    let body = String::from_utf8_lossy(
                        &buffer[header_end..header_end + content_length],
                    )
                    .to_string();
                    let first_line = headers.lines().next().unwrap_or_default().to_string();
                    break (first_line, body);
                }
            };
            let _ = sender.send((first_line, body));
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                response.len(),
                response
            );
            let _ = stream.write_all(reply.as_bytes());
        }
    });

    (address, receiver)
}

fn block_json(height: u64) -> serde_json::Value {
    serde_json::json!({
        "block": {
            "number": height,
            "hash": format!("0x{height:064x}"),
            "parentHash": format!("0x{:064x}", height.saturating_sub(1)),
            "timestamp": format!("0x{:x}", 1_700_000_000u64 + height * 12),
        },
        "transactions": [],
        "logs": [],
    })
}

fn log_request() -> DataRequest {
    DataRequest {
        logs: vec![LogCriterion::default()],
        ..Default::default()
    }
}

#[tokio::test]
async fn height_endpoint_round_trip() {
    let (address, _requests) =
        spawn_scripted_server(vec![serde_json::json!({"height": 123}).to_string()]);
    let client = ArchiveClient::new(address).expect("client");
    assert_eq!(client.finalized_height().await.expect("height"), 123);
}

#[tokio::test]
async fn batch_closes_at_next_block_minus_one() {
    let response = serde_json::json!({
        "data": [[block_json(40), block_json(41)], [block_json(42)]],
        "nextBlock": 43,
        "archiveHeight": 100,
    });
    let (address, requests) = spawn_scripted_server(vec![response.to_string()]);

    let client = ArchiveClient::new(address).expect("client");
    let masks = resolve(&FieldSelection::default());
    let batch = client
        .finalized_batch(40, Some(50), &log_request(), &masks)
        .await
        .expect("batch");

    assert_eq!(batch.range.from, 40);
    assert_eq!(batch.range.to, 42);
    assert_eq!(batch.chain_height, 100);
    let heights: Vec<u64> = batch.blocks.iter().map(|b| b.header.height).collect();
    assert_eq!(heights, vec![40, 41, 42]);
    assert_eq!(batch.blocks.last().unwrap().header.height, batch.range.to);

    let (first_line, body) = requests.recv().expect("query request");
    assert!(first_line.starts_with("POST /query"), "{first_line}");
    let query: serde_json::Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(query["fromBlock"], serde_json::json!(40));
    assert_eq!(query["toBlock"], serde_json::json!(50));
}

#[tokio::test]
async fn missing_trailing_block_is_backfilled_with_a_stub_header() {
    let empty = serde_json::json!({
        "data": [],
        "nextBlock": 51,
        "archiveHeight": 100,
    });
    let closing = serde_json::json!({
        "data": [[block_json(50)]],
        "nextBlock": 51,
        "archiveHeight": 100,
    });
    let (address, requests) =
        spawn_scripted_server(vec![empty.to_string(), closing.to_string()]);

    let client = ArchiveClient::new(address).expect("client");
    let masks = resolve(&FieldSelection::default());
    let batch = client
        .finalized_batch(40, Some(50), &log_request(), &masks)
        .await
        .expect("batch");

    assert_eq!(batch.range.from, 40);
    assert_eq!(batch.range.to, 50);
    assert_eq!(batch.blocks.len(), 1);
    let stub = &batch.blocks[0];
    assert_eq!(stub.header.height, 50);
    assert_eq!(stub.header.timestamp, 1_700_000_000 + 50 * 12);
    assert!(stub.items.is_empty());

    let (_, first_body) = requests.recv().expect("first query");
    let first: serde_json::Value = serde_json::from_str(&first_body).expect("json");
    assert_eq!(first["fromBlock"], serde_json::json!(40));

    let (_, closing_body) = requests.recv().expect("closing query");
    let follow_up: serde_json::Value = serde_json::from_str(&closing_body).expect("json");
    assert_eq!(follow_up["fromBlock"], serde_json::json!(50));
    assert_eq!(follow_up["toBlock"], serde_json::json!(50));
    assert_eq!(follow_up["includeAllBlocks"], serde_json::json!(true));
    assert!(follow_up.get("logs").is_none());
}
