//! Benchmark for the safe-serialization performance contract: converting
//! 100 ~5KB envelopes must cost well under 100ms.
//!
//! Run with: cargo run --release --bin envelope_throughput_bench

use std::time::Instant;

use serde_json::{Map, Value};
use wsrouter::{build_envelope, serialize_safely, BusinessEvent, RoutingIds};

fn five_kilobyte_tool_args() -> Value {
    let mut map = Map::new();
    map.insert("query".to_string(), Value::String("x".repeat(5000)));
    Value::Object(map)
}

fn main() {
    println!("Envelope Serialization Benchmark");
    println!("=================================\n");

    let envelopes: Vec<_> = (0..100)
        .map(|i| {
            build_envelope(
                BusinessEvent::ToolExecuting {
                    tool_name: "search".to_string(),
                    tool_args: five_kilobyte_tool_args(),
                    execution_id: format!("exec_{i}"),
                },
                RoutingIds {
                    run_id: Some(format!("thread_t{i}_run_100_abcd1234")),
                    thread_id: Some(format!("t{i}")),
                    user_id: Some(format!("u{i}")),
                },
            )
        })
        .collect();

    let start = Instant::now();
    let mut total_bytes = 0;
    for envelope in &envelopes {
        let payload = serialize_safely(envelope);
        total_bytes += serde_json::to_vec(&payload).unwrap().len();
    }
    let elapsed = start.elapsed();

    println!("Serialized {} envelopes ({} bytes total)", envelopes.len(), total_bytes);
    println!("Elapsed: {elapsed:?}");
    assert!(
        elapsed.as_millis() < 100,
        "100 ~5KB envelopes must serialize in under 100ms, took {elapsed:?}"
    );
    println!("\nOK: within the 100ms/100-message contract.");
}
