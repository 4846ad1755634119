use kadnode::Testnet;
use std::time::{Duration, Instant};

/// End-to-end latency for put/get operations on an in-memory testnet.
///
/// Every message is delivered on its own thread, so these numbers reflect
/// lookup rounds and thread scheduling rather than network latency.
fn main() {
    println!("latency\n");

    for size in [10, 100] {
        let testnet = Testnet::new(size).unwrap();
        let nodes = &testnet.nodes;

        // PUT
        let samples = 20;
        let mut timings = Vec::with_capacity(samples);

        for i in 0..samples {
            let key = format!("put_bench_{size}_{i}");
            let node_idx = i % size;
            let start = Instant::now();
            let _ = nodes[node_idx].put(&key, "bench_payload".to_string());
            timings.push(start.elapsed());
        }

        println!("put ({size} nodes)");
        print_stats(&timings);

        // FIND_VALUE, skipping local storage
        let samples = 30;
        let mut timings = Vec::with_capacity(samples);
        let mut misses = 0;

        for i in 0..samples {
            let key = format!("put_bench_{size}_{}", i % 20);
            let node_idx = (i * 7) % size;
            let start = Instant::now();
            let result = nodes[node_idx].find_value(&key);
            timings.push(start.elapsed());
            if result.value().is_none() {
                misses += 1;
            }
        }

        println!("find_value ({size} nodes, {misses} misses)");
        print_stats(&timings);
    }
}

fn print_stats(timings: &[Duration]) {
    let mut us: Vec<_> = timings.iter().map(|d| d.as_micros()).collect();
    us.sort_unstable();
    let n = us.len();
    let mean = us.iter().sum::<u128>() / n as u128;

    println!(
        "n={n} min={:.2}ms mean={:.2}ms p50={:.2}ms p95={:.2}ms max={:.2}ms\n",
        us[0] as f64 / 1000.0,
        mean as f64 / 1000.0,
        us[n / 2] as f64 / 1000.0,
        us[n * 95 / 100] as f64 / 1000.0,
        us[n - 1] as f64 / 1000.0,
    );
}
