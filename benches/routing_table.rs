//! Micro-benchmarks for RoutingTable operations: insert, closest contacts and
//! remove at varying table sizes. Reports nanoseconds-per-operation.
//!
//! Run: `cargo bench --bench routing_table`

use kadnode::{Contact, Id, RoutingTable};
use std::net::SocketAddr;
use std::time::Instant;

fn contacts(count: usize) -> Vec<Contact> {
    let addr = SocketAddr::from(([127, 0, 0, 1], 6881));

    (0..count).map(|_| Contact::new(Id::random(), addr)).collect()
}

fn main() {
    println!("routing_table\n");

    bench_insert();
    bench_closest();
    bench_remove();
}

fn bench_insert() {
    println!("insert_or_refresh");

    for prefill in [0, 100, 400] {
        let table = RoutingTable::new(Id::random());
        for contact in contacts(prefill) {
            let _ = table.insert_or_refresh(contact);
        }

        // Pre-generate contacts outside the timed section
        let fresh = contacts(1000);
        let start = Instant::now();
        for contact in fresh {
            let _ = table.insert_or_refresh(contact);
        }
        let per_op = start.elapsed().as_nanos() / 1000;
        println!("{prefill:>3} prefilled: {per_op}ns/op (final size: {})", table.len());
    }

    println!();
}

fn bench_closest() {
    println!("closest_contacts");

    let targets: Vec<_> = (0..1000).map(|_| Id::random()).collect();

    for size in [50, 100, 200, 400] {
        let table = RoutingTable::new(Id::random());
        for contact in contacts(size) {
            let _ = table.insert_or_refresh(contact);
        }

        let start = Instant::now();
        for target in &targets {
            let _ = table.closest_contacts(target, table.k());
        }
        let per_op = start.elapsed().as_nanos() / targets.len() as u128;
        println!("{size:>3} contacts: {per_op}ns/op");
    }

    println!();
}

fn bench_remove() {
    println!("remove");

    let table = RoutingTable::new(Id::random());
    let mut ids = Vec::new();
    for contact in contacts(200) {
        ids.push(*contact.id());
        let _ = table.insert_or_refresh(contact);
    }

    let n = ids.len();
    let start = Instant::now();
    for id in &ids {
        table.remove(id);
    }
    let per_op = start.elapsed().as_nanos() / n as u128;
    println!("{per_op}ns/op ({n} removals)");
    println!();
}
