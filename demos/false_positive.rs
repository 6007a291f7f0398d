use std::time::Instant;

use morton_filter::{FilterConfig, MortonFilter};

fn main() {
    let key_count = 4_000_000u64;
    let query_count = 4_000_000u64;

    let mut filter = MortonFilter::new(key_count + key_count / 2, FilterConfig::default())
        .expect("filter should build");

    let keys: Vec<u64> = (0..key_count).collect();
    let build_start = Instant::now();
    let inserted = filter
        .insert_many(&keys)
        .iter()
        .filter(|&&ok| ok)
        .count();
    let build_time = build_start.elapsed();

    // Probe keys disjoint from the inserted range, so every hit is a false
    // positive.
    let mut false_positives = 0u64;
    for i in 0..query_count {
        if filter.likely_contains((1 << 40) + i) {
            false_positives += 1;
        }
    }

    let fp_rate = false_positives as f64 / query_count as f64;

    println!("inserted {inserted}/{key_count} keys in {:?}", build_time);
    println!("queries: {query_count}");
    println!("false positives: {false_positives}");
    println!("measured false positive rate: {:.4}%", fp_rate * 100.0);
    println!(
        "estimated false positive rate: {:.4}%",
        filter.estimated_false_positive_rate() * 100.0
    );
    println!(
        "overflow bit occupancy: {:.1}%",
        filter.report_ota_occupancy() * 100.0
    );
}
