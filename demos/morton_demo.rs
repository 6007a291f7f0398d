use std::env;
use std::time::Instant;

use morton_filter::{FilterConfig, MortonFilter};

fn main() {
    // Demo configuration with sensible defaults.
    let mut key_count = 1_000_000u64;
    let mut seed = 0xC0FFEE_u64;
    let mut fingerprint_bits = 8u32;

    let mut args = env::args().skip(1);
    while let Some(flag) = args.next() {
        fn parse<T: std::str::FromStr>(value: Option<String>, name: &str) -> T
        where
            T::Err: std::fmt::Display,
        {
            let value = value.unwrap_or_else(|| panic!("expected value after {name}"));
            value
                .parse::<T>()
                .unwrap_or_else(|err| panic!("invalid value for {name}: {err}"))
        }

        match flag.as_str() {
            "--keys" => key_count = parse(args.next(), "--keys"),
            "--seed" => seed = parse(args.next(), "--seed"),
            "--fingerprint-bits" => fingerprint_bits = parse(args.next(), "--fingerprint-bits"),
            other => panic!("unknown flag: {other}"),
        }
    }

    let config = FilterConfig {
        seed,
        fingerprint_bits,
        ..FilterConfig::default()
    };
    // Size the table so the requested keys land around 90% physical load.
    let logical_slots = key_count + key_count / 2;
    let mut filter = MortonFilter::new(logical_slots, config).expect("filter should build");
    println!("{filter:?}");
    println!("storage: {} KiB", filter.storage_bytes() / 1024);
    println!(
        "compression ratio: {:.3}",
        filter.report_compression_ratio()
    );

    let keys: Vec<u64> = (0..key_count).collect();

    let insert_start = Instant::now();
    let status = filter.insert_many(&keys);
    let insert_time = insert_start.elapsed();
    let inserted = status.iter().filter(|&&ok| ok).count();
    println!(
        "inserted {inserted}/{key_count} keys in {:?} ({:.1} Mops/s)",
        insert_time,
        inserted as f64 / insert_time.as_secs_f64() / 1e6
    );

    let lookup_start = Instant::now();
    let found = filter
        .likely_contains_many(&keys)
        .iter()
        .filter(|&&hit| hit)
        .count();
    let lookup_time = lookup_start.elapsed();
    println!(
        "positive lookups: {found}/{key_count} in {:?} ({:.1} Mops/s)",
        lookup_time,
        key_count as f64 / lookup_time.as_secs_f64() / 1e6
    );

    println!(
        "block occupancy: {:.1}%",
        filter.report_block_occupancy() * 100.0
    );
    println!(
        "overflow bit occupancy: {:.1}%",
        filter.report_ota_occupancy() * 100.0
    );
    println!(
        "estimated false positive rate: {:.4}%",
        filter.estimated_false_positive_rate() * 100.0
    );
}
