// Copyright 2019 Zhizhesihai (Beijing) Technology Limited.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate bufcache;
extern crate num_cpus;
extern crate rand;

use std::env;
use std::sync::Arc;
use std::thread;
use std::time;

use bufcache::core::cache::BufferCache;
use bufcache::core::store::{RamDevice, SECTOR_SIZE};
use bufcache::core::util::SectorId;
use rand::Rng;

const DEVICE_SECTORS: u64 = 4096;

fn run_worker(
    cache: &BufferCache<RamDevice>,
    ops: usize,
    write_ratio: u32,
) -> Vec<time::Duration> {
    let mut latencies = Vec::with_capacity(ops);
    let mut rng = rand::thread_rng();
    let mut buf = [0u8; SECTOR_SIZE];
    for _ in 0..ops {
        let sector: SectorId = rng.gen_range(0..DEVICE_SECTORS as u32);
        let start = time::Instant::now();
        if rng.gen_range(0..100) < write_ratio {
            buf[0] = buf[0].wrapping_add(1);
            cache.write(sector, &buf).unwrap();
        } else {
            cache.read(sector, &mut buf).unwrap();
        }
        latencies.push(start.elapsed());
    }
    latencies
}

fn report(label: &str, mut latencies: Vec<time::Duration>, elapsed: time::Duration) {
    latencies.sort_unstable();
    let len = latencies.len();
    let per_sec =
        len as f64 / (elapsed.as_secs() as f64 + f64::from(elapsed.subsec_nanos()) / 1e9);
    println!("======== {} ========", label);
    println!("{} ops in {:?}, {:.0} ops/sec", len, elapsed, per_sec);
    println!("p50:  {:?}", latencies[len / 2]);
    println!("p90:  {:?}", latencies[len * 90 / 100]);
    println!("p99:  {:?}", latencies[len * 99 / 100]);
    println!("p999: {:?}", latencies[len * 999 / 1000]);
    println!("max:  {:?}", latencies[len - 1]);
}

fn benchmark(total_ops: usize, threads: usize, write_ratio: u32) {
    let device = Arc::new(RamDevice::new(DEVICE_SECTORS));
    let cache = Arc::new(BufferCache::new(device));

    let ops_per_thread = (total_ops + threads - 1) / threads;
    let start = time::Instant::now();
    let handles: Vec<thread::JoinHandle<_>> = (0..threads)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || run_worker(&cache, ops_per_thread, write_ratio))
        })
        .collect();

    let mut latencies = Vec::with_capacity(ops_per_thread * threads);
    for handle in handles {
        latencies.extend(handle.join().unwrap());
    }
    let elapsed = start.elapsed();

    report(
        &format!("{} threads, {}% writes", threads, write_ratio),
        latencies,
        elapsed,
    );

    let stats = cache.stats();
    println!(
        "hits: {}, misses: {}, evictions: {}, flushes: {}",
        stats.hits, stats.misses, stats.evictions, stats.flushes
    );
    cache.shutdown().unwrap();
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let total_ops: usize = args
        .get(1)
        .map(|s| s.parse().expect("ops must be a number"))
        .unwrap_or(100_000);
    let threads: usize = args
        .get(2)
        .map(|s| s.parse().expect("threads must be a number"))
        .unwrap_or_else(num_cpus::get);

    benchmark(total_ops, threads, 0);
    benchmark(total_ops, threads, 50);
    benchmark(total_ops, threads, 100);
}
