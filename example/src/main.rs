use std::collections::HashMap;

use heap_leak_track::report;
use heap_leak_track::{Config, Tracker, TrackingAllocator};

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator::system();

fn test() -> String {
    let mut s = " ".to_owned();
    for _ in 0..12 {
        s = format!("{}{}", s, s);
    }
    s
}

#[inline(never)]
fn remember(cache: &mut HashMap<usize, Box<[u8]>>, key: usize) {
    cache.insert(key, vec![key as u8; 64].into_boxed_slice());
}

fn main() {
    pretty_env_logger::init();

    let tracker = match Tracker::builder(Config::from_env()).build() {
        Ok(tracker) => tracker,
        Err(err) => {
            log::error!("cannot build tracker: {}", err);
            return;
        }
    };
    let _guard = match tracker.install() {
        Ok(guard) => guard,
        Err(err) => {
            log::error!("cannot install tracker: {}", err);
            return;
        }
    };
    tracker.attach_loaded_modules();
    tracker.mark_all_reported(None);

    let v = vec![1, 2, 3];
    println!("Hello, world! {:?}", v);
    println!("test: {}", test().len());

    let mut cache = HashMap::new();
    for key in 0..8 {
        remember(&mut cache, key);
    }
    std::mem::forget(cache);

    let handles: Vec<_> = (0..4)
        .map(|_| std::thread::spawn(|| Box::leak(test().into_boxed_str()).len()))
        .collect();
    for handle in handles {
        let _ = handle.join();
    }

    println!("outstanding leaks: {}", tracker.leak_count(None));
    let leaks = tracker.shutdown();
    match report::to_json(&leaks) {
        Ok(json) => println!("{}", json),
        Err(err) => log::error!("cannot serialize report: {}", err),
    }
}
