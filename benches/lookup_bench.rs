//! Benchmark for box lookup performance.
//!
//! Builds a 512x512 Z-2D point index and a 64^3 Hilbert-3D index, then
//! times box scans of varying selectivity (25%, 1%, single column).

use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use zcurve_rs::{BitKey, KeyKind, MemIndex, RowLocator, SpatialScan};

fn build_grid(kind: KeyKind, side: u32) -> Arc<MemIndex> {
    let d = kind.ncoords();
    let mut entries = Vec::new();
    let mut coords = vec![0u32; d];
    let mut row = 0u64;
    'outer: loop {
        let key = BitKey::encode(kind, &coords).unwrap();
        entries.push((
            key.raw(),
            RowLocator::new((row / 64) as u32, (row % 64) as u16),
        ));
        row += 1;
        let mut i = 0;
        loop {
            coords[i] += 1;
            if coords[i] < side {
                break;
            }
            coords[i] = 0;
            i += 1;
            if i == d {
                break 'outer;
            }
        }
    }
    Arc::new(MemIndex::build(kind, entries, 128).unwrap())
}

fn bench_boxes(label: &str, idx: &Arc<MemIndex>, kind: KeyKind, boxes: &[(Vec<u32>, Vec<u32>)]) {
    let start = Instant::now();
    let mut rows = 0u64;
    for (lo, hi) in boxes {
        let mut scan = SpatialScan::new(Arc::clone(idx), kind, lo, hi).unwrap();
        let mut item = scan.move_first().unwrap();
        while item.is_some() {
            rows += 1;
            item = scan.move_next().unwrap();
        }
    }
    let elapsed = start.elapsed();
    println!(
        "{}: {} scans, {} rows, {}ms",
        label,
        boxes.len(),
        rows,
        elapsed.as_millis()
    );
}

fn random_boxes(rng: &mut StdRng, d: usize, side: u32, extent: u32, n: usize) -> Vec<(Vec<u32>, Vec<u32>)> {
    (0..n)
        .map(|_| {
            let lo: Vec<u32> = (0..d).map(|_| rng.gen_range(0..side - extent)).collect();
            let hi: Vec<u32> = lo.iter().map(|l| l + extent).collect();
            (lo, hi)
        })
        .collect()
}

fn main() {
    let mut rng = StdRng::seed_from_u64(4242);

    let z2 = build_grid(KeyKind::Z2d, 512);
    bench_boxes(
        "z2d 25% boxes",
        &z2,
        KeyKind::Z2d,
        &random_boxes(&mut rng, 2, 512, 256, 20),
    );
    bench_boxes(
        "z2d 1% boxes",
        &z2,
        KeyKind::Z2d,
        &random_boxes(&mut rng, 2, 512, 50, 200),
    );
    let columns: Vec<(Vec<u32>, Vec<u32>)> = (0..200)
        .map(|_| {
            let x = rng.gen_range(0..512);
            (vec![x, 0], vec![x, 511])
        })
        .collect();
    bench_boxes("z2d columns", &z2, KeyKind::Z2d, &columns);

    let h3 = build_grid(KeyKind::Hilbert3d, 64);
    bench_boxes(
        "hilbert3d 1% boxes",
        &h3,
        KeyKind::Hilbert3d,
        &random_boxes(&mut rng, 3, 64, 13, 50),
    );
}
