use chain_sim::{
    contour::{cell_polygons, isolines},
    parse_grid, parse_header, Grid, GridOptions,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Square grid holding a dome of water with a dry corner.
fn dome_grid(size: usize) -> Grid {
    let mut text = format!(
        "ncols {size}\nnrows {size}\nxllcorner 4.0\nyllcorner 52.0\ncellsize 0.01\nNODATA_value -9999\n"
    );
    let center = size as f64 / 2.0;
    for row in 0..size {
        let line: Vec<String> = (0..size)
            .map(|col| {
                if row + col < size / 4 {
                    return "-9999".to_string();
                }
                let dr = row as f64 - center;
                let dc = col as f64 - center;
                let depth = (center * center - dr * dr - dc * dc).max(0.0) / center;
                format!("{depth:.2}")
            })
            .collect();
        text.push_str(&line.join(" "));
        text.push('\n');
    }
    let options = GridOptions::default();
    let params = parse_header(&text, &options).expect("bench grid header");
    parse_grid(&text, &params)
}

fn bench_contours(c: &mut Criterion) {
    let mut group = c.benchmark_group("contours");

    for size in [16usize, 64, 128] {
        let grid = dome_grid(size);
        group.bench_with_input(BenchmarkId::new("cell_polygons", size), &grid, |b, grid| {
            b.iter(|| black_box(cell_polygons(grid)));
        });
        group.bench_with_input(BenchmarkId::new("isolines", size), &grid, |b, grid| {
            b.iter(|| black_box(isolines(grid)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_contours);
criterion_main!(benches);
