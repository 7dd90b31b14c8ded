use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use kegsmith::cellar::compare_versions;
use kegsmith::resolve::resolve_many;
use kegsmith::{FormulaRecord, InstallStep, normalize_path};
use std::collections::HashMap;
use std::path::Path;

/// A layered graph: every formula depends on up to `fan_out` formulae of the previous layer.
fn layered_graph(layers: usize, width: usize, fan_out: usize) -> HashMap<String, FormulaRecord> {
    let mut graph = HashMap::new();
    for layer in 0..layers {
        for i in 0..width {
            let name = format!("f{}-{}", layer, i);
            let dependencies = if layer == 0 {
                vec![]
            } else {
                (0..fan_out)
                    .map(|k| format!("f{}-{}", layer - 1, (i + k) % width))
                    .collect()
            };
            graph.insert(
                name.clone(),
                FormulaRecord {
                    name: name.clone(),
                    desc: None,
                    homepage: None,
                    license: None,
                    url: format!("file:///srv/sources/{}-1.0.0.tar.gz", name),
                    sha256: None,
                    version: Some("1.0.0".to_string()),
                    dependencies,
                    options: vec![],
                    install: vec![InstallStep::Shell("make install".to_string())],
                    test: None,
                },
            );
        }
    }
    graph
}

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_many");

    for layers in [4, 8, 16] {
        let graph = layered_graph(layers, 16, 3);
        let roots: Vec<String> = (0..16).map(|i| format!("f{}-{}", layers - 1, i)).collect();
        let plan = resolve_many(&roots, &graph).expect("bench graph must resolve");
        assert_eq!(plan.len(), layers * 16);

        group.bench_with_input(BenchmarkId::new("layers", layers), &roots, |b, roots| {
            b.iter(|| resolve_many(black_box(roots), &graph))
        });
    }

    group.finish();
}

fn bench_normalize_path(c: &mut Criterion) {
    let test_paths = vec![
        Path::new("foo/bar/../baz"),
        Path::new("./foo/./bar"),
        Path::new("foo/../../bar"),
        Path::new("/usr/local/bin/../Cellar/libx/1.0.0/bin/libx"),
        Path::new("a/b/c/../../d"),
    ];

    c.bench_function("normalize_path", |b| {
        b.iter(|| {
            for path in &test_paths {
                let _ = normalize_path(black_box(path));
            }
        })
    });
}

fn bench_compare_versions(c: &mut Criterion) {
    let mut versions: Vec<String> = (0..200)
        .map(|i| format!("{}.{}.{}", i % 7, i % 13, i))
        .collect();

    c.bench_function("compare_versions sort", |b| {
        b.iter(|| {
            versions.sort_by(|a, b| compare_versions(black_box(a), black_box(b)));
        })
    });
}

criterion_group!(
    benches,
    bench_resolve,
    bench_normalize_path,
    bench_compare_versions
);
criterion_main!(benches);
