// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Benchmarks for offload-core hot paths.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use offload_core::{
    kernel_args, kernels, DType, DeviceRegistry, HostArray, HostBuffer, HostEngine, MemoryTracker,
    OffloadConfig,
};
use std::hint::black_box;
use std::sync::Arc;

fn registry() -> DeviceRegistry {
    DeviceRegistry::new(Arc::new(HostEngine::new(1)), OffloadConfig::default()).unwrap()
}

/// Benchmark host/device round trips at several sizes.
fn bench_transfers(c: &mut Criterion) {
    let mut group = c.benchmark_group("transfers");
    let registry = registry();
    let stream = registry.device(0).unwrap().default_stream().unwrap().clone();

    for nbytes in [4 << 10, 256 << 10, 4 << 20] {
        let src = HostBuffer::zeroed(nbytes);
        let dst = HostBuffer::zeroed(nbytes);
        let mem = stream.allocate(nbytes).unwrap();
        group.throughput(Throughput::Bytes(2 * nbytes as u64));
        group.bench_with_input(BenchmarkId::new("round_trip", nbytes), &nbytes, |b, &n| {
            b.iter(|| {
                stream.host_to_device(&src, &mem, n, 0, 0).unwrap();
                stream.device_to_host(&mem, &dst, n, 0, 0).unwrap();
                stream.sync().unwrap();
            })
        });
    }

    group.finish();
}

/// Benchmark allocation through a stream and the raw tracker.
fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");
    let registry = registry();
    let stream = registry.device(0).unwrap().default_stream().unwrap().clone();

    group.bench_function("allocate_release_64k", |b| {
        b.iter(|| black_box(stream.allocate(black_box(64 << 10)).unwrap()))
    });

    group.bench_function("tracker_allocate_deallocate", |b| {
        let tracker = MemoryTracker::with_limit(1_000_000_000);
        b.iter(|| {
            tracker.allocate(black_box(1_000_000)).unwrap();
            tracker.deallocate(black_box(1_000_000));
        })
    });

    group.finish();
}

/// Benchmark kernel invocation with device-resident and copy-in/out arguments.
fn bench_invoke(c: &mut Criterion) {
    let mut group = c.benchmark_group("invoke");
    let registry = registry();
    let device = registry.device(0).unwrap();
    let stream = device.default_stream().unwrap().clone();
    let library = device.load_library(kernels::ARRAY_LIBRARY).unwrap();
    let fill = library.kernel(kernels::symbols::FILL).unwrap();
    let dt = DType::F64.type_code().unwrap();

    let host = HostArray::zeros(&[1024], DType::F64);
    let array = stream.bind(&host, true).unwrap();

    group.bench_function("fill_device_array", |b| {
        b.iter(|| {
            stream
                .invoke(&fill, &kernel_args![dt, 1024, &array, 1.0])
                .unwrap();
            stream.sync().unwrap();
        })
    });

    group.bench_function("fill_host_array", |b| {
        b.iter(|| {
            stream
                .invoke(&fill, &kernel_args![dt, 1024, &host, 1.0])
                .unwrap();
        })
    });

    group.bench_function("add_arrays", |b| {
        b.iter(|| {
            let sum = array.add(&array).unwrap();
            stream.sync().unwrap();
            black_box(sum)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_transfers, bench_allocation, bench_invoke);
criterion_main!(benches);
