// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Performance tests.

use guest_range::AlignedWindow;
use std::hint::black_box;
use vmem::Console;
use vmem::LOC_MAIN;
use vmem::Memory;
use vmem::RunState;

criterion::criterion_main!(benches);

criterion::criterion_group!(benches, bench_hot_paths);

fn bench_hot_paths(c: &mut criterion::Criterion) {
    let vm = Memory::new(Console::Ps3, RunState::new()).unwrap();
    let addr = vm.alloc(0x10000, LOC_MAIN, 0x1000).unwrap();

    c.bench_function("check-addr", |b| {
        b.iter(|| vm.check_addr(black_box(addr), black_box(0x10000)));
    })
    .bench_function("window-overlap", |b| {
        let event = AlignedWindow::new(addr, 128);
        let waiter = AlignedWindow::new(addr + 64, 16);
        b.iter(|| black_box(event).overlaps(&black_box(waiter)));
    })
    .bench_function("reservation-acquire-update", |b| {
        let mut data = [0; 8];
        b.iter(|| {
            vm.reservation_acquire(&mut data, addr, 8);
            vm.reservation_update(addr, &data, 8)
        });
    });
}
