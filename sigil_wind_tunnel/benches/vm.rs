// Copyright 2026 the Sigil Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use sigil::asm::{Asm, ModuleBuilder};
use sigil::host::HostError;
use sigil::memory::LinearMemory;
use sigil::module::Module;
use sigil::opcode::Opcode;
use sigil::value::{Value, ValueType};
use sigil::vm::{Config, Vm};

fn bench_vm(c: &mut Criterion) {
    bench_add_chain(c);
    bench_branch_hot_loop(c);
    bench_call_overhead(c);
    bench_memory_traffic(c);
    bench_host_call_loop(c);
    bench_module_load(c);
}

fn ready_vm(builder: &ModuleBuilder) -> Vm {
    let module = Arc::new(Module::load(&builder.finish()).unwrap());
    let mut vm = Vm::new(module, Config::default());
    vm.init().unwrap();
    vm
}

/// Straight-line i32 adds of the given chain length.
fn build_add_chain(len: u32) -> ModuleBuilder {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[], Some(ValueType::I32));
    let mut a = Asm::new();
    a.ldi32(0, 0);
    a.ldi32(1, 1);
    for _ in 0..len {
        a.op(Opcode::Add32, 0, 0, 1);
    }
    a.ret();
    let f = b.func(ty, 2, 0, a).unwrap();
    b.export_func(f, "chain");
    b
}

fn bench_add_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_chain");
    for &len in &[10_u32, 100, 1000] {
        let b = build_add_chain(len);
        let mut vm = ready_vm(&b);
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |bench, _| {
            bench.iter(|| {
                let out = vm.call("chain", &[]).unwrap();
                black_box(out);
            });
        });
    }
    group.finish();
}

/// Countdown loop: compare, branch, subtract.
fn bench_branch_hot_loop(c: &mut Criterion) {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValueType::I32], Some(ValueType::I32));
    let mut a = Asm::new();
    let top = a.new_label();
    let done = a.new_label();
    a.ldi32(1, 0);
    a.ldi32(2, 1);
    a.place(top);
    a.jle(0, 1, done);
    a.op(Opcode::Sub32, 0, 0, 2);
    a.jmp(top);
    a.place(done);
    a.ret();
    let f = b.func(ty, 4, 0, a).unwrap();
    b.export_func(f, "countdown");

    let mut group = c.benchmark_group("branch_hot_loop");
    for &n in &[100_i32, 10_000] {
        let mut vm = ready_vm(&b);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |bench, &n| {
            bench.iter(|| {
                let out = vm.call("countdown", &[Value::I32(n)]).unwrap();
                black_box(out);
            });
        });
    }
    group.finish();
}

/// A call that immediately returns, to measure frame push/pop cost.
fn bench_call_overhead(c: &mut Criterion) {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValueType::I32], Some(ValueType::I32));
    let mut leaf = Asm::new();
    leaf.ret();
    let leaf_fn = b.func(ty, 1, 0, leaf).unwrap();

    let mut a = Asm::new();
    a.arg(0, 0);
    a.call(0, leaf_fn);
    a.ret();
    let f = b.func(ty, 2, 0, a).unwrap();
    b.export_func(f, "trampoline");

    let mut vm = ready_vm(&b);
    c.bench_function("call_overhead", |bench| {
        bench.iter(|| {
            let out = vm.call("trampoline", &[Value::I32(7)]).unwrap();
            black_box(out);
        });
    });
}

/// Store/load pairs walking a page of linear memory.
fn bench_memory_traffic(c: &mut Criterion) {
    let mut b = ModuleBuilder::new();
    b.memory(1, 1);
    let ty = b.ty(&[ValueType::I32], Some(ValueType::I32));
    let mut a = Asm::new();
    let top = a.new_label();
    let done = a.new_label();
    a.ldi32(1, 0); // cursor
    a.ldi32(2, 4);
    a.place(top);
    a.jle(0, 1, done);
    a.store32(0, 1, 0);
    a.load32(3, 1, 0);
    a.op(Opcode::Add32, 1, 1, 2);
    a.op(Opcode::Sub32, 0, 0, 2);
    a.jmp(top);
    a.place(done);
    a.mov(0, 3);
    a.ret();
    let f = b.func(ty, 4, 0, a).unwrap();
    b.export_func(f, "walk");

    let mut vm = ready_vm(&b);
    c.bench_function("memory_traffic", |bench| {
        bench.iter(|| {
            let out = vm.call("walk", &[Value::I32(4096)]).unwrap();
            black_box(out);
        });
    });
}

/// Host dispatch cost: a loop of no-op host calls.
fn bench_host_call_loop(c: &mut Criterion) {
    let mut b = ModuleBuilder::new();
    let ty_sink = b.ty(&[ValueType::I32], None);
    let sink = b.import("bench", "sink", ty_sink);
    let ty = b.ty(&[ValueType::I32], Some(ValueType::I32));
    let mut a = Asm::new();
    let top = a.new_label();
    let done = a.new_label();
    a.ldi32(1, 0);
    a.ldi32(2, 1);
    a.place(top);
    a.jle(0, 1, done);
    a.arg(0, 0);
    a.call_host(3, sink);
    a.op(Opcode::Sub32, 0, 0, 2);
    a.jmp(top);
    a.place(done);
    a.ret();
    let f = b.func(ty, 4, 0, a).unwrap();
    b.export_func(f, "pump");

    let module = Arc::new(Module::load(&b.finish()).unwrap());
    let mut vm = Vm::new(module, Config::default());
    vm.register(
        "bench",
        "sink",
        |_mem: &mut LinearMemory, args: &[Value]| -> Result<Value, HostError> {
            Ok(Value::I32(args[0].as_i32()))
        },
    )
    .unwrap();
    vm.init().unwrap();

    let mut group = c.benchmark_group("host_call_loop");
    for &n in &[10_i32, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |bench, &n| {
            bench.iter(|| {
                let out = vm.call("pump", &[Value::I32(n)]).unwrap();
                black_box(out);
            });
        });
    }
    group.finish();
}

/// Container parse + validate throughput.
fn bench_module_load(c: &mut Criterion) {
    let b = build_add_chain(1000);
    let bytes = b.finish();
    c.bench_function("module_load", |bench| {
        bench.iter(|| {
            let m = Module::load(black_box(&bytes)).unwrap();
            black_box(m);
        });
    });
}

criterion_group!(benches, bench_vm);
criterion_main!(benches);
