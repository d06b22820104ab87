//! Benchmarks for program execution

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use datex_core::Endpoint;
use datex_pointer::{PointerRegistry, RegistryConfig};
use datex_test::{long_sum, sum};
use datex_vm::{Execution, ScopeContext, ScopeMachine, Step};

fn execute(program: &[u8], reg: &mut PointerRegistry, local: &Endpoint) -> Step {
    let mut execution = Execution::new(ScopeMachine::new(ScopeContext::local(local.clone())));
    execution.feed(program);
    execution.finish_input();
    execution.run(reg).expect("run")
}

fn bench_sum(c: &mut Criterion) {
    let local = Endpoint::person("alice");
    let mut reg = PointerRegistry::new(local.clone(), RegistryConfig::default());
    let program = sum(40, 2);

    c.bench_function("execute_sum", |b| {
        b.iter(|| execute(black_box(&program), &mut reg, &local))
    });
}

fn bench_long_sum(c: &mut Criterion) {
    let local = Endpoint::person("alice");
    let mut reg = PointerRegistry::new(local.clone(), RegistryConfig::default());
    let program = long_sum(1000);

    c.bench_function("execute_long_sum_1000", |b| {
        b.iter(|| execute(black_box(&program), &mut reg, &local))
    });
}

fn bench_streamed_blocks(c: &mut Criterion) {
    let local = Endpoint::person("alice");
    let mut reg = PointerRegistry::new(local.clone(), RegistryConfig::default());
    let program = long_sum(1000);

    c.bench_function("execute_long_sum_streamed", |b| {
        b.iter(|| {
            let mut execution = Execution::new(ScopeMachine::new(ScopeContext::local(local.clone())));
            for part in program.chunks(64) {
                execution.feed(part);
                let _ = execution.run(&mut reg).expect("run");
            }
            execution.finish_input();
            execution.run(&mut reg).expect("run")
        })
    });
}

criterion_group!(benches, bench_sum, bench_long_sum, bench_streamed_blocks);
criterion_main!(benches);
