//! Allocator and layout benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ironbark::layout::StructTy;
use ironbark::machine::env::Env;
use ironbark::memory::blocks::BLOCK_PO2;
use ironbark::types::{PrimTy, Ty, Value};

fn arena_small_cycle(env: &mut Env) {
    let classes = [3u8, 4, 5, 6, 3, 4, 5, 6];
    let mut ptrs = [0u32; 8];
    for (i, po2) in classes.iter().enumerate() {
        ptrs[i] = env.alloc(*po2).unwrap();
    }
    for (i, po2) in classes.iter().enumerate().rev() {
        env.free(*po2, ptrs[i]).unwrap();
    }
}

fn block_cycle(env: &mut Env) {
    let a = env.alloc(BLOCK_PO2).unwrap();
    let b = env.alloc(BLOCK_PO2).unwrap();
    env.free(BLOCK_PO2, a).unwrap();
    env.free(BLOCK_PO2, b).unwrap();
}

fn stack_churn(env: &mut Env) {
    for i in 0..16u32 {
        env.push(&Value::U32(i)).unwrap();
    }
    for _ in 0..16 {
        env.pop(&Ty::Prim(PrimTy::U32)).unwrap();
    }
}

fn build_record_layout() -> u32 {
    let st = StructTy::new(
        "bench_record",
        &[
            ("a", Ty::Prim(PrimTy::U32)),
            ("b", Ty::Prim(PrimTy::U16)),
            ("c", Ty::Prim(PrimTy::U16)),
            ("d", Ty::Prim(PrimTy::U64)),
            ("e", Ty::Prim(PrimTy::U8)),
        ],
    )
    .unwrap();
    st.offset("d").unwrap() + st.size()
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("arena_small_cycle", |b| {
        let mut env = Env::new().unwrap();
        b.iter(|| arena_small_cycle(black_box(&mut env)))
    });
    c.bench_function("block_cycle", |b| {
        let mut env = Env::new().unwrap();
        b.iter(|| block_cycle(black_box(&mut env)))
    });
    c.bench_function("stack_churn", |b| {
        let mut env = Env::new().unwrap();
        b.iter(|| stack_churn(black_box(&mut env)))
    });
    c.bench_function("struct_layout", |b| {
        b.iter(|| black_box(build_record_layout()))
    });
    c.bench_function("env_build", |b| b.iter(|| Env::new().unwrap()));
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
