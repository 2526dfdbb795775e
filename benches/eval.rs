use criterion::{Criterion, criterion_group, criterion_main};
use exprvm::{Parser, unary_plus};
use std::hint::black_box;
use std::sync::Arc;

fn math_parser() -> Parser {
    let mut p = Parser::new();
    p.define_const("_pi", std::f64::consts::PI).unwrap();
    p.define_fun("sin", Arc::new(|a| Ok(a[0].sin())), 1, true)
        .unwrap();
    p.define_fun("cos", Arc::new(|a| Ok(a[0].cos())), 1, true)
        .unwrap();
    p.define_fun("exp", Arc::new(|a| Ok(a[0].exp())), 1, true)
        .unwrap();
    p.define_infix_oprt("-", Arc::new(|a| Ok(-a[0])), true).unwrap();
    p.define_infix_oprt("+", unary_plus(), true).unwrap();
    p.define_var("x", 0).unwrap();
    p
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");

    for (name, expr) in [
        ("poly", "x^3 + 2*x^2 + x"),
        ("trig", "sin(x) * cos(x)"),
        ("cond", "x>0 ? sin(x) : -x"),
    ] {
        group.bench_function(name, |b| {
            b.iter(|| {
                let mut p = math_parser();
                p.set_expr(black_box(expr)).unwrap();
                p.eval(&mut [0.5]).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_eval(c: &mut Criterion) {
    let mut group = c.benchmark_group("eval");

    for (name, expr) in [
        ("affine", "2*x + 1"),
        ("poly", "x^4 + x^3 + x^2 + x"),
        ("trig", "sin(x) * cos(x) + exp(-x)"),
    ] {
        let mut p = math_parser();
        p.set_expr(expr).unwrap();
        let mut vars = [0.5];
        // Warm up so the benchmark measures evaluation, not compilation.
        p.eval(&mut vars).unwrap();

        group.bench_function(name, |b| {
            b.iter(|| p.eval(black_box(&mut vars)).unwrap());
        });
    }

    group.finish();
}

fn bench_bulk(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk");

    let mut p = math_parser();
    p.set_expr("2*x + 1").unwrap();
    let mut xs: Vec<f64> = (0..10_000).map(|i| f64::from(i) * 0.001).collect();
    let mut out = vec![0.0; 10_000];
    p.eval_bulk(&mut xs, &mut out).unwrap();

    group.bench_function("affine_10k", |b| {
        b.iter(|| p.eval_bulk(black_box(&mut xs), black_box(&mut out)).unwrap());
    });

    group.finish();
}

criterion_group!(benches, bench_compile, bench_eval, bench_bulk);
criterion_main!(benches);
